use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

#[cfg(feature = "bluez")]
use bluer::rfcomm::{SocketAddr, Stream};
#[cfg(feature = "bluez")]
use bluer::{Address, Session};

#[cfg(not(feature = "bluez"))]
use std::mem;
#[cfg(not(feature = "bluez"))]
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
#[cfg(not(feature = "bluez"))]
use std::task::ready;
#[cfg(not(feature = "bluez"))]
use tokio::io::unix::AsyncFd;

use crate::config::DriverConfig;
use crate::errors::{BluetoothError, DriverError, Result};
use crate::source::DataSource;

#[cfg(not(feature = "bluez"))]
const AF_BLUETOOTH: libc::c_int = 31;
#[cfg(not(feature = "bluez"))]
const BTPROTO_RFCOMM: libc::c_int = 3;

/// Address in the form the active backend connects with.
#[cfg(not(feature = "bluez"))]
type DeviceAddress = BdAddr;
#[cfg(feature = "bluez")]
type DeviceAddress = Address;

/// RFCOMM data source for a Unicorn headset.
///
/// Behavior depends on build features:
/// - Default (manual RFCOMM): raw non-blocking RFCOMM socket; the device must
///   already be paired/trusted (e.g., via `bluetoothctl`).
/// - With `bluez` feature: connects through BlueZ, powering the adapter on first.
///
/// One instance serves one connection attempt; the reconnect loop builds a new
/// source for every attempt.
pub struct RfcommSource {
    mac: String,
    address: DeviceAddress,
    channel: u8,
    connect_timeout: Duration,
    io_timeout: Duration,
    stream: Option<RfcommStream>,
}

impl RfcommSource {
    /// Validate `mac` without touching the radio.
    pub fn new(mac: &str, config: &DriverConfig) -> Result<Self> {
        Ok(Self {
            mac: mac.to_string(),
            address: parse_address(mac)?,
            channel: config.channel,
            connect_timeout: config.connect_timeout,
            io_timeout: config.io_timeout,
            stream: None,
        })
    }

    fn stream(&mut self) -> Result<&mut RfcommStream> {
        self.stream.as_mut().ok_or_else(|| {
            DriverError::Bluetooth(BluetoothError::NotConnected(self.mac.clone()))
        })
    }
}

#[async_trait]
impl DataSource for RfcommSource {
    fn describe(&self) -> String {
        format!("rfcomm:{}@{}", self.mac, self.channel)
    }

    async fn connect(&mut self) -> Result<()> {
        debug!(
            "opening RFCOMM connection: mac={}, channel={}",
            self.mac, self.channel
        );
        let stream = tokio::time::timeout(
            self.connect_timeout,
            open_rfcomm(self.address, self.channel),
        )
        .await
        .map_err(|_| DriverError::Timeout("rfcomm connect timed out".into()))??;

        info!("RFCOMM connection established: mac={}", self.mac);
        self.stream = Some(stream);
        Ok(())
    }

    async fn send_command(&mut self, command: &[u8]) -> Result<()> {
        let io_timeout = self.io_timeout;
        let stream = self.stream()?;
        tokio::time::timeout(io_timeout, async {
            stream.write_all(command).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| DriverError::Timeout("rfcomm write timed out".into()))??;
        Ok(())
    }

    async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let io_timeout = self.io_timeout;
        let stream = self.stream()?;
        let mut buf = vec![0u8; len];
        tokio::time::timeout(io_timeout, stream.read_exact(&mut buf))
            .await
            .map_err(|_| DriverError::Timeout("timeout on unicorn connection".into()))??;
        Ok(buf)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            debug!("closing RFCOMM connection: mac={}", self.mac);
            // Dropping the stream closes the socket even if shutdown fails.
            stream.shutdown().await?;
        }
        Ok(())
    }
}

// ============================================================================
// Stream
// ============================================================================

/// Async RFCOMM byte stream.
#[cfg(not(feature = "bluez"))]
pub struct RfcommStream {
    inner: AsyncFd<OwnedFd>,
}

#[cfg(feature = "bluez")]
pub struct RfcommStream {
    inner: Stream,
}

#[cfg(not(feature = "bluez"))]
impl RfcommStream {
    /// Verify the connection is actually established and usable.
    pub fn verify_connected(&self) -> Result<()> {
        use nix::sys::socket::{getsockopt, sockopt::SocketError};

        let err = getsockopt(self.inner.get_ref(), SocketError).map_err(io::Error::from)?;
        if err != 0 {
            return Err(DriverError::Bluetooth(BluetoothError::NotConnected(
                io::Error::from_raw_os_error(err).to_string(),
            )));
        }
        Ok(())
    }
}

#[cfg(not(feature = "bluez"))]
impl AsyncRead for RfcommStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            let mut guard = ready!(this.inner.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            let result = guard.try_io(|inner| {
                let n = unsafe {
                    libc::recv(
                        inner.as_raw_fd(),
                        unfilled.as_mut_ptr() as *mut libc::c_void,
                        unfilled.len(),
                        0,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

#[cfg(not(feature = "bluez"))]
impl AsyncWrite for RfcommStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            let mut guard = ready!(this.inner.poll_write_ready(cx))?;
            let result = guard.try_io(|inner| {
                // MSG_NOSIGNAL: a peer that already hung up must not raise SIGPIPE.
                let n = unsafe {
                    libc::send(
                        inner.as_raw_fd(),
                        data.as_ptr() as *const libc::c_void,
                        data.len(),
                        libc::MSG_NOSIGNAL,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let ret = unsafe { libc::shutdown(self.inner.as_raw_fd(), libc::SHUT_RDWR) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // Already disconnected by the peer.
            if err.raw_os_error() != Some(libc::ENOTCONN) {
                return Poll::Ready(Err(err));
            }
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(feature = "bluez")]
impl AsyncRead for RfcommStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

#[cfg(feature = "bluez")]
impl AsyncWrite for RfcommStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

// ============================================================================
// BlueZ backend
// ============================================================================

#[cfg(feature = "bluez")]
fn parse_address(mac: &str) -> Result<Address> {
    mac.parse()
        .map_err(|_| DriverError::Bluetooth(BluetoothError::InvalidAddress(mac.to_string())))
}

#[cfg(feature = "bluez")]
async fn open_rfcomm(address: Address, channel: u8) -> Result<RfcommStream> {
    let session = Session::new()
        .await
        .map_err(|e| DriverError::Bluetooth(BluetoothError::Connection(e.to_string())))?;
    let adapter = session
        .default_adapter()
        .await
        .map_err(|e| DriverError::Bluetooth(BluetoothError::Connection(e.to_string())))?;
    adapter
        .set_powered(true)
        .await
        .map_err(|e| DriverError::Bluetooth(BluetoothError::Connection(e.to_string())))?;

    debug!(
        "opening RFCOMM socket via bluer: mac={}, channel={}",
        address, channel
    );
    let inner = Stream::connect(SocketAddr::new(address, channel))
        .await
        .map_err(|e| DriverError::Bluetooth(BluetoothError::Connection(e.to_string())))?;
    Ok(RfcommStream { inner })
}

// ============================================================================
// Raw socket backend
// ============================================================================

#[cfg(not(feature = "bluez"))]
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct BdAddr {
    b: [u8; 6],
}

#[cfg(not(feature = "bluez"))]
#[repr(C)]
struct SockAddrRc {
    rc_family: libc::sa_family_t,
    rc_bdaddr: BdAddr,
    rc_channel: u8,
}

#[cfg(not(feature = "bluez"))]
fn parse_address(mac: &str) -> Result<BdAddr> {
    let invalid = || DriverError::Bluetooth(BluetoothError::InvalidAddress(mac.to_string()));

    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return Err(invalid());
    }

    let mut bytes = [0u8; 6];
    for (byte, part) in bytes.iter_mut().zip(&parts) {
        if part.len() != 2 {
            return Err(invalid());
        }
        *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
    }

    // bdaddr_t stores bytes in reverse order compared to the usual MAC string
    bytes.reverse();
    Ok(BdAddr { b: bytes })
}

#[cfg(not(feature = "bluez"))]
async fn open_rfcomm(address: BdAddr, channel: u8) -> Result<RfcommStream> {
    debug!(
        "opening RFCOMM socket (manual): channel={}, addr_bytes={:02X?}",
        channel, address.b
    );

    let raw = unsafe {
        libc::socket(
            AF_BLUETOOTH,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            BTPROTO_RFCOMM,
        )
    };
    if raw < 0 {
        return Err(DriverError::Bluetooth(BluetoothError::Connection(
            io::Error::last_os_error().to_string(),
        )));
    }
    // Owned from here on: every early return closes the socket.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let addr = SockAddrRc {
        rc_family: AF_BLUETOOTH as libc::sa_family_t,
        rc_bdaddr: address,
        rc_channel: channel,
    };

    let ret = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<SockAddrRc>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(DriverError::Bluetooth(BluetoothError::Connection(
                err.to_string(),
            )));
        }
    }

    // The socket turns writable once the connect has completed or failed.
    let inner = AsyncFd::new(fd)?;
    drop(inner.writable().await?);

    let stream = RfcommStream { inner };
    stream.verify_connected()?;
    Ok(stream)
}
