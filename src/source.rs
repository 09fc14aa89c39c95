//! Transport abstraction shared by the reconnect state machine.
//!
//! The state machine never talks to a socket directly. It asks a
//! [`Connector`] for a [`DataSource`] matching the configured address and
//! drives it through `connect`, `send_command`, `read_block` and `close`.
//! Native RFCOMM sockets, pre-bound serial devices and the recording
//! simulator all satisfy the same capability.

use async_trait::async_trait;

use crate::bluetooth::RfcommSource;
use crate::config::{ConnectionSettings, DriverConfig, Target};
use crate::errors::{DriverError, Result};
use crate::protocol::{RawBlock, PAYLOAD_LENGTH};
use crate::serial::SerialSource;
use crate::simulator::SimulatorSource;

/// A byte stream carrying Unicorn frames.
#[async_trait]
pub trait DataSource: Send {
    /// Short human-readable description for logs.
    fn describe(&self) -> String;

    /// Open the underlying transport.
    async fn connect(&mut self) -> Result<()>;

    /// Write a device command.
    async fn send_command(&mut self, command: &[u8]) -> Result<()>;

    /// Read exactly `len` bytes, suspending until they arrive or the stream fails.
    async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>>;

    /// Read one block of `n_samp` whole frames.
    async fn read_block(&mut self, n_samp: usize) -> Result<RawBlock> {
        let bytes = self.read_exact(PAYLOAD_LENGTH * n_samp).await?;
        Ok(RawBlock::from_full_read(bytes))
    }

    /// Release the transport. Must be safe to call more than once.
    async fn close(&mut self) -> Result<()>;
}

/// Builds a fresh [`DataSource`] for every connection attempt.
pub trait Connector: Send + Sync + 'static {
    fn source_for(
        &self,
        target: &Target,
        settings: &ConnectionSettings,
        config: &DriverConfig,
    ) -> Result<Box<dyn DataSource>>;
}

/// Picks the RFCOMM, serial or simulator source from the address.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceConnector;

impl Connector for DeviceConnector {
    fn source_for(
        &self,
        target: &Target,
        _settings: &ConnectionSettings,
        config: &DriverConfig,
    ) -> Result<Box<dyn DataSource>> {
        match target {
            Target::Idle => Err(DriverError::NotReady("no device address specified".into())),
            Target::Simulator(id) => Ok(Box::new(SimulatorSource::new(
                id.clone(),
                &config.recordings_dir,
            ))),
            Target::Serial(path) => Ok(Box::new(SerialSource::new(
                path.clone(),
                config.serial_baud,
                config.io_timeout,
            ))),
            Target::Rfcomm(mac) => Ok(Box::new(RfcommSource::new(mac, config)?)),
        }
    }
}
