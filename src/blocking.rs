//! Synchronous facade over [`Connection`] for callers without a tokio runtime.
//!
//! Owns a small runtime that drives the connection task. Each output stream
//! sits behind its own lock, so a thread waiting on one stream never holds up
//! readers of another.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::{ConnectionSettings, DriverConfig};
use crate::connection::{Connection, Outputs, State};
use crate::errors::{DriverError, Result};
use crate::interpolator::{Motion, Signal};
use crate::source::{Connector, DeviceConnector};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A [`Connection`] driven from blocking code.
///
/// Dropping it stops acquisition and closes the device, as [`close`] does.
///
/// [`close`]: BlockingConnection::close
pub struct BlockingConnection {
    // Declared before the runtime so the task is shut down while the runtime
    // is still alive.
    connection: Mutex<Option<Connection>>,
    signal: Mutex<UnboundedReceiver<Signal>>,
    motion: Mutex<UnboundedReceiver<Motion>>,
    battery: Mutex<UnboundedReceiver<f64>>,
    dropped: Mutex<UnboundedReceiver<u32>>,
    runtime: Runtime,
}

impl BlockingConnection {
    pub fn spawn(settings: ConnectionSettings, config: DriverConfig) -> Result<Self> {
        Self::spawn_with(settings, config, DeviceConnector)
    }

    pub fn spawn_with<C: Connector>(
        settings: ConnectionSettings,
        config: DriverConfig,
        connector: C,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("unicorn-rs")
            .enable_all()
            .build()
            .map_err(|e| DriverError::Command(format!("tokio runtime init failed: {e}")))?;

        let (connection, outputs) = {
            let _guard = runtime.enter();
            Connection::spawn_with(settings, config, connector)
        };
        let Outputs {
            signal,
            motion,
            battery,
            dropped,
        } = outputs;

        Ok(Self {
            connection: Mutex::new(Some(connection)),
            signal: Mutex::new(signal),
            motion: Mutex::new(motion),
            battery: Mutex::new(battery),
            dropped: Mutex::new(dropped),
            runtime,
        })
    }

    fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> T) -> Result<T> {
        lock(&self.connection)
            .as_ref()
            .map(f)
            .ok_or_else(|| DriverError::NotReady("connection is closed".into()))
    }

    /// Switch to new settings. Fails once the connection is closed.
    pub fn reconnect(&self, settings: ConnectionSettings) -> Result<()> {
        self.with_connection(|conn| conn.reconnect(settings))
    }

    pub fn settings(&self) -> Result<ConnectionSettings> {
        self.with_connection(Connection::settings)
    }

    /// Current state, `None` once closed.
    pub fn state(&self) -> Option<State> {
        lock(&self.connection).as_ref().map(Connection::state)
    }

    /// Wait for the next item on one stream. `None` on timeout or once the
    /// connection is closed and the stream drained.
    fn recv<T>(&self, rx: &Mutex<UnboundedReceiver<T>>, wait: Option<Duration>) -> Option<T> {
        let mut rx = lock(rx);
        self.runtime.block_on(async {
            match wait {
                Some(wait) => tokio::time::timeout(wait, rx.recv()).await.ok().flatten(),
                None => rx.recv().await,
            }
        })
    }

    pub fn next_signal(&self, wait: Option<Duration>) -> Option<Signal> {
        self.recv(&self.signal, wait)
    }

    pub fn next_motion(&self, wait: Option<Duration>) -> Option<Motion> {
        self.recv(&self.motion, wait)
    }

    pub fn next_battery(&self, wait: Option<Duration>) -> Option<f64> {
        self.recv(&self.battery, wait)
    }

    pub fn next_dropped(&self, wait: Option<Duration>) -> Option<u32> {
        self.recv(&self.dropped, wait)
    }

    /// Stop acquisition, close the device and wait for cleanup. Idempotent.
    pub fn close(&self) {
        let connection = lock(&self.connection).take();
        if let Some(connection) = connection {
            if Handle::try_current().is_ok() {
                // Cannot block inside a runtime; the handle's drop cancels instead.
                log::debug!("closing from async context, not waiting for cleanup");
                return;
            }
            self.runtime.block_on(connection.shutdown());
        }
    }
}

impl Drop for BlockingConnection {
    fn drop(&mut self) {
        self.close();
    }
}
