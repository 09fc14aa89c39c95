//! Serial-port transport for headsets bound with `rfcomm bind`.
//!
//! `serialport` is blocking, so every call runs on tokio's blocking pool and
//! is bounded by the port timeout. If the caller abandons a read, the port is
//! dropped (and closed) when that blocking call returns.

use std::io::{Read, Write};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serialport::SerialPort;

use crate::errors::{DriverError, Result};
use crate::source::DataSource;

pub struct SerialSource {
    path: String,
    baud: u32,
    timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialSource {
    pub fn new(path: impl Into<String>, baud: u32, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            baud,
            timeout,
            port: None,
        }
    }

    fn take_port(&mut self) -> Result<Box<dyn SerialPort>> {
        self.port
            .take()
            .ok_or_else(|| DriverError::NotReady(format!("serial port {} not open", self.path)))
    }

    /// Run `op` against the port on the blocking pool and put the port back.
    async fn with_port<T, F>(&mut self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Box<dyn SerialPort>) -> std::io::Result<T> + Send + 'static,
    {
        let mut port = self.take_port()?;
        let (port, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut port);
            (port, result)
        })
        .await
        .map_err(|e| DriverError::Command(format!("serial worker failed: {e}")))?;
        self.port = Some(port);
        Ok(result?)
    }
}

#[async_trait]
impl DataSource for SerialSource {
    fn describe(&self) -> String {
        format!("serial:{}", self.path)
    }

    async fn connect(&mut self) -> Result<()> {
        let path = self.path.clone();
        let (baud, timeout) = (self.baud, self.timeout);
        debug!("opening serial port: path={}, baud={}", path, baud);

        let port = tokio::task::spawn_blocking(move || {
            serialport::new(path, baud).timeout(timeout).open()
        })
        .await
        .map_err(|e| DriverError::Command(format!("serial worker failed: {e}")))??;

        self.port = Some(port);
        Ok(())
    }

    async fn send_command(&mut self, command: &[u8]) -> Result<()> {
        let command = command.to_vec();
        self.with_port(move |port| {
            port.write_all(&command)?;
            port.flush()
        })
        .await
    }

    async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        self.with_port(move |port| {
            let mut buf = vec![0u8; len];
            port.read_exact(&mut buf)?;
            Ok(buf)
        })
        .await
    }

    async fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            debug!("closed serial port: path={}", self.path);
        }
        Ok(())
    }
}
