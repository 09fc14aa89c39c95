use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] BluetoothError),
    #[error("simulator error: {0}")]
    Simulator(#[from] SimulatorError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("device not ready: {0}")]
    NotReady(String),
}

impl DriverError {
    /// Whether the reconnect loop should back off and try the same target again.
    ///
    /// Transport faults are retried forever; configuration faults (bad address,
    /// unknown recording) wait for new settings instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            DriverError::Io(_)
            | DriverError::Serial(_)
            | DriverError::Timeout(_)
            | DriverError::Command(_)
            | DriverError::NotReady(_) => true,
            DriverError::Bluetooth(e) => !matches!(e, BluetoothError::InvalidAddress(_)),
            DriverError::Simulator(_) | DriverError::Protocol(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum BluetoothError {
    #[error("invalid bluetooth address: {0}")]
    InvalidAddress(String),
    #[error("connection not established: {0}")]
    NotConnected(String),
    #[error("rfcomm connection failed: {0}")]
    Connection(String),
}

#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error("could not find simulator recording {id:?} (available: {available:?})")]
    NotFound { id: String, available: Vec<String> },
    #[error("recording {path:?} holds {len} bytes, fewer than one block of {block} bytes")]
    TooShort {
        path: PathBuf,
        len: usize,
        block: usize,
    },
}

pub type Result<T> = std::result::Result<T, DriverError>;
