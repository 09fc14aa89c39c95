//! Connection settings and driver configuration.

use std::path::PathBuf;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

/// Default frames per physical read.
pub const DEFAULT_N_SAMP: usize = 50;

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_IO_TIMEOUT_SECS: u64 = 5;
const DEFAULT_RECONNECT_DELAY_SECS: u64 = 60;
const DEFAULT_CLEANUP_TIMEOUT_SECS: u64 = 2;
const DEFAULT_SERIAL_BAUD: u32 = 115_200;
const DEFAULT_SIMULATOR_MARKER: &str = "simulator";
const RECORDINGS_ENV: &str = "UNICORN_RECORDINGS";

/// What to connect to and how many frames to read at a time.
///
/// Sent once at spawn and again whenever the caller wants to switch device.
/// An absent or empty address means "stay disconnected".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// `XX:XX:XX:XX:XX:XX`, a simulator recording, or a serial device path.
    pub address: Option<String>,
    /// Frames per block.
    pub n_samp: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            address: None,
            n_samp: DEFAULT_N_SAMP,
        }
    }
}

impl ConnectionSettings {
    pub fn new(address: impl Into<String>, n_samp: usize) -> Self {
        Self {
            address: Some(address.into()),
            n_samp,
        }
    }

    /// Settings that keep the connection idle.
    pub fn disconnected() -> Self {
        Self::default()
    }

    /// Frames per block, never less than one.
    pub fn frames_per_block(&self) -> usize {
        if self.n_samp == 0 {
            warn!("n_samp=0 is invalid, reading one frame per block");
            1
        } else {
            self.n_samp
        }
    }

    /// Trimmed address, `None` when it is absent or blank.
    pub fn address(&self) -> Option<&str> {
        self.address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
    }

    /// Classify the address into the kind of source it selects.
    pub fn target(&self, config: &DriverConfig) -> Target {
        let Some(address) = self.address() else {
            return Target::Idle;
        };

        let is_simulator = match config.simulator_match {
            SimulatorMatch::Exact => address == config.simulator_marker,
            SimulatorMatch::Contains => address.contains(config.simulator_marker.as_str()),
        };

        if is_simulator {
            Target::Simulator(address.to_string())
        } else if is_serial_path(address) {
            Target::Serial(address.to_string())
        } else {
            Target::Rfcomm(address.to_string())
        }
    }
}

fn is_serial_path(address: &str) -> bool {
    address.starts_with("/dev/")
        || address
            .strip_prefix("COM")
            .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}

/// Kind of data source selected by a [`ConnectionSettings`] address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Idle,
    /// Replay of a recording, by identifier or path.
    Simulator(String),
    /// Pre-bound serial device such as `/dev/rfcomm0`.
    Serial(String),
    /// Bluetooth MAC address.
    Rfcomm(String),
}

/// How the device's command acknowledgements are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Start streaming straight after the start command.
    #[default]
    Skip,
    /// Read the 3-byte acknowledgement before the first block.
    Await,
}

/// How an address is recognised as a simulator recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulatorMatch {
    /// Only the bare marker selects the simulator.
    Exact,
    /// Any address containing the marker selects the simulator.
    #[default]
    Contains,
}

/// Tunables for the connection task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub channel: u8,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    /// Wait between attempts after a transport failure.
    pub reconnect_delay: Duration,
    /// Upper bound on stop command plus close.
    pub cleanup_timeout: Duration,
    pub ack: AckPolicy,
    pub simulator_match: SimulatorMatch,
    pub simulator_marker: String,
    pub recordings_dir: PathBuf,
    pub serial_baud: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            channel: crate::protocol::PORT,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            io_timeout: Duration::from_secs(DEFAULT_IO_TIMEOUT_SECS),
            reconnect_delay: Duration::from_secs(DEFAULT_RECONNECT_DELAY_SECS),
            cleanup_timeout: Duration::from_secs(DEFAULT_CLEANUP_TIMEOUT_SECS),
            ack: AckPolicy::default(),
            simulator_match: SimulatorMatch::default(),
            simulator_marker: DEFAULT_SIMULATOR_MARKER.to_string(),
            recordings_dir: default_recordings_dir(),
            serial_baud: DEFAULT_SERIAL_BAUD,
        }
    }
}

fn default_recordings_dir() -> PathBuf {
    std::env::var_os(RECORDINGS_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("recordings"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(address: &str) -> ConnectionSettings {
        ConnectionSettings::new(address, 10)
    }

    #[test]
    fn blank_addresses_are_idle() {
        let config = DriverConfig::default();
        assert_eq!(ConnectionSettings::disconnected().target(&config), Target::Idle);
        assert_eq!(settings("").target(&config), Target::Idle);
        assert_eq!(settings("   ").target(&config), Target::Idle);
    }

    #[test]
    fn simulator_matching_is_configurable() {
        let mut config = DriverConfig::default();
        assert_eq!(
            settings("simulator_eyes_closed").target(&config),
            Target::Simulator("simulator_eyes_closed".into())
        );

        config.simulator_match = SimulatorMatch::Exact;
        assert_eq!(
            settings("simulator").target(&config),
            Target::Simulator("simulator".into())
        );
        assert_eq!(
            settings("simulator_eyes_closed").target(&config),
            Target::Rfcomm("simulator_eyes_closed".into())
        );
    }

    #[test]
    fn classifies_serial_paths_and_macs() {
        let config = DriverConfig::default();
        assert_eq!(
            settings("/dev/rfcomm0").target(&config),
            Target::Serial("/dev/rfcomm0".into())
        );
        assert_eq!(settings("COM7").target(&config), Target::Serial("COM7".into()));
        assert_eq!(
            settings("60:B6:47:E1:26:9E").target(&config),
            Target::Rfcomm("60:B6:47:E1:26:9E".into())
        );
    }

    #[test]
    fn zero_frames_per_block_is_clamped() {
        assert_eq!(settings("x").frames_per_block(), 10);
        assert_eq!(ConnectionSettings::new("x", 0).frames_per_block(), 1);
    }
}
