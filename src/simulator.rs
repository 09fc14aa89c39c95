//! Recording playback in place of a live headset.
//!
//! A recording is a flat concatenation of 45-byte frames exactly as they came
//! off the wire, with no header. Playback honours the original timing: the
//! wait before each block is derived from the packet counters it contains, so
//! drops captured in the recording are reproduced rather than smoothed over.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info};

use crate::errors::{DriverError, Result, SimulatorError};
use crate::protocol::{Decoder, RawBlock, FS, PAYLOAD_LENGTH};
use crate::source::DataSource;

const RECORDING_EXTENSION: &str = "bin";

/// Identifiers of the recordings available in `dir`, sorted.
pub fn list_recordings(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == RECORDING_EXTENSION))
        .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .collect();
    names.sort();
    names
}

/// Replays a recording in a continuous loop.
pub struct SimulatorSource {
    id: String,
    dir: PathBuf,
    data: Option<Vec<u8>>,
    cursor: usize,
    last_counter: Option<i64>,
}

impl SimulatorSource {
    /// `id` is either a recording name inside `dir` or a path to a `.bin` file.
    pub fn new(id: impl Into<String>, dir: &Path) -> Self {
        Self {
            id: id.into(),
            dir: dir.to_path_buf(),
            data: None,
            cursor: 0,
            last_counter: None,
        }
    }

    fn resolve(&self) -> std::result::Result<PathBuf, SimulatorError> {
        let direct = Path::new(&self.id);
        if direct.extension().is_some_and(|ext| ext == RECORDING_EXTENSION) && direct.is_file() {
            return Ok(direct.to_path_buf());
        }

        let in_dir = self.dir.join(format!("{}.{}", self.id, RECORDING_EXTENSION));
        if in_dir.is_file() {
            return Ok(in_dir);
        }

        Err(SimulatorError::NotFound {
            id: self.id.clone(),
            available: list_recordings(&self.dir),
        })
    }

    /// Next block of `n_samp` frames, wrapping to the start of the recording
    /// when the remaining data cannot fill it.
    fn next_block(&mut self, n_samp: usize) -> Result<RawBlock> {
        let data = self
            .data
            .as_ref()
            .ok_or_else(|| DriverError::NotReady("simulator not connected".into()))?;
        let len = PAYLOAD_LENGTH * n_samp;

        if data.len() < len {
            return Err(SimulatorError::TooShort {
                path: PathBuf::from(&self.id),
                len: data.len(),
                block: len,
            }
            .into());
        }

        if self.cursor + len > data.len() {
            info!("Simulator record looping");
            self.cursor = 0;
            self.last_counter = None;
        }

        let block = RawBlock::from_full_read(data[self.cursor..self.cursor + len].to_vec());
        self.cursor += len;
        Ok(block)
    }

    /// How long the device took to produce `block` after the previous one.
    fn pacing(&mut self, block: &RawBlock) -> Duration {
        let counts = Decoder::new(block).packet_count();
        let first = i64::from(counts[0]);
        let last = i64::from(counts[counts.len() - 1]);

        let previous = self.last_counter.unwrap_or(first - 1);
        self.last_counter = Some(last);

        let delta = (last - previous).max(0);
        Duration::from_secs_f64(delta as f64 / FS)
    }
}

#[async_trait]
impl DataSource for SimulatorSource {
    fn describe(&self) -> String {
        format!("simulator:{}", self.id)
    }

    async fn connect(&mut self) -> Result<()> {
        let path = match self.resolve() {
            Ok(path) => path,
            Err(e) => {
                if let SimulatorError::NotFound { id, available } = &e {
                    error!("Could not find simulator recording: {}", id);
                    info!("Available simulators: {:?}", available);
                }
                return Err(e.into());
            }
        };

        let data = tokio::fs::read(&path).await?;
        info!(
            "Starting Unicorn simulator: recording={}, frames={}",
            path.display(),
            data.len() / PAYLOAD_LENGTH
        );

        self.data = Some(data);
        self.cursor = 0;
        self.last_counter = None;
        Ok(())
    }

    async fn send_command(&mut self, command: &[u8]) -> Result<()> {
        debug!("simulator ignoring command {:02X?}", command);
        Ok(())
    }

    async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        // Only acknowledgements are read this way; the simulator always succeeds.
        Ok(vec![0u8; len])
    }

    async fn read_block(&mut self, n_samp: usize) -> Result<RawBlock> {
        let block = self.next_block(n_samp)?;
        let wait = self.pacing(&block);
        tokio::time::sleep(wait).await;
        Ok(block)
    }

    async fn close(&mut self) -> Result<()> {
        self.data = None;
        Ok(())
    }
}
