//! Unicorn EEG headset driver with Python bindings.
//!
//! The headset streams fixed 45-byte frames at 250 Hz over Bluetooth RFCOMM.
//! This crate decodes them, repairs packet loss by linear interpolation over
//! the frame counter, and keeps the link alive with an automatic reconnect
//! loop. A recording simulator stands in for the device during development.
//!
//! # Timing
//!
//! Output blocks carry an `offset` (Unix seconds of the first sample) and a
//! sampling rate, so sample `i` sits at `offset + i / fs`. The offset is taken
//! when the block is emitted and back-dated by the block duration, which
//! absorbs Bluetooth latency jitter across blocks rather than within them.
//!
//! ```no_run
//! use unicorn_rs::{Connection, ConnectionSettings, DriverConfig};
//!
//! # async fn demo() {
//! let (conn, mut outputs) =
//!     Connection::spawn(ConnectionSettings::new("C4:BE:84:12:34:56", 50), DriverConfig::default());
//! while let Some(signal) = outputs.signal.recv().await {
//!     println!("{} samples at {}", signal.len(), signal.offset);
//! }
//! conn.shutdown().await;
//! # }
//! ```

pub mod blocking;
pub mod bluetooth;
pub mod config;
pub mod connection;
pub mod errors;
pub mod interpolator;
pub mod logging;
pub mod protocol;
pub mod serial;
pub mod simulator;
pub mod source;

pub use blocking::BlockingConnection;
pub use bluetooth::RfcommSource;
pub use config::{AckPolicy, ConnectionSettings, DriverConfig, SimulatorMatch, Target};
pub use connection::{Connection, Outputs, State};
pub use errors::*;
pub use interpolator::{Interpolated, Motion, PacketInterpolator, Signal, TimeSeries};
pub use protocol::{Decoder, Frame, RawBlock};
pub use serial::SerialSource;
pub use simulator::{list_recordings, SimulatorSource};
pub use source::{Connector, DataSource, DeviceConnector};

// ============================================================================
// Python Bindings
// ============================================================================

#[cfg(feature = "python")]
mod python {
    use std::path::PathBuf;
    use std::time::Duration;

    use pyo3::exceptions::{PyConnectionError, PyRuntimeError, PyTimeoutError, PyValueError};
    use pyo3::prelude::*;
    use pyo3::types::PyDict;

    use crate::blocking::BlockingConnection;
    use crate::config::{AckPolicy, ConnectionSettings, DriverConfig, DEFAULT_N_SAMP};
    use crate::connection::State;
    use crate::errors::DriverError;
    use crate::interpolator::TimeSeries;
    use crate::logging;
    use crate::protocol::{Decoder, RawBlock, FS, PAYLOAD_LENGTH};

    fn to_py_err(e: DriverError) -> PyErr {
        match e {
            DriverError::Protocol(_) | DriverError::Simulator(_) => PyValueError::new_err(e.to_string()),
            DriverError::Timeout(_) => PyTimeoutError::new_err(e.to_string()),
            DriverError::Io(_) | DriverError::Serial(_) | DriverError::Bluetooth(_) => {
                PyConnectionError::new_err(e.to_string())
            }
            _ => PyRuntimeError::new_err(e.to_string()),
        }
    }

    /// A block of evenly spaced samples.
    ///
    /// Attributes:
    ///     key: Stream name, `EEG_<address>` or `MOTION_<address>`.
    ///     fs: Sampling rate in Hz.
    ///     offset: Unix time of the first sample, in seconds.
    ///     samples: One list per sample, one value per channel.
    ///     counters: Device frame counter of each sample.
    ///     interpolated: True where the sample was synthesized for a lost frame.
    #[pyclass(name = "TimeSeries", frozen)]
    #[derive(Clone)]
    struct PyTimeSeries {
        #[pyo3(get)]
        key: String,
        #[pyo3(get)]
        fs: f64,
        #[pyo3(get)]
        offset: f64,
        #[pyo3(get)]
        samples: Vec<Vec<f64>>,
        #[pyo3(get)]
        counters: Vec<u32>,
        #[pyo3(get)]
        interpolated: Vec<bool>,
    }

    #[pymethods]
    impl PyTimeSeries {
        /// Unix time of every sample.
        fn timestamps(&self) -> Vec<f64> {
            (0..self.samples.len())
                .map(|i| self.offset + i as f64 / self.fs)
                .collect()
        }

        fn __len__(&self) -> usize {
            self.samples.len()
        }

        fn __repr__(&self) -> String {
            format!(
                "TimeSeries(key={:?}, samples={}, offset={:.3}, interpolated={})",
                self.key,
                self.samples.len(),
                self.offset,
                self.interpolated.iter().filter(|&&i| i).count()
            )
        }
    }

    impl<const N: usize> From<TimeSeries<N>> for PyTimeSeries {
        fn from(ts: TimeSeries<N>) -> Self {
            PyTimeSeries {
                key: ts.key,
                fs: ts.fs,
                offset: ts.offset,
                samples: ts.samples.iter().map(|row| row.to_vec()).collect(),
                counters: ts.counters,
                interpolated: ts.interpolated,
            }
        }
    }

    /// Decode raw frames into physical units.
    ///
    /// Args:
    ///     data: A whole number of 45-byte frames.
    ///
    /// Returns:
    ///     dict with `eeg` (µV), `accel` (g), `gyro` (deg/s), `battery` (0-1)
    ///     and `counter`, one entry per frame.
    ///
    /// Raises:
    ///     ValueError: If `data` is empty or not a multiple of 45 bytes.
    #[pyfunction]
    fn decode<'py>(py: Python<'py>, data: &[u8]) -> PyResult<Bound<'py, PyDict>> {
        let block = RawBlock::new(data.to_vec()).map_err(to_py_err)?;
        let decoder = Decoder::new(&block);
        let rows = |v: Vec<[f64; 3]>| v.iter().map(|r| r.to_vec()).collect::<Vec<_>>();

        let dict = PyDict::new(py);
        dict.set_item(
            "eeg",
            decoder.eeg().iter().map(|r| r.to_vec()).collect::<Vec<_>>(),
        )?;
        dict.set_item("accel", rows(decoder.accel()))?;
        dict.set_item("gyro", rows(decoder.gyro()))?;
        dict.set_item("battery", decoder.battery())?;
        dict.set_item("counter", decoder.packet_count())?;
        Ok(dict)
    }

    /// Route Rust logs into Python's `logging` at `level` (or `UNICORN_LOG`).
    #[pyfunction]
    #[pyo3(signature = (level=None))]
    fn set_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        logging::set_python_log_level_str(py, level)
    }

    /// Forget cached Python loggers after reconfiguring `logging`.
    #[pyfunction]
    fn reset_log_cache() {
        logging::reset_python_logging_cache();
    }

    /// Live connection to a Unicorn headset or simulator.
    ///
    /// The connection runs in the background and reconnects on its own; read
    /// its output with the `next_*` methods.
    ///
    /// Example:
    ///     >>> device = Unicorn("C4:BE:84:12:34:56")
    ///     >>> eeg = device.next_signal(timeout=5.0)
    ///     >>> device.reconnect("simulator_eyes_closed")
    ///     >>> device.close()
    #[pyclass(name = "Unicorn")]
    struct PyUnicorn {
        inner: BlockingConnection,
    }

    fn to_wait(timeout: Option<f64>) -> PyResult<Option<Duration>> {
        timeout
            .map(Duration::try_from_secs_f64)
            .transpose()
            .map_err(|e| PyValueError::new_err(e.to_string()))
    }

    #[pymethods]
    impl PyUnicorn {
        /// Start a connection.
        ///
        /// Args:
        ///     address: MAC address, serial device path, or simulator recording.
        ///         None stays idle until `reconnect` is called.
        ///     n_samp: Frames per block (default 50, i.e. 200 ms).
        ///     recordings_dir: Directory holding simulator `.bin` recordings.
        ///     reconnect_delay: Seconds to wait after a connection failure.
        ///     await_ack: Read the device's start acknowledgement before streaming.
        #[new]
        #[pyo3(signature = (address=None, n_samp=DEFAULT_N_SAMP, recordings_dir=None, reconnect_delay=None, await_ack=false))]
        fn new(
            py: Python<'_>,
            address: Option<String>,
            n_samp: usize,
            recordings_dir: Option<PathBuf>,
            reconnect_delay: Option<f64>,
            await_ack: bool,
        ) -> PyResult<Self> {
            logging::init_python_logging(py)?;

            let mut config = DriverConfig::default();
            if let Some(dir) = recordings_dir {
                config.recordings_dir = dir;
            }
            if let Some(delay) = reconnect_delay {
                config.reconnect_delay = Duration::try_from_secs_f64(delay)
                    .map_err(|e| PyValueError::new_err(e.to_string()))?;
            }
            if await_ack {
                config.ack = AckPolicy::Await;
            }

            let settings = ConnectionSettings {
                address,
                n_samp,
            };
            let inner = BlockingConnection::spawn(settings, config).map_err(to_py_err)?;
            Ok(PyUnicorn { inner })
        }

        /// Switch device. An empty or None address disconnects.
        ///
        /// Args:
        ///     address: New address, or None to go idle.
        ///     n_samp: Frames per block; keeps the current value when None.
        #[pyo3(signature = (address=None, n_samp=None))]
        fn reconnect(&self, address: Option<String>, n_samp: Option<usize>) -> PyResult<()> {
            let n_samp = match n_samp {
                Some(n) => n,
                None => self.inner.settings().map_err(to_py_err)?.n_samp,
            };
            self.inner
                .reconnect(ConnectionSettings { address, n_samp })
                .map_err(to_py_err)
        }

        /// Next EEG block, or None on timeout.
        #[pyo3(signature = (timeout=None))]
        fn next_signal(&self, py: Python<'_>, timeout: Option<f64>) -> PyResult<Option<PyTimeSeries>> {
            let wait = to_wait(timeout)?;
            Ok(py.detach(|| self.inner.next_signal(wait)).map(PyTimeSeries::from))
        }

        /// Next accelerometer and gyroscope block, or None on timeout.
        #[pyo3(signature = (timeout=None))]
        fn next_motion(&self, py: Python<'_>, timeout: Option<f64>) -> PyResult<Option<PyTimeSeries>> {
            let wait = to_wait(timeout)?;
            Ok(py.detach(|| self.inner.next_motion(wait)).map(PyTimeSeries::from))
        }

        /// Next battery fraction (0-1), or None on timeout.
        #[pyo3(signature = (timeout=None))]
        fn next_battery(&self, py: Python<'_>, timeout: Option<f64>) -> PyResult<Option<f64>> {
            let wait = to_wait(timeout)?;
            Ok(py.detach(|| self.inner.next_battery(wait)))
        }

        /// Next dropped-frame count, or None on timeout.
        #[pyo3(signature = (timeout=None))]
        fn next_dropped(&self, py: Python<'_>, timeout: Option<f64>) -> PyResult<Option<u32>> {
            let wait = to_wait(timeout)?;
            Ok(py.detach(|| self.inner.next_dropped(wait)))
        }

        /// One of "idle", "connecting", "streaming", "reconnecting" or "closed".
        #[getter]
        fn state(&self) -> String {
            match self.inner.state() {
                None => "closed",
                Some(State::Idle) => "idle",
                Some(State::Connecting { .. }) => "connecting",
                Some(State::Streaming { .. }) => "streaming",
                Some(State::Reconnecting { .. }) => "reconnecting",
            }
            .to_string()
        }

        /// Stop acquisition and release the device. Further calls do nothing.
        fn close(&self, py: Python<'_>) {
            py.detach(|| self.inner.close());
        }

        fn __repr__(&self) -> String {
            let address = self
                .inner
                .settings()
                .ok()
                .and_then(|s| s.address().map(str::to_string));
            format!("Unicorn(address={:?}, state={})", address, self.state())
        }
    }

    #[pymodule]
    fn unicorn_rs(m: &Bound<'_, PyModule>) -> PyResult<()> {
        logging::init_python_logging(m.py())?;

        m.add_class::<PyUnicorn>()?;
        m.add_class::<PyTimeSeries>()?;
        m.add_function(wrap_pyfunction!(decode, m)?)?;
        m.add_function(wrap_pyfunction!(set_log_level, m)?)?;
        m.add_function(wrap_pyfunction!(reset_log_cache, m)?)?;

        m.add("FS", FS)?;
        m.add("PAYLOAD_LENGTH", PAYLOAD_LENGTH)?;
        m.add("DEFAULT_N_SAMP", DEFAULT_N_SAMP)?;
        Ok(())
    }
}
