//! Connection lifecycle: connect, acquire, tear down, back off, retry.
//!
//! A [`Connection`] owns exactly one background task. That task owns the
//! active [`DataSource`] and the per-attempt [`PacketInterpolator`]; nothing
//! else ever touches them. New settings arrive on a `watch` channel and are
//! the only external input: they interrupt whatever the task is suspended on
//! (connect, read, backoff sleep), the current attempt is cleaned up, and the
//! task starts over from the new settings.
//!
//! ```text
//! Idle ──settings──▶ Connecting ──ok──▶ Streaming
//!   ▲                    │                  │ read error / timeout
//!   │                    ▼ error            ▼
//!   └──empty addr── Reconnecting ◀──────────┘
//! ```

use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{AckPolicy, ConnectionSettings, DriverConfig, Target};
use crate::errors::Result;
use crate::interpolator::{Interpolated, Motion, PacketInterpolator, Signal};
use crate::protocol::{ACK_LENGTH, START_ACQUISITION, STOP_ACQUISITION};
use crate::source::{Connector, DataSource, DeviceConnector};

/// Observable connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    /// No address configured, or parked after a configuration error.
    Idle,
    Connecting { address: String },
    Streaming { address: String },
    /// Waiting out the backoff delay before the next attempt.
    Reconnecting { address: String },
}

/// Receiving ends of the four output streams.
///
/// All channels are unbounded: the acquisition task never waits on a slow
/// consumer. Dropping a receiver simply discards that stream.
#[derive(Debug)]
pub struct Outputs {
    pub signal: mpsc::UnboundedReceiver<Signal>,
    pub motion: mpsc::UnboundedReceiver<Motion>,
    /// Battery fraction, once per block.
    pub battery: mpsc::UnboundedReceiver<f64>,
    /// Dropped-frame counts, only when non-zero.
    pub dropped: mpsc::UnboundedReceiver<u32>,
}

#[derive(Debug, Clone)]
struct OutputSinks {
    signal: mpsc::UnboundedSender<Signal>,
    motion: mpsc::UnboundedSender<Motion>,
    battery: mpsc::UnboundedSender<f64>,
    dropped: mpsc::UnboundedSender<u32>,
}

impl OutputSinks {
    fn channel() -> (Self, Outputs) {
        let (signal_tx, signal) = mpsc::unbounded_channel();
        let (motion_tx, motion) = mpsc::unbounded_channel();
        let (battery_tx, battery) = mpsc::unbounded_channel();
        let (dropped_tx, dropped) = mpsc::unbounded_channel();
        (
            Self {
                signal: signal_tx,
                motion: motion_tx,
                battery: battery_tx,
                dropped: dropped_tx,
            },
            Outputs {
                signal,
                motion,
                battery,
                dropped,
            },
        )
    }

    fn emit(&self, out: Interpolated) {
        // A closed channel only means nobody is listening to that stream.
        if out.dropped > 0 && self.dropped.send(out.dropped).is_err() {
            trace!("dropped-count receiver closed");
        }
        if self.signal.send(out.signal).is_err() {
            trace!("signal receiver closed");
        }
        if self.motion.send(out.motion).is_err() {
            trace!("motion receiver closed");
        }
        if self.battery.send(out.battery).is_err() {
            trace!("battery receiver closed");
        }
    }
}

/// Handle to a running connection task.
///
/// Must be created inside a tokio runtime. Dropping the handle cancels the
/// task; use [`Connection::shutdown`] to also wait for its cleanup.
pub struct Connection {
    settings: watch::Sender<ConnectionSettings>,
    state: watch::Receiver<State>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Connection {
    /// Start a connection using the built-in RFCOMM, serial and simulator sources.
    pub fn spawn(settings: ConnectionSettings, config: DriverConfig) -> (Self, Outputs) {
        Self::spawn_with(settings, config, DeviceConnector)
    }

    /// Start a connection whose sources come from `connector`.
    pub fn spawn_with<C: Connector>(
        settings: ConnectionSettings,
        config: DriverConfig,
        connector: C,
    ) -> (Self, Outputs) {
        let (settings_tx, settings_rx) = watch::channel(settings);
        let (state_tx, state_rx) = watch::channel(State::Idle);
        let (sinks, outputs) = OutputSinks::channel();
        let cancel = CancellationToken::new();

        let driver = Driver {
            config: Arc::new(config),
            connector,
            settings: settings_rx,
            state: state_tx,
            sinks,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(driver.run());

        (
            Self {
                settings: settings_tx,
                state: state_rx,
                cancel,
                task: Some(task),
            },
            outputs,
        )
    }

    /// Switch to new settings, aborting the current attempt.
    ///
    /// Returns immediately; the running attempt is torn down in the background.
    pub fn reconnect(&self, settings: ConnectionSettings) {
        info!("new connection settings: {:?}", settings);
        self.settings.send_replace(settings);
    }

    /// Settings currently in effect.
    pub fn settings(&self) -> ConnectionSettings {
        self.settings.borrow().clone()
    }

    pub fn state(&self) -> State {
        self.state.borrow().clone()
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<State> {
        self.state.clone()
    }

    /// Stop the task and wait until its transport is closed.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("connection task failed: {e}");
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Why a suspended operation was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    /// New settings arrived.
    Requested,
    /// The handle was shut down or dropped.
    Shutdown,
}

/// Resolves when the current attempt must be abandoned.
async fn interrupted(
    settings: &mut watch::Receiver<ConnectionSettings>,
    cancel: &CancellationToken,
) -> Interrupt {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Interrupt::Shutdown,
        changed = settings.changed() => match changed {
            Ok(()) => Interrupt::Requested,
            Err(_) => Interrupt::Shutdown,
        },
    }
}

struct Driver<C> {
    config: Arc<DriverConfig>,
    connector: C,
    settings: watch::Receiver<ConnectionSettings>,
    state: watch::Sender<State>,
    sinks: OutputSinks,
    cancel: CancellationToken,
}

impl<C: Connector> Driver<C> {
    async fn run(mut self) {
        loop {
            let settings = self.settings.borrow_and_update().clone();
            let outcome = match settings.target(&self.config) {
                Target::Idle => {
                    debug!("no device address specified");
                    None
                }
                target => self.run_target(&settings, &target).await,
            };

            match outcome {
                Some(Interrupt::Shutdown) => break,
                Some(Interrupt::Requested) => continue,
                None => {
                    self.set_state(State::Idle);
                    if interrupted(&mut self.settings, &self.cancel).await == Interrupt::Shutdown {
                        break;
                    }
                }
            }
        }
        self.set_state(State::Idle);
        debug!("connection task stopped");
    }

    fn set_state(&self, state: State) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!("connection state: {:?}", state);
                *current = state;
                true
            }
        });
    }

    fn pending_request(&self) -> bool {
        self.settings.has_changed().unwrap_or(true)
    }

    /// Reconnection loop for one set of settings.
    ///
    /// Returns `None` when the target cannot be used with these settings and the
    /// machine should idle until new ones arrive.
    async fn run_target(
        &mut self,
        settings: &ConnectionSettings,
        target: &Target,
    ) -> Option<Interrupt> {
        let address = settings.address().unwrap_or_default().to_string();

        loop {
            if self.cancel.is_cancelled() {
                return Some(Interrupt::Shutdown);
            }
            if self.pending_request() {
                return Some(Interrupt::Requested);
            }

            self.set_state(State::Connecting {
                address: address.clone(),
            });

            let failure = match self.connector.source_for(target, settings, &self.config) {
                Ok(mut source) => {
                    match self.attempt(source.as_mut(), settings, &address).await {
                        Attempt::Interrupted(i) => return Some(i),
                        Attempt::Failed(e) => e,
                    }
                }
                Err(e) => e,
            };

            if !failure.is_retryable() {
                error!("cannot use {}: {}", address, failure);
                return None;
            }

            self.set_state(State::Reconnecting {
                address: address.clone(),
            });
            debug!(
                "retrying {} in {:?} after: {}",
                address, self.config.reconnect_delay, failure
            );
            tokio::select! {
                i = interrupted(&mut self.settings, &self.cancel) => return Some(i),
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
    }

    /// One connect / acquire / cleanup cycle.
    async fn attempt(
        &mut self,
        source: &mut dyn DataSource,
        settings: &ConnectionSettings,
        address: &str,
    ) -> Attempt {
        let connected = tokio::select! {
            i = interrupted(&mut self.settings, &self.cancel) => Err(Attempt::Interrupted(i)),
            r = source.connect() => r.map_err(|e| {
                debug!("could not open connection to {}: {}", source_name(address), e);
                Attempt::Failed(e)
            }),
        };
        if let Err(outcome) = connected {
            // A half-open transport still gets closed.
            self.cleanup(source, false).await;
            return outcome;
        }

        let outcome = self.acquire(source, settings, address).await;
        self.cleanup(source, true).await;
        outcome
    }

    /// Start acquisition and forward blocks until something breaks the loop.
    async fn acquire(
        &mut self,
        source: &mut dyn DataSource,
        settings: &ConnectionSettings,
        address: &str,
    ) -> Attempt {
        debug!("starting stream on {}", source.describe());
        if let Err(e) = self.start(source).await {
            return e;
        }

        self.set_state(State::Streaming {
            address: address.to_string(),
        });

        let n_samp = settings.frames_per_block();
        let mut interpolator = PacketInterpolator::new(address);

        loop {
            let block = tokio::select! {
                biased;
                i = interrupted(&mut self.settings, &self.cancel) => return Attempt::Interrupted(i),
                block = source.read_block(n_samp) => block,
            };

            match block {
                Ok(block) => self.sinks.emit(interpolator.process(&block)),
                Err(e) => {
                    warn!("{} disconnected: {}", source.describe(), e);
                    return Attempt::Failed(e);
                }
            }
        }
    }

    /// Send the start command and, if configured, wait for its acknowledgement.
    async fn start(&mut self, source: &mut dyn DataSource) -> std::result::Result<(), Attempt> {
        let started: Result<()> = tokio::select! {
            i = interrupted(&mut self.settings, &self.cancel) => return Err(Attempt::Interrupted(i)),
            r = source.send_command(&START_ACQUISITION) => r,
        };
        started.map_err(Attempt::Failed)?;

        if self.config.ack == AckPolicy::Await {
            let ack = tokio::select! {
                i = interrupted(&mut self.settings, &self.cancel) => return Err(Attempt::Interrupted(i)),
                r = source.read_exact(ACK_LENGTH) => r,
            };
            let ack = ack.map_err(Attempt::Failed)?;
            debug!("start acknowledged: {:02X?}", ack);
        }
        Ok(())
    }

    /// Stop acquisition and close, bounded by the cleanup timeout. Never fails.
    async fn cleanup(&self, source: &mut dyn DataSource, streaming: bool) {
        let name = source.describe();
        let teardown = async {
            if streaming {
                debug!("stopping stream on {}", name);
                if let Err(e) = source.send_command(&STOP_ACQUISITION).await {
                    debug!("stop command failed on {}: {}", name, e);
                }
            }
            if let Err(e) = source.close().await {
                debug!("close failed on {}: {}", name, e);
            }
        };
        if tokio::time::timeout(self.config.cleanup_timeout, teardown)
            .await
            .is_err()
        {
            warn!(
                "cleanup of {} did not finish within {:?}; abandoning transport",
                name, self.config.cleanup_timeout
            );
        }
    }
}

enum Attempt {
    Interrupted(Interrupt),
    Failed(crate::errors::DriverError),
}

fn source_name(address: &str) -> &str {
    if address.is_empty() {
        "<none>"
    } else {
        address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DriverError;
    use crate::protocol::{Frame, RawBlock};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Connect,
        Command(Vec<u8>),
        Ack,
        Close,
    }

    #[derive(Default)]
    struct Shared {
        events: Mutex<Vec<Event>>,
        attempts: AtomicUsize,
        /// Connects that fail with a retryable error before one succeeds.
        failing_connects: AtomicUsize,
        /// Every connect fails with a configuration error.
        reject: bool,
        /// Block reads that fail with a reset, each after one good block.
        failing_reads: AtomicUsize,
    }

    impl Shared {
        fn push(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    #[derive(Clone)]
    struct MockConnector(Arc<Shared>);

    impl Connector for MockConnector {
        fn source_for(
            &self,
            _target: &Target,
            _settings: &ConnectionSettings,
            _config: &DriverConfig,
        ) -> Result<Box<dyn DataSource>> {
            self.0.attempts.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockSource {
                shared: self.0.clone(),
                counter: 0,
            }))
        }
    }

    struct MockSource {
        shared: Arc<Shared>,
        counter: u32,
    }

    #[async_trait::async_trait]
    impl DataSource for MockSource {
        fn describe(&self) -> String {
            "mock".into()
        }

        async fn connect(&mut self) -> Result<()> {
            self.shared.push(Event::Connect);
            if self.shared.reject {
                return Err(DriverError::Protocol("unusable device".into()));
            }
            let failing = &self.shared.failing_connects;
            if failing.load(Ordering::SeqCst) > 0 {
                failing.fetch_sub(1, Ordering::SeqCst);
                return Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into());
            }
            Ok(())
        }

        async fn send_command(&mut self, command: &[u8]) -> Result<()> {
            self.shared.push(Event::Command(command.to_vec()));
            Ok(())
        }

        async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
            self.shared.push(Event::Ack);
            Ok(vec![0; len])
        }

        async fn read_block(&mut self, n_samp: usize) -> Result<RawBlock> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let failing = &self.shared.failing_reads;
            if self.counter > 0 && failing.load(Ordering::SeqCst) > 0 {
                failing.fetch_sub(1, Ordering::SeqCst);
                return Err(std::io::Error::from(std::io::ErrorKind::ConnectionReset).into());
            }
            let frames: Vec<Frame> = (0..n_samp)
                .map(|_| {
                    self.counter += 1;
                    Frame {
                        counter: self.counter,
                        ..Frame::default()
                    }
                })
                .collect();
            RawBlock::from_frames(&frames)
        }

        async fn close(&mut self) -> Result<()> {
            self.shared.push(Event::Close);
            Ok(())
        }
    }

    fn settings() -> ConnectionSettings {
        ConnectionSettings::new("C4:BE:84:00:00:01", 50)
    }

    fn spawn(shared: &Arc<Shared>, config: DriverConfig) -> (Connection, Outputs) {
        Connection::spawn_with(settings(), config, MockConnector(shared.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn streams_blocks_after_start_command() {
        let shared = Arc::new(Shared::default());
        let (conn, mut outputs) = spawn(&shared, DriverConfig::default());

        let signal = outputs.signal.recv().await.unwrap();
        assert_eq!(signal.len(), 50);
        assert_eq!(signal.key, "EEG_C4:BE:84:00:00:01");
        assert!(outputs.motion.recv().await.is_some());
        assert!(outputs.battery.recv().await.is_some());
        assert!(matches!(conn.state(), State::Streaming { .. }));

        let events = shared.events();
        assert_eq!(events[0], Event::Connect);
        assert_eq!(events[1], Event::Command(START_ACQUISITION.to_vec()));
        assert!(!events.contains(&Event::Ack));
        conn.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn empty_address_stops_and_goes_idle() {
        let shared = Arc::new(Shared::default());
        let (conn, mut outputs) = spawn(&shared, DriverConfig::default());
        outputs.signal.recv().await.unwrap();

        conn.reconnect(ConnectionSettings::disconnected());
        let mut state = conn.watch_state();
        state.wait_for(|s| *s == State::Idle).await.unwrap();

        let events = shared.events();
        let n = events.len();
        assert_eq!(events[n - 2], Event::Command(STOP_ACQUISITION.to_vec()));
        assert_eq!(events[n - 1], Event::Close);

        while outputs.signal.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(outputs.signal.try_recv().is_err());
        assert_eq!(shared.attempts.load(Ordering::SeqCst), 1);
        conn.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_backs_off_then_retries() {
        let shared = Arc::new(Shared {
            failing_connects: AtomicUsize::new(1),
            ..Shared::default()
        });
        let config = DriverConfig {
            reconnect_delay: Duration::from_secs(60),
            ..DriverConfig::default()
        };
        let started = Instant::now();
        let (conn, mut outputs) = spawn(&shared, config);

        outputs.signal.recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(shared.attempts.load(Ordering::SeqCst), 2);

        // The failed attempt was still closed.
        let events = shared.events();
        assert_eq!(&events[..3], &[Event::Connect, Event::Close, Event::Connect]);
        conn.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn read_failure_stops_closes_and_retries_after_backoff() {
        let shared = Arc::new(Shared {
            failing_reads: AtomicUsize::new(1),
            ..Shared::default()
        });
        let config = DriverConfig {
            reconnect_delay: Duration::from_secs(60),
            ..DriverConfig::default()
        };
        let (conn, mut outputs) = spawn(&shared, config);
        outputs.signal.recv().await.unwrap();

        let mut state = conn.watch_state();
        state
            .wait_for(|s| matches!(s, State::Reconnecting { .. }))
            .await
            .unwrap();
        let failed_at = Instant::now();
        assert_eq!(
            shared.events(),
            vec![
                Event::Connect,
                Event::Command(START_ACQUISITION.to_vec()),
                Event::Command(STOP_ACQUISITION.to_vec()),
                Event::Close,
            ]
        );

        let signal = outputs.signal.recv().await.unwrap();
        assert!(failed_at.elapsed() >= Duration::from_secs(60));
        assert_eq!(signal.key, "EEG_C4:BE:84:00:00:01");
        assert_eq!(shared.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(shared.events()[4], Event::Connect);
        assert!(matches!(conn.state(), State::Streaming { .. }));
        conn.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn switching_address_cleans_up_before_connecting_again() {
        let shared = Arc::new(Shared::default());
        let (conn, mut outputs) = spawn(&shared, DriverConfig::default());
        outputs.signal.recv().await.unwrap();

        conn.reconnect(ConnectionSettings::new("C4:BE:84:00:00:02", 50));
        let signal = loop {
            let signal = outputs.signal.recv().await.unwrap();
            if signal.key != "EEG_C4:BE:84:00:00:01" {
                break signal;
            }
        };
        assert_eq!(signal.key, "EEG_C4:BE:84:00:00:02");
        assert_eq!(conn.settings().address(), Some("C4:BE:84:00:00:02"));

        let events = shared.events();
        assert_eq!(
            events,
            vec![
                Event::Connect,
                Event::Command(START_ACQUISITION.to_vec()),
                Event::Command(STOP_ACQUISITION.to_vec()),
                Event::Close,
                Event::Connect,
                Event::Command(START_ACQUISITION.to_vec()),
            ]
        );
        assert_eq!(shared.attempts.load(Ordering::SeqCst), 2);
        conn.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn new_settings_cut_the_backoff_short() {
        let shared = Arc::new(Shared {
            failing_connects: AtomicUsize::new(1),
            ..Shared::default()
        });
        let started = Instant::now();
        let (conn, mut outputs) = spawn(&shared, DriverConfig::default());

        let mut state = conn.watch_state();
        state
            .wait_for(|s| matches!(s, State::Reconnecting { .. }))
            .await
            .unwrap();
        conn.reconnect(ConnectionSettings::new("C4:BE:84:00:00:02", 10));

        let signal = outputs.signal.recv().await.unwrap();
        assert_eq!(signal.len(), 10);
        assert_eq!(signal.key, "EEG_C4:BE:84:00:00:02");
        assert!(started.elapsed() < Duration::from_secs(60));
        conn.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn configuration_error_parks_idle_without_retrying() {
        let shared = Arc::new(Shared {
            reject: true,
            ..Shared::default()
        });
        let (conn, mut outputs) = spawn(&shared, DriverConfig::default());

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(conn.state(), State::Idle);
        assert_eq!(shared.attempts.load(Ordering::SeqCst), 1);
        assert!(outputs.signal.try_recv().is_err());
        conn.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn await_policy_reads_the_acknowledgement() {
        let shared = Arc::new(Shared::default());
        let config = DriverConfig {
            ack: AckPolicy::Await,
            ..DriverConfig::default()
        };
        let (conn, mut outputs) = spawn(&shared, config);
        outputs.signal.recv().await.unwrap();

        let events = shared.events();
        assert_eq!(events[1], Event::Command(START_ACQUISITION.to_vec()));
        assert_eq!(events[2], Event::Ack);
        conn.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_and_closes_the_source() {
        let shared = Arc::new(Shared::default());
        let (conn, mut outputs) = spawn(&shared, DriverConfig::default());
        outputs.signal.recv().await.unwrap();

        conn.shutdown().await;
        let events = shared.events();
        assert!(events.contains(&Event::Command(STOP_ACQUISITION.to_vec())));
        assert_eq!(events.last(), Some(&Event::Close));
    }

    struct CountingConnector(Arc<AtomicUsize>);

    impl Connector for CountingConnector {
        fn source_for(
            &self,
            target: &Target,
            settings: &ConnectionSettings,
            config: &DriverConfig,
        ) -> Result<Box<dyn DataSource>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            DeviceConnector.source_for(target, settings, config)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_recording_yields_no_data() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let config = DriverConfig {
            recordings_dir: "/nonexistent/unicorn-recordings".into(),
            ..DriverConfig::default()
        };
        let (conn, mut outputs) = Connection::spawn_with(
            ConnectionSettings::new("simulator_missing", 50),
            config,
            CountingConnector(attempts.clone()),
        );

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(conn.state(), State::Idle);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(outputs.signal.try_recv().is_err());
        conn.shutdown().await;
    }
}
