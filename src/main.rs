use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};

use unicorn_rs::config::DEFAULT_N_SAMP;
use unicorn_rs::logging::init_rust_logging;
use unicorn_rs::{
    list_recordings, AckPolicy, Connection, ConnectionSettings, DriverConfig, Outputs,
    SimulatorMatch,
};

#[derive(Parser, Debug)]
#[command(
    name = "unicorn-stream",
    about = "Stream a Unicorn EEG headset (or a recording) and log what arrives"
)]
struct Args {
    /// Bluetooth MAC (C4:BE:84:XX:XX:XX), serial device, or simulator recording
    #[arg(long, env = "UNICORN_ADDRESS")]
    address: Option<String>,
    /// Frames per block
    #[arg(long, env = "UNICORN_N_SAMP", default_value_t = DEFAULT_N_SAMP)]
    n_samp: usize,
    /// Directory holding simulator `.bin` recordings
    #[arg(long, env = "UNICORN_RECORDINGS")]
    recordings: Option<PathBuf>,
    /// Seconds to wait before reconnecting after a failure
    #[arg(long, default_value_t = 60.0)]
    reconnect_delay: f64,
    /// Read the device's start acknowledgement before streaming
    #[arg(long)]
    await_ack: bool,
    /// Only the bare word "simulator" selects the simulator
    #[arg(long)]
    exact_simulator_match: bool,
    /// Print the available recordings and exit
    #[arg(long)]
    list_recordings: bool,
}

impl Args {
    fn config(&self) -> Result<DriverConfig> {
        let mut config = DriverConfig::default();
        if let Some(dir) = &self.recordings {
            config.recordings_dir = dir.clone();
        }
        config.reconnect_delay = Duration::try_from_secs_f64(self.reconnect_delay)
            .context("invalid --reconnect-delay")?;
        if self.await_ack {
            config.ack = AckPolicy::Await;
        }
        if self.exact_simulator_match {
            config.simulator_match = SimulatorMatch::Exact;
        }
        Ok(config)
    }
}

fn main() {
    init_rust_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let config = args.config()?;

    if args.list_recordings {
        for name in list_recordings(&config.recordings_dir) {
            println!("{name}");
        }
        return Ok(());
    }

    let Some(address) = args.address.clone().filter(|a| !a.trim().is_empty()) else {
        bail!("no device address given (use --address or UNICORN_ADDRESS)");
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(stream(ConnectionSettings::new(address, args.n_samp), config))
}

async fn stream(settings: ConnectionSettings, config: DriverConfig) -> Result<()> {
    info!(
        "Connecting to {} with n_samp={}",
        settings.address().unwrap_or_default(),
        settings.n_samp
    );
    let (conn, outputs) = Connection::spawn(settings, config);

    let mut state = conn.watch_state();
    let state_task = tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = state.borrow_and_update().clone();
            info!("State: {:?}", current);
        }
    });
    let consumers = spawn_consumers(outputs);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Stopping...");
    conn.shutdown().await;

    state_task.abort();
    for task in consumers {
        if let Err(e) = task.await {
            warn!("consumer task failed: {e}");
        }
    }
    info!("Done.");
    Ok(())
}

/// Log every output block until the connection shuts down.
fn spawn_consumers(outputs: Outputs) -> Vec<tokio::task::JoinHandle<()>> {
    let Outputs {
        mut signal,
        mut motion,
        mut battery,
        mut dropped,
    } = outputs;

    vec![
        tokio::spawn(async move {
            while let Some(block) = signal.recv().await {
                let first = block.samples.first().copied().unwrap_or_default();
                let synthetic = block.interpolated.iter().filter(|&&i| i).count();
                info!(
                    "[{}] {} samples @ {:.3} | interpolated: {} | ch1..8: {:.1?}",
                    block.key,
                    block.len(),
                    block.offset,
                    synthetic,
                    first
                );
            }
        }),
        tokio::spawn(async move {
            while let Some(block) = motion.recv().await {
                let accel = block.accel().first().copied().unwrap_or_default();
                info!("[{}] accel(g): {:.3?}", block.key, accel);
            }
        }),
        tokio::spawn(async move {
            while let Some(level) = battery.recv().await {
                info!("Battery: {:.0}%", level * 100.0);
            }
        }),
        tokio::spawn(async move {
            while let Some(n) = dropped.recv().await {
                warn!("Dropped {} frame(s)", n);
            }
        }),
    ]
}
