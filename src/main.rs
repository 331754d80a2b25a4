//! Host binary: assemble the node from host drivers and keep it running.
//!
//! The process never exits on its own; `run()` returning is a request to
//! rebuild the node (operator restart or heap starvation), so the main
//! loop constructs a fresh orchestrator and goes again.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use micrelay::capture::CpalDriver;
use micrelay::config::Config;
use micrelay::console::{CommandSource, StdinSource};
use micrelay::link::HostLink;
use micrelay::logging;
use micrelay::memory::SystemHeapProbe;
use micrelay::orchestrator::{ExitReason, NodeParts, Orchestrator};
use micrelay::stats::Stats;
use micrelay::time::{SharedClock, SystemClock};
use micrelay::watchdog::SoftWatchdog;

/// Reported signal level for the host link, which has no radio to ask.
const HOST_RSSI_DBM: i32 = -50;

#[derive(Parser, Debug)]
#[command(name = "micrelay", about = "Microphone capture relayed over TCP")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Override the receiver host.
    #[arg(long)]
    host: Option<String>,

    /// Override the receiver port.
    #[arg(long)]
    port: Option<u16>,
}

fn load_config(cli: &Cli) -> Config {
    let mut cfg = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                // Startup validation will refuse to run the defaults, but
                // the node must still come up for the console.
                eprintln!("failed to load config {}: {e}", path.display());
                Config::default()
            }
        },
        None => Config::default(),
    };

    if let Some(host) = &cli.host {
        cfg.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        cfg.server.port = port;
    }
    cfg
}

fn main() {
    let cli = Cli::parse();
    let cfg = load_config(&cli);

    let clock: SharedClock = Arc::new(SystemClock::new());
    let stats = Stats::new();

    if let Err(e) = logging::init_logging(&cfg.logger, clock.clone(), &stats) {
        eprintln!("failed to initialize logging: {e}");
    }

    // Per-node jitter seed; never wallclock, which would alias across a
    // fleet booted by the same outage.
    let jitter_seed = std::process::id();

    loop {
        // A node without a console is degraded but must still stream.
        let console: Option<Box<dyn CommandSource>> = match StdinSource::spawn() {
            Ok(source) => Some(Box::new(source)),
            Err(e) => {
                tracing::warn!("console reader unavailable, running without it: {e}");
                None
            }
        };

        let parts = NodeParts {
            driver: Box::new(CpalDriver::new()),
            wireless: Box::new(HostLink::new(HOST_RSSI_DBM)),
            heap: Box::new(SystemHeapProbe),
            watchdog: Box::new(SoftWatchdog::new(clock.clone())),
            console,
            clock: clock.clone(),
            stats: stats.clone(),
            jitter_seed,
        };

        let mut node = Orchestrator::new(cfg.clone(), parts);
        match node.run() {
            ExitReason::RestartRequested => {
                tracing::info!("restarting node");
            }
            ExitReason::HeapExhausted => {
                tracing::error!("node restarting after heap exhaustion");
            }
        }
    }
}
