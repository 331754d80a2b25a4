//! Top-level sequencing.
//!
//! One cooperative tick loop owns every subsystem and drives the node
//! state machine: associate, connect, stream, recover. Subsystems receive
//! the clock and statistics handles at construction and communicate back
//! through return values and state, never through callbacks or globals.
//! Inadmissible transitions are rejected unless forced by an emergency or
//! operator action.

use std::time::Duration;

use crate::capture::{CaptureDriver, CaptureEngine, DriverConfig, FailureClass};
use crate::config::Config;
use crate::console::{Command, CommandSource};
use crate::link::{AdaptiveSizer, TransportSession, WirelessInterface, WirelessSupervisor};
use crate::memory::{HeapProbe, MemoryAction, MemoryMonitor};
use crate::stats::Stats;
use crate::telemetry::{EventKind, TelemetryRing};
use crate::time::{IntervalTimer, SharedClock};
use crate::watchdog::Watchdog;

/// Cadence of the invalid-configuration reminder while refusing to start.
const CONFIG_REPORT_INTERVAL_MS: u64 = 10_000;

/// Cadence of the periodic statistics line while streaming.
const STATS_REPORT_INTERVAL_MS: u64 = 60_000;

/// Telemetry ring capacity.
const TELEMETRY_EVENTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Initializing,
    AssociatingWireless,
    ConnectingTransport,
    Streaming,
    Disconnected,
    Errored,
    Maintenance,
}

impl NodeState {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Initializing => "INITIALIZING",
            NodeState::AssociatingWireless => "ASSOCIATING_WIRELESS",
            NodeState::ConnectingTransport => "CONNECTING_TRANSPORT",
            NodeState::Streaming => "STREAMING",
            NodeState::Disconnected => "DISCONNECTED",
            NodeState::Errored => "ERRORED",
            NodeState::Maintenance => "MAINTENANCE",
        }
    }

    /// Budget a state may hold the node before recovery kicks in.
    pub fn max_duration_ms(self) -> Option<u64> {
        match self {
            NodeState::Initializing => Some(10_000),
            NodeState::AssociatingWireless => Some(30_000),
            NodeState::ConnectingTransport => Some(10_000),
            NodeState::Streaming => None,
            NodeState::Disconnected => None,
            NodeState::Errored => Some(60_000),
            NodeState::Maintenance => None,
        }
    }
}

/// Why a transition was requested; emergencies and operator commands may
/// bypass the admissibility table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCause {
    Normal,
    Emergency,
    Manual,
}

/// The admissible-transition table.
pub fn transition_admissible(from: NodeState, to: NodeState) -> bool {
    use NodeState::*;
    matches!(
        (from, to),
        (Initializing, AssociatingWireless)
            | (Initializing, Errored)
            | (AssociatingWireless, ConnectingTransport)
            | (AssociatingWireless, Errored)
            | (AssociatingWireless, AssociatingWireless)
            | (ConnectingTransport, Streaming)
            | (ConnectingTransport, Errored)
            | (ConnectingTransport, AssociatingWireless)
            | (ConnectingTransport, ConnectingTransport)
            | (Streaming, Disconnected)
            | (Streaming, Errored)
            | (Streaming, AssociatingWireless)
            | (Streaming, ConnectingTransport)
            | (Disconnected, ConnectingTransport)
            | (Disconnected, Errored)
            | (Disconnected, AssociatingWireless)
            | (Errored, AssociatingWireless)
            | (Errored, Maintenance)
            | (Errored, Errored)
            | (Maintenance, Initializing)
            | (Maintenance, AssociatingWireless)
    )
}

/// Why `run()` returned. The process itself never exits; the binary
/// rebuilds the node and calls `run()` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    RestartRequested,
    HeapExhausted,
}

/// Everything the orchestrator does not build itself: the hardware seams
/// and the shared capabilities.
pub struct NodeParts {
    pub driver: Box<dyn CaptureDriver>,
    pub wireless: Box<dyn WirelessInterface>,
    pub heap: Box<dyn HeapProbe>,
    pub watchdog: Box<dyn Watchdog>,
    pub console: Option<Box<dyn CommandSource>>,
    pub clock: SharedClock,
    pub stats: Stats,
    /// Seed for the jitter generators; per-node, never wallclock-derived.
    pub jitter_seed: u32,
}

pub struct Orchestrator {
    cfg: Config,
    clock: SharedClock,
    stats: Stats,
    capture: CaptureEngine,
    wireless: WirelessSupervisor,
    transport: TransportSession,
    sizer: AdaptiveSizer,
    memory: MemoryMonitor,
    watchdog: Box<dyn Watchdog>,
    console: Option<Box<dyn CommandSource>>,
    telemetry: TelemetryRing,
    state: NodeState,
    previous_state: NodeState,
    state_entered_ms: u64,
    consecutive_errors: u32,
    /// Outbound staging buffer, allocated once at construction.
    audio_buf: Vec<u8>,
    config_valid: bool,
    config_report_timer: IntervalTimer,
    stats_report_timer: IntervalTimer,
    pending_exit: Option<ExitReason>,
}

impl Orchestrator {
    pub fn new(cfg: Config, parts: NodeParts) -> Self {
        let clock = parts.clock;
        let stats = parts.stats;

        let config_valid = match cfg.validate() {
            Ok(()) => {
                tracing::info!("configuration validation passed ✓");
                true
            }
            Err(problems) => {
                for problem in &problems {
                    tracing::error!(%problem, "configuration invalid");
                }
                false
            }
        };

        let capture = CaptureEngine::new(
            parts.driver,
            DriverConfig::from_capture(&cfg.i2s),
            stats.clone(),
        );
        let wireless = WirelessSupervisor::new(
            parts.wireless,
            cfg.wifi.clone(),
            cfg.rssi.clone(),
            cfg.static_ip.clone(),
            clock.clone(),
            stats.clone(),
            parts.jitter_seed ^ 0x9E37_79B9,
        );
        let transport = TransportSession::new(
            cfg.server.clone(),
            cfg.tcp.clone(),
            clock.clone(),
            stats.clone(),
            parts.jitter_seed,
        );
        let sizer = AdaptiveSizer::new(cfg.i2s.buffer_bytes, clock.clone(), stats.clone());
        let memory = MemoryMonitor::new(parts.heap, cfg.memory.clone(), clock.clone(), stats.clone());

        let mut config_report_timer =
            IntervalTimer::new(clock.clone(), CONFIG_REPORT_INTERVAL_MS, true);
        config_report_timer.start_expired();

        let mut stats_report_timer =
            IntervalTimer::new(clock.clone(), STATS_REPORT_INTERVAL_MS, true);
        stats_report_timer.start();

        let audio_buf = vec![0u8; cfg.i2s.buffer_bytes];
        let state_entered_ms = clock.now_ms();

        Self {
            cfg,
            clock,
            stats,
            capture,
            wireless,
            transport,
            sizer,
            memory,
            watchdog: parts.watchdog,
            console: parts.console,
            telemetry: TelemetryRing::new(TELEMETRY_EVENTS),
            state: NodeState::Initializing,
            previous_state: NodeState::Initializing,
            state_entered_ms,
            consecutive_errors: 0,
            audio_buf,
            config_valid,
            config_report_timer,
            stats_report_timer,
            pending_exit: None,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn telemetry(&self) -> &TelemetryRing {
        &self.telemetry
    }

    /// Run until something demands a rebuild of the node.
    pub fn run(&mut self) -> ExitReason {
        // Doubled deadline through initialization; tightened on leaving
        // `Initializing`.
        self.watchdog
            .arm(Duration::from_secs(self.cfg.watchdog.timeout_s as u64 * 2));
        tracing::info!("node starting");

        loop {
            self.tick();
            if let Some(reason) = self.pending_exit.take() {
                self.shutdown();
                return reason;
            }
            std::thread::sleep(Duration::from_millis(self.cfg.orchestrator.tick_interval_ms));
        }
    }

    /// One pass of the cooperative loop: monitor, dispatch, act.
    pub fn tick(&mut self) {
        self.watchdog.pet();
        self.service_console();
        self.wireless.handle();
        self.wireless.monitor_signal(&mut self.sizer);

        if self.memory.check() == MemoryAction::Shutdown {
            self.telemetry.record(
                self.clock.now_ms(),
                EventKind::MemoryPressure,
                "heap exhausted",
            );
            self.pending_exit = Some(ExitReason::HeapExhausted);
            return;
        }

        if self.pending_exit.is_some() {
            return;
        }

        if self.stats_report_timer.check() && self.state == NodeState::Streaming {
            let snapshot = self.stats.snapshot();
            tracing::info!(
                bytes_sent = snapshot.bytes_sent,
                tcp_errors = snapshot.link_errors,
                capture_errors = snapshot.capture_errors_total,
                uptime_ms = self.transport.connection_uptime_ms(),
                "streaming"
            );
        }

        self.check_state_timeout();
        self.dispatch();
    }

    fn state_duration_ms(&self) -> u64 {
        self.clock.now_ms().wrapping_sub(self.state_entered_ms)
    }

    fn check_state_timeout(&mut self) {
        // An invalid configuration pins the node in Initializing on
        // purpose; the timeout must not spring it loose.
        if self.state == NodeState::Initializing && !self.config_valid {
            return;
        }
        let Some(max) = self.state.max_duration_ms() else {
            return;
        };
        if self.state_duration_ms() < max {
            return;
        }

        tracing::warn!(
            state = self.state.as_str(),
            max_ms = max,
            "state exceeded its time budget"
        );
        let next = match self.state {
            NodeState::Errored => NodeState::AssociatingWireless,
            _ => NodeState::Errored,
        };
        self.transition(next, TransitionCause::Normal);
    }

    fn dispatch(&mut self) {
        match self.state {
            NodeState::Initializing => self.tick_initializing(),
            NodeState::AssociatingWireless => {
                if self.wireless.is_associated() {
                    self.transition(NodeState::ConnectingTransport, TransitionCause::Normal);
                }
            }
            NodeState::ConnectingTransport => {
                if !self.wireless.is_associated() {
                    self.transition(NodeState::AssociatingWireless, TransitionCause::Normal);
                } else if self.transport.is_connected() || self.transport.connect() {
                    self.transition(NodeState::Streaming, TransitionCause::Normal);
                }
                // else: the backoff owns the schedule; try again next tick.
            }
            NodeState::Streaming => self.tick_streaming(),
            NodeState::Disconnected => {
                self.transition(NodeState::ConnectingTransport, TransitionCause::Normal);
            }
            NodeState::Errored => {
                if self.state_duration_ms() >= self.cfg.orchestrator.error_recovery_delay_ms {
                    self.transport.disconnect();
                    self.transition(NodeState::AssociatingWireless, TransitionCause::Normal);
                }
            }
            NodeState::Maintenance => {
                // Idle until an operator intervenes.
            }
        }
    }

    fn tick_initializing(&mut self) {
        if !self.config_valid {
            if self.config_report_timer.check() {
                tracing::error!(
                    "configuration invalid - refusing to start; fix the config file and RESTART"
                );
            }
            return;
        }

        // Seed the heap gauge before anything logs against it.
        if self.memory.sample() == MemoryAction::Shutdown {
            self.pending_exit = Some(ExitReason::HeapExhausted);
            return;
        }

        // Wireless first: if capture install fails, the association
        // machinery still runs and recovery can retry the install from
        // Streaming via the read path.
        self.wireless.start();

        if let Err(err) = self.capture.initialize() {
            tracing::error!(%err, "capture initialization failed");
            self.transition(NodeState::Errored, TransitionCause::Normal);
            return;
        }

        self.watchdog
            .arm(Duration::from_secs(self.cfg.watchdog.timeout_s as u64));
        self.transition(NodeState::AssociatingWireless, TransitionCause::Normal);
    }

    fn tick_streaming(&mut self) {
        if !self.wireless.is_associated() {
            tracing::warn!("wireless lost while streaming");
            self.transport.disconnect();
            self.transition(NodeState::AssociatingWireless, TransitionCause::Normal);
            return;
        }
        if !self.transport.is_connected() {
            self.transition(NodeState::ConnectingTransport, TransitionCause::Normal);
            return;
        }

        // Signal-adaptive read size; the write chunk size is fixed by the
        // receiver contract and never follows it.
        let read_len = self.sizer.current_bytes().min(self.audio_buf.len()) & !1;
        let max_attempts = self.cfg.i2s.max_read_retries;

        match self
            .capture
            .read_with_retry(&mut self.audio_buf[..read_len], max_attempts)
        {
            Ok(n) if n > 0 => {
                if self.transport.write(&self.audio_buf[..n]) {
                    self.consecutive_errors = 0;
                } else {
                    tracing::warn!("chunk write failed - reconnecting transport");
                    self.transition(NodeState::ConnectingTransport, TransitionCause::Normal);
                }
            }
            Ok(_) => {}
            Err(err) => {
                self.consecutive_errors += 1;
                if err.class() == FailureClass::Fatal {
                    tracing::error!(%err, "fatal capture failure");
                    self.transition(NodeState::Errored, TransitionCause::Normal);
                } else {
                    tracing::warn!(
                        %err,
                        consecutive = self.consecutive_errors,
                        "capture read failed"
                    );
                }
            }
        }

        if self.consecutive_errors > self.cfg.orchestrator.max_consecutive_errors {
            tracing::error!(
                consecutive = self.consecutive_errors,
                "error budget exhausted - entering maintenance"
            );
            self.telemetry.record(
                self.clock.now_ms(),
                EventKind::CaptureRecovery,
                "consecutive error budget exhausted",
            );
            self.consecutive_errors = 0;
            self.transition(NodeState::Maintenance, TransitionCause::Emergency);
        }
    }

    fn transition(&mut self, to: NodeState, cause: TransitionCause) -> bool {
        if cause == TransitionCause::Normal && !transition_admissible(self.state, to) {
            tracing::warn!(
                from = self.state.as_str(),
                to = to.as_str(),
                "rejected inadmissible state transition"
            );
            return false;
        }

        tracing::info!(from = self.state.as_str(), to = to.as_str(), "node state");
        self.previous_state = self.state;
        self.state = to;
        self.state_entered_ms = self.clock.now_ms();
        self.telemetry.record(
            self.state_entered_ms,
            EventKind::StateChange,
            format!("{} -> {}", self.previous_state.as_str(), to.as_str()),
        );
        true
    }

    fn service_console(&mut self) {
        let Some(line) = self.console.as_mut().and_then(|c| c.poll_line()) else {
            return;
        };
        match Command::parse(&line) {
            None => {}
            Some(Ok(cmd)) => {
                self.telemetry.record(
                    self.clock.now_ms(),
                    EventKind::ConsoleCommand,
                    format!("{cmd:?}"),
                );
                self.execute_command(cmd);
            }
            Some(Err(token)) => {
                tracing::error!(command = %token, "unknown command");
                self.print_help();
            }
        }
    }

    fn execute_command(&mut self, cmd: Command) {
        match cmd {
            Command::Status => self.print_status(),
            Command::Stats => {
                let snapshot = self.stats.snapshot();
                match serde_json::to_string(&snapshot) {
                    Ok(json) => tracing::info!(stats = %json, "statistics"),
                    Err(e) => tracing::error!("failed to serialize statistics: {e}"),
                }
            }
            Command::Health => {
                let action = self.memory.sample();
                tracing::info!(
                    capture_healthy = self.capture.is_healthy(),
                    capture_consecutive_errors = self.capture.consecutive_errors(),
                    capture_reinits = self.capture.reinit_count(),
                    heap_trend = ?self.memory.trend(),
                    heap_free = self.memory.last(),
                    heap_min = self.memory.min(),
                    memory_action = ?action,
                    "health report"
                );
            }
            Command::ConfigShow => self.print_config(),
            Command::Connect => {
                tracing::info!("operator requested connection");
                if self.state == NodeState::Maintenance {
                    self.transition(NodeState::AssociatingWireless, TransitionCause::Manual);
                } else if !self.transport.connect() {
                    tracing::warn!("connection attempt scheduled (backoff in effect)");
                }
            }
            Command::Disconnect => {
                tracing::info!("operator requested disconnect");
                self.transport.disconnect();
                if self.state == NodeState::Streaming {
                    self.transition(NodeState::Disconnected, TransitionCause::Manual);
                }
            }
            Command::Restart => {
                tracing::error!("operator requested restart");
                self.pending_exit = Some(ExitReason::RestartRequested);
            }
            Command::Help => self.print_help(),
        }
    }

    fn print_status(&mut self) {
        tracing::info!("========== SYSTEM STATUS ==========");
        if self.wireless.is_associated() {
            tracing::info!(
                ip = ?self.wireless.local_ip(),
                rssi_dbm = ?self.wireless.rssi(),
                "wireless: ASSOCIATED"
            );
        } else {
            tracing::info!(
                retries = self.wireless.retry_count(),
                "wireless: DISCONNECTED"
            );
        }
        tracing::info!(
            state = self.transport.state().as_str(),
            uptime_ms = self.transport.connection_uptime_ms(),
            receiver = %format!("{}:{}", self.cfg.server.host, self.cfg.server.port),
            "transport"
        );
        tracing::info!(state = self.state.as_str(), "node");

        let snapshot = self.stats.snapshot();
        tracing::info!(
            free_heap = snapshot.heap_free_current,
            bytes_sent = snapshot.bytes_sent,
            wifi_reconnects = snapshot.wireless_reassociations,
            server_reconnects = snapshot.transport_reconnects,
            tcp_errors = snapshot.link_errors,
            tcp_state_changes = snapshot.link_state_changes,
            "counters"
        );
        tracing::info!("===================================");
    }

    fn print_config(&self) {
        tracing::info!("========== CONFIGURATION ==========");
        tracing::info!(ssid = %self.cfg.wifi.ssid, "wireless");
        tracing::info!(
            host = %self.cfg.server.host,
            port = self.cfg.server.port,
            reconnect_min_ms = self.cfg.server.reconnect_min_ms,
            reconnect_max_ms = self.cfg.server.reconnect_max_ms,
            "receiver"
        );
        tracing::info!(
            chunk_bytes = self.cfg.tcp.chunk_bytes,
            write_timeout_ms = self.cfg.tcp.write_timeout_ms,
            "transport"
        );
        tracing::info!(
            sample_rate = self.cfg.i2s.sample_rate,
            buffer_bytes = self.cfg.i2s.buffer_bytes,
            "capture"
        );
        tracing::info!(
            warn_bytes = self.cfg.memory.warn_bytes,
            critical_bytes = self.cfg.memory.critical_bytes,
            "memory thresholds"
        );
        tracing::info!("===================================");
    }

    fn print_help(&self) {
        for line in Command::help_text() {
            tracing::info!("{line}");
        }
    }

    fn shutdown(&mut self) {
        tracing::info!("orderly shutdown");
        self.transport.disconnect();
        self.capture.cleanup();
    }
}
