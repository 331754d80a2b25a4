//! Wireless association supervision.
//!
//! Drives the station-mode interface through association and reassociation
//! with a bounded safety backoff. The supervisor never reboots the node on
//! association failure: the console must stay reachable, so an exhausted
//! retry budget widens the retry interval instead.

use std::net::Ipv4Addr;

use crate::backoff::{apply_jitter, Lcg};
use crate::config::{SignalConfig, StaticIpConfig, WifiConfig};
use crate::link::AdaptiveSizer;
use crate::stats::Stats;
use crate::time::{IntervalTimer, SharedClock};

/// Ceiling for the safety backoff between association retries.
const SAFETY_BACKOFF_MAX_MS: u64 = 30_000;
const SAFETY_BACKOFF_JITTER_PCT: u8 = 10;

/// Station-mode wireless interface seam.
///
/// The embedded build drives the radio; the host build answers for an OS
/// that already manages the network.
pub trait WirelessInterface {
    /// Enter station mode with power-save and credential persistence off,
    /// then start associating.
    fn begin(&mut self, ssid: &str, password: &str);

    /// Apply fixed addressing instead of DHCP. False means the interface
    /// fell back to DHCP.
    fn configure_static(&mut self, net: &StaticIpConfig) -> bool;

    fn is_associated(&self) -> bool;

    /// Latest signal level in dBm; `None` while unassociated.
    fn rssi(&self) -> Option<i32>;

    /// Drop any socket state riding the link so a stale session cannot
    /// survive reassociation. Called before every reassociation attempt.
    fn reset_link(&mut self);

    /// Tear down and restart the association attempt.
    fn reassociate(&mut self, ssid: &str, password: &str);

    fn local_ip(&self) -> Option<Ipv4Addr>;
}

pub struct WirelessSupervisor {
    iface: Box<dyn WirelessInterface>,
    cfg: WifiConfig,
    static_ip: Option<StaticIpConfig>,
    weak_threshold_dbm: i32,
    retry_timer: IntervalTimer,
    rssi_timer: IntervalTimer,
    retry_count: u32,
    rng: Lcg,
    stats: Stats,
}

impl WirelessSupervisor {
    pub fn new(
        iface: Box<dyn WirelessInterface>,
        cfg: WifiConfig,
        signal: SignalConfig,
        static_ip: Option<StaticIpConfig>,
        clock: SharedClock,
        stats: Stats,
        jitter_seed: u32,
    ) -> Self {
        let retry_timer = IntervalTimer::new(clock.clone(), cfg.retry_delay_ms, true);
        let rssi_timer = IntervalTimer::new(clock, signal.check_interval_ms, true);
        Self {
            iface,
            cfg,
            static_ip,
            weak_threshold_dbm: signal.weak_threshold_dbm,
            retry_timer,
            rssi_timer,
            retry_count: 0,
            rng: Lcg::new(jitter_seed),
            stats,
        }
    }

    /// Configure the interface and begin associating.
    pub fn start(&mut self) {
        tracing::info!(ssid = %self.cfg.ssid, "starting wireless association");

        if let Some(net) = &self.static_ip {
            if self.iface.configure_static(net) {
                tracing::info!(ip = %net.ip, "static addressing configured");
            } else {
                tracing::error!("static addressing failed - falling back to DHCP");
            }
        }

        self.iface.begin(&self.cfg.ssid, &self.cfg.password);
        self.retry_timer.set_interval(self.cfg.retry_delay_ms);
        self.retry_timer.start();
        self.rssi_timer.start();
        self.retry_count = 0;
    }

    /// Per-tick association upkeep.
    pub fn handle(&mut self) {
        if self.iface.is_associated() {
            if self.retry_count > 0 {
                tracing::info!(
                    attempts = self.retry_count,
                    "wireless associated after retries"
                );
                self.stats.incr_wireless_reassociations();
                self.retry_count = 0;
                self.retry_timer.set_interval(self.cfg.retry_delay_ms);
            }
            return;
        }

        if !self.retry_timer.check() {
            return;
        }

        if self.retry_count == 0 {
            tracing::warn!("wireless association lost - reassociating");
        }
        // Reset link-level socket state, then reattempt the association.
        self.iface.reset_link();
        self.iface.reassociate(&self.cfg.ssid, &self.cfg.password);
        self.retry_count += 1;

        if self.retry_count > self.cfg.max_retries {
            // Safety backoff: widen the retry interval instead of rebooting
            // so the console stays reachable.
            let base = (1000 * (self.retry_count - self.cfg.max_retries) as u64)
                .min(SAFETY_BACKOFF_MAX_MS);
            let backoff = apply_jitter(
                &mut self.rng,
                base,
                SAFETY_BACKOFF_JITTER_PCT,
                self.cfg.retry_delay_ms,
                SAFETY_BACKOFF_MAX_MS,
            );
            tracing::error!(
                attempts = self.cfg.max_retries,
                backoff_ms = backoff,
                "wireless association failed repeatedly - backing off (no reboot)"
            );
            self.retry_timer.set_interval(backoff);
            self.retry_timer.start();
            self.retry_count = self.cfg.max_retries; // clamp to avoid overflow
        }
    }

    /// Sample signal quality on its cadence and feed the sizer.
    pub fn monitor_signal(&mut self, sizer: &mut AdaptiveSizer) {
        if !self.rssi_timer.check() {
            return;
        }
        if !self.iface.is_associated() {
            return;
        }
        let Some(rssi) = self.iface.rssi() else {
            return;
        };

        sizer.update(rssi);

        if rssi < self.weak_threshold_dbm {
            tracing::warn!(rssi, "weak wireless signal - shrinking reads, no forced disassociation");
        } else if rssi < -70 {
            tracing::warn!(rssi, "wireless signal degraded");
        }
    }

    pub fn is_associated(&self) -> bool {
        self.iface.is_associated()
    }

    pub fn rssi(&self) -> Option<i32> {
        self.iface.rssi()
    }

    pub fn local_ip(&self) -> Option<Ipv4Addr> {
        self.iface.local_ip()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

/// Host adapter for machines whose OS owns the network: always associated,
/// reporting a fixed signal level.
pub struct HostLink {
    associated: bool,
    rssi_dbm: i32,
}

impl HostLink {
    pub fn new(rssi_dbm: i32) -> Self {
        Self {
            associated: false,
            rssi_dbm,
        }
    }
}

impl WirelessInterface for HostLink {
    fn begin(&mut self, _ssid: &str, _password: &str) {
        self.associated = true;
    }

    fn configure_static(&mut self, _net: &StaticIpConfig) -> bool {
        false // the OS owns addressing
    }

    fn is_associated(&self) -> bool {
        self.associated
    }

    fn rssi(&self) -> Option<i32> {
        self.associated.then_some(self.rssi_dbm)
    }

    fn reset_link(&mut self) {
        // The OS tears down its own sockets.
    }

    fn reassociate(&mut self, _ssid: &str, _password: &str) {
        self.associated = true;
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        Some(Ipv4Addr::LOCALHOST)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ManualClock;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct FakeRadio {
        associated: Arc<AtomicBool>,
        reassociations: Arc<AtomicU32>,
        link_resets: Arc<AtomicU32>,
        rssi: i32,
    }

    impl WirelessInterface for FakeRadio {
        fn begin(&mut self, _ssid: &str, _password: &str) {}
        fn configure_static(&mut self, _net: &StaticIpConfig) -> bool {
            true
        }
        fn is_associated(&self) -> bool {
            self.associated.load(Ordering::Relaxed)
        }
        fn rssi(&self) -> Option<i32> {
            self.is_associated().then_some(self.rssi)
        }
        fn reset_link(&mut self) {
            self.link_resets.fetch_add(1, Ordering::Relaxed);
        }
        fn reassociate(&mut self, _ssid: &str, _password: &str) {
            self.reassociations.fetch_add(1, Ordering::Relaxed);
        }
        fn local_ip(&self) -> Option<Ipv4Addr> {
            None
        }
    }

    struct Fixture {
        supervisor: WirelessSupervisor,
        clock: Arc<ManualClock>,
        associated: Arc<AtomicBool>,
        reassociations: Arc<AtomicU32>,
        link_resets: Arc<AtomicU32>,
        stats: Stats,
    }

    fn fixture(max_retries: u32) -> Fixture {
        let clock = ManualClock::shared(0);
        let associated = Arc::new(AtomicBool::new(false));
        let reassociations = Arc::new(AtomicU32::new(0));
        let link_resets = Arc::new(AtomicU32::new(0));
        let radio = FakeRadio {
            associated: associated.clone(),
            reassociations: reassociations.clone(),
            link_resets: link_resets.clone(),
            rssi: -55,
        };
        let cfg = WifiConfig {
            ssid: "AP".to_string(),
            password: "pw".to_string(),
            retry_delay_ms: 100,
            max_retries,
            timeout_ms: 30_000,
        };
        let stats = Stats::new();
        let mut supervisor = WirelessSupervisor::new(
            Box::new(radio),
            cfg,
            SignalConfig::default(),
            None,
            clock.clone(),
            stats.clone(),
            1,
        );
        supervisor.start();
        Fixture {
            supervisor,
            clock,
            associated,
            reassociations,
            link_resets,
            stats,
        }
    }

    #[test]
    fn test_no_retry_while_associated() {
        let mut fx = fixture(20);
        fx.associated.store(true, Ordering::Relaxed);

        fx.clock.advance(10_000);
        fx.supervisor.handle();
        assert_eq!(fx.reassociations.load(Ordering::Relaxed), 0);
        assert_eq!(fx.supervisor.retry_count(), 0);
    }

    #[test]
    fn test_retry_fires_on_timer_expiry() {
        let mut fx = fixture(20);

        fx.supervisor.handle();
        assert_eq!(fx.reassociations.load(Ordering::Relaxed), 0);

        fx.clock.advance(100);
        fx.supervisor.handle();
        assert_eq!(fx.reassociations.load(Ordering::Relaxed), 1);
        assert_eq!(fx.supervisor.retry_count(), 1);
    }

    #[test]
    fn test_every_retry_resets_the_link_first() {
        let mut fx = fixture(20);

        for _ in 0..4 {
            fx.clock.advance(100);
            fx.supervisor.handle();
        }
        assert_eq!(fx.reassociations.load(Ordering::Relaxed), 4);
        assert_eq!(fx.link_resets.load(Ordering::Relaxed), 4);

        // No retries while associated, so no resets either.
        fx.associated.store(true, Ordering::Relaxed);
        fx.clock.advance(1000);
        fx.supervisor.handle();
        assert_eq!(fx.link_resets.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_reassociation_counted_once_on_recovery() {
        let mut fx = fixture(20);

        for _ in 0..3 {
            fx.clock.advance(100);
            fx.supervisor.handle();
        }
        assert_eq!(fx.supervisor.retry_count(), 3);

        fx.associated.store(true, Ordering::Relaxed);
        fx.supervisor.handle();
        assert_eq!(fx.stats.wireless_reassociations(), 1);
        assert_eq!(fx.supervisor.retry_count(), 0);

        // Staying associated adds nothing.
        fx.supervisor.handle();
        assert_eq!(fx.stats.wireless_reassociations(), 1);
    }

    #[test]
    fn test_safety_backoff_after_budget() {
        let mut fx = fixture(3);

        for _ in 0..4 {
            fx.clock.advance(100);
            fx.supervisor.handle();
        }
        // Budget of 3 exceeded: counter clamped, interval widened.
        assert_eq!(fx.supervisor.retry_count(), 3);
        assert!(fx.supervisor.retry_timer.interval() >= 100);

        // Counter stays clamped through further failures.
        for _ in 0..10 {
            fx.clock.advance(31_000);
            fx.supervisor.handle();
        }
        assert_eq!(fx.supervisor.retry_count(), 3);
        assert!(fx.supervisor.retry_timer.interval() <= SAFETY_BACKOFF_MAX_MS);
    }

    #[test]
    fn test_recovery_restores_base_retry_interval() {
        let mut fx = fixture(2);

        for _ in 0..5 {
            fx.clock.advance(31_000);
            fx.supervisor.handle();
        }
        assert!(fx.supervisor.retry_timer.interval() > 100);

        fx.associated.store(true, Ordering::Relaxed);
        fx.supervisor.handle();
        assert_eq!(fx.supervisor.retry_timer.interval(), 100);
    }

    #[test]
    fn test_signal_monitor_feeds_sizer_on_cadence() {
        let mut fx = fixture(20);
        fx.associated.store(true, Ordering::Relaxed);

        let sizer_clock = ManualClock::shared(60_000);
        let mut sizer = AdaptiveSizer::new(4096, sizer_clock, Stats::new());

        // Before the cadence fires, nothing is sampled.
        fx.supervisor.monitor_signal(&mut sizer);
        assert_eq!(sizer.last_rssi(), -100);

        fx.clock.advance(10_000);
        fx.supervisor.monitor_signal(&mut sizer);
        assert_eq!(sizer.last_rssi(), -55);
    }
}
