//! Memory-pressure monitoring.
//!
//! Samples free heap on a fixed cadence, tracks peak/min/last with a trend
//! signal, and escalates through WARN, CRITICAL, and forced shutdown as the
//! heap shrinks. The trend uses a 1 KiB dead-band so allocator noise does
//! not read as a leak.

use crate::config::MemoryConfig;
use crate::stats::Stats;
use crate::time::{IntervalTimer, SharedClock};

/// Dead-band for trend detection.
const TREND_DEADBAND_BYTES: u32 = 1024;

/// Free-heap source seam. The host probe reads the OS; the embedded port
/// asks its allocator.
pub trait HeapProbe {
    fn free_bytes(&self) -> u32;
}

/// Direction of free-heap movement between samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapTrend {
    Decreasing,
    Stable,
    Increasing,
}

/// Escalation decided by a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAction {
    None,
    Warn,
    Critical,
    /// Heap below half the critical threshold: shut down in order and reset.
    Shutdown,
}

pub struct MemoryMonitor {
    probe: Box<dyn HeapProbe>,
    cfg: MemoryConfig,
    timer: IntervalTimer,
    peak: u32,
    min: u32,
    last: u32,
    trend: HeapTrend,
    stats: Stats,
}

impl MemoryMonitor {
    pub fn new(probe: Box<dyn HeapProbe>, cfg: MemoryConfig, clock: SharedClock, stats: Stats) -> Self {
        let mut timer = IntervalTimer::new(clock, cfg.check_interval_ms, true);
        timer.start();
        Self {
            probe,
            cfg,
            timer,
            peak: 0,
            min: u32::MAX,
            last: 0,
            trend: HeapTrend::Stable,
            stats,
        }
    }

    /// Cadenced check; returns `None`-action between samples.
    pub fn check(&mut self) -> MemoryAction {
        if !self.timer.check() {
            return MemoryAction::None;
        }
        self.sample()
    }

    /// Take a sample immediately (startup, console HEALTH).
    pub fn sample(&mut self) -> MemoryAction {
        let free = self.probe.free_bytes();

        if self.last != 0 {
            self.trend = if free.saturating_add(TREND_DEADBAND_BYTES) < self.last {
                HeapTrend::Decreasing
            } else if free > self.last.saturating_add(TREND_DEADBAND_BYTES) {
                HeapTrend::Increasing
            } else {
                HeapTrend::Stable
            };
            if self.trend == HeapTrend::Decreasing {
                tracing::warn!(free, last = self.last, "free heap trending down");
            }
        }

        self.last = free;
        self.peak = self.peak.max(free);
        self.min = self.min.min(free);
        self.stats.record_heap_free(free);

        if free < self.cfg.critical_bytes / 2 {
            tracing::error!(
                free,
                critical = self.cfg.critical_bytes,
                "heap exhausted - initiating shutdown"
            );
            MemoryAction::Shutdown
        } else if free < self.cfg.critical_bytes {
            tracing::error!(free, critical = self.cfg.critical_bytes, "critically low memory");
            MemoryAction::Critical
        } else if free < self.cfg.warn_bytes {
            tracing::warn!(free, warn = self.cfg.warn_bytes, "low memory");
            MemoryAction::Warn
        } else {
            MemoryAction::None
        }
    }

    pub fn trend(&self) -> HeapTrend {
        self.trend
    }

    pub fn last(&self) -> u32 {
        self.last
    }

    pub fn peak(&self) -> u32 {
        self.peak
    }

    pub fn min(&self) -> u32 {
        self.min
    }
}

/// Host probe: `MemAvailable` from `/proc/meminfo`. Reports `u32::MAX`
/// where the file is missing, which keeps pressure actions disabled on
/// platforms the probe does not understand.
pub struct SystemHeapProbe;

impl HeapProbe for SystemHeapProbe {
    fn free_bytes(&self) -> u32 {
        let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
            return u32::MAX;
        };
        for line in meminfo.lines() {
            if let Some(rest) = line.strip_prefix("MemAvailable:") {
                let kib: u64 = rest
                    .trim()
                    .trim_end_matches("kB")
                    .trim()
                    .parse()
                    .unwrap_or(0);
                return (kib * 1024).min(u32::MAX as u64) as u32;
            }
        }
        u32::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct ScriptedProbe {
        free: Arc<AtomicU32>,
    }

    impl HeapProbe for ScriptedProbe {
        fn free_bytes(&self) -> u32 {
            self.free.load(Ordering::Relaxed)
        }
    }

    fn monitor(initial_free: u32) -> (MemoryMonitor, Arc<AtomicU32>, Arc<ManualClock>) {
        let free = Arc::new(AtomicU32::new(initial_free));
        let clock = ManualClock::shared(0);
        let cfg = MemoryConfig {
            warn_bytes: 40 * 1024,
            critical_bytes: 20 * 1024,
            check_interval_ms: 1000,
        };
        let m = MemoryMonitor::new(
            Box::new(ScriptedProbe { free: free.clone() }),
            cfg,
            clock.clone(),
            Stats::new(),
        );
        (m, free, clock)
    }

    #[test]
    fn test_check_respects_cadence() {
        let (mut m, _free, clock) = monitor(100 * 1024);

        assert_eq!(m.check(), MemoryAction::None);
        assert_eq!(m.last(), 0); // no sample yet

        clock.advance(1000);
        assert_eq!(m.check(), MemoryAction::None);
        assert_eq!(m.last(), 100 * 1024);
    }

    #[test]
    fn test_threshold_escalation() {
        let (mut m, free, _clock) = monitor(0);

        free.store(100 * 1024, Ordering::Relaxed);
        assert_eq!(m.sample(), MemoryAction::None);

        free.store(39 * 1024, Ordering::Relaxed);
        assert_eq!(m.sample(), MemoryAction::Warn);

        free.store(19 * 1024, Ordering::Relaxed);
        assert_eq!(m.sample(), MemoryAction::Critical);

        free.store(9 * 1024, Ordering::Relaxed);
        assert_eq!(m.sample(), MemoryAction::Shutdown);
    }

    #[test]
    fn test_trend_with_deadband() {
        let (mut m, free, _clock) = monitor(0);

        free.store(100 * 1024, Ordering::Relaxed);
        m.sample();
        assert_eq!(m.trend(), HeapTrend::Stable); // first sample sets baseline

        // Within the 1 KiB dead-band: still stable.
        free.store(100 * 1024 - 512, Ordering::Relaxed);
        m.sample();
        assert_eq!(m.trend(), HeapTrend::Stable);

        free.store(90 * 1024, Ordering::Relaxed);
        m.sample();
        assert_eq!(m.trend(), HeapTrend::Decreasing);

        free.store(120 * 1024, Ordering::Relaxed);
        m.sample();
        assert_eq!(m.trend(), HeapTrend::Increasing);
    }

    #[test]
    fn test_peak_and_min_track_extremes() {
        let (mut m, free, _clock) = monitor(0);

        for kb in [100u32, 60, 120, 80] {
            free.store(kb * 1024, Ordering::Relaxed);
            m.sample();
        }
        assert_eq!(m.peak(), 120 * 1024);
        assert_eq!(m.min(), 60 * 1024);
        assert_eq!(m.last(), 80 * 1024);
    }

    #[test]
    fn test_system_probe_reports_something() {
        let free = SystemHeapProbe.free_bytes();
        assert!(free > 0);
    }
}
