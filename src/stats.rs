//! Node-wide statistics.
//!
//! One atomics block shared across subsystems: each counter is written by
//! its owning component only and read anywhere with relaxed ordering, so a
//! stale read costs nothing but a slightly old report line.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Shared statistics handle.
#[derive(Debug, Clone)]
pub struct Stats {
    inner: Arc<StatsInner>,
}

#[derive(Debug, Default)]
struct StatsInner {
    // Transport
    bytes_sent: AtomicU64,
    transport_reconnects: AtomicU32,
    link_errors: AtomicU32,
    link_state_changes: AtomicU32,

    // Wireless
    wireless_reassociations: AtomicU32,

    // Capture
    capture_errors_total: AtomicU32,
    capture_errors_transient: AtomicU32,
    capture_errors_permanent: AtomicU32,
    capture_reinits: AtomicU32,

    // Adaptive sizing
    buffer_adjustments: AtomicU32,

    // Heap gauges (bytes free)
    heap_free_current: AtomicU32,
    heap_free_peak: AtomicU32,
    heap_free_min: AtomicU32,

    // Log sink
    log_lines_dropped: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub bytes_sent: u64,
    pub transport_reconnects: u32,
    pub link_errors: u32,
    pub link_state_changes: u32,
    pub wireless_reassociations: u32,
    pub capture_errors_total: u32,
    pub capture_errors_transient: u32,
    pub capture_errors_permanent: u32,
    pub capture_reinits: u32,
    pub buffer_adjustments: u32,
    pub heap_free_current: u32,
    pub heap_free_peak: u32,
    pub heap_free_min: u32,
    pub log_lines_dropped: u64,
}

impl Stats {
    pub fn new() -> Self {
        let inner = StatsInner {
            heap_free_min: AtomicU32::new(u32::MAX),
            ..StatsInner::default()
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.inner.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr_transport_reconnects(&self) {
        self.inner
            .transport_reconnects
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_link_errors(&self) {
        self.inner.link_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_link_state_changes(&self) {
        self.inner
            .link_state_changes
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_wireless_reassociations(&self) {
        self.inner
            .wireless_reassociations
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capture_transient(&self) {
        self.inner
            .capture_errors_total
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .capture_errors_transient
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capture_permanent(&self) {
        self.inner
            .capture_errors_total
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .capture_errors_permanent
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capture_fatal(&self) {
        self.inner
            .capture_errors_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_capture_reinits(&self) {
        self.inner.capture_reinits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_buffer_adjustments(&self) {
        self.inner
            .buffer_adjustments
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a heap sample, folding it into the peak/min gauges.
    pub fn record_heap_free(&self, free: u32) {
        self.inner.heap_free_current.store(free, Ordering::Relaxed);
        self.inner.heap_free_peak.fetch_max(free, Ordering::Relaxed);
        self.inner.heap_free_min.fetch_min(free, Ordering::Relaxed);
    }

    pub fn incr_log_lines_dropped(&self) {
        self.inner.log_lines_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn link_errors(&self) -> u32 {
        self.inner.link_errors.load(Ordering::Relaxed)
    }

    pub fn transport_reconnects(&self) -> u32 {
        self.inner.transport_reconnects.load(Ordering::Relaxed)
    }

    pub fn wireless_reassociations(&self) -> u32 {
        self.inner.wireless_reassociations.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let i = &self.inner;
        StatsSnapshot {
            bytes_sent: i.bytes_sent.load(Ordering::Relaxed),
            transport_reconnects: i.transport_reconnects.load(Ordering::Relaxed),
            link_errors: i.link_errors.load(Ordering::Relaxed),
            link_state_changes: i.link_state_changes.load(Ordering::Relaxed),
            wireless_reassociations: i.wireless_reassociations.load(Ordering::Relaxed),
            capture_errors_total: i.capture_errors_total.load(Ordering::Relaxed),
            capture_errors_transient: i.capture_errors_transient.load(Ordering::Relaxed),
            capture_errors_permanent: i.capture_errors_permanent.load(Ordering::Relaxed),
            capture_reinits: i.capture_reinits.load(Ordering::Relaxed),
            buffer_adjustments: i.buffer_adjustments.load(Ordering::Relaxed),
            heap_free_current: i.heap_free_current.load(Ordering::Relaxed),
            heap_free_peak: i.heap_free_peak.load(Ordering::Relaxed),
            heap_free_min: i.heap_free_min.load(Ordering::Relaxed),
            log_lines_dropped: i.log_lines_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}
