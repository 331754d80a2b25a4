//! Volatile telemetry record.
//!
//! A fixed-capacity ring of notable events (state changes, link errors,
//! recoveries) kept in memory only; the oldest entry gives way when the
//! ring is full. Nothing here ever touches storage.

use std::collections::VecDeque;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    StateChange,
    LinkError,
    CaptureRecovery,
    MemoryPressure,
    ConsoleCommand,
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    pub at_ms: u64,
    pub kind: EventKind,
    pub detail: String,
}

pub struct TelemetryRing {
    events: VecDeque<TelemetryEvent>,
    capacity: usize,
    total_recorded: u64,
}

impl TelemetryRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            total_recorded: 0,
        }
    }

    pub fn record(&mut self, at_ms: u64, kind: EventKind, detail: impl Into<String>) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(TelemetryEvent {
            at_ms,
            kind,
            detail: detail.into(),
        });
        self.total_recorded += 1;
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events oldest-first.
    pub fn iter(&self) -> impl Iterator<Item = &TelemetryEvent> {
        self.events.iter()
    }

    pub fn total_recorded(&self) -> u64 {
        self.total_recorded
    }
}
