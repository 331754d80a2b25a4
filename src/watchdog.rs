//! Watchdog seam.
//!
//! The tick loop pets the watchdog once per pass; if the loop stalls past
//! the armed deadline the hardware resets the node. The host build cannot
//! reset itself, so its soft watchdog logs the starvation and counts it
//! instead.

use std::time::Duration;

use crate::time::SharedClock;

pub trait Watchdog {
    /// (Re)arm with a fresh deadline. Startup arms at twice the configured
    /// timeout to tolerate initialization latency.
    fn arm(&mut self, timeout: Duration);

    /// Feed the watchdog; called once per tick.
    fn pet(&mut self);
}

/// Host watchdog: detects loop stalls without the power to reset.
pub struct SoftWatchdog {
    clock: SharedClock,
    timeout_ms: u64,
    last_pet_ms: u64,
    armed: bool,
    starvations: u32,
}

impl SoftWatchdog {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            timeout_ms: 0,
            last_pet_ms: 0,
            armed: false,
            starvations: 0,
        }
    }

    pub fn starvations(&self) -> u32 {
        self.starvations
    }
}

impl Watchdog for SoftWatchdog {
    fn arm(&mut self, timeout: Duration) {
        self.timeout_ms = timeout.as_millis() as u64;
        self.last_pet_ms = self.clock.now_ms();
        self.armed = true;
        tracing::debug!(timeout_ms = self.timeout_ms, "watchdog armed");
    }

    fn pet(&mut self) {
        let now = self.clock.now_ms();
        if self.armed && now.wrapping_sub(self.last_pet_ms) > self.timeout_ms {
            self.starvations += 1;
            tracing::error!(
                stalled_ms = now.wrapping_sub(self.last_pet_ms),
                timeout_ms = self.timeout_ms,
                "watchdog deadline exceeded - a hardware watchdog would have reset"
            );
        }
        self.last_pet_ms = now;
    }
}
