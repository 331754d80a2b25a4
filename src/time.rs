//! Monotonic time source and non-blocking interval timers.
//!
//! Every timer in the system derives from one [`Clock`], injected at
//! construction, so tests can step time manually and subsystems never reach
//! for a global time source. All interval arithmetic uses wrapping unsigned
//! subtraction: comparisons are of the form `now - previous >= interval`,
//! never absolute, so a counter wrap does not break expiry checks.

use std::sync::Arc;
use std::time::Instant;

/// Monotonic millisecond clock.
pub trait Clock {
    /// Milliseconds since an arbitrary fixed origin, non-decreasing for the
    /// process lifetime.
    fn now_ms(&self) -> u64;
}

/// Shared clock handle passed into subsystems.
pub type SharedClock = Arc<dyn Clock + Send + Sync>;

/// Process clock backed by [`Instant`], anchored at construction.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Non-blocking interval timer: expiry is tested, never slept on.
///
/// `check()` consumes an expiry (auto-resetting or stopping the timer);
/// `is_expired()` only observes it.
pub struct IntervalTimer {
    clock: SharedClock,
    previous: u64,
    interval: u64,
    running: bool,
    auto_reset: bool,
}

impl IntervalTimer {
    pub fn new(clock: SharedClock, interval_ms: u64, auto_reset: bool) -> Self {
        Self {
            clock,
            previous: 0,
            interval: interval_ms,
            running: false,
            auto_reset,
        }
    }

    pub fn set_interval(&mut self, interval_ms: u64) {
        self.interval = interval_ms;
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn start(&mut self) {
        self.previous = self.clock.now_ms();
        self.running = true;
    }

    /// Start with `previous` backdated a full interval, so the next
    /// `check()` fires immediately. Used to skip the pointless initial
    /// delay on a first connection attempt.
    pub fn start_expired(&mut self) {
        self.previous = self.clock.now_ms().wrapping_sub(self.interval);
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn reset(&mut self) {
        self.previous = self.clock.now_ms();
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// True iff running and the interval has elapsed. On expiry the timer
    /// either advances (`auto_reset`) or stops.
    pub fn check(&mut self) -> bool {
        if !self.running {
            return false;
        }
        let now = self.clock.now_ms();
        if now.wrapping_sub(self.previous) >= self.interval {
            if self.auto_reset {
                self.previous = now;
            } else {
                self.running = false;
            }
            return true;
        }
        false
    }

    /// Expiry test without consuming the expiry.
    pub fn is_expired(&self) -> bool {
        if !self.running {
            return false;
        }
        self.clock.now_ms().wrapping_sub(self.previous) >= self.interval
    }

    pub fn elapsed(&self) -> u64 {
        self.clock.now_ms().wrapping_sub(self.previous)
    }

    pub fn remaining(&self) -> u64 {
        let elapsed = self.elapsed();
        if elapsed >= self.interval {
            0
        } else {
            self.interval - elapsed
        }
    }
}
