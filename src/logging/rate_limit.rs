//! Token-bucket rate limit for log emission.
//!
//! Applied as a per-layer [`Filter`] on the console layer: events beyond the
//! cap are silently dropped and counted, spans always pass. The bucket holds
//! `burst` whole lines and refills at `max_lines_per_sec`; it starts full so
//! boot-time reporting is never throttled.

use std::sync::Mutex;

use tracing::Metadata;
use tracing_subscriber::layer::{Context, Filter};

use crate::stats::Stats;
use crate::time::SharedClock;

// Tokens are stored in line-millis so refill stays in integer math.
const TOKEN: u64 = 1000;

#[derive(Debug)]
struct Bucket {
    tokens_milli: u64,
    last_refill_ms: u64,
}

pub struct RateLimitFilter {
    max_lines_per_sec: u32,
    capacity_milli: u64,
    bucket: Mutex<Bucket>,
    clock: SharedClock,
    stats: Stats,
}

impl RateLimitFilter {
    pub fn new(max_lines_per_sec: u32, burst_max: u32, clock: SharedClock, stats: Stats) -> Self {
        let capacity_milli = burst_max.max(1) as u64 * TOKEN;
        let now = clock.now_ms();
        Self {
            max_lines_per_sec,
            capacity_milli,
            bucket: Mutex::new(Bucket {
                tokens_milli: capacity_milli,
                last_refill_ms: now,
            }),
            clock,
            stats,
        }
    }

    /// Take one line's worth of tokens; false means the line is dropped.
    fn try_acquire(&self) -> bool {
        if self.max_lines_per_sec == 0 {
            return true; // cap disabled
        }

        let mut bucket = self.bucket.lock().expect("log rate bucket poisoned");
        let now = self.clock.now_ms();
        let elapsed = now.wrapping_sub(bucket.last_refill_ms);
        bucket.tokens_milli = self
            .capacity_milli
            .min(bucket.tokens_milli + elapsed.saturating_mul(self.max_lines_per_sec as u64));
        bucket.last_refill_ms = now;

        if bucket.tokens_milli >= TOKEN {
            bucket.tokens_milli -= TOKEN;
            true
        } else {
            self.stats.incr_log_lines_dropped();
            false
        }
    }
}

impl<S> Filter<S> for RateLimitFilter {
    fn enabled(&self, meta: &Metadata<'_>, _cx: &Context<'_, S>) -> bool {
        if !meta.is_event() {
            return true;
        }
        self.try_acquire()
    }
}
