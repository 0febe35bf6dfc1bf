//! Adaptive delay between outbound service calls.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Consecutive successes needed before the delay narrows.
pub const SUCCESS_STREAK: u32 = 10;
const SPEEDUP_FACTOR: f64 = 0.9;
const SLOWDOWN_FACTOR: f64 = 1.5;

/// Widens the inter-call delay after failures and narrows it after success streaks.
#[derive(Debug)]
pub struct RateLimiter {
    current_delay: Duration,
    min_delay: Duration,
    max_delay: Duration,
    success_streak: u32,
    last_call: Option<Instant>,
}

impl RateLimiter {
    /// Starts at `base` clamped into `[min, max]`.
    pub fn new(base: Duration, min: Duration, max: Duration) -> Self {
        Self {
            current_delay: base.max(min).min(max),
            min_delay: min,
            max_delay: max,
            success_streak: 0,
            last_call: None,
        }
    }

    /// Current enforced delay.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Suspends until `current_delay` has elapsed since the previous call.
    pub async fn wait(&mut self) {
        if let Some(last) = self.last_call {
            let remaining = self.current_delay.saturating_sub(last.elapsed());
            if !remaining.is_zero() {
                debug!(wait_ms = remaining.as_millis() as u64, "rate limit wait");
                sleep(remaining).await;
            }
        }
        self.last_call = Some(Instant::now());
    }

    /// Records a successful call.
    pub fn record_success(&mut self) {
        self.success_streak += 1;
        if self.success_streak >= SUCCESS_STREAK {
            self.current_delay = self
                .current_delay
                .mul_f64(SPEEDUP_FACTOR)
                .max(self.min_delay);
            self.success_streak = 0;
            debug!(
                delay_ms = self.current_delay.as_millis() as u64,
                "rate limit narrowed"
            );
        }
    }

    /// Records a failed call.
    pub fn record_failure(&mut self) {
        self.success_streak = 0;
        self.current_delay = self
            .current_delay
            .mul_f64(SLOWDOWN_FACTOR)
            .min(self.max_delay);
        warn!(
            delay_ms = self.current_delay.as_millis() as u64,
            "rate limit widened"
        );
    }
}
