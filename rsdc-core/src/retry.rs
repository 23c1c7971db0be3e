//! Retry pacing. The dispatcher owns the deadline; strategies only decide
//! how long to wait before the next attempt, and whether to keep going.

use std::fmt::Debug;
use std::time::Duration;

use rand::Rng;

/// Decides the backoff before retry attempt `attempt` (1-based). Returning
/// `None` abandons the request regardless of remaining deadline.
pub trait RetryStrategy: Send + Sync + Debug {
    fn delay(&self, attempt: u32) -> Option<Duration>;
}

/// Exponential backoff from `base` to `cap`, retrying for as long as the
/// request deadline allows. This is the default strategy.
#[derive(Debug, Clone, Copy)]
pub struct BestEffortRetry {
    base: Duration,
    cap: Duration,
}

impl BestEffortRetry {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }
}

impl Default for BestEffortRetry {
    fn default() -> Self {
        Self::new(Duration::from_millis(10), Duration::from_millis(500))
    }
}

impl RetryStrategy for BestEffortRetry {
    fn delay(&self, attempt: u32) -> Option<Duration> {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base.saturating_mul(1_u32 << exp);
        Some(delay.min(self.cap))
    }
}

/// Never retries; the first failure is surfaced as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailFastRetry;

impl RetryStrategy for FailFastRetry {
    fn delay(&self, _: u32) -> Option<Duration> {
        None
    }
}

const RECONNECT_MIN: Duration = Duration::from_millis(32);
const RECONNECT_CAP: Duration = Duration::from_secs(4);

/// The reconnect supervisor's backoff: exponential between 32ms and 4s with
/// ±10% jitter so a bounced cluster does not see reconnect stampedes.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(7);
    let base = RECONNECT_MIN.saturating_mul(1_u32 << exp).min(RECONNECT_CAP);
    let jitter = rand::thread_rng().gen_range(0.9_f64..=1.1_f64);
    base.mul_f64(jitter)
}
