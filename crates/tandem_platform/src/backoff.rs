#![forbid(unsafe_code)]

use std::time::Duration;

/// Bounded exponential reconnect policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
	pub min_delay: Duration,
	pub max_delay: Duration,
	/// Attempts before giving up. Zero disables reconnection.
	pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
	fn default() -> Self {
		Self {
			min_delay: Duration::from_millis(500),
			max_delay: Duration::from_secs(30),
			max_attempts: 8,
		}
	}
}

impl ReconnectPolicy {
	/// Delay before the given 1-based attempt.
	pub fn delay_for(&self, attempt: u32) -> Duration {
		backoff_delay(attempt.saturating_sub(1), self.min_delay, self.max_delay)
	}
}

/// `min * 2^attempt`, clamped to `[min, max]`.
pub fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
	let pow = attempt.min(16);
	let ms = min.as_millis().saturating_mul(1u128 << pow);
	let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
	d.min(max).max(min)
}
