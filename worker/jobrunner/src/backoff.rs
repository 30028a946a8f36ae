use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter, for transient store errors.
#[derive(Debug, Clone)]
pub struct Backoff {
	current: Duration,
	base: Duration,
	max: Duration,
}

impl Backoff {
	pub const BASE: Duration = Duration::from_millis(50);
	pub const MAX: Duration = Duration::from_millis(3200);

	pub fn new() -> Self {
		Self::with_bounds(Self::BASE, Self::MAX)
	}

	pub fn with_bounds(base: Duration, max: Duration) -> Self {
		Self {
			current: base,
			base,
			max,
		}
	}

	/// Returns the next delay, somewhere in the upper half of the current step.
	pub fn next_delay(&mut self) -> Duration {
		let step = self.current;
		self.current = (self.current * 2).min(self.max);

		let half = step / 2;
		let jitter = rand::rng().random_range(0..=half.as_millis() as u64);
		half + Duration::from_millis(jitter)
	}

	pub fn reset(&mut self) {
		self.current = self.base;
	}

	pub async fn wait(&mut self) {
		let delay = self.next_delay();
		tokio::time::sleep(delay).await;
	}
}

impl Default for Backoff {
	fn default() -> Self {
		Self::new()
	}
}
