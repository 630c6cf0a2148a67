use rand::Rng;
use std::time::Duration;

/// Attempt budget and backoff between polling rounds.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.0,
        }
    }
}

impl RetryConfig {
    /// Delay before attempt `attempt` (0-based). The first attempt never waits;
    /// attempt n waits initial * 2^(n-1), clamped to `max_delay`.
    pub fn delay_before(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 {
            return None;
        }
        let base = self.initial_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32 - 1);
        let clamped = base.min(self.max_delay.as_millis() as f64);

        // Add jitter: ±jitter_factor of the delay
        let jitter_range = clamped * self.jitter_factor.clamp(0.0, 1.0);
        let jitter: f64 = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_delay = (clamped + jitter).max(0.0);

        Some(Duration::from_millis(final_delay as u64))
    }
}
