use std::time::Duration;

/// Retry policy for calls that are safe to repeat.
///
/// The default mirrors the agent-wide policy: 5 attempts with a constant
/// interval.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            interval: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> backon::ConstantBuilder {
        backon::ConstantBuilder::default()
            .with_delay(self.interval)
            // max_times counts retries after the first attempt
            .with_max_times(self.max_attempts.saturating_sub(1))
    }
}
