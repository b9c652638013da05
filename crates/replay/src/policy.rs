use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry. Used for polling.
    Constant,
    /// `delay * 2^(n-1)`, capped.
    Exponential { cap: Duration },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
    pub backoff: Backoff,
    /// Measured from the first attempt ever made, including attempts made
    /// before a restart.
    pub timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn constant(delay: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            delay,
            backoff: Backoff::Constant,
            timeout: None,
        }
    }

    pub fn exponential(delay: Duration, cap: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            delay,
            backoff: Backoff::Exponential { cap },
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait after `attempt` (1-based) failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Constant => self.delay,
            Backoff::Exponential { cap } => {
                let exp = attempt.saturating_sub(1).min(31);
                self.delay.saturating_mul(2u32.saturating_pow(exp)).min(cap)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::exponential(Duration::from_secs(2), Duration::from_secs(60), 4)
            .with_timeout(Duration::from_secs(15 * 60))
    }
}
