use std::time::Duration;
use crate::config::BackoffConfig;

/// Successive retry delays after failures. `None` means give up.
pub trait Backoff: Send + Sync {
    fn next_delay(&mut self) -> Option<Duration>;
    fn reset(&mut self);
}

/// Doubling delay capped at `max_delay`, exhausted after `max_tries`
/// consecutive failures (never, if `max_tries` is 0).
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    max_tries: u32,
    tries: u32,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_tries: u32) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            max_tries,
            tries: 0,
        }
    }
}

impl From<&BackoffConfig> for ExponentialBackoff {
    fn from(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_secs(config.initial_delay_secs),
            Duration::from_secs(config.max_delay_secs),
            config.max_tries,
        )
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&mut self) -> Option<Duration> {
        self.tries = self.tries.saturating_add(1);
        if self.max_tries != 0 && self.tries >= self.max_tries {
            return None;
        }
        let factor = 1u32.checked_shl(self.tries - 1).unwrap_or(u32::MAX);
        Some(
            self.initial_delay
                .checked_mul(factor)
                .map_or(self.max_delay, |d| d.min(self.max_delay)),
        )
    }

    fn reset(&mut self) {
        self.tries = 0;
    }
}
