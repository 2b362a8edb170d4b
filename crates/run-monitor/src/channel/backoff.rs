use std::time::Duration;

use crate::config::ReconnectConfig;

/// Doubling reconnect delay with a ceiling. Attempts are unbounded.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current + self.current;
        self.current = if next > self.max { self.max } else { next };
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
