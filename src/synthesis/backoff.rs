//! Exponential backoff for the synthesis reconnect loop

use std::time::Duration;

use crate::config::SynthesisConfig;

/// Reconnect delay state
///
/// The Nth consecutive failure waits `min(initial * 2^(N-1), ceiling)`.
/// A successful open resets the sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    ceiling: Duration,
    current: Duration,
    attempts: u32,
    max_attempts: Option<u32>,
}

impl Backoff {
    /// Create an unbounded backoff
    #[must_use]
    pub const fn new(initial: Duration, ceiling: Duration) -> Self {
        Self {
            initial,
            ceiling,
            current: initial,
            attempts: 0,
            max_attempts: None,
        }
    }

    /// Give up after `max` consecutive failures
    #[must_use]
    pub const fn with_max_attempts(mut self, max: Option<u32>) -> Self {
        self.max_attempts = max;
        self
    }

    /// Build from the synthesis connection settings
    #[must_use]
    pub const fn from_config(config: &SynthesisConfig) -> Self {
        Self::new(config.initial_backoff(), config.max_backoff())
            .with_max_attempts(config.max_attempts)
    }

    /// Record a failed attempt and return how long to wait before the next one
    ///
    /// Returns `None` once the configured attempt limit is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);

        if self.max_attempts.is_some_and(|max| self.attempts >= max) {
            return None;
        }

        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        Some(delay)
    }

    /// Back to the initial delay after a successful open
    pub const fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    /// Consecutive failures since the last reset
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay the next failure will wait
    #[must_use]
    pub const fn current(&self) -> Duration {
        self.current
    }

    /// Upper bound on the delay
    #[must_use]
    pub const fn ceiling(&self) -> Duration {
        self.ceiling
    }
}
