//! Bounded exponential backoff for endpoint reconnection.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Reconnect at all after an unexpected disconnect
    pub enabled: bool,
    /// Delay before the first attempt
    pub initial_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
    /// Growth factor between attempts
    pub multiplier: u32,
    /// Attempts before giving up with `Failed`; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2,
            max_attempts: Some(10),
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before attempt number `attempt` (1-based), or `None` once the
    /// budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if !self.enabled || attempt == 0 {
            return None;
        }
        if self.max_attempts.is_some_and(|max| attempt > max) {
            return None;
        }
        let factor = self.multiplier.max(1).saturating_pow(attempt - 1);
        Some(self.initial_delay.saturating_mul(factor).min(self.max_delay))
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempt: 0,
        }
    }
}

/// Stateful iterator over a policy's delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    /// Advance and return `(attempt, delay)`, or `None` when exhausted.
    pub fn next_delay(&mut self) -> Option<(u32, Duration)> {
        let attempt = self.attempt.saturating_add(1);
        let delay = self.policy.delay_for(attempt)?;
        self.attempt = attempt;
        Some((attempt, delay))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
