//! Reconnect backoff for the notification channel.

use std::time::Duration;

use crate::config::ReconnectSettings;

/// Close code for a normal, intentional close.
pub const NORMAL_CLOSE: u16 = 1000;
/// Close code used when the connection dropped without a close frame.
pub const ABNORMAL_CLOSE: u16 = 1006;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Reconnects allowed between two successful connects
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_settings(&ReconnectSettings::default())
    }
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &ReconnectSettings) -> Self {
        Self {
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            max_attempts: settings.max_attempts,
        }
    }

    /// `base * 2^attempt`, capped at `max_delay`. `attempt` is 0-based.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        let ms = base.checked_shl(attempt).unwrap_or(max).min(max);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDecision {
    /// Try again after `delay`; `attempt` is 1-based
    Reconnect { attempt: u32, delay: Duration },
    /// Retry budget spent
    Exhausted,
    /// Server closed normally
    Normal,
}

/// Counts reconnect attempts since the last successful connect.
#[derive(Debug, Clone)]
pub struct ReconnectTracker {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl ReconnectTracker {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempts: 0 }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn on_connected(&mut self) {
        self.attempts = 0;
    }

    pub fn on_close(&mut self, code: u16) -> CloseDecision {
        if code == NORMAL_CLOSE {
            return CloseDecision::Normal;
        }
        if self.attempts >= self.policy.max_attempts {
            return CloseDecision::Exhausted;
        }
        let delay = self.policy.delay(self.attempts);
        self.attempts += 1;
        CloseDecision::Reconnect {
            attempt: self.attempts,
            delay,
        }
    }
}
