use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::ApiError;

/// Retry configuration for idempotent API calls
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first call
    pub max_retries: u32,
    /// Initial delay between retries (doubles each attempt)
    pub initial_delay_ms: u64,
    /// Maximum delay between retries
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 4000,
        }
    }
}

impl RetryConfig {
    pub fn from_settings(settings: &crate::config::RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_delay_ms: settings.base_delay_ms,
            max_delay_ms: settings.max_delay_ms,
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1);
        let ms = self
            .initial_delay_ms
            .checked_shl(shift)
            .unwrap_or(self.max_delay_ms)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent. Only use for idempotent requests.
pub async fn retry_idempotent<T, F, Fut>(
    config: &RetryConfig,
    label: &str,
    mut op: F,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                attempt += 1;
                let delay = config.delay_for(attempt);
                warn!(
                    request = label,
                    attempt,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retryable API failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                debug!(request = label, attempt, error = %e, "Giving up on request");
                return Err(e);
            }
        }
    }
}
