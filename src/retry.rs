//! Bounded exponential backoff for transient collaborator failures.

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;

/// Delay before retry number `retry` (0 = first retry).
pub fn backoff_delay(config: &RetryConfig, retry: u32) -> Duration {
    let factor = 1u64.checked_shl(retry.min(32)).unwrap_or(u64::MAX);
    let ms = config.base_delay_ms.saturating_mul(factor).min(config.max_delay_ms);
    Duration::from_millis(ms)
}

/// Run `op` until it succeeds, fails permanently, or `max_attempts` is spent.
///
/// Only errors for which `is_transient` returns true are retried. The last
/// error is returned once the attempts are used up.
pub async fn with_backoff<T, E, F, Fut>(
    config: &RetryConfig,
    label: &str,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if !is_transient(&err) || attempt >= attempts {
                    if attempt > 1 {
                        log::debug!("Retry: {} gave up after {} attempts: {}", label, attempt, err);
                    }
                    return Err(err);
                }
                let delay = backoff_delay(config, attempt - 1);
                log::debug!(
                    "Retry: {} attempt {}/{} failed ({}), retrying in {:?}",
                    label,
                    attempt,
                    attempts,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
