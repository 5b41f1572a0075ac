//! Bounded exponential backoff for kernel-facing backend calls.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use dnsgate_config::RetryConfig;
use dnsgate_firewall::FirewallError;

/// Runs `op` up to `config.max_attempts` times, doubling the delay between
/// attempts up to the configured cap. Returns the last error on exhaustion.
pub(crate) async fn with_backoff<T, F, Fut>(
    config: &RetryConfig,
    context: &str,
    mut op: F,
) -> Result<T, FirewallError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FirewallError>>,
{
    let cap = Duration::from_millis(config.max_delay_ms);
    let mut delay = Duration::from_millis(config.base_delay_ms);
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt >= config.max_attempts => return Err(error),
            Err(error) => {
                warn!(context, attempt, ?delay, %error, "backend call failed, retrying");
                sleep(delay).await;
                delay = (delay * 2).min(cap);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 10,
            max_delay_ms: 40,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let result = with_backoff(&config(5), "test", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(FirewallError::Timeout {
                        context: "test".into(),
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_the_attempt_ceiling() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(&config(3), "test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(FirewallError::Timeout {
                    context: "test".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
