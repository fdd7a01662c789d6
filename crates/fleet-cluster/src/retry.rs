//! Bounded retry, polling and timeout helpers

use crate::error::{ClusterError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

/// Upper bound on a single TCP probe in [`wait_for_server`]
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Retry budget with exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_backoff: Duration,
    /// Cap on any single delay
    pub max_backoff: Duration,
    /// Randomize each delay into `[d/2, d]`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Fixed number of attempts at a fixed interval
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff: interval,
            max_backoff: interval,
            jitter: false,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);

        if self.jitter && !delay.is_zero() {
            let millis = delay.as_millis() as u64;
            let jittered = rand::thread_rng().gen_range(millis / 2..=millis);
            Duration::from_millis(jittered)
        } else {
            delay
        }
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the budget runs out.
///
/// The last error is returned unchanged when the budget is exhausted.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!("{} succeeded on attempt {}", operation, attempt);
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff_for(attempt);
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    operation,
                    attempt,
                    policy.max_attempts,
                    e,
                    delay
                );
                sleep(delay).await;
            }
            Err(e) => {
                if e.is_transient() {
                    tracing::error!(
                        "{} failed after {} attempts: {}",
                        operation,
                        attempt,
                        e
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Bound a fallible future; elapsed time becomes [`ClusterError::Timeout`].
pub async fn with_timeout<T, Fut>(limit: Duration, operation: &str, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ClusterError::timeout(format!(
            "{} did not complete within {:?}",
            operation, limit
        ))),
    }
}

/// Evaluate `predicate` up to `attempts` times, `interval` apart.
///
/// Returns the 1-based attempt that satisfied it, or `None` when it never did.
pub async fn poll_until<F>(attempts: u32, interval: Duration, mut predicate: F) -> Option<u32>
where
    F: FnMut() -> bool,
{
    for attempt in 1..=attempts {
        if predicate() {
            return Some(attempt);
        }
        if attempt < attempts {
            sleep(interval).await;
        }
    }
    None
}

/// Wait until a TCP endpoint accepts connections.
pub async fn wait_for_server(
    host: &str,
    port: u16,
    attempts: u32,
    interval: Duration,
) -> Result<()> {
    for attempt in 1..=attempts {
        match timeout(PROBE_CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => {
                tracing::debug!("Server at {}:{} is up after {} attempt(s)", host, port, attempt);
                return Ok(());
            }
            Ok(Err(e)) => {
                tracing::debug!("Waiting for {}:{} (attempt {}): {}", host, port, attempt, e);
            }
            Err(_) => {
                tracing::debug!("Connect to {}:{} timed out (attempt {})", host, port, attempt);
            }
        }
        if attempt < attempts {
            sleep(interval).await;
        }
    }

    Err(ClusterError::timeout(format!(
        "Server at {}:{} did not come up after {} attempts",
        host, port, attempts
    )))
}
