//! Bounded connection retry.
//!
//! Only connection establishment is retried. Once connected, publish and
//! consume failures are fatal to the worker.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::{Error, Result};

/// Retry policy for broker connection establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum connection attempts
    pub attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Upper bound on the delay between attempts
    pub max_delay: Duration,
    /// Random extra delay added to each wait, up to this bound
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 15,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(1),
            jitter: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    /// Fixed delay between attempts.
    #[must_use]
    pub const fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            base_delay: delay,
            max_delay: delay,
            jitter: Duration::ZERO,
        }
    }

    /// Set the maximum delay (enables exponential growth up to it).
    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the jitter bound.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after the failed attempt number `attempt` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        let backoff = base_ms.saturating_mul(2u64.saturating_pow(attempt)).min(max_ms);

        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(0);
        let extra = rand::random::<u64>()
            .checked_rem(jitter_ms.saturating_add(1))
            .unwrap_or(0);

        Duration::from_millis(backoff.saturating_add(extra))
    }
}

/// Run `connect` until it succeeds, a non-transient error occurs, or the
/// policy's attempts are exhausted.
///
/// # Errors
///
/// - Any non-retryable error from `connect`, unchanged
/// - `ConnectFailed` once every attempt failed transiently
pub async fn connect_with_retry<T, F, Fut>(
    address: &str,
    policy: RetryPolicy,
    mut connect: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    for attempt in 0..attempts {
        match connect().await {
            Ok(connection) => {
                info!(address, attempt = attempt.saturating_add(1), "Connected to broker");
                return Ok(connection);
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    address,
                    attempt = attempt.saturating_add(1),
                    max_attempts = attempts,
                    error = %e,
                    "Broker not reachable yet"
                );
                if attempt.saturating_add(1) < attempts {
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                }
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::ConnectFailed {
        address: address.to_string(),
        attempts,
    })
}
