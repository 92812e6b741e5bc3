//! Retry policy for device calls

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::ProtocolError;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Bounded retry with capped exponential backoff.
///
/// Only [`ProtocolError::Transient`] failures are retried. The policy never
/// sleeps past the caller's deadline.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: CooldownOptions,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: CooldownOptions {
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
            },
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Run `operation` (called with the 0-based attempt index) under this policy
    pub async fn run<F, Fut, T>(
        &self,
        name: &str,
        deadline: Instant,
        mut operation: F,
    ) -> Result<T, ProtocolError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProtocolError>>,
    {
        let max = self.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => e,
            };

            let next_attempt = attempt + 1;
            if next_attempt >= max {
                warn!("{} failed after {} attempts: {}", name, next_attempt, err);
                return Err(ProtocolError::RetriesExhausted {
                    attempts: next_attempt,
                    last: Box::new(err),
                });
            }

            let delay = calc_exp_backoff(&self.backoff, attempt);
            if Instant::now() + delay >= deadline {
                return Err(ProtocolError::Timeout(format!(
                    "{} did not succeed before its deadline (last error: {})",
                    name, err
                )));
            }

            debug!(
                attempt = attempt,
                next_attempt = next_attempt,
                delay_ms = delay.as_millis() as u64,
                "{} retry backoff: {}",
                name,
                err
            );
            tokio::time::sleep(delay).await;
            attempt = next_attempt;
        }
    }
}
