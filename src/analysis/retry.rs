//! Bounded retry around a [`Transport`].
//!
//! Only `RetryableFailure` is retried. Quota exhaustion and fatal failures
//! return on the attempt that produced them.

use super::types::{PromptEnvelope, RetryReason, Transport, TransportOutcome};
use crate::config::RetryPolicy;

/// Final outcome and how many transport attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome {
    pub outcome: TransportOutcome,
    pub attempts: u32,
}

impl RetryOutcome {
    /// True when the ceiling was hit while the failure was still retryable.
    pub fn retries_exhausted(&self, policy: &RetryPolicy) -> bool {
        self.outcome.is_retryable() && self.attempts >= policy.attempts()
    }
}

/// Send `envelope`, retrying transient failures up to the policy ceiling.
///
/// Waits the server's suggested delay when one was given. Otherwise a rate
/// limit waits `attempt * rate_limit_unit` and a network failure waits
/// `attempt * backoff_unit`.
pub async fn send_with_retry(
    transport: &dyn Transport,
    envelope: &PromptEnvelope,
    policy: &RetryPolicy,
) -> RetryOutcome {
    let max_attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        let outcome = transport.send(envelope).await;

        match &outcome {
            TransportOutcome::RetryableFailure {
                reason,
                suggested_delay,
            } if attempt < max_attempts => {
                let delay = suggested_delay.unwrap_or_else(|| match reason {
                    RetryReason::RateLimited { .. } => policy.rate_limit_backoff_for(attempt),
                    RetryReason::Network { .. } => policy.backoff_for(attempt),
                });
                tracing::warn!(
                    task = %envelope.task,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "AI request failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            TransportOutcome::RetryableFailure { reason, .. } => {
                tracing::warn!(
                    task = %envelope.task,
                    attempts = attempt,
                    reason = %reason,
                    "AI request failed, max retries exceeded"
                );
                return RetryOutcome {
                    outcome,
                    attempts: attempt,
                };
            }
            _ => {
                return RetryOutcome {
                    outcome,
                    attempts: attempt,
                }
            }
        }
    }
}
