use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{NodeFailure, ProviderError};
use crate::field::Content;
use crate::provider::{GenerationRequest, Provider};

/// Longest wait honored from a rate-limit response before the next attempt.
pub const MAX_RATE_LIMIT_WAIT_MS: u64 = 60_000;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt, for transient errors only.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 500,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given retry attempt using exponential backoff.
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }

    /// Wait before retrying after `err`. A rate limit raises the backoff to
    /// the server's retry-after, capped at [`MAX_RATE_LIMIT_WAIT_MS`].
    pub fn delay_after(&self, attempt: u32, err: &ProviderError) -> u64 {
        let backoff = self.delay_for_attempt(attempt);
        match err {
            ProviderError::RateLimited { retry_after_ms } => {
                backoff.max((*retry_after_ms).min(MAX_RATE_LIMIT_WAIT_MS))
            }
            _ => backoff,
        }
    }
}

/// What a node task reports back over the completion channel.
#[derive(Debug)]
pub(crate) enum Attempt {
    Generated { content: Content, attempts: u32 },
    Failed(NodeFailure),
    /// Cancelled before the provider was ever called.
    NotAttempted,
}

/// Call the provider until it succeeds, fails permanently or the retry budget
/// runs out. Each call is bounded by `per_call`.
pub(crate) async fn generate_with_retry(
    provider: &dyn Provider,
    request: &GenerationRequest,
    retry: &RetryConfig,
    per_call: Duration,
    cancel: &CancellationToken,
) -> Attempt {
    if cancel.is_cancelled() {
        return Attempt::NotAttempted;
    }

    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match timeout(per_call, provider.generate(request)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(per_call)),
        };

        let err = match result {
            Ok(content) => {
                debug!(note_id = request.note_id, field = %request.field, attempt, "generated");
                return Attempt::Generated {
                    content,
                    attempts: attempt,
                };
            }
            Err(err) => err,
        };

        if !err.is_transient() || attempt > retry.max_retries {
            return Attempt::Failed(NodeFailure::Provider {
                kind: err.kind(),
                attempts: attempt,
                message: err.to_string(),
            });
        }

        let delay_ms = retry.delay_after(attempt, &err);
        warn!(
            note_id = request.note_id,
            field = %request.field,
            attempt,
            delay_ms,
            error = %err,
            "transient provider error, retrying"
        );

        tokio::select! {
            _ = sleep(Duration::from_millis(delay_ms)) => {}
            _ = cancel.cancelled() => {
                return Attempt::Failed(NodeFailure::Provider {
                    kind: err.kind(),
                    attempts: attempt,
                    message: err.to_string(),
                });
            }
        }
    }
}
