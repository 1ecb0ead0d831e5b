use thiserror::Error;

/// Failures talking to the Anthropic Messages API.
#[derive(Debug, Error)]
pub enum AnthropicError {
    /// HTTP 429. `retry_after_ms` comes from the `retry-after` header.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("response contained no text")]
    EmptyResponse,
}
