use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::anthropic::AnthropicError;
use crate::capacity::CapacityError;
use crate::field::FieldKind;

#[derive(Debug, Error)]
pub enum SmartFieldsError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("A request is already in progress")]
    RequestInProgress,

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Invalid transition for field {field}: {from} -> {to}")]
    InvalidTransition {
        field: String,
        from: String,
        to: String,
    },

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Generation task lost: {0}")]
    TaskLost(String),
}

/// Problems found in prompt templates. Detected before anything runs and
/// never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("Invalid field in prompt for {field}: {reference}")]
    UnknownField { field: String, reference: String },

    #[error("Smart field {0} does not exist on the note")]
    MissingField(String),

    #[error("Prompt for {field} cannot reference its own field")]
    SelfReference { field: String },

    #[error("Prompt for {field} cannot reference {kind} field {reference}")]
    NonTextReference {
        field: String,
        reference: String,
        kind: FieldKind,
    },

    #[error("Smart fields referencing other smart fields cannot make a cycle: {}", cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    #[error("Unknown target field: {0}")]
    UnknownTarget(String),

    #[error("Smart field {0} has more than one prompt")]
    DuplicateField(String),
}

/// Classifies a provider failure for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Network, timeout, rate limit or server-side failure. Worth retrying.
    Transient,
    /// The request itself is wrong (bad key, unsupported kind). Retrying won't help.
    Permanent,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "Transient"),
            FailureKind::Permanent => write!(f, "Permanent"),
        }
    }
}

/// Errors returned by a provider capability for a single call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("{provider} does not support {kind} generation")]
    Unsupported {
        provider: &'static str,
        kind: FieldKind,
    },

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ProviderError::RateLimited { .. }
            | ProviderError::Timeout(_)
            | ProviderError::Network(_) => FailureKind::Transient,
            ProviderError::Api { status, .. } if *status >= 500 => FailureKind::Transient,
            ProviderError::Api { .. }
            | ProviderError::Unsupported { .. }
            | ProviderError::Malformed(_) => FailureKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == FailureKind::Transient
    }
}

impl From<AnthropicError> for ProviderError {
    fn from(err: AnthropicError) -> Self {
        match err {
            AnthropicError::RateLimited { retry_after_ms } => {
                ProviderError::RateLimited { retry_after_ms }
            }
            AnthropicError::ApiError { status, message } => ProviderError::Api { status, message },
            AnthropicError::NetworkError(e) => ProviderError::Network(e.to_string()),
            AnthropicError::EmptyResponse => {
                ProviderError::Malformed("response contained no text".into())
            }
        }
    }
}

/// Why a node ended `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum NodeFailure {
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(CapacityError),

    #[error("{kind} provider failure after {attempts} attempt(s): {message}")]
    Provider {
        kind: FailureKind,
        attempts: u32,
        message: String,
    },
}
