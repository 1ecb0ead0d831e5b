//! The abstract generation capability the orchestrator calls.
//!
//! Wire protocols live behind [`Provider`]. The core only sees a prompt going
//! in and [`Content`] or a [`ProviderError`] coming out.

mod anthropic;

pub use anthropic::AnthropicProvider;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::field::{Content, FieldKind, NoteId};

/// One call to a provider: the interpolated prompt for one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub note_id: NoteId,
    pub field: String,
    pub prompt: String,
    pub kind: FieldKind,
    /// Per-field model override; the provider's default otherwise.
    pub model: Option<String>,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(&self, request: &GenerationRequest) -> Result<Content, ProviderError>;
}

/// Offline provider with deterministic output, for demos and dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoProvider;

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Content, ProviderError> {
        Ok(match request.kind {
            FieldKind::Text => Content::Text(format!("✨ {}", request.prompt)),
            FieldKind::Speech => Content::Audio(request.prompt.as_bytes().to_vec()),
            FieldKind::Image => Content::Image(request.prompt.as_bytes().to_vec()),
        })
    }
}
