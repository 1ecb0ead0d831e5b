use async_trait::async_trait;

use super::{GenerationRequest, Provider};
use crate::anthropic::{AnthropicClient, AnthropicError, MessageSender, MessagesRequest};
use crate::error::ProviderError;
use crate::field::{Content, FieldKind};

const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Text generation through the Anthropic Messages API.
pub struct AnthropicProvider<S = AnthropicClient> {
    sender: S,
    default_model: String,
    max_tokens: u32,
    temperature: Option<f32>,
}

impl<S: MessageSender> AnthropicProvider<S> {
    pub fn new(sender: S, default_model: impl Into<String>) -> Self {
        Self {
            sender,
            default_model: default_model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[async_trait]
impl<S: MessageSender> Provider for AnthropicProvider<S> {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Content, ProviderError> {
        match request.kind {
            FieldKind::Text => {}
            kind @ (FieldKind::Speech | FieldKind::Image) => {
                return Err(ProviderError::Unsupported {
                    provider: self.name(),
                    kind,
                });
            }
        }

        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let mut req = MessagesRequest::user_prompt(model, self.max_tokens, request.prompt.clone());
        if let Some(t) = self.temperature {
            req = req.with_temperature(t);
        }

        let response = self.sender.send_message(&req).await?;
        let text = response.text();
        if text.is_empty() {
            return Err(AnthropicError::EmptyResponse.into());
        }
        Ok(Content::Text(text))
    }
}
