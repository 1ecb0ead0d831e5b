//! Configuration loaded from `smartfields.toml`.
//!
//! Every key has a default, so a missing file or a partial one is fine.
//! The `ANTHROPIC_API_KEY` environment variable takes precedence over the file.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::capacity::PlanInfo;
use crate::orchestrator::RetryConfig;

const CONFIG_FILE: &str = "smartfields.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct SmartFieldsConfig {
    #[serde(default)]
    pub api_key: String,

    /// Default chat model; fields may override it.
    #[serde(default = "default_chat_model")]
    pub chat_model: String,

    /// Provider calls in flight at once, across every note of a batch.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Run prompts even when some of the fields they reference are empty.
    #[serde(default)]
    pub allow_empty_fields: bool,

    #[serde(default)]
    pub capacity: CapacityConfig,
}

/// Plan limits. An absent credit count is unlimited.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CapacityConfig {
    pub text_credits: Option<u64>,
    pub voice_credits: Option<u64>,
    pub image_credits: Option<u64>,
    pub requests_per_minute: Option<u32>,
}

impl CapacityConfig {
    pub fn plan(&self) -> PlanInfo {
        let limited = self.text_credits.is_some()
            || self.voice_credits.is_some()
            || self.image_credits.is_some();
        PlanInfo {
            plan_id: if limited { "configured" } else { "unlimited" }.to_string(),
            text_credits_capacity: self.text_credits,
            voice_credits_capacity: self.voice_credits,
            image_credits_capacity: self.image_credits,
            ..PlanInfo::default()
        }
    }
}

fn default_chat_model() -> String {
    "claude-haiku-4-5".to_string()
}

fn default_max_concurrency() -> usize {
    8
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for SmartFieldsConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            chat_model: default_chat_model(),
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            allow_empty_fields: false,
            capacity: CapacityConfig::default(),
        }
    }
}

impl SmartFieldsConfig {
    /// Load `smartfields.toml` from the current directory.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Load from `path`, falling back to defaults when it doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<SmartFieldsConfig>(&contents)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY")
            && !key.is_empty()
        {
            config.api_key = key;
        }

        Ok(config)
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
