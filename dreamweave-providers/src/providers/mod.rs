//! # Provider System Module
//!
//! The provider abstraction layer: one shared [`Provider`] trait that every
//! upstream adapter implements, the static [`ProviderSettings`] descriptor,
//! and the factory that turns a descriptor into a running adapter.
//!
//! The trait is deliberately narrow. An adapter does exactly one attempt:
//! shape the request for its wire format, send it within the timeout it was
//! given, and hand back the raw payload plus token accounting. Retries,
//! circuit breaking, rate limiting, extraction, and validation all live
//! above this layer, so adding a provider means writing a transport and
//! nothing else.
//!
//! ## Supported providers
//!
//! - **openai**: OpenAI chat completions (also the default wire format)
//! - **cerebras**: Cerebras inference, OpenAI-compatible surface
//! - **anthropic**: Anthropic messages API
//! - **ollama**: local or remote Ollama instances

use crate::error::ProviderError;
use crate::models::{PreparedPrompt, ProviderResponse};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub mod anthropic;
pub mod http_client;
pub mod ollama;
pub mod openai;

/// Trait implemented by every upstream adapter.
///
/// `invoke` performs exactly one attempt and never retries internally; the
/// timeout it receives is already capped by the request's remaining budget.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Provider name/identifier.
    fn name(&self) -> &str;

    /// Transport capabilities of this provider.
    fn capabilities(&self) -> ProviderCapabilities;

    /// Perform one generation attempt within `timeout`.
    async fn invoke(
        &self,
        prompt: &PreparedPrompt,
        timeout: Duration,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Lightweight liveness probe. Returns observed latency on success.
    async fn probe(&self, timeout: Duration) -> Result<Duration, ProviderError>;
}

/// Static per-provider configuration (the provider descriptor).
///
/// Mutable only through the administrative endpoint; the gateway treats a
/// loaded descriptor as read-mostly state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Provider kind: openai, cerebras, anthropic, ollama
    pub name: String,
    /// API key; may be injected via `<NAME>_API_KEY`
    #[serde(default)]
    pub api_key: String,
    /// Override for the provider's API base URL
    #[serde(default)]
    pub base_url: Option<String>,
    /// Model identifier sent to the provider
    #[serde(default)]
    pub model: String,
    /// Selection priority, higher is preferred
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Disabled providers are skipped by selection
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Per-attempt transport timeout
    #[serde(default = "default_timeout", with = "crate::duration_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub limits: ProviderLimits,
    #[serde(default)]
    pub capabilities: ProviderCapabilities,
    /// Preferred sampling temperature for this provider
    #[serde(default = "default_temperature")]
    pub optimal_temperature: f32,
    /// Extra HTTP headers sent with every request
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_priority() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_temperature() -> f32 {
    0.7
}

impl ProviderSettings {
    pub fn new(name: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            api_key: api_key.into(),
            base_url: None,
            model: String::new(),
            priority: default_priority(),
            enabled: true,
            timeout: default_timeout(),
            limits: ProviderLimits::default(),
            capabilities: ProviderCapabilities::default(),
            optimal_temperature: default_temperature(),
            headers: HashMap::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_limits(mut self, limits: ProviderLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Model to dispatch, with a sensible default per provider kind.
    pub fn resolved_model(&self) -> String {
        if !self.model.is_empty() {
            return self.model.clone();
        }
        match self.name.as_str() {
            "openai" => "gpt-4o-mini".to_string(),
            "cerebras" => "llama3.1-8b".to_string(),
            "anthropic" => "claude-3-5-haiku-latest".to_string(),
            "ollama" => "llama3.2".to_string(),
            other => other.to_string(),
        }
    }
}

/// Hard limits enforced by the gateway's rate limiter and prompt shaping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProviderLimits {
    /// Completion token ceiling
    pub max_tokens: u32,
    /// Requests per rolling minute
    pub rpm: u32,
    /// Concurrent in-flight requests
    pub concurrent: u32,
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            rpm: 60,
            concurrent: 4,
        }
    }
}

/// Transport features a provider supports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    /// Server-sent-event streaming
    pub streaming: bool,
    /// Native JSON output mode
    pub json_mode: bool,
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self {
            streaming: false,
            json_mode: true,
        }
    }
}

/// Create an adapter from a descriptor.
pub fn create_provider(
    settings: ProviderSettings,
) -> Result<Arc<dyn Provider>, ProviderError> {
    match settings.name.as_str() {
        "openai" => Ok(Arc::new(openai::OpenAiProvider::new(settings)?)),
        "cerebras" => Ok(Arc::new(openai::OpenAiProvider::with_default_base(
            settings,
            "https://api.cerebras.ai/v1",
        )?)),
        "anthropic" => Ok(Arc::new(anthropic::AnthropicProvider::new(settings)?)),
        "ollama" => Ok(Arc::new(ollama::OllamaProvider::new(settings)?)),
        _ => Err(ProviderError::ProviderNotSupported {
            provider: settings.name,
        }),
    }
}
