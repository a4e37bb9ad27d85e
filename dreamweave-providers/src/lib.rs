//! # Dreamweave Providers
//!
//! Provider plumbing for the Dreamweave gateway: everything needed to talk
//! to heterogeneous LLM providers and get a candidate JSON object out of
//! whatever they send back.
//!
//! ## What lives here
//!
//! - **Error taxonomy** ([`error`]): the stable set of failure kinds with
//!   fixed severity/category/retryability, plus the single classification
//!   point that turns raised transport and API failures into values.
//! - **Admission gates** ([`circuit_breaker`], [`rate_limiter`]): the
//!   per-provider three-state circuit and the rpm/concurrency limiter, both
//!   with RAII guards so cancellation and panics release their holds.
//! - **Extraction** ([`extraction`]): wrapper-path descent, balanced-brace
//!   JSON salvage, and the pending-value guard that refuses serialized
//!   promises.
//! - **Adapters** ([`providers`]): the [`providers::Provider`] trait and the
//!   OpenAI / Cerebras / Anthropic / Ollama transports over a shared HTTP
//!   client.
//! - **Data model** ([`models`]): requests, prepared prompts, raw responses,
//!   and the validated artifact envelope.
//!
//! Orchestration (selection, retries, validation, repair, health, metrics,
//! alerting, fallback) lives in the `dreamweave-gateway` crate; this crate
//! has no opinion about when to call a provider, only how.
//!
//! ## Example
//!
//! ```rust,no_run
//! use dreamweave_providers::models::PreparedPrompt;
//! use dreamweave_providers::providers::{create_provider, ProviderSettings};
//! use dreamweave_providers::extraction;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = create_provider(ProviderSettings::new("openai", "sk-..."))?;
//! let prompt = PreparedPrompt {
//!     system: "Render the dream as JSON.".to_string(),
//!     user: "a dragon over mountains".to_string(),
//!     temperature: 0.7,
//!     max_tokens: 1024,
//!     json_mode: true,
//! };
//! let response = provider.invoke(&prompt, Duration::from_secs(20)).await?;
//! let extraction = extraction::extract(&response.raw)?;
//! println!("candidate: {}", extraction.candidate);
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod duration_serde;
pub mod error;
pub mod extraction;
pub mod models;
pub mod providers;
pub mod rate_limiter;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitGuard, CircuitRejection, CircuitSnapshot,
    CircuitState,
};
pub use error::{ErrorCategory, ErrorKind, ErrorRecord, ProviderError, Severity};
pub use extraction::{extract, Extraction};
pub use models::{
    ArtifactMetadata, Cinematography, DreamResponse, DreamScene, GenerationRequest,
    PreparedPrompt, ProviderResponse, RawResponse, SchemaId, TokenUsage, ValidatedArtifact,
    EMERGENCY_FALLBACK_SOURCE,
};
pub use providers::{
    create_provider, Provider, ProviderCapabilities, ProviderLimits, ProviderSettings,
};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RatePermit};
