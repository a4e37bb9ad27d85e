//! # Core Data Model
//!
//! Request, prompt, raw-response, and artifact types shared between the
//! provider adapters and the gateway. The wire format is camelCase JSON: the
//! dream artifact schema (`dreamResponse`) is consumed by downstream scene
//! renderers that expect `processingTimeMs`-style keys.
//!
//! Two types deserve a note:
//!
//! - [`RawResponse`] is what an adapter hands back before extraction: either
//!   the provider's unmodified JSON body or the assembled text of a streamed
//!   response. Wrapper descent and JSON salvage happen later, in the
//!   extraction module, so adapters stay thin transports.
//! - [`ValidatedArtifact`] is the envelope returned to callers. Its `source`
//!   field is the only way consumers can tell genuine provider output from
//!   the emergency fallback synthesizer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Sentinel `source` value for locally synthesized artifacts.
pub const EMERGENCY_FALLBACK_SOURCE: &str = "emergency_fallback";

/// Named validation target for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemaId {
    #[serde(rename = "dreamResponse")]
    DreamResponse,
}

impl SchemaId {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaId::DreamResponse => "dreamResponse",
        }
    }

    /// Short human description embedded in corrective prompts.
    pub fn description(&self) -> &'static str {
        match self {
            SchemaId::DreamResponse => {
                "a JSON object with string `id`, `title` (5-200 chars), `description` \
                 (10-2000 chars), a non-empty `scenes` array of {id, description, objects[]}, \
                 and optional `cinematography` with a positive `durationSec`"
            }
        }
    }
}

impl std::fmt::Display for SchemaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single generation request as accepted by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Unique request identifier
    pub id: String,
    /// The natural-language dream prompt
    pub prompt: String,
    /// Optional style preset (ethereal, noir, cyberpunk, ...)
    pub style: Option<String>,
    /// Optional quality tier (draft, standard, high)
    pub quality: Option<String>,
    /// Validation target for the response
    pub schema: SchemaId,
    /// Hard time ceiling across all retries and fallbacks
    #[serde(with = "crate::duration_serde")]
    pub timeout_budget: Duration,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, timeout_budget: Duration) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            style: None,
            quality: None,
            schema: SchemaId::DreamResponse,
            timeout_budget,
            created_at: Utc::now(),
        }
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }

    pub fn with_quality(mut self, quality: impl Into<String>) -> Self {
        self.quality = Some(quality.into());
        self
    }
}

/// A provider-ready prompt with generation parameters resolved.
#[derive(Debug, Clone)]
pub struct PreparedPrompt {
    /// System / instruction segment
    pub system: String,
    /// User segment (the dream text, possibly with corrective context)
    pub user: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Completion token ceiling
    pub max_tokens: u32,
    /// Ask the provider for native JSON output when it supports it
    pub json_mode: bool,
}

/// Token accounting reported by a provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Raw provider output, pre-extraction.
#[derive(Debug, Clone)]
pub enum RawResponse {
    /// Unmodified JSON body from a unary call
    Json(serde_json::Value),
    /// Assembled text of a streamed response
    Text(String),
}

/// One completed provider invocation.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub raw: RawResponse,
    /// Model the provider reports having used
    pub model: String,
    pub tokens: Option<TokenUsage>,
}

/// The validated envelope returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedArtifact {
    /// Schema-conformant content (a `dreamResponse` object)
    pub content: serde_json::Value,
    /// Name of the schema the content validates against
    pub schema: String,
    /// Provider name, or `emergency_fallback`
    pub source: String,
    /// Composite confidence in [0, 1]
    pub confidence: f64,
    /// End-to-end processing time for this request
    pub processing_time_ms: u64,
    /// Whether the repair engine modified the candidate
    pub repair_applied: bool,
    /// Extraction notes (salvage, wrapper descent) for observability
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extraction_notes: Vec<String>,
}

/// Typed form of the `dreamResponse` schema, used by the fallback
/// synthesizer and tests. Provider output is validated as loose JSON and
/// only optionally round-trips through this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DreamResponse {
    pub id: String,
    pub title: String,
    pub description: String,
    pub scenes: Vec<DreamScene>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cinematography: Option<Cinematography>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ArtifactMetadata>,
}

/// A single scene within a dream response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DreamScene {
    pub id: String,
    pub description: String,
    pub objects: Vec<String>,
}

/// Optional camera direction block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cinematography {
    pub duration_sec: f64,
    #[serde(default)]
    pub shots: Vec<CameraShot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraShot {
    pub shot_type: String,
    pub target: String,
    pub duration_sec: f64,
}

/// Required metadata block stamped onto every artifact before it is
/// returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    pub source: String,
    pub model: String,
    pub processing_time_ms: u64,
    pub quality: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u32>,
    pub confidence: f64,
    pub cache_hit: bool,
}
