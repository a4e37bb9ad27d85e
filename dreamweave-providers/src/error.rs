//! # Error Taxonomy Module
//!
//! Every failure in the gateway is classified exactly once, at the boundary
//! where provider calls return, into a stable [`ErrorKind`] with a fixed
//! severity, category, and retryability. Past that point the core passes
//! structured [`ErrorRecord`] values around; nothing downstream re-inspects
//! HTTP statuses or exception messages.
//!
//! Adapters raise [`ProviderError`] (a conventional `thiserror` enum wrapping
//! transport and API failures); [`ProviderError::kind`] is the deterministic
//! mapping into the taxonomy. Classification from a raw HTTP status consults
//! message signatures first (content-filter and quota refusals share status
//! codes with unrelated failures), then the status range.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Stable failure kinds. The wire representation (`as_str`) never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ProviderUnavailable,
    RateLimitExceeded,
    InvalidResponse,
    ValidationFailed,
    Timeout,
    Authentication,
    QuotaExceeded,
    NetworkError,
    ServerError,
    ClientError,
    ParsingError,
    ConfigurationError,
    ResourceExhausted,
    ServiceDegraded,
    CircuitBreakerOpen,
    FallbackFailed,
    StreamingError,
    TokenLimitExceeded,
    ModelUnavailable,
    ContentFilter,
    AsyncExtractionError,
    Unknown,
}

/// Error severity ladder, ordered from least to most serious.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Coarse failure category used by the propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Permanent,
    Configuration,
    Capacity,
    External,
}

impl ErrorKind {
    /// Stable string form used on the wire and in metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            ErrorKind::InvalidResponse => "invalid_response",
            ErrorKind::ValidationFailed => "validation_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Authentication => "authentication",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::ServerError => "server_error",
            ErrorKind::ClientError => "client_error",
            ErrorKind::ParsingError => "parsing_error",
            ErrorKind::ConfigurationError => "configuration_error",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::ServiceDegraded => "service_degraded",
            ErrorKind::CircuitBreakerOpen => "circuit_breaker_open",
            ErrorKind::FallbackFailed => "fallback_failed",
            ErrorKind::StreamingError => "streaming_error",
            ErrorKind::TokenLimitExceeded => "token_limit_exceeded",
            ErrorKind::ModelUnavailable => "model_unavailable",
            ErrorKind::ContentFilter => "content_filter",
            ErrorKind::AsyncExtractionError => "async_extraction_error",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Fixed severity per kind.
    pub fn severity(&self) -> Severity {
        match self {
            ErrorKind::Authentication
            | ErrorKind::ConfigurationError
            | ErrorKind::FallbackFailed => Severity::Critical,
            ErrorKind::ProviderUnavailable
            | ErrorKind::QuotaExceeded
            | ErrorKind::ServerError
            | ErrorKind::ResourceExhausted
            | ErrorKind::ModelUnavailable
            | ErrorKind::AsyncExtractionError => Severity::High,
            ErrorKind::RateLimitExceeded
            | ErrorKind::InvalidResponse
            | ErrorKind::ValidationFailed
            | ErrorKind::Timeout
            | ErrorKind::NetworkError
            | ErrorKind::ClientError
            | ErrorKind::ParsingError
            | ErrorKind::ServiceDegraded
            | ErrorKind::CircuitBreakerOpen
            | ErrorKind::StreamingError
            | ErrorKind::TokenLimitExceeded
            | ErrorKind::ContentFilter
            | ErrorKind::Unknown => Severity::Medium,
        }
    }

    /// Fixed category per kind.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorKind::Timeout
            | ErrorKind::NetworkError
            | ErrorKind::ServerError
            | ErrorKind::ValidationFailed
            | ErrorKind::ParsingError
            | ErrorKind::StreamingError => ErrorCategory::Transient,
            ErrorKind::ClientError
            | ErrorKind::ContentFilter
            | ErrorKind::TokenLimitExceeded
            | ErrorKind::FallbackFailed
            | ErrorKind::AsyncExtractionError => ErrorCategory::Permanent,
            ErrorKind::Authentication
            | ErrorKind::ConfigurationError
            | ErrorKind::ModelUnavailable => ErrorCategory::Configuration,
            ErrorKind::RateLimitExceeded
            | ErrorKind::QuotaExceeded
            | ErrorKind::ResourceExhausted
            | ErrorKind::CircuitBreakerOpen => ErrorCategory::Capacity,
            ErrorKind::ProviderUnavailable
            | ErrorKind::InvalidResponse
            | ErrorKind::ServiceDegraded
            | ErrorKind::Unknown => ErrorCategory::External,
        }
    }

    /// Whether the same provider may be attempted again for this kind.
    ///
    /// Validation and parsing failures count as retryable because the
    /// repair-and-retry path re-prompts the same provider.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimitExceeded
                | ErrorKind::Timeout
                | ErrorKind::NetworkError
                | ErrorKind::ServerError
                | ErrorKind::ValidationFailed
                | ErrorKind::ParsingError
                | ErrorKind::StreamingError
                | ErrorKind::ServiceDegraded
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an HTTP status and its error message into a kind.
///
/// Message signatures win over the raw status: providers report content
/// filtering, exhausted quotas, and oversized prompts under overloaded
/// status codes (400/403/429), so the text is the only reliable signal.
pub fn classify_status(status: u16, message: &str) -> ErrorKind {
    let lower = message.to_lowercase();

    if lower.contains("content filter")
        || lower.contains("content_filter")
        || lower.contains("content policy")
        || lower.contains("safety system")
    {
        return ErrorKind::ContentFilter;
    }
    if lower.contains("quota") || lower.contains("billing") || lower.contains("credit balance") {
        return ErrorKind::QuotaExceeded;
    }
    if lower.contains("context length")
        || lower.contains("maximum context")
        || lower.contains("too many tokens")
        || lower.contains("prompt is too long")
    {
        return ErrorKind::TokenLimitExceeded;
    }
    if lower.contains("model not found")
        || lower.contains("does not exist")
        || lower.contains("unknown model")
    {
        return ErrorKind::ModelUnavailable;
    }
    if lower.contains("overloaded") {
        return ErrorKind::ServiceDegraded;
    }

    match status {
        401 | 403 => ErrorKind::Authentication,
        402 => ErrorKind::QuotaExceeded,
        404 => ErrorKind::ModelUnavailable,
        408 => ErrorKind::Timeout,
        413 => ErrorKind::TokenLimitExceeded,
        429 => ErrorKind::RateLimitExceeded,
        503 => ErrorKind::ProviderUnavailable,
        500..=599 => ErrorKind::ServerError,
        400..=499 => ErrorKind::ClientError,
        _ => ErrorKind::Unknown,
    }
}

/// Classify a transport-level failure into a kind.
pub fn classify_transport(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_decode() || err.is_body() {
        ErrorKind::InvalidResponse
    } else {
        ErrorKind::NetworkError
    }
}

/// Adapter-level errors raised during a single provider invocation.
///
/// These are values only up to the classification point: the invoker turns
/// them into [`ErrorRecord`]s via [`ProviderError::kind`] and nothing past
/// the invoker matches on this enum.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// HTTP client and network communication errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider API errors with status code and message
    #[error("API error: {code} - {message}")]
    Api { code: u16, message: String },

    /// Invalid or missing API key
    #[error("Invalid API key")]
    InvalidApiKey,

    /// Requested model not found or unsupported
    #[error("Model not found: {model}")]
    ModelNotFound { model: String },

    /// Rate limit exceeded for this provider
    #[error("Rate limit exceeded")]
    RateLimit,

    /// Provider quota exhausted
    #[error("Quota exceeded")]
    QuotaExceeded,

    /// Request refused by the provider's content moderation
    #[error("Content filtered: {message}")]
    ContentFiltered { message: String },

    /// Prompt or completion exceeded the provider's token window
    #[error("Token limit exceeded: {message}")]
    TokenLimit { message: String },

    /// Provider service temporarily unavailable
    #[error("Service unavailable")]
    ServiceUnavailable,

    /// Request timed out
    #[error("Timeout")]
    Timeout,

    /// JSON serialization and deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Response present but not in any recognized shape
    #[error("Invalid response format: {detail}")]
    InvalidResponse { detail: String },

    /// An unresolved deferred value reached extraction
    #[error("Pending value reached extraction at {location}")]
    PendingValue { location: String },

    /// Streaming transport broke mid-response
    #[error("Streaming error: {message}")]
    Streaming { message: String },

    /// Invalid or missing provider configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Unsupported provider type
    #[error("Provider not supported: {provider}")]
    ProviderNotSupported { provider: String },

    /// Network connectivity failure
    #[error("Network error: {message}")]
    NetworkError { message: String },
}

impl ProviderError {
    /// The single deterministic mapping into the taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Http(e) => classify_transport(e),
            ProviderError::Api { code, message } => classify_status(*code, message),
            ProviderError::InvalidApiKey => ErrorKind::Authentication,
            ProviderError::ModelNotFound { .. } => ErrorKind::ModelUnavailable,
            ProviderError::RateLimit => ErrorKind::RateLimitExceeded,
            ProviderError::QuotaExceeded => ErrorKind::QuotaExceeded,
            ProviderError::ContentFiltered { .. } => ErrorKind::ContentFilter,
            ProviderError::TokenLimit { .. } => ErrorKind::TokenLimitExceeded,
            ProviderError::ServiceUnavailable => ErrorKind::ProviderUnavailable,
            ProviderError::Timeout => ErrorKind::Timeout,
            ProviderError::Serialization(_) => ErrorKind::ParsingError,
            ProviderError::InvalidResponse { .. } => ErrorKind::InvalidResponse,
            ProviderError::PendingValue { .. } => ErrorKind::AsyncExtractionError,
            ProviderError::Streaming { .. } => ErrorKind::StreamingError,
            ProviderError::Configuration { .. } => ErrorKind::ConfigurationError,
            ProviderError::ProviderNotSupported { .. } => ErrorKind::ConfigurationError,
            ProviderError::NetworkError { .. } => ErrorKind::NetworkError,
        }
    }
}

/// Structured failure value carried through the core once classified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unique identifier for this occurrence
    pub id: Uuid,
    /// Classified failure kind
    pub kind: ErrorKind,
    /// Severity fixed by the kind
    pub severity: Severity,
    /// Category fixed by the kind
    pub category: ErrorCategory,
    /// Whether the same provider may be retried
    pub retryable: bool,
    /// Provider the failure was observed on, if any
    pub provider: Option<String>,
    /// Request this failure belongs to
    pub request_id: String,
    /// Attempt number within the request (1-based)
    pub attempt: u32,
    /// Wall-clock time of classification
    pub timestamp: DateTime<Utc>,
    /// Human-readable context for logs
    pub context: String,
    /// Underlying cause, never placed on the wire
    pub cause: Option<String>,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, request_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            severity: kind.severity(),
            category: kind.category(),
            retryable: kind.is_retryable(),
            provider: None,
            request_id: request_id.into(),
            attempt: 0,
            timestamp: Utc::now(),
            context: String::new(),
            cause: None,
        }
    }

    /// Classify an adapter error observed on a given attempt.
    pub fn from_provider_error(
        err: &ProviderError,
        provider: &str,
        request_id: &str,
        attempt: u32,
    ) -> Self {
        let mut record = Self::new(err.kind(), request_id);
        record.provider = Some(provider.to_string());
        record.attempt = attempt;
        record.context = err.to_string();
        record
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_uses_message_signatures_first() {
        assert_eq!(
            classify_status(400, "Your prompt was flagged by our content filter"),
            ErrorKind::ContentFilter
        );
        assert_eq!(
            classify_status(429, "You exceeded your current quota, check billing"),
            ErrorKind::QuotaExceeded
        );
        assert_eq!(
            classify_status(400, "This model's maximum context length is 8192 tokens"),
            ErrorKind::TokenLimitExceeded
        );
        assert_eq!(classify_status(529, "Overloaded"), ErrorKind::ServiceDegraded);
    }

    #[test]
    fn status_classification_falls_back_to_ranges() {
        assert_eq!(classify_status(401, ""), ErrorKind::Authentication);
        assert_eq!(classify_status(404, ""), ErrorKind::ModelUnavailable);
        assert_eq!(classify_status(429, ""), ErrorKind::RateLimitExceeded);
        assert_eq!(classify_status(500, ""), ErrorKind::ServerError);
        assert_eq!(classify_status(503, ""), ErrorKind::ProviderUnavailable);
        assert_eq!(classify_status(418, ""), ErrorKind::ClientError);
        assert_eq!(classify_status(302, ""), ErrorKind::Unknown);
    }

    #[test]
    fn severity_and_category_are_fixed_per_kind() {
        assert_eq!(ErrorKind::Authentication.severity(), Severity::Critical);
        assert_eq!(
            ErrorKind::Authentication.category(),
            ErrorCategory::Configuration
        );
        assert_eq!(ErrorKind::Timeout.category(), ErrorCategory::Transient);
        assert_eq!(
            ErrorKind::RateLimitExceeded.category(),
            ErrorCategory::Capacity
        );
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::Authentication.is_retryable());
        assert!(!ErrorKind::CircuitBreakerOpen.is_retryable());
    }

    #[test]
    fn classifying_the_same_raw_error_twice_is_deterministic() {
        let err = ProviderError::Api {
            code: 429,
            message: "slow down".to_string(),
        };
        let a = ErrorRecord::from_provider_error(&err, "openai", "req-1", 1);
        let b = ErrorRecord::from_provider_error(&err, "openai", "req-1", 1);

        // Equal modulo id and timestamp.
        assert_ne!(a.id, b.id);
        assert_eq!(a.kind, b.kind);
        assert_eq!(a.severity, b.severity);
        assert_eq!(a.category, b.category);
        assert_eq!(a.retryable, b.retryable);
        assert_eq!(a.provider, b.provider);
        assert_eq!(a.request_id, b.request_id);
        assert_eq!(a.attempt, b.attempt);
        assert_eq!(a.context, b.context);
    }

    #[test]
    fn pending_value_maps_to_async_extraction() {
        let err = ProviderError::PendingValue {
            location: "choices[0].message.content".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::AsyncExtractionError);
        assert_eq!(err.kind().severity(), Severity::High);
    }

    #[test]
    fn wire_strings_are_stable() {
        assert_eq!(ErrorKind::RateLimitExceeded.as_str(), "rate_limit_exceeded");
        assert_eq!(
            ErrorKind::AsyncExtractionError.as_str(),
            "async_extraction_error"
        );
        assert_eq!(
            ErrorKind::CircuitBreakerOpen.as_str(),
            "circuit_breaker_open"
        );
    }
}
