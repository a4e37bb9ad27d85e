//! # Configuration Management Module
//!
//! TOML configuration with environment overrides and startup validation.
//! Every knob has a default; the only required values are provider
//! credentials (Ollama excepted, since it runs without keys).
//!
//! Loading order matches the deployment story: file → environment
//! overrides (`GATEWAY_HOST`, `GATEWAY_PORT`, `<PROVIDER>_API_KEY`) →
//! validation. Validation failures are fatal: the gateway refuses to serve
//! requests with an invalid configuration rather than limping along.
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 3000
//!
//! [providers.openai]
//! name = "openai"
//! api_key = "sk-..."
//! priority = 3
//!
//! [providers.ollama]
//! name = "ollama"
//! base_url = "http://localhost:11434"
//! priority = 1
//!
//! [alerts]
//! critical_failure_rate = 0.5
//! ```

use dreamweave_providers::duration_serde;
use dreamweave_providers::providers::ProviderSettings;
use dreamweave_providers::CircuitBreakerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub repair: RepairConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub confidence: ConfidenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Whole-request timeout at the HTTP layer
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Weights for the composite provider-selection score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    pub priority_weight: f64,
    pub success_weight: f64,
    pub latency_weight: f64,
    /// Latency is normalized into [0, 1] against this ceiling
    #[serde(with = "duration_serde")]
    pub latency_norm: Duration,
    /// Score penalty while a provider's circuit is not closed
    pub circuit_penalty: f64,
    /// Budget applied when a request does not specify one
    #[serde(with = "duration_serde")]
    pub default_budget: Duration,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            priority_weight: 10.0,
            success_weight: 5.0,
            latency_weight: 2.0,
            latency_norm: Duration::from_secs(10),
            circuit_penalty: 2.0,
            default_budget: Duration::from_secs(30),
        }
    }
}

/// Caps shared by the per-kind retry policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay cap for rate-limit backoff
    #[serde(with = "duration_serde")]
    pub rate_limit_delay_cap: Duration,
    /// Delay cap for every other retryable kind
    #[serde(with = "duration_serde")]
    pub general_delay_cap: Duration,
    /// Jitter fraction applied to every delay (0.1 = ±10%)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            rate_limit_delay_cap: Duration::from_secs(60),
            general_delay_cap: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairConfig {
    /// Bounded repair iterations per candidate
    pub max_attempts: u32,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// Circuit breaker thresholds, shared by every provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub failure_rate_threshold: f64,
    pub min_samples: usize,
    #[serde(with = "duration_serde")]
    pub cooldown: Duration,
    pub window: usize,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            min_samples: 10,
            cooldown: Duration::from_secs(30),
            window: 20,
        }
    }
}

impl CircuitConfig {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            failure_rate_threshold: self.failure_rate_threshold,
            min_samples: self.min_samples,
            cooldown: self.cooldown,
            window: self.window,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Longest an admission attempt may block before refusal
    #[serde(with = "duration_serde")]
    pub acquire_deadline: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            acquire_deadline: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Passive derivation interval
    #[serde(with = "duration_serde")]
    pub eval_interval: Duration,
    /// Active probe interval
    #[serde(with = "duration_serde")]
    pub probe_interval: Duration,
    /// Per-probe timeout
    #[serde(with = "duration_serde")]
    pub probe_timeout: Duration,
    /// Latency SLA for the healthy verdict
    #[serde(with = "duration_serde")]
    pub sla_latency: Duration,
    /// Windowed success rate for the healthy verdict
    pub healthy_success_rate: f64,
    /// Consecutive failures that force the unhealthy verdict
    pub critical_consecutive_failures: u32,
    /// Consecutive probe failures that force the unhealthy verdict
    pub probe_failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            eval_interval: Duration::from_secs(10),
            probe_interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(10),
            sla_latency: Duration::from_secs(5),
            healthy_success_rate: 0.9,
            critical_consecutive_failures: 5,
            probe_failure_threshold: 3,
        }
    }
}

/// Alerting thresholds. Where the legacy system and its successor disagreed
/// the stricter value is the default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    pub critical_failure_rate: f64,
    pub warning_failure_rate: f64,
    /// Minimum observations before the failure-rate rules apply
    pub min_samples: u64,
    pub consecutive_failures: u32,
    #[serde(with = "duration_serde")]
    pub slow_response: Duration,
    pub parsing_errors_per_hour: u64,
    /// Identical alerts inside this window are suppressed
    #[serde(with = "duration_serde")]
    pub duplicate_window: Duration,
    pub max_alerts_per_provider_per_hour: usize,
    /// Recurrences within one hour that trigger escalation
    pub escalation_count: usize,
    #[serde(with = "duration_serde")]
    pub retention: Duration,
    #[serde(with = "duration_serde")]
    pub eval_interval: Duration,
    /// Optional webhook delivery channel
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            critical_failure_rate: 0.5,
            warning_failure_rate: 0.25,
            min_samples: 5,
            consecutive_failures: 3,
            slow_response: Duration::from_secs(10),
            parsing_errors_per_hour: 5,
            duplicate_window: Duration::from_secs(300),
            max_alerts_per_provider_per_hour: 10,
            escalation_count: 5,
            retention: Duration::from_secs(24 * 3600),
            eval_interval: Duration::from_secs(30),
            webhook_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Raw metric data kept at full resolution
    #[serde(with = "duration_serde")]
    pub raw_retention: Duration,
    /// Minute buckets kept after collapse
    #[serde(with = "duration_serde")]
    pub bucket_retention: Duration,
    /// How often raw data is collapsed into buckets
    #[serde(with = "duration_serde")]
    pub aggregation_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            raw_retention: Duration::from_secs(3600),
            bucket_retention: Duration::from_secs(24 * 3600),
            aggregation_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
    #[serde(with = "duration_serde")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 256,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// Component weights for the composite confidence score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceConfig {
    /// Multiplier applied when the repair engine touched the candidate
    pub repair_penalty: f64,
    /// Multiplier applied when extraction needed salvage or descent
    pub extraction_penalty: f64,
    /// Fixed confidence for emergency fallback artifacts
    pub fallback_confidence: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            repair_penalty: 0.85,
            extraction_penalty: 0.9,
            fallback_confidence: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, apply environment overrides,
    /// and validate. Missing file is fatal.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {path}: {e}"))?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise start from defaults. Used for
    /// the default config path so a bare `dreamweave-gateway` run works.
    pub fn load_or_default(path: &str) -> anyhow::Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            tracing::warn!("config file {} not found, using defaults", path);
            Config::default()
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(host) = env::var("GATEWAY_HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }

        if let Ok(port_str) = env::var("GATEWAY_PORT") {
            let port: u16 = port_str
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid GATEWAY_PORT: {port_str}"))?;
            if port > 0 {
                self.server.port = port;
            }
        }

        if let Ok(timeout) = env::var("GATEWAY_TIMEOUT") {
            self.server.timeout =
                duration_serde::parse_duration(&timeout).map_err(|e| anyhow::anyhow!(e))?;
        }

        // Provider API keys from <NAME>_API_KEY.
        for (provider_name, settings) in &mut self.providers {
            let env_key = format!(
                "{}_API_KEY",
                provider_name.to_uppercase().replace('-', "_")
            );
            if let Ok(api_key) = env::var(&env_key) {
                if !api_key.is_empty() {
                    settings.api_key = api_key;
                    tracing::debug!("loaded API key for provider {}", provider_name);
                }
            }
        }

        Ok(())
    }

    /// Validate the configuration. Errors here are fatal at startup.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.host.is_empty() {
            anyhow::bail!("server host cannot be empty");
        }
        if self.server.port == 0 {
            anyhow::bail!("server port must be between 1 and 65535");
        }

        for (key, settings) in &self.providers {
            if settings.name.is_empty() {
                anyhow::bail!("provider kind missing for provider entry: {key}");
            }
            if !matches!(
                settings.name.as_str(),
                "openai" | "cerebras" | "anthropic" | "ollama"
            ) {
                anyhow::bail!("unknown provider kind for {key}: {}", settings.name);
            }
            if settings.api_key.is_empty() && settings.name != "ollama" {
                anyhow::bail!(
                    "provider {key} requires an API key (set {}_API_KEY)",
                    key.to_uppercase().replace('-', "_")
                );
            }
            if settings.timeout.is_zero() {
                anyhow::bail!("provider {key} timeout cannot be 0");
            }
            if settings.limits.concurrent == 0 {
                anyhow::bail!("provider {key} concurrent limit cannot be 0");
            }
            if settings.limits.max_tokens == 0 {
                anyhow::bail!("provider {key} max_tokens cannot be 0");
            }
            if let Some(base_url) = &settings.base_url {
                if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
                    anyhow::bail!("invalid base URL for provider {key}: {base_url}");
                }
            }
        }

        if !(0.0..=1.0).contains(&self.circuit.failure_rate_threshold)
            || self.circuit.failure_rate_threshold == 0.0
        {
            anyhow::bail!("circuit failure_rate_threshold must be in (0, 1]");
        }
        if self.circuit.failure_threshold == 0 {
            anyhow::bail!("circuit failure_threshold cannot be 0");
        }
        if self.circuit.cooldown.is_zero() {
            anyhow::bail!("circuit cooldown cannot be 0");
        }

        if self.selection.priority_weight < 0.0
            || self.selection.success_weight < 0.0
            || self.selection.latency_weight < 0.0
        {
            anyhow::bail!("selection weights must be non-negative");
        }
        if self.selection.default_budget.is_zero() {
            anyhow::bail!("selection default_budget cannot be 0");
        }

        if !(0.0..=1.0).contains(&self.alerts.warning_failure_rate)
            || !(0.0..=1.0).contains(&self.alerts.critical_failure_rate)
        {
            anyhow::bail!("alert failure rates must be in [0, 1]");
        }
        if self.alerts.warning_failure_rate > self.alerts.critical_failure_rate {
            anyhow::bail!("warning_failure_rate cannot exceed critical_failure_rate");
        }

        if self.cache.enabled {
            if self.cache.max_entries == 0 {
                anyhow::bail!("cache max_entries cannot be 0 when the cache is enabled");
            }
            if self.cache.ttl.is_zero() {
                anyhow::bail!("cache ttl cannot be 0 when the cache is enabled");
            }
        }

        if self.repair.max_attempts == 0 {
            anyhow::bail!("repair max_attempts cannot be 0");
        }

        for (name, value) in [
            ("repair_penalty", self.confidence.repair_penalty),
            ("extraction_penalty", self.confidence.extraction_penalty),
            ("fallback_confidence", self.confidence.fallback_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("confidence {name} must be in [0, 1]");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        config.validate().expect("defaults are valid");
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.retry.rate_limit_delay_cap, Duration::from_secs(60));
        assert_eq!(config.alerts.critical_failure_rate, 0.5);
    }

    #[test]
    fn parses_a_minimal_toml() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 8080
            timeout = "45s"

            [providers.openai]
            name = "openai"
            api_key = "sk-test"
            priority = 3

            [providers.local]
            name = "ollama"
            base_url = "http://localhost:11434"

            [alerts]
            critical_failure_rate = 0.4
        "#;
        let config: Config = toml::from_str(toml_str).expect("parses");
        config.validate().expect("valid");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.providers["openai"].priority, 3);
        assert_eq!(config.alerts.critical_failure_rate, 0.4);
        // Unspecified sections keep defaults.
        assert_eq!(config.circuit.cooldown, Duration::from_secs(30));
    }

    #[test]
    fn missing_api_key_is_fatal() {
        let toml_str = r#"
            [providers.openai]
            name = "openai"
        "#;
        let config: Config = toml::from_str(toml_str).expect("parses");
        assert!(config.validate().is_err());
    }

    #[test]
    fn ollama_needs_no_api_key() {
        let toml_str = r#"
            [providers.local]
            name = "ollama"
        "#;
        let config: Config = toml::from_str(toml_str).expect("parses");
        config.validate().expect("valid without key");
    }

    #[test]
    fn unknown_provider_kind_is_fatal() {
        let toml_str = r#"
            [providers.watson]
            name = "watson"
            api_key = "k"
        "#;
        let config: Config = toml::from_str(toml_str).expect("parses");
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_alert_thresholds_are_fatal() {
        let mut config = Config::default();
        config.alerts.warning_failure_rate = 0.9;
        config.alerts.critical_failure_rate = 0.5;
        assert!(config.validate().is_err());
    }
}
