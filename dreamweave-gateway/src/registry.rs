//! # Provider Registry
//!
//! Runtime home of every configured provider: the adapter, its circuit
//! breaker and rate limiter, the admin-mutable descriptor, and the
//! serialized per-provider status block.
//!
//! Locking discipline (single-writer-per-provider): all mutation of a
//! provider's status goes through its own `Mutex` with short critical
//! sections, so observers always see a consistent snapshot and one
//! provider's congestion never blocks another's dispatch. Dashboards read
//! cloned snapshots and may be arbitrarily stale.
//!
//! Health here is *derived* state, written only by the health monitor. It
//! is deliberately independent of circuit state: the circuit gates
//! dispatch, health gates selection.

use crate::config::Config;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dreamweave_providers::providers::{create_provider, Provider, ProviderSettings};
use dreamweave_providers::rate_limiter::RateLimiterConfig;
use dreamweave_providers::{CircuitBreaker, CircuitSnapshot, ErrorKind, RateLimiter};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

const LATENCY_RING: usize = 100;
const OUTCOME_RING: usize = 50;

/// Derived provider health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Unknown => "unknown",
        }
    }
}

/// Mutable per-provider status block. Serialized access through the entry's
/// mutex; snapshots are cheap clones.
#[derive(Debug, Clone)]
pub struct ProviderStatus {
    pub health: HealthState,
    pub last_error: Option<String>,
    pub last_error_kind: Option<ErrorKind>,
    pub last_latency_ms: Option<u64>,
    pub last_activity: Option<DateTime<Utc>>,
    /// Dispatches started (completed + in flight)
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub in_flight: u32,
    pub error_kind_counts: HashMap<ErrorKind, u64>,
    latency_series: VecDeque<u64>,
    recent_outcomes: VecDeque<bool>,
    /// Active-probe accounting, kept apart from user-facing counters
    pub probe_consecutive_failures: u32,
    pub last_probe_latency_ms: Option<u64>,
}

impl Default for ProviderStatus {
    fn default() -> Self {
        Self {
            health: HealthState::Unknown,
            last_error: None,
            last_error_kind: None,
            last_latency_ms: None,
            last_activity: None,
            requests: 0,
            successes: 0,
            failures: 0,
            in_flight: 0,
            error_kind_counts: HashMap::new(),
            latency_series: VecDeque::new(),
            recent_outcomes: VecDeque::new(),
            probe_consecutive_failures: 0,
            last_probe_latency_ms: None,
        }
    }
}

impl ProviderStatus {
    /// Success rate over the recent-outcome ring; 1.0 with no history.
    pub fn recent_success_rate(&self) -> f64 {
        if self.recent_outcomes.is_empty() {
            return 1.0;
        }
        let ok = self.recent_outcomes.iter().filter(|s| **s).count();
        ok as f64 / self.recent_outcomes.len() as f64
    }

    /// Mean latency over the latency ring.
    pub fn avg_latency_ms(&self) -> f64 {
        if self.latency_series.is_empty() {
            return 0.0;
        }
        self.latency_series.iter().sum::<u64>() as f64 / self.latency_series.len() as f64
    }

    pub fn has_observations(&self) -> bool {
        !self.recent_outcomes.is_empty() || self.last_probe_latency_ms.is_some()
    }
}

/// Final outcome of one dispatch attempt.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub success: bool,
    pub latency_ms: u64,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

/// One provider's runtime entry.
pub struct ProviderEntry {
    /// Registry key (also the provider kind for built-in adapters)
    pub name: String,
    settings: RwLock<ProviderSettings>,
    pub provider: Arc<dyn Provider>,
    pub breaker: CircuitBreaker,
    pub limiter: RateLimiter,
    status: Mutex<ProviderStatus>,
}

impl ProviderEntry {
    pub fn settings(&self) -> ProviderSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn status(&self) -> ProviderStatus {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn with_status<T>(&self, f: impl FnOnce(&mut ProviderStatus) -> T) -> T {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut status)
    }

    /// Mark a dispatch as started. Pairs with [`complete_attempt`].
    ///
    /// [`complete_attempt`]: Self::complete_attempt
    pub fn begin_attempt(&self) {
        self.with_status(|s| {
            s.requests += 1;
            s.in_flight += 1;
            s.last_activity = Some(Utc::now());
        });
    }

    /// Record the final outcome of a started dispatch.
    pub fn complete_attempt(&self, outcome: AttemptOutcome) {
        self.with_status(|s| {
            s.in_flight = s.in_flight.saturating_sub(1);
            s.last_activity = Some(Utc::now());
            s.last_latency_ms = Some(outcome.latency_ms);
            if s.latency_series.len() >= LATENCY_RING {
                s.latency_series.pop_front();
            }
            s.latency_series.push_back(outcome.latency_ms);
            if s.recent_outcomes.len() >= OUTCOME_RING {
                s.recent_outcomes.pop_front();
            }
            s.recent_outcomes.push_back(outcome.success);
            if outcome.success {
                s.successes += 1;
            } else {
                s.failures += 1;
                if let Some(kind) = outcome.error_kind {
                    s.last_error_kind = Some(kind);
                    *s.error_kind_counts.entry(kind).or_insert(0) += 1;
                }
                s.last_error = outcome.error_message;
            }
        });
    }

    /// Record an active probe result. Probes never touch the user-facing
    /// request counters.
    pub fn record_probe(&self, latency_ms: Option<u64>, ok: bool) {
        self.with_status(|s| {
            if ok {
                s.probe_consecutive_failures = 0;
                s.last_probe_latency_ms = latency_ms;
            } else {
                s.probe_consecutive_failures += 1;
            }
        });
    }

    pub fn set_health(&self, health: HealthState) -> HealthState {
        self.with_status(|s| {
            let previous = s.health;
            s.health = health;
            previous
        })
    }

    pub fn health(&self) -> HealthState {
        self.with_status(|s| s.health)
    }

    /// Immutable snapshot for dashboards and selection.
    pub fn snapshot(&self) -> ProviderSnapshot {
        let settings = self.settings();
        let status = self.status();
        let circuit = self.breaker.snapshot();
        ProviderSnapshot {
            name: self.name.clone(),
            kind: settings.name,
            enabled: settings.enabled,
            priority: settings.priority,
            health: status.health,
            circuit: circuit.state.as_str().to_string(),
            consecutive_failures: circuit.consecutive_failures,
            success_rate: status.recent_success_rate(),
            avg_response_time_ms: status.avg_latency_ms(),
            in_flight: status.in_flight,
            requests: status.requests,
            successes: status.successes,
            failures: status.failures,
            last_error: status.last_error.clone(),
            last_error_kind: status.last_error_kind,
            circuit_detail: circuit,
        }
    }

    pub fn apply_patch(&self, patch: &ProviderPatch) {
        let mut settings = self.settings.write().unwrap_or_else(|e| e.into_inner());
        if let Some(enabled) = patch.enabled {
            settings.enabled = enabled;
        }
        if let Some(priority) = patch.priority {
            settings.priority = priority;
        }
    }
}

/// Administrative mutation of a provider descriptor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderPatch {
    pub enabled: Option<bool>,
    pub priority: Option<u32>,
}

/// Wire-friendly provider snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSnapshot {
    pub name: String,
    pub kind: String,
    pub enabled: bool,
    pub priority: u32,
    pub health: HealthState,
    pub circuit: String,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub in_flight: u32,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_kind: Option<ErrorKind>,
    #[serde(skip)]
    pub circuit_detail: CircuitSnapshot,
}

/// All configured providers, keyed by registry name.
pub struct ProviderRegistry {
    entries: DashMap<String, Arc<ProviderEntry>>,
}

impl ProviderRegistry {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let entries = DashMap::new();
        for (key, settings) in &config.providers {
            let provider = create_provider(settings.clone())
                .map_err(|e| anyhow::anyhow!("provider {key}: {e}"))?;
            let breaker = CircuitBreaker::new(key.clone(), config.circuit.to_breaker_config());
            let limiter = RateLimiter::new(
                key.clone(),
                RateLimiterConfig {
                    rpm: settings.limits.rpm,
                    concurrent: settings.limits.concurrent,
                    acquire_deadline: config.rate_limit.acquire_deadline,
                },
            );
            entries.insert(
                key.clone(),
                Arc::new(ProviderEntry {
                    name: key.clone(),
                    settings: RwLock::new(settings.clone()),
                    provider,
                    breaker,
                    limiter,
                    status: Mutex::new(ProviderStatus::default()),
                }),
            );
        }
        Ok(Self { entries })
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProviderEntry>> {
        self.entries.get(name).map(|e| Arc::clone(e.value()))
    }

    pub fn entries(&self) -> Vec<Arc<ProviderEntry>> {
        let mut all: Vec<_> = self
            .entries
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn snapshots(&self) -> Vec<ProviderSnapshot> {
        self.entries().iter().map(|e| e.snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> ProviderRegistry {
        let mut config = Config::default();
        config.providers.insert(
            "local".to_string(),
            ProviderSettings::new("ollama", "").with_priority(2),
        );
        ProviderRegistry::from_config(&config).expect("registry")
    }

    #[test]
    fn builds_entries_from_config() {
        let registry = test_registry();
        assert_eq!(registry.len(), 1);
        let entry = registry.get("local").expect("entry");
        assert_eq!(entry.settings().priority, 2);
        assert_eq!(entry.health(), HealthState::Unknown);
    }

    #[test]
    fn attempt_counters_preserve_the_inflight_invariant() {
        let registry = test_registry();
        let entry = registry.get("local").expect("entry");

        entry.begin_attempt();
        entry.begin_attempt();
        let status = entry.status();
        // requests counts in-flight work; the difference is in_flight.
        assert_eq!(status.requests, 2);
        assert_eq!(status.successes + status.failures, 0);
        assert_eq!(status.in_flight, 2);

        entry.complete_attempt(AttemptOutcome {
            success: true,
            latency_ms: 120,
            error_kind: None,
            error_message: None,
        });
        entry.complete_attempt(AttemptOutcome {
            success: false,
            latency_ms: 300,
            error_kind: Some(ErrorKind::ServerError),
            error_message: Some("boom".to_string()),
        });

        let status = entry.status();
        assert_eq!(status.in_flight, 0);
        assert_eq!(status.successes, 1);
        assert_eq!(status.failures, 1);
        assert!(status.successes + status.failures <= status.requests);
        assert_eq!(status.error_kind_counts[&ErrorKind::ServerError], 1);
        assert_eq!(status.recent_success_rate(), 0.5);
    }

    #[test]
    fn probes_do_not_touch_request_counters() {
        let registry = test_registry();
        let entry = registry.get("local").expect("entry");
        entry.record_probe(Some(50), true);
        entry.record_probe(None, false);
        let status = entry.status();
        assert_eq!(status.requests, 0);
        assert_eq!(status.probe_consecutive_failures, 1);
    }

    #[test]
    fn admin_patch_mutates_descriptor() {
        let registry = test_registry();
        let entry = registry.get("local").expect("entry");
        entry.apply_patch(&ProviderPatch {
            enabled: Some(false),
            priority: Some(9),
        });
        let settings = entry.settings();
        assert!(!settings.enabled);
        assert_eq!(settings.priority, 9);
    }
}
