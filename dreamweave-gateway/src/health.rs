//! # Health Monitor
//!
//! Two loops per the gateway's health model:
//!
//! - **Passive**: derives each provider's health from its rolling request
//!   window, its circuit, and recent probe results. Runs every few seconds
//!   and emits `healthChanged` events on transitions.
//! - **Active**: a periodic lightweight probe per provider. Probe outcomes
//!   feed the health derivation but never touch user-facing request
//!   metrics.
//!
//! Health is intentionally independent of circuit state (the circuit gates
//! dispatch, health gates selection); the only coupling is the rule that a
//! circuit stuck open for more than twice its cooldown forces `unhealthy`.

use crate::config::HealthConfig;
use crate::events::{EventBus, GatewayEvent};
use crate::registry::{HealthState, ProviderEntry, ProviderRegistry};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Result of one on-demand or scheduled probe.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub provider: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct HealthMonitor {
    registry: Arc<ProviderRegistry>,
    events: EventBus,
    config: HealthConfig,
    circuit_cooldown: Duration,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        events: EventBus,
        config: HealthConfig,
        circuit_cooldown: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            events,
            config,
            circuit_cooldown,
        })
    }

    /// Spawn the passive and active loops.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let passive = {
            let monitor = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(monitor.config.eval_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    monitor.evaluate_once();
                }
            })
        };
        let active = {
            let monitor = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(monitor.config.probe_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    monitor.probe_providers(None).await;
                }
            })
        };
        vec![passive, active]
    }

    /// One passive evaluation pass over all providers.
    pub fn evaluate_once(&self) {
        for entry in self.registry.entries() {
            let (current, evidence) = self.derive_health(&entry);
            let previous = entry.set_health(current);
            if previous != current {
                tracing::info!(
                    provider = %entry.name,
                    previous = previous.as_str(),
                    current = current.as_str(),
                    %evidence,
                    "provider health changed"
                );
                self.events.emit(GatewayEvent::HealthChanged {
                    provider: entry.name.clone(),
                    previous,
                    current,
                    evidence,
                });
            }
        }
    }

    fn derive_health(&self, entry: &ProviderEntry) -> (HealthState, String) {
        let status = entry.status();
        let circuit = entry.breaker.snapshot();

        if let Some(open_for) = circuit.open_for {
            if open_for > self.circuit_cooldown * 2 {
                return (
                    HealthState::Unhealthy,
                    format!("circuit open for {}s", open_for.as_secs()),
                );
            }
        }
        if circuit.consecutive_failures >= self.config.critical_consecutive_failures {
            return (
                HealthState::Unhealthy,
                format!("{} consecutive failures", circuit.consecutive_failures),
            );
        }
        if status.probe_consecutive_failures >= self.config.probe_failure_threshold {
            return (
                HealthState::Unhealthy,
                format!(
                    "{} consecutive probe failures",
                    status.probe_consecutive_failures
                ),
            );
        }
        if !status.has_observations() {
            return (HealthState::Unknown, "no observations yet".to_string());
        }

        let success_rate = status.recent_success_rate();
        let avg_latency = status.avg_latency_ms();
        let sla_ms = self.config.sla_latency.as_millis() as f64;
        if success_rate >= self.config.healthy_success_rate && avg_latency <= sla_ms {
            (
                HealthState::Healthy,
                format!("success rate {success_rate:.2}, avg latency {avg_latency:.0}ms"),
            )
        } else {
            (
                HealthState::Degraded,
                format!(
                    "success rate {success_rate:.2} (floor {}), avg latency {avg_latency:.0}ms (sla {sla_ms:.0}ms)",
                    self.config.healthy_success_rate
                ),
            )
        }
    }

    /// Probe providers now. `names = None` probes everything; unknown names
    /// are skipped (the HTTP layer reports them).
    pub async fn probe_providers(&self, names: Option<Vec<String>>) -> Vec<ProbeResult> {
        let entries: Vec<Arc<ProviderEntry>> = match &names {
            Some(names) => names
                .iter()
                .filter_map(|name| self.registry.get(name))
                .collect(),
            None => self.registry.entries(),
        };

        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            results.push(self.probe_entry(&entry).await);
        }
        results
    }

    async fn probe_entry(&self, entry: &ProviderEntry) -> ProbeResult {
        let timeout = self.config.probe_timeout;
        let outcome = tokio::time::timeout(timeout, entry.provider.probe(timeout)).await;
        match outcome {
            Ok(Ok(latency)) => {
                let latency_ms = latency.as_millis() as u64;
                entry.record_probe(Some(latency_ms), true);
                ProbeResult {
                    provider: entry.name.clone(),
                    ok: true,
                    latency_ms: Some(latency_ms),
                    error: None,
                }
            }
            Ok(Err(e)) => {
                entry.record_probe(None, false);
                tracing::debug!(provider = %entry.name, error = %e, "probe failed");
                ProbeResult {
                    provider: entry.name.clone(),
                    ok: false,
                    latency_ms: None,
                    error: Some(e.kind().as_str().to_string()),
                }
            }
            Err(_) => {
                entry.record_probe(None, false);
                ProbeResult {
                    provider: entry.name.clone(),
                    ok: false,
                    latency_ms: None,
                    error: Some("timeout".to_string()),
                }
            }
        }
    }
}
