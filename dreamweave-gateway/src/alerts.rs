//! # Alerting System
//!
//! Evaluates threshold rules against the metrics collector and provider
//! snapshots, and reacts to gateway events. One consolidated rule set; the
//! thresholds live in configuration and default to the stricter of the two
//! alerting stacks this system replaces.
//!
//! Lifecycle per alert: **fire** on threshold crossing → **suppress**
//! duplicates inside the duplicate window (plus an hourly per-provider cap)
//! → **escalate** when the same alert recurs five times within an hour →
//! **resolve** automatically once the condition stops holding for a full
//! evaluation cycle.
//!
//! Delivery channels are pluggable and fail independently: a broken webhook
//! is logged and counted, never retried synchronously, and never blocks
//! another channel or the request path.

use crate::config::AlertsConfig;
use crate::events::{EventBus, GatewayEvent};
use crate::metrics::MetricsCollector;
use crate::registry::{HealthState, ProviderRegistry};
use chrono::{DateTime, Utc};
use dreamweave_providers::Severity;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Alert types produced by the rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighFailureRate,
    ElevatedFailureRate,
    ConsecutiveFailures,
    SlowResponses,
    ParsingErrors,
    ProviderUnhealthy,
    AllProvidersFailed,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::HighFailureRate => "high_failure_rate",
            AlertKind::ElevatedFailureRate => "elevated_failure_rate",
            AlertKind::ConsecutiveFailures => "consecutive_failures",
            AlertKind::SlowResponses => "slow_responses",
            AlertKind::ParsingErrors => "parsing_errors",
            AlertKind::ProviderUnhealthy => "provider_unhealthy",
            AlertKind::AllProvidersFailed => "all_providers_failed",
        }
    }
}

/// One alert occurrence.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecord {
    pub id: Uuid,
    pub kind: AlertKind,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suppressed_until: Option<DateTime<Utc>>,
    pub escalation_level: u8,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Pluggable delivery target.
#[async_trait::async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, alert: &AlertRecord) -> anyhow::Result<()>;
}

/// Structured-log delivery.
pub struct LogChannel;

#[async_trait::async_trait]
impl AlertChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, alert: &AlertRecord) -> anyhow::Result<()> {
        match alert.severity {
            Severity::Critical => tracing::error!(
                kind = alert.kind.as_str(),
                provider = alert.provider.as_deref().unwrap_or("-"),
                escalation = alert.escalation_level,
                "ALERT: {}",
                alert.data
            ),
            _ => tracing::warn!(
                kind = alert.kind.as_str(),
                provider = alert.provider.as_deref().unwrap_or("-"),
                "alert: {}",
                alert.data
            ),
        }
        Ok(())
    }
}

/// Plain stdout delivery, for operators tailing the process.
pub struct ConsoleChannel;

#[async_trait::async_trait]
impl AlertChannel for ConsoleChannel {
    fn name(&self) -> &str {
        "console"
    }

    async fn deliver(&self, alert: &AlertRecord) -> anyhow::Result<()> {
        println!(
            "[alert:{:?}] {} provider={} {}",
            alert.severity,
            alert.kind.as_str(),
            alert.provider.as_deref().unwrap_or("-"),
            alert.data
        );
        Ok(())
    }
}

/// JSON POST to a configured webhook.
pub struct WebhookChannel {
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl AlertChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, alert: &AlertRecord) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .timeout(Duration::from_secs(5))
            .json(alert)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

struct ActiveCondition {
    record: AlertRecord,
    last_fired: DateTime<Utc>,
    /// Fire/suppress occurrences within the escalation window
    occurrences: VecDeque<DateTime<Utc>>,
    escalated: bool,
    held_this_cycle: bool,
}

#[derive(Default)]
struct AlertState {
    active: HashMap<(AlertKind, Option<String>), ActiveCondition>,
    history: VecDeque<AlertRecord>,
    hourly: HashMap<String, VecDeque<DateTime<Utc>>>,
}

pub struct AlertingSystem {
    config: AlertsConfig,
    registry: Arc<ProviderRegistry>,
    metrics: Arc<MetricsCollector>,
    channels: Vec<Arc<dyn AlertChannel>>,
    state: Mutex<AlertState>,
    delivery_failures: Arc<AtomicU64>,
}

impl AlertingSystem {
    pub fn new(
        config: AlertsConfig,
        registry: Arc<ProviderRegistry>,
        metrics: Arc<MetricsCollector>,
    ) -> Arc<Self> {
        let mut channels: Vec<Arc<dyn AlertChannel>> = vec![Arc::new(LogChannel)];
        if let Some(url) = &config.webhook_url {
            channels.push(Arc::new(WebhookChannel::new(url.clone())));
        }
        Arc::new(Self {
            config,
            registry,
            metrics,
            channels,
            state: Mutex::new(AlertState::default()),
            delivery_failures: Arc::new(AtomicU64::new(0)),
        })
    }

    #[cfg(test)]
    fn with_channels(
        config: AlertsConfig,
        registry: Arc<ProviderRegistry>,
        metrics: Arc<MetricsCollector>,
        channels: Vec<Arc<dyn AlertChannel>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            metrics,
            channels,
            state: Mutex::new(AlertState::default()),
            delivery_failures: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Spawn the evaluation loop and the event listener.
    pub fn spawn(self: &Arc<Self>, events: &EventBus) -> Vec<JoinHandle<()>> {
        let eval = {
            let system = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(system.config.eval_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    system.evaluate_once().await;
                }
            })
        };
        let listener = {
            let system = Arc::clone(self);
            let mut rx = events.subscribe();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(GatewayEvent::AllProvidersFailed { request_id }) => {
                            system.raise(
                                AlertKind::AllProvidersFailed,
                                None,
                                Severity::Critical,
                                json!({ "requestId": request_id }),
                            );
                        }
                        Ok(GatewayEvent::HealthChanged {
                            provider, current, ..
                        }) if current == HealthState::Unhealthy => {
                            system.raise(
                                AlertKind::ProviderUnhealthy,
                                Some(provider),
                                Severity::High,
                                json!({ "health": "unhealthy" }),
                            );
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "alert listener lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };
        vec![eval, listener]
    }

    /// One evaluation pass over all rules.
    pub async fn evaluate_once(&self) {
        let snapshots = self.registry.snapshots();
        let window = Duration::from_secs(300);
        let mut conditions: Vec<(AlertKind, Option<String>, Severity, Value)> = Vec::new();

        for snapshot in &snapshots {
            let stats = self.metrics.window_stats(&snapshot.name, window).await;
            let hour = self
                .metrics
                .window_stats(&snapshot.name, Duration::from_secs(3600))
                .await;

            if stats.requests >= self.config.min_samples {
                if stats.failure_rate >= self.config.critical_failure_rate {
                    conditions.push((
                        AlertKind::HighFailureRate,
                        Some(snapshot.name.clone()),
                        Severity::Critical,
                        json!({ "failureRate": stats.failure_rate, "requests": stats.requests }),
                    ));
                } else if stats.failure_rate >= self.config.warning_failure_rate {
                    conditions.push((
                        AlertKind::ElevatedFailureRate,
                        Some(snapshot.name.clone()),
                        Severity::Medium,
                        json!({ "failureRate": stats.failure_rate, "requests": stats.requests }),
                    ));
                }
                if stats.avg_latency_ms >= self.config.slow_response.as_millis() as f64 {
                    conditions.push((
                        AlertKind::SlowResponses,
                        Some(snapshot.name.clone()),
                        Severity::Medium,
                        json!({ "avgLatencyMs": stats.avg_latency_ms }),
                    ));
                }
            }
            if snapshot.consecutive_failures >= self.config.consecutive_failures {
                conditions.push((
                    AlertKind::ConsecutiveFailures,
                    Some(snapshot.name.clone()),
                    Severity::High,
                    json!({ "consecutiveFailures": snapshot.consecutive_failures }),
                ));
            }
            if hour.parsing_errors >= self.config.parsing_errors_per_hour {
                conditions.push((
                    AlertKind::ParsingErrors,
                    Some(snapshot.name.clone()),
                    Severity::Medium,
                    json!({ "parsingErrors": hour.parsing_errors }),
                ));
            }
            if snapshot.health == HealthState::Unhealthy {
                conditions.push((
                    AlertKind::ProviderUnhealthy,
                    Some(snapshot.name.clone()),
                    Severity::High,
                    json!({ "health": "unhealthy" }),
                ));
            }
        }

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            for condition in state.active.values_mut() {
                condition.held_this_cycle = false;
            }
        }

        for (kind, provider, severity, data) in conditions {
            self.raise(kind, provider, severity, data);
        }

        self.resolve_cleared();
        self.trim();
    }

    /// Fire or suppress an alert. Returns the newly fired record, if any.
    pub fn raise(
        &self,
        kind: AlertKind,
        provider: Option<String>,
        severity: Severity,
        data: Value,
    ) -> Option<AlertRecord> {
        let now = Utc::now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        // Hourly per-provider cap.
        if let Some(provider) = &provider {
            let fired = state.hourly.entry(provider.clone()).or_default();
            while fired
                .front()
                .is_some_and(|t| now - *t > chrono::Duration::hours(1))
            {
                fired.pop_front();
            }
            if fired.len() >= self.config.max_alerts_per_provider_per_hour {
                tracing::debug!(provider = %provider, kind = kind.as_str(), "alert hourly cap reached");
                return None;
            }
        }

        let key = (kind, provider.clone());
        let duplicate_window =
            chrono::Duration::from_std(self.config.duplicate_window).unwrap_or_else(|_| chrono::Duration::zero());
        let escalation_window = chrono::Duration::hours(1);

        if let Some(active) = state.active.get_mut(&key) {
            active.held_this_cycle = true;
            active.occurrences.push_back(now);
            while active
                .occurrences
                .front()
                .is_some_and(|t| now - *t > escalation_window)
            {
                active.occurrences.pop_front();
            }

            if now - active.last_fired < duplicate_window {
                active.record.suppressed_until = Some(active.last_fired + duplicate_window);

                if active.occurrences.len() >= self.config.escalation_count && !active.escalated {
                    active.escalated = true;
                    let escalated = AlertRecord {
                        id: Uuid::new_v4(),
                        kind,
                        severity: Severity::Critical,
                        provider: provider.clone(),
                        created_at: now,
                        suppressed_until: None,
                        escalation_level: active.record.escalation_level + 1,
                        data: json!({
                            "escalatedFrom": active.record.id,
                            "occurrencesInHour": active.occurrences.len(),
                        }),
                        resolved_at: None,
                    };
                    state.history.push_back(escalated.clone());
                    drop(state);
                    self.dispatch(escalated.clone());
                    return Some(escalated);
                }
                return None;
            }

            // Outside the duplicate window: refire.
            active.last_fired = now;
            active.record.suppressed_until = None;
            let record = active.record.clone();
            drop(state);
            self.dispatch(record.clone());
            return Some(record);
        }

        let record = AlertRecord {
            id: Uuid::new_v4(),
            kind,
            severity,
            provider: provider.clone(),
            created_at: now,
            suppressed_until: None,
            escalation_level: 0,
            data,
            resolved_at: None,
        };
        if let Some(provider) = &provider {
            state
                .hourly
                .entry(provider.clone())
                .or_default()
                .push_back(now);
        }
        state.active.insert(
            key,
            ActiveCondition {
                record: record.clone(),
                last_fired: now,
                occurrences: VecDeque::from([now]),
                escalated: false,
                held_this_cycle: true,
            },
        );
        drop(state);
        self.dispatch(record.clone());
        Some(record)
    }

    /// Resolve active alerts whose condition did not hold this cycle.
    fn resolve_cleared(&self) {
        let now = Utc::now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let cleared: Vec<(AlertKind, Option<String>)> = state
            .active
            .iter()
            .filter(|(_, c)| !c.held_this_cycle)
            .map(|(k, _)| k.clone())
            .collect();
        for key in cleared {
            if let Some(mut condition) = state.active.remove(&key) {
                condition.record.resolved_at = Some(now);
                tracing::info!(
                    kind = condition.record.kind.as_str(),
                    provider = condition.record.provider.as_deref().unwrap_or("-"),
                    "alert resolved"
                );
                state.history.push_back(condition.record);
            }
        }
    }

    fn trim(&self) {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(self.config.retention).unwrap_or_else(|_| chrono::Duration::hours(24));
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while state
            .history
            .front()
            .is_some_and(|r| r.created_at < cutoff)
        {
            state.history.pop_front();
        }
    }

    /// Deliver to every channel off the caller's path. Channels deliver
    /// independently; one blocking or failing channel cannot hold up the
    /// others.
    fn dispatch(&self, record: AlertRecord) {
        for channel in &self.channels {
            let channel = Arc::clone(channel);
            let record = record.clone();
            let failures = Arc::clone(&self.delivery_failures);
            tokio::spawn(async move {
                if let Err(e) = channel.deliver(&record).await {
                    failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(channel = channel.name(), error = %e, "alert delivery failed");
                }
            });
        }
    }

    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }

    /// Active alerts plus recent history, newest first, filtered.
    pub fn query(
        &self,
        severity: Option<Severity>,
        provider: Option<&str>,
        limit: usize,
    ) -> Vec<AlertRecord> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<AlertRecord> = state
            .active
            .values()
            .map(|c| c.record.clone())
            .chain(state.history.iter().cloned())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
            .into_iter()
            .filter(|r| severity.map_or(true, |s| r.severity >= s))
            .filter(|r| provider.map_or(true, |p| r.provider.as_deref() == Some(p)))
            .take(limit)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .active
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metrics::Outcome;
    use dreamweave_providers::providers::ProviderSettings;
    use dreamweave_providers::ErrorKind;
    use std::sync::atomic::AtomicUsize;

    fn system() -> Arc<AlertingSystem> {
        let mut config = Config::default();
        config
            .providers
            .insert("local".to_string(), ProviderSettings::new("ollama", ""));
        let registry = Arc::new(ProviderRegistry::from_config(&config).expect("registry"));
        let metrics = MetricsCollector::start(config.metrics.clone());
        AlertingSystem::new(config.alerts, registry, metrics)
    }

    #[tokio::test]
    async fn duplicate_alerts_are_suppressed_within_the_window() {
        let system = system();
        let first = system.raise(
            AlertKind::HighFailureRate,
            Some("local".to_string()),
            Severity::Critical,
            json!({}),
        );
        assert!(first.is_some());

        let second = system.raise(
            AlertKind::HighFailureRate,
            Some("local".to_string()),
            Severity::Critical,
            json!({}),
        );
        assert!(second.is_none(), "identical alert inside the window must be suppressed");
        assert_eq!(system.active_count(), 1);
    }

    #[tokio::test]
    async fn repeated_occurrences_escalate_once() {
        let system = system();
        let mut escalations = 0;
        for _ in 0..8 {
            if let Some(record) = system.raise(
                AlertKind::SlowResponses,
                Some("local".to_string()),
                Severity::Medium,
                json!({}),
            ) {
                if record.escalation_level > 0 {
                    escalations += 1;
                    assert_eq!(record.severity, Severity::Critical);
                }
            }
        }
        assert_eq!(escalations, 1);
    }

    #[tokio::test]
    async fn hourly_cap_limits_distinct_alerts_per_provider() {
        let mut config = Config::default();
        config
            .providers
            .insert("local".to_string(), ProviderSettings::new("ollama", ""));
        let registry = Arc::new(ProviderRegistry::from_config(&config).expect("registry"));
        let metrics = MetricsCollector::start(config.metrics.clone());
        let mut alerts_config = config.alerts;
        alerts_config.max_alerts_per_provider_per_hour = 2;
        let system = AlertingSystem::new(alerts_config, registry, metrics);

        assert!(system
            .raise(AlertKind::HighFailureRate, Some("local".into()), Severity::Critical, json!({}))
            .is_some());
        assert!(system
            .raise(AlertKind::SlowResponses, Some("local".into()), Severity::Medium, json!({}))
            .is_some());
        // Cap reached; a third distinct alert for the same provider is dropped.
        assert!(system
            .raise(AlertKind::ParsingErrors, Some("local".into()), Severity::Medium, json!({}))
            .is_none());
    }

    #[tokio::test]
    async fn evaluation_fires_on_failure_rate_and_resolves_when_clear() {
        let mut config = Config::default();
        config
            .providers
            .insert("local".to_string(), ProviderSettings::new("ollama", ""));
        let registry = Arc::new(ProviderRegistry::from_config(&config).expect("registry"));
        let metrics = MetricsCollector::start(zero_retention_metrics_config());
        let system = AlertingSystem::with_channels(
            config.alerts.clone(),
            Arc::clone(&registry),
            Arc::clone(&metrics),
            vec![],
        );

        for i in 0..10 {
            metrics.record_attempt(
                "local",
                &format!("r{i}"),
                Outcome::Failure,
                100,
                Some(ErrorKind::ServerError),
                None,
            );
        }
        metrics.sync().await;

        system.evaluate_once().await;
        assert!(system
            .query(Some(Severity::Critical), Some("local"), 10)
            .iter()
            .any(|r| r.kind == AlertKind::HighFailureRate && r.resolved_at.is_none()));

        // Clear the window: collapse the raw data away, then re-evaluate.
        metrics.run_aggregation_once().await;
        system.evaluate_once().await;
        let records = system.query(None, Some("local"), 10);
        assert!(records
            .iter()
            .any(|r| r.kind == AlertKind::HighFailureRate && r.resolved_at.is_some()));
        assert_eq!(system.active_count(), 0);
    }

    fn zero_retention_metrics_config() -> crate::config::MetricsConfig {
        crate::config::MetricsConfig {
            raw_retention: Duration::from_secs(0),
            ..Default::default()
        }
    }

    struct FailingChannel {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl AlertChannel for FailingChannel {
        fn name(&self) -> &str {
            "failing"
        }

        async fn deliver(&self, _alert: &AlertRecord) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("delivery target down")
        }
    }

    struct CountingChannel {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl AlertChannel for CountingChannel {
        fn name(&self) -> &str {
            "counting"
        }

        async fn deliver(&self, _alert: &AlertRecord) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn a_failing_channel_does_not_block_the_others() {
        let mut config = Config::default();
        config
            .providers
            .insert("local".to_string(), ProviderSettings::new("ollama", ""));
        let registry = Arc::new(ProviderRegistry::from_config(&config).expect("registry"));
        let metrics = MetricsCollector::start(config.metrics.clone());

        let failing_calls = Arc::new(AtomicUsize::new(0));
        let counting_calls = Arc::new(AtomicUsize::new(0));
        let system = AlertingSystem::with_channels(
            config.alerts,
            registry,
            metrics,
            vec![
                Arc::new(FailingChannel {
                    calls: Arc::clone(&failing_calls),
                }),
                Arc::new(CountingChannel {
                    calls: Arc::clone(&counting_calls),
                }),
            ],
        );

        system.raise(
            AlertKind::AllProvidersFailed,
            None,
            Severity::Critical,
            json!({}),
        );
        // Delivery runs on spawned tasks; give them a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(failing_calls.load(Ordering::SeqCst), 1);
        assert_eq!(counting_calls.load(Ordering::SeqCst), 1);
    }
}
