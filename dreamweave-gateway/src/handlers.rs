//! # HTTP Request Handlers
//!
//! Route handlers for the gateway's three surfaces:
//!
//! - **Generation**: `POST /api/parse-dream`, the primary endpoint.
//! - **Health**: liveness, per-provider detail (with 200/206/503 status
//!   aggregation), and on-demand probes.
//! - **Monitoring & admin**: dashboard snapshot, realtime counters,
//!   performance with baseline comparison, alert queries, and the
//!   administrative provider mutation.
//!
//! Handlers stay thin: request validation and response shaping only, with
//! all behavior behind [`crate::manager::ProviderManager`] and friends.

use crate::gateway_error::GatewayError;
use crate::registry::ProviderPatch;
use crate::server::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use dreamweave_providers::duration_serde;
use dreamweave_providers::{GenerationRequest, Severity};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const MAX_PROMPT_CHARS: usize = 20_000;
const MAX_BUDGET: Duration = Duration::from_secs(600);

#[derive(Debug, Deserialize)]
pub struct ParseDreamRequest {
    pub text: String,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub options: Option<ParseDreamOptions>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseDreamOptions {
    pub timeout_ms: Option<u64>,
}

/// `POST /api/parse-dream`: generate validated structured content from a
/// dream prompt. Returns 200 for every successful generation, including
/// emergency fallback output; callers inspect `data.source`.
pub async fn parse_dream(
    State(state): State<AppState>,
    Json(body): Json<ParseDreamRequest>,
) -> Result<Json<Value>, GatewayError> {
    let text = body.text.trim();
    if text.is_empty() {
        return Err(GatewayError::invalid("text is required"));
    }
    if text.chars().count() > MAX_PROMPT_CHARS {
        return Err(GatewayError::invalid(format!(
            "text exceeds {MAX_PROMPT_CHARS} characters"
        )));
    }

    let budget = match body.options.as_ref().and_then(|o| o.timeout_ms) {
        Some(ms) => {
            let requested = Duration::from_millis(ms);
            if requested > MAX_BUDGET {
                return Err(GatewayError::invalid(format!(
                    "timeoutMs exceeds the {}s ceiling",
                    MAX_BUDGET.as_secs()
                )));
            }
            requested
        }
        None => state.config.selection.default_budget,
    };

    let mut request = GenerationRequest::new(text, budget);
    request.style = body.style.filter(|s| !s.is_empty());
    request.quality = body.quality.filter(|q| !q.is_empty());

    let artifact = state.manager.generate(request).await?;
    Ok(Json(json!({ "success": true, "data": artifact })))
}

/// `GET /health`: liveness. 200 whenever the process is up.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptimeSeconds": state.metrics.uptime().as_secs(),
        "providers": state.registry.len(),
    }))
}

/// `GET /health/detailed`: per-provider health with aggregate status:
/// 200 all-healthy, 206 degraded, 503 all-unhealthy.
pub async fn health_detailed(State(state): State<AppState>) -> Response {
    let snapshots = state.registry.snapshots();
    let status = aggregate_status(&snapshots);

    let providers: Vec<Value> = snapshots
        .iter()
        .map(|s| {
            json!({
                "name": s.name,
                "status": s.health.as_str(),
                "successRate": s.success_rate,
                "avgResponseTime": s.avg_response_time_ms,
                "consecutiveFailures": s.consecutive_failures,
                "circuit": s.circuit,
            })
        })
        .collect();

    (status, Json(json!({ "providers": providers }))).into_response()
}

fn aggregate_status(snapshots: &[crate::registry::ProviderSnapshot]) -> StatusCode {
    use crate::registry::HealthState;
    if snapshots.is_empty() {
        return StatusCode::PARTIAL_CONTENT;
    }
    if snapshots
        .iter()
        .all(|s| s.health == HealthState::Unhealthy)
    {
        StatusCode::SERVICE_UNAVAILABLE
    } else if snapshots.iter().all(|s| s.health == HealthState::Healthy) {
        StatusCode::OK
    } else {
        StatusCode::PARTIAL_CONTENT
    }
}

/// `GET /health/provider/{name}`: one provider; 404 if unknown.
pub async fn health_provider(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    let entry = state
        .registry
        .get(&name)
        .ok_or_else(|| GatewayError::not_found(format!("unknown provider: {name}")))?;
    let snapshot = entry.snapshot();
    Ok(Json(json!({
        "name": snapshot.name,
        "status": snapshot.health.as_str(),
        "successRate": snapshot.success_rate,
        "avgResponseTime": snapshot.avg_response_time_ms,
        "consecutiveFailures": snapshot.consecutive_failures,
        "circuit": snapshot.circuit,
        "enabled": snapshot.enabled,
        "requests": snapshot.requests,
        "lastError": snapshot.last_error,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct HealthCheckRequest {
    #[serde(default)]
    pub providers: Option<Vec<String>>,
}

/// `POST /health/check`: live probe, optionally scoped to named
/// providers.
pub async fn health_check(
    State(state): State<AppState>,
    body: Option<Json<HealthCheckRequest>>,
) -> Json<Value> {
    let names = body.and_then(|Json(b)| b.providers);
    let results = state.health.probe_providers(names).await;
    Json(json!({ "results": results }))
}

/// `GET /monitoring/dashboard`: combined snapshot for operators.
pub async fn monitoring_dashboard(State(state): State<AppState>) -> Json<Value> {
    let providers = state.registry.snapshots();
    let realtime = state.metrics.realtime().await;
    let totals = state.metrics.totals().await;
    let alerts = state.alerts.query(None, None, 20);

    let total_requests: u64 = totals.values().map(|t| t.requests).sum();
    let total_failures: u64 = totals.values().map(|t| t.failures).sum();

    Json(json!({
        "system": {
            "uptimeSeconds": state.metrics.uptime().as_secs(),
            "totalRequests": total_requests,
            "totalFailures": total_failures,
            "activeAlerts": state.alerts.active_count(),
            "alertDeliveryFailures": state.alerts.delivery_failures(),
        },
        "providers": providers,
        "realtime": realtime,
        "alerts": alerts,
    }))
}

/// `GET /monitoring/realtime`: realtime counters per provider.
pub async fn monitoring_realtime(State(state): State<AppState>) -> Json<Value> {
    let window = state.metrics.realtime().await;
    let counters: Vec<Value> = state
        .registry
        .snapshots()
        .into_iter()
        .map(|snapshot| {
            let stats = window.get(&snapshot.name);
            json!({
                "provider": snapshot.name,
                "inFlight": snapshot.in_flight,
                "requestsLastMinute": stats.map_or(0, |s| s.requests),
                "failuresLastMinute": stats.map_or(0, |s| s.failures),
                "avgLatencyMs": stats.map_or(0.0, |s| s.avg_latency_ms),
                "p50LatencyMs": stats.map_or(0.0, |s| s.p50_latency_ms),
                "p95LatencyMs": stats.map_or(0.0, |s| s.p95_latency_ms),
            })
        })
        .collect();
    Json(json!({ "providers": counters }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceQuery {
    pub time_range: Option<String>,
    pub provider: Option<String>,
}

/// `GET /monitoring/performance?timeRange=1h`: aggregated metrics with
/// baseline comparison and a minute-resolution series.
pub async fn monitoring_performance(
    State(state): State<AppState>,
    Query(query): Query<PerformanceQuery>,
) -> Result<Json<Value>, GatewayError> {
    let range = match &query.time_range {
        Some(raw) => duration_serde::parse_duration(raw)
            .map_err(|e| GatewayError::invalid(format!("invalid timeRange: {e}")))?,
        None => Duration::from_secs(3600),
    };

    let report = state
        .metrics
        .performance_report(query.provider.as_deref(), range)
        .await;
    let series = state
        .metrics
        .time_series(query.provider.as_deref(), range)
        .await;
    let detections = state.metrics.promise_detections().await;

    Ok(Json(json!({
        "timeRangeSeconds": range.as_secs(),
        "providers": report,
        "series": series,
        "promiseDetections": detections,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct AlertsQuery {
    pub severity: Option<String>,
    pub provider: Option<String>,
    pub limit: Option<usize>,
}

/// `GET /monitoring/alerts?severity=&provider=&limit=`.
pub async fn monitoring_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> Result<Json<Value>, GatewayError> {
    let severity = match query.severity.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(parse_severity(raw)?),
    };
    let limit = query.limit.unwrap_or(50).min(500);
    let alerts = state
        .alerts
        .query(severity, query.provider.as_deref(), limit);
    Ok(Json(json!({ "alerts": alerts })))
}

fn parse_severity(raw: &str) -> Result<Severity, GatewayError> {
    match raw.to_lowercase().as_str() {
        "low" => Ok(Severity::Low),
        "medium" => Ok(Severity::Medium),
        "high" => Ok(Severity::High),
        "critical" => Ok(Severity::Critical),
        other => Err(GatewayError::invalid(format!("unknown severity: {other}"))),
    }
}

/// `GET /admin/providers`: descriptors plus runtime state, credentials
/// redacted.
pub async fn admin_providers(State(state): State<AppState>) -> Json<Value> {
    let providers: Vec<Value> = state
        .registry
        .entries()
        .into_iter()
        .map(|entry| {
            let settings = entry.settings();
            let snapshot = entry.snapshot();
            json!({
                "name": entry.name,
                "kind": settings.name,
                "enabled": settings.enabled,
                "priority": settings.priority,
                "model": settings.resolved_model(),
                "limits": settings.limits,
                "capabilities": settings.capabilities,
                "health": snapshot.health.as_str(),
                "circuit": snapshot.circuit,
                "requests": snapshot.requests,
                "successRate": snapshot.success_rate,
            })
        })
        .collect();
    Json(json!({ "providers": providers }))
}

/// `PATCH /admin/providers/{name}`: the administrative mutation: enable or
/// disable a provider and adjust its priority at runtime.
pub async fn admin_provider_patch(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(patch): Json<ProviderPatch>,
) -> Result<Json<Value>, GatewayError> {
    let entry = state
        .registry
        .get(&name)
        .ok_or_else(|| GatewayError::not_found(format!("unknown provider: {name}")))?;
    entry.apply_patch(&patch);
    tracing::info!(provider = %name, ?patch, "provider descriptor updated");
    let settings = entry.settings();
    Ok(Json(json!({
        "name": name,
        "enabled": settings.enabled,
        "priority": settings.priority,
    })))
}

/// `GET /admin/config`: sanitized configuration snapshot. Provider API
/// keys never appear in the response.
pub async fn admin_config(State(state): State<AppState>) -> Json<Value> {
    let providers: Value = state
        .config
        .providers
        .iter()
        .map(|(name, settings)| {
            (
                name.clone(),
                json!({
                    "kind": settings.name,
                    "enabled": settings.enabled,
                    "priority": settings.priority,
                    "model": settings.resolved_model(),
                    "baseUrl": settings.base_url,
                    "limits": settings.limits,
                    "capabilities": settings.capabilities,
                    "apiKey": if settings.api_key.is_empty() { "unset" } else { "redacted" },
                }),
            )
        })
        .collect::<serde_json::Map<String, Value>>()
        .into();

    Json(json!({
        "server": {
            "host": state.config.server.host,
            "port": state.config.server.port,
        },
        "providers": providers,
        "selection": {
            "priorityWeight": state.config.selection.priority_weight,
            "successWeight": state.config.selection.success_weight,
            "latencyWeight": state.config.selection.latency_weight,
            "defaultBudgetMs": state.config.selection.default_budget.as_millis() as u64,
        },
        "circuit": {
            "failureThreshold": state.config.circuit.failure_threshold,
            "cooldownMs": state.config.circuit.cooldown.as_millis() as u64,
        },
        "alerts": {
            "criticalFailureRate": state.config.alerts.critical_failure_rate,
            "warningFailureRate": state.config.alerts.warning_failure_rate,
        },
    }))
}
