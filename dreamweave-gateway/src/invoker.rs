//! # Provider Invoker
//!
//! Executes exactly one attempt against one provider, in the fixed order
//! the admission pipeline demands: rate-limiter slot → circuit gate →
//! dispatch under the remaining deadline → extraction → record. The
//! invoker never retries; that policy lives in the retry orchestrator.
//!
//! Both gates hand out RAII guards, so a timeout, panic, or cancelled
//! future releases the concurrency slot and the half-open probe hold on
//! every exit path.

use crate::events::{EventBus, GatewayEvent};
use crate::metrics::{MetricsCollector, Outcome};
use crate::registry::{AttemptOutcome, ProviderEntry};
use dreamweave_providers::{extraction, CircuitRejection, ErrorKind, ErrorRecord};
use dreamweave_providers::{GenerationRequest, PreparedPrompt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

/// A usable candidate produced by one attempt.
#[derive(Debug, Clone)]
pub struct InvokeSuccess {
    pub candidate: Value,
    pub extraction_notes: Vec<String>,
    pub model: String,
    pub tokens: Option<u32>,
    pub latency_ms: u64,
}

pub struct ProviderInvoker {
    metrics: Arc<MetricsCollector>,
    events: EventBus,
}

impl ProviderInvoker {
    pub fn new(metrics: Arc<MetricsCollector>, events: EventBus) -> Self {
        Self { metrics, events }
    }

    /// Perform one attempt. On success the caller owns the validation step
    /// and must call [`ProviderEntry::complete_attempt`] with the final
    /// outcome; on failure this method has already recorded everything.
    pub async fn invoke_once(
        &self,
        entry: &ProviderEntry,
        prompt: &PreparedPrompt,
        request: &GenerationRequest,
        attempt: u32,
        deadline: Instant,
    ) -> Result<InvokeSuccess, ErrorRecord> {
        let now = Instant::now();
        let remaining = deadline.saturating_duration_since(now);
        if remaining.is_zero() {
            return Err(self.reject(
                entry,
                request,
                attempt,
                ErrorKind::Timeout,
                "request budget exhausted before dispatch",
            ));
        }

        // 1. Admission: bounded wait for a rate-limiter slot.
        let _permit = match entry.limiter.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                return Err(self.reject(
                    entry,
                    request,
                    attempt,
                    e.kind(),
                    "rate limiter refused admission",
                ));
            }
        };

        // 2. Circuit gate.
        let guard = match entry.breaker.try_acquire() {
            Ok(guard) => guard,
            Err(CircuitRejection::Open { retry_after }) => {
                return Err(self.reject(
                    entry,
                    request,
                    attempt,
                    ErrorKind::CircuitBreakerOpen,
                    &format!("circuit open, retry after {}ms", retry_after.as_millis()),
                ));
            }
            Err(CircuitRejection::ProbeInFlight) => {
                return Err(self.reject(
                    entry,
                    request,
                    attempt,
                    ErrorKind::CircuitBreakerOpen,
                    "circuit half-open with a probe already in flight",
                ));
            }
        };

        // 3. Dispatch under the smaller of the provider timeout and the
        //    remaining request budget.
        let settings = entry.settings();
        let timeout = settings.timeout.min(remaining);
        entry.begin_attempt();
        let started = Instant::now();
        let dispatch = entry.provider.invoke(prompt, timeout).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let response = match dispatch {
            Ok(response) => response,
            Err(e) => {
                if let Some(state) = guard.failure() {
                    self.events.emit(GatewayEvent::CircuitTransition {
                        provider: entry.name.clone(),
                        state,
                    });
                }
                let record =
                    ErrorRecord::from_provider_error(&e, &entry.name, &request.id, attempt);
                entry.complete_attempt(AttemptOutcome {
                    success: false,
                    latency_ms,
                    error_kind: Some(record.kind),
                    error_message: Some(record.context.clone()),
                });
                self.metrics.record_attempt(
                    &entry.name,
                    &request.id,
                    Outcome::Failure,
                    latency_ms,
                    Some(record.kind),
                    None,
                );
                tracing::warn!(
                    provider = %entry.name,
                    request = %request.id,
                    attempt,
                    kind = record.kind.as_str(),
                    "provider dispatch failed"
                );
                return Err(record);
            }
        };

        // 4. Extraction.
        match extraction::extract(&response.raw) {
            Ok(extracted) => {
                if let Some(state) = guard.success() {
                    self.events.emit(GatewayEvent::CircuitTransition {
                        provider: entry.name.clone(),
                        state,
                    });
                }
                Ok(InvokeSuccess {
                    candidate: extracted.candidate,
                    extraction_notes: extracted.notes,
                    model: response.model,
                    tokens: response.tokens.map(|t| t.total()),
                    latency_ms,
                })
            }
            Err(e) => {
                if let Some(state) = guard.failure() {
                    self.events.emit(GatewayEvent::CircuitTransition {
                        provider: entry.name.clone(),
                        state,
                    });
                }
                let record =
                    ErrorRecord::from_provider_error(&e, &entry.name, &request.id, attempt);
                if record.kind == ErrorKind::AsyncExtractionError {
                    // The location context rides in the error message.
                    self.metrics
                        .record_promise_detection(&entry.name, &record.context);
                }
                entry.complete_attempt(AttemptOutcome {
                    success: false,
                    latency_ms,
                    error_kind: Some(record.kind),
                    error_message: Some(record.context.clone()),
                });
                self.metrics.record_attempt(
                    &entry.name,
                    &request.id,
                    Outcome::Failure,
                    latency_ms,
                    Some(record.kind),
                    None,
                );
                Err(record)
            }
        }
    }

    /// Record an admission-stage refusal. No dispatch was started, so the
    /// provider's request counters are untouched; only the metric stream
    /// sees the refusal.
    fn reject(
        &self,
        entry: &ProviderEntry,
        request: &GenerationRequest,
        attempt: u32,
        kind: ErrorKind,
        context: &str,
    ) -> ErrorRecord {
        self.metrics
            .record_attempt(&entry.name, &request.id, Outcome::Failure, 0, Some(kind), None);
        tracing::debug!(
            provider = %entry.name,
            request = %request.id,
            kind = kind.as_str(),
            context,
            "attempt rejected before dispatch"
        );
        ErrorRecord::new(kind, request.id.clone())
            .with_provider(entry.name.clone())
            .with_attempt(attempt)
            .with_context(context.to_string())
    }
}
