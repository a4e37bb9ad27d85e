//! # Provider Manager
//!
//! Top-level coordinator for one generation request. Builds a scored
//! candidate list, walks it under the request's shared time budget, drives
//! each candidate through the retry orchestrator, and falls back to local
//! synthesis when everything is exhausted.
//!
//! Selection score per provider:
//!
//! ```text
//! score = priority * w_p + recent_success_rate * w_s
//!       - normalized_latency * w_l - circuit_penalty
//! ```
//!
//! Ties break by priority, then name, so selection is deterministic under
//! equal scores. Providers are skipped when disabled, unhealthy, or behind
//! a circuit that is open with its cooldown still running.

use crate::cache::ArtifactCache;
use crate::config::{Config, ConfidenceConfig, SelectionConfig};
use crate::events::{EventBus, GatewayEvent};
use crate::fallback::EmergencyFallback;
use crate::invoker::{InvokeSuccess, ProviderInvoker};
use crate::metrics::{MetricsCollector, Outcome};
use crate::registry::{AttemptOutcome, HealthState, ProviderEntry, ProviderRegistry};
use crate::repair::RepairEngine;
use crate::retry::{PromptAdjustment, RetryAction, RetryOrchestrator};
use crate::validation::ValidationPipeline;
use dreamweave_providers::providers::ProviderSettings;
use dreamweave_providers::{
    CircuitState, ErrorKind, ErrorRecord, GenerationRequest, PreparedPrompt, ValidatedArtifact,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of walking one provider for one request.
enum ProviderRun {
    Success(Box<FinishedAttempt>),
    Move(ErrorRecord),
    GiveUp(ErrorRecord),
}

struct FinishedAttempt {
    content: serde_json::Value,
    extraction_notes: Vec<String>,
    model: String,
    tokens: Option<u32>,
    repaired: bool,
}

pub struct ProviderManager {
    registry: Arc<ProviderRegistry>,
    invoker: ProviderInvoker,
    orchestrator: RetryOrchestrator,
    pipeline: ValidationPipeline,
    repair: RepairEngine,
    fallback: EmergencyFallback,
    cache: ArtifactCache,
    metrics: Arc<MetricsCollector>,
    events: EventBus,
    selection: SelectionConfig,
    confidence: ConfidenceConfig,
    circuit_cooldown: Duration,
}

impl ProviderManager {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        metrics: Arc<MetricsCollector>,
        events: EventBus,
        config: &Config,
    ) -> Self {
        Self {
            invoker: ProviderInvoker::new(Arc::clone(&metrics), events.clone()),
            orchestrator: RetryOrchestrator::new(config.retry.clone()),
            pipeline: ValidationPipeline::new(),
            repair: RepairEngine::new(config.repair.max_attempts),
            fallback: EmergencyFallback::new(config.confidence.clone()),
            cache: ArtifactCache::new(&config.cache),
            registry,
            metrics,
            events,
            selection: config.selection.clone(),
            confidence: config.confidence.clone(),
            circuit_cooldown: config.circuit.cooldown,
        }
    }

    /// The primary operation: generate a validated artifact for a request.
    ///
    /// Always returns `Ok` with either genuine provider output or an
    /// emergency fallback artifact; `Err` is reserved for the case where
    /// even fallback synthesis produced something invalid.
    pub async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<ValidatedArtifact, ErrorRecord> {
        let started = Instant::now();
        let deadline = started + request.timeout_budget;

        let cache_key = ArtifactCache::key(
            &request.prompt,
            request.style.as_deref(),
            request.quality.as_deref(),
        );
        if let Some(hit) = self.cache.get(cache_key) {
            tracing::debug!(request = %request.id, "artifact cache hit");
            return Ok(hit);
        }

        let candidates = self.select_candidates();
        tracing::debug!(
            request = %request.id,
            candidates = candidates.len(),
            budget_ms = request.timeout_budget.as_millis() as u64,
            "generation started"
        );

        for entry in candidates {
            if Instant::now() >= deadline {
                tracing::warn!(request = %request.id, "budget exhausted before next candidate");
                break;
            }
            match self.run_provider(&entry, &request, deadline).await {
                ProviderRun::Success(parts) => {
                    let artifact = self.finish_artifact(&request, &entry, *parts, started);
                    self.events.emit(GatewayEvent::OperationSuccess {
                        provider: entry.name.clone(),
                        request_id: request.id.clone(),
                        latency_ms: artifact.processing_time_ms,
                        repaired: artifact.repair_applied,
                    });
                    self.cache.insert(cache_key, artifact.clone());
                    return Ok(artifact);
                }
                ProviderRun::Move(record) => {
                    tracing::info!(
                        request = %request.id,
                        provider = %entry.name,
                        kind = record.kind.as_str(),
                        "moving to next candidate"
                    );
                }
                ProviderRun::GiveUp(record) => {
                    // The decision table reserves giveUp for failures no
                    // retry can fix; the candidate walk still advances so
                    // a differently-configured provider gets its chance.
                    tracing::warn!(
                        request = %request.id,
                        provider = %entry.name,
                        kind = record.kind.as_str(),
                        "provider gave up"
                    );
                }
            }
        }

        self.events.emit(GatewayEvent::AllProvidersFailed {
            request_id: request.id.clone(),
        });
        tracing::error!(request = %request.id, "all providers failed, synthesizing fallback");

        let artifact = self
            .fallback
            .synthesize(&request, started.elapsed().as_millis() as u64);
        let report = self.pipeline.validate(&artifact.content, request.schema);
        if !report.valid {
            return Err(ErrorRecord::new(ErrorKind::FallbackFailed, request.id.clone())
                .with_context("emergency fallback artifact failed validation")
                .with_cause(report.summary()));
        }
        Ok(artifact)
    }

    /// Score and order eligible providers.
    fn select_candidates(&self) -> Vec<Arc<ProviderEntry>> {
        let mut scored: Vec<(f64, u32, String, Arc<ProviderEntry>)> = Vec::new();

        for entry in self.registry.entries() {
            let settings = entry.settings();
            if !settings.enabled {
                continue;
            }
            let circuit = entry.breaker.snapshot();
            if circuit.state == CircuitState::Open
                && circuit.open_for.map_or(true, |d| d < self.circuit_cooldown)
            {
                continue;
            }
            let status = entry.status();
            if status.health == HealthState::Unhealthy {
                continue;
            }

            let normalized_latency = (status.avg_latency_ms()
                / self.selection.latency_norm.as_millis().max(1) as f64)
                .min(1.0);
            let circuit_penalty = if circuit.state == CircuitState::Closed {
                0.0
            } else {
                self.selection.circuit_penalty
            };
            let score = settings.priority as f64 * self.selection.priority_weight
                + status.recent_success_rate() * self.selection.success_weight
                - normalized_latency * self.selection.latency_weight
                - circuit_penalty;
            scored.push((score, settings.priority, entry.name.clone(), entry));
        }

        scored.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| b.1.cmp(&a.1))
                .then_with(|| a.2.cmp(&b.2))
        });
        scored.into_iter().map(|(_, _, _, entry)| entry).collect()
    }

    /// Drive one provider through attempts until success, move, or give-up.
    async fn run_provider(
        &self,
        entry: &Arc<ProviderEntry>,
        request: &GenerationRequest,
        deadline: Instant,
    ) -> ProviderRun {
        let settings = entry.settings();
        let base_user = build_user_prompt(request);
        let mut prompt = self.prepare_prompt(request, &settings);
        let mut occurrences: HashMap<ErrorKind, u32> = HashMap::new();
        let mut attempt = 0u32;

        loop {
            if Instant::now() >= deadline {
                return ProviderRun::Move(
                    ErrorRecord::new(ErrorKind::Timeout, request.id.clone())
                        .with_provider(entry.name.clone())
                        .with_attempt(attempt)
                        .with_context("request budget exhausted"),
                );
            }
            attempt += 1;

            match self
                .invoker
                .invoke_once(entry, &prompt, request, attempt, deadline)
                .await
            {
                Ok(success) => {
                    match self.settle_candidate(entry, request, success, attempt) {
                        SettledCandidate::Done(parts) => {
                            return ProviderRun::Success(Box::new(parts))
                        }
                        SettledCandidate::Reprompt { summary } => {
                            let occurrence = {
                                let counter =
                                    occurrences.entry(ErrorKind::ValidationFailed).or_insert(0);
                                *counter += 1;
                                *counter
                            };
                            let decision = self.orchestrator.decide(
                                ErrorKind::ValidationFailed,
                                occurrence,
                                Some(&summary),
                                request.schema,
                                &prompt,
                                &settings.limits,
                            );
                            match decision.action {
                                RetryAction::RepairAndRetry => {
                                    if let Some(adjustment) = decision.adjustment {
                                        apply_adjustment(&mut prompt, &base_user, &adjustment);
                                    }
                                    continue;
                                }
                                _ => {
                                    return ProviderRun::Move(
                                        ErrorRecord::new(
                                            ErrorKind::ValidationFailed,
                                            request.id.clone(),
                                        )
                                        .with_provider(entry.name.clone())
                                        .with_attempt(attempt)
                                        .with_context(summary),
                                    );
                                }
                            }
                        }
                    }
                }
                Err(record) => {
                    self.events.emit(GatewayEvent::OperationFailure {
                        provider: entry.name.clone(),
                        request_id: request.id.clone(),
                        kind: record.kind,
                        attempt,
                    });
                    let occurrence = {
                        let counter = occurrences.entry(record.kind).or_insert(0);
                        *counter += 1;
                        *counter
                    };
                    let decision = self.orchestrator.decide(
                        record.kind,
                        occurrence,
                        Some(&record.context),
                        request.schema,
                        &prompt,
                        &settings.limits,
                    );
                    match decision.action {
                        RetryAction::RetrySameProvider => {
                            let remaining = deadline.saturating_duration_since(Instant::now());
                            if decision.delay >= remaining {
                                return ProviderRun::Move(record);
                            }
                            tokio::time::sleep(decision.delay).await;
                            continue;
                        }
                        RetryAction::RepairAndRetry => {
                            // Parsing failures have no candidate to repair
                            // locally; re-prompt correctively instead.
                            if let Some(adjustment) = decision.adjustment {
                                apply_adjustment(&mut prompt, &base_user, &adjustment);
                            }
                            continue;
                        }
                        RetryAction::MoveToNextProvider => return ProviderRun::Move(record),
                        RetryAction::GiveUp => return ProviderRun::GiveUp(record),
                    }
                }
            }
        }
    }

    /// Validate an extracted candidate and, on failure, try a local repair
    /// before asking the orchestrator for a corrective re-prompt.
    fn settle_candidate(
        &self,
        entry: &Arc<ProviderEntry>,
        request: &GenerationRequest,
        success: InvokeSuccess,
        attempt: u32,
    ) -> SettledCandidate {
        let report = self.pipeline.validate(&success.candidate, request.schema);
        if report.valid {
            entry.complete_attempt(AttemptOutcome {
                success: true,
                latency_ms: success.latency_ms,
                error_kind: None,
                error_message: None,
            });
            self.metrics.record_attempt(
                &entry.name,
                &request.id,
                Outcome::Success,
                success.latency_ms,
                None,
                success.tokens,
            );
            return SettledCandidate::Done(FinishedAttempt {
                content: success.candidate,
                extraction_notes: success.extraction_notes,
                model: success.model,
                tokens: success.tokens,
                repaired: false,
            });
        }

        // Validation failure: one failure datum regardless of what repair
        // achieves, then either a success datum (local repair) or the
        // orchestrator takes over.
        let summary = report.summary();
        self.metrics.record_attempt(
            &entry.name,
            &request.id,
            Outcome::Failure,
            success.latency_ms,
            Some(ErrorKind::ValidationFailed),
            None,
        );
        self.events.emit(GatewayEvent::OperationFailure {
            provider: entry.name.clone(),
            request_id: request.id.clone(),
            kind: ErrorKind::ValidationFailed,
            attempt,
        });
        tracing::info!(
            provider = %entry.name,
            request = %request.id,
            errors = report.errors.len(),
            "candidate failed validation: {summary}"
        );

        let outcome = self
            .repair
            .repair(&success.candidate, &report, request.schema);
        if outcome.success {
            if let Some(repaired) = outcome.repaired {
                entry.complete_attempt(AttemptOutcome {
                    success: true,
                    latency_ms: success.latency_ms,
                    error_kind: None,
                    error_message: None,
                });
                self.metrics.record_attempt(
                    &entry.name,
                    &request.id,
                    Outcome::Success,
                    success.latency_ms,
                    None,
                    success.tokens,
                );
                tracing::info!(
                    provider = %entry.name,
                    request = %request.id,
                    fixed = ?outcome.fixed_fields,
                    "candidate repaired"
                );
                return SettledCandidate::Done(FinishedAttempt {
                    content: repaired,
                    extraction_notes: success.extraction_notes,
                    model: success.model,
                    tokens: success.tokens,
                    repaired: true,
                });
            }
        }

        entry.complete_attempt(AttemptOutcome {
            success: false,
            latency_ms: success.latency_ms,
            error_kind: Some(ErrorKind::ValidationFailed),
            error_message: Some(summary.clone()),
        });
        SettledCandidate::Reprompt { summary }
    }

    /// Stamp metadata and compute the composite confidence.
    fn finish_artifact(
        &self,
        request: &GenerationRequest,
        entry: &Arc<ProviderEntry>,
        parts: FinishedAttempt,
        started: Instant,
    ) -> ValidatedArtifact {
        let processing_time_ms = started.elapsed().as_millis() as u64;
        let success_probability = entry.status().recent_success_rate();
        let mut confidence = success_probability;
        if parts.repaired {
            confidence *= self.confidence.repair_penalty;
        }
        if !parts.extraction_notes.is_empty() {
            confidence *= self.confidence.extraction_penalty;
        }
        let confidence = confidence.clamp(0.0, 1.0);

        let quality = request
            .quality
            .clone()
            .unwrap_or_else(|| "standard".to_string());
        let mut content = parts.content;
        let mut metadata = json!({
            "source": entry.name,
            "model": parts.model,
            "processingTimeMs": processing_time_ms,
            "quality": quality,
            "confidence": confidence,
            "cacheHit": false,
        });
        if let Some(tokens) = parts.tokens {
            metadata["tokens"] = json!(tokens);
        }
        content["metadata"] = metadata;

        ValidatedArtifact {
            content,
            schema: request.schema.as_str().to_string(),
            source: entry.name.clone(),
            confidence,
            processing_time_ms,
            repair_applied: parts.repaired,
            extraction_notes: parts.extraction_notes,
        }
    }

    /// Shape the provider-ready prompt from the request and provider
    /// preferences.
    fn prepare_prompt(
        &self,
        request: &GenerationRequest,
        settings: &ProviderSettings,
    ) -> PreparedPrompt {
        let style = request.style.as_deref();
        let style_line = match style {
            Some("ethereal") => "Render it weightless and luminous, soft gradients and drift.",
            Some("noir") => "Render it in stark shadow and rain-slick monochrome.",
            Some("cyberpunk") => "Render it neon-saturated, dense, and electric.",
            Some("surreal") => "Render it with impossible geometry and dream logic.",
            Some("fantasy") => "Render it mythic, painterly, and vast.",
            _ => "Render it vividly and coherently.",
        };
        let temperature = match style {
            Some("surreal") => (settings.optimal_temperature + 0.1).min(1.2),
            Some("noir") => (settings.optimal_temperature - 0.1).max(0.1),
            _ => settings.optimal_temperature,
        };
        let max_tokens = match request.quality.as_deref() {
            Some("draft") => 1024,
            Some("high") => 4096,
            _ => 2048,
        }
        .min(settings.limits.max_tokens);

        PreparedPrompt {
            system: format!(
                "You are a dream-to-scene engine. Turn the user's dream into {}. {}",
                request.schema.description(),
                style_line
            ),
            user: build_user_prompt(request),
            temperature,
            max_tokens,
            json_mode: true,
        }
    }
}

enum SettledCandidate {
    Done(FinishedAttempt),
    Reprompt { summary: String },
}

fn build_user_prompt(request: &GenerationRequest) -> String {
    request.prompt.clone()
}

fn apply_adjustment(prompt: &mut PreparedPrompt, base_user: &str, adjustment: &PromptAdjustment) {
    prompt.user = format!("{base_user}\n\n{}", adjustment.corrective_suffix);
    prompt.temperature = adjustment.temperature;
    prompt.max_tokens = adjustment.max_tokens;
}

#[cfg(test)]
mod tests {
    use super::*;
    use dreamweave_providers::providers::ProviderSettings;

    fn manager_with(providers: Vec<(&str, ProviderSettings)>) -> (ProviderManager, Arc<ProviderRegistry>) {
        let mut config = Config::default();
        for (name, settings) in providers {
            config.providers.insert(name.to_string(), settings);
        }
        let registry = Arc::new(ProviderRegistry::from_config(&config).expect("registry"));
        let metrics = MetricsCollector::start(config.metrics.clone());
        let manager = ProviderManager::new(
            Arc::clone(&registry),
            metrics,
            EventBus::new(),
            &config,
        );
        (manager, registry)
    }

    #[tokio::test]
    async fn selection_orders_by_priority() {
        let (manager, _registry) = manager_with(vec![
            ("low", ProviderSettings::new("ollama", "").with_priority(1)),
            ("high", ProviderSettings::new("ollama", "").with_priority(5)),
        ]);
        let candidates = manager.select_candidates();
        assert_eq!(candidates[0].name, "high");
        assert_eq!(candidates[1].name, "low");
    }

    #[tokio::test]
    async fn selection_breaks_ties_lexically() {
        let (manager, _registry) = manager_with(vec![
            ("beta", ProviderSettings::new("ollama", "")),
            ("alpha", ProviderSettings::new("ollama", "")),
        ]);
        let candidates = manager.select_candidates();
        assert_eq!(candidates[0].name, "alpha");
        assert_eq!(candidates[1].name, "beta");
    }

    #[tokio::test]
    async fn disabled_and_open_circuit_providers_are_skipped() {
        let (manager, registry) = manager_with(vec![
            ("a", ProviderSettings::new("ollama", "")),
            ("b", ProviderSettings::new("ollama", "")),
            ("c", ProviderSettings::new("ollama", "")),
        ]);
        registry
            .get("a")
            .expect("entry")
            .apply_patch(&crate::registry::ProviderPatch {
                enabled: Some(false),
                priority: None,
            });
        registry.get("b").expect("entry").breaker.force_open();

        let candidates = manager.select_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name, "c");
    }

    #[tokio::test]
    async fn unhealthy_providers_are_excluded_from_selection() {
        let (manager, registry) = manager_with(vec![
            ("a", ProviderSettings::new("ollama", "")),
            ("b", ProviderSettings::new("ollama", "")),
        ]);
        registry
            .get("a")
            .expect("entry")
            .set_health(HealthState::Unhealthy);
        let candidates = manager.select_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name, "b");
    }

    #[tokio::test]
    async fn zero_budget_requests_fall_back_without_dispatch() {
        let (manager, registry) = manager_with(vec![("a", ProviderSettings::new("ollama", ""))]);
        let request = GenerationRequest::new("a dragon over mountains", Duration::ZERO);
        let artifact = manager.generate(request).await.expect("artifact");
        assert_eq!(artifact.source, "emergency_fallback");
        assert_eq!(registry.get("a").expect("entry").status().requests, 0);
    }

    #[tokio::test]
    async fn style_and_quality_shape_the_prompt() {
        let (manager, _registry) = manager_with(vec![("a", ProviderSettings::new("ollama", ""))]);
        let settings = ProviderSettings::new("ollama", "");
        let request = GenerationRequest::new("a dragon", Duration::from_secs(10))
            .with_style("noir")
            .with_quality("high");
        let prompt = manager.prepare_prompt(&request, &settings);
        assert!(prompt.system.contains("monochrome"));
        assert!((prompt.temperature - 0.6).abs() < 1e-6);
        assert_eq!(prompt.max_tokens, 4096);
    }
}
