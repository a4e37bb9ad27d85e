//! # Retry Orchestrator
//!
//! Decides, per classified failure, what happens next for one
//! (provider, request) pair: retry the same provider after backoff, repair
//! and re-prompt, move to the next candidate, or give up. The per-kind
//! policy table is the heart of the gateway's failure handling:
//!
//! | kind                 | action                 | max | base  | mult |
//! |----------------------|------------------------|-----|-------|------|
//! | rate_limit_exceeded  | retry same provider    | 5   | 1000ms| 3.0  |
//! | timeout              | retry same provider    | 3   | 1000ms| 1.5  |
//! | network_error        | retry same provider    | 4   | 1000ms| 1.8  |
//! | server_error         | retry same provider    | 3   | 1000ms| 2.0  |
//! | validation_failed    | repair and retry       | 3   | 0     | -    |
//! | parsing_error        | repair and retry, then move | 2 | 0  | -    |
//! | authentication et al.| move to next provider  | 0   | -     | -    |
//! | configuration_error  | give up                | 0   | -     | -    |
//!
//! Delays are capped per kind (60s for rate limits, 30s otherwise) and
//! jittered ±10%. A repair-and-retry decision carries a corrective prompt:
//! the validation error summary plus the schema description, a lowered
//! temperature (−0.2, floored at 0.2), and a raised token ceiling (×1.5,
//! capped by provider limits).

use crate::config::RetryConfig;
use dreamweave_providers::providers::ProviderLimits;
use dreamweave_providers::{ErrorKind, PreparedPrompt, SchemaId};
use rand::Rng;
use std::time::Duration;

const TEMPERATURE_FLOOR: f32 = 0.2;
const TEMPERATURE_STEP: f32 = 0.2;

/// What to do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    RetrySameProvider,
    RepairAndRetry,
    MoveToNextProvider,
    GiveUp,
}

/// Per-kind policy row.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub action: RetryAction,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

/// A concrete decision for the current failure.
#[derive(Debug, Clone)]
pub struct RetryDecision {
    pub action: RetryAction,
    pub delay: Duration,
    /// Present on repair-and-retry: how to modify the next prompt
    pub adjustment: Option<PromptAdjustment>,
}

/// Prompt modifications for a corrective re-prompt.
#[derive(Debug, Clone)]
pub struct PromptAdjustment {
    pub corrective_suffix: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

pub struct RetryOrchestrator {
    config: RetryConfig,
}

impl RetryOrchestrator {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The policy row for a failure kind.
    pub fn policy_for(&self, kind: ErrorKind) -> RetryPolicy {
        match kind {
            ErrorKind::RateLimitExceeded => RetryPolicy {
                action: RetryAction::RetrySameProvider,
                max_attempts: 5,
                base_delay: Duration::from_millis(1000),
                multiplier: 3.0,
            },
            ErrorKind::Timeout => RetryPolicy {
                action: RetryAction::RetrySameProvider,
                max_attempts: 3,
                base_delay: Duration::from_millis(1000),
                multiplier: 1.5,
            },
            ErrorKind::NetworkError => RetryPolicy {
                action: RetryAction::RetrySameProvider,
                max_attempts: 4,
                base_delay: Duration::from_millis(1000),
                multiplier: 1.8,
            },
            ErrorKind::ServerError | ErrorKind::ServiceDegraded => RetryPolicy {
                action: RetryAction::RetrySameProvider,
                max_attempts: 3,
                base_delay: Duration::from_millis(1000),
                multiplier: 2.0,
            },
            ErrorKind::StreamingError => RetryPolicy {
                action: RetryAction::RetrySameProvider,
                max_attempts: 2,
                base_delay: Duration::from_millis(1000),
                multiplier: 1.5,
            },
            ErrorKind::ValidationFailed => RetryPolicy {
                action: RetryAction::RepairAndRetry,
                max_attempts: 3,
                base_delay: Duration::ZERO,
                multiplier: 1.0,
            },
            ErrorKind::ParsingError => RetryPolicy {
                action: RetryAction::RepairAndRetry,
                max_attempts: 2,
                base_delay: Duration::ZERO,
                multiplier: 1.0,
            },
            ErrorKind::ConfigurationError => RetryPolicy {
                action: RetryAction::GiveUp,
                max_attempts: 0,
                base_delay: Duration::ZERO,
                multiplier: 1.0,
            },
            // authentication, quota, circuit open, content filter, model
            // unavailable, token limit, and everything else non-retryable.
            _ => RetryPolicy {
                action: RetryAction::MoveToNextProvider,
                max_attempts: 0,
                base_delay: Duration::ZERO,
                multiplier: 1.0,
            },
        }
    }

    /// Decide the next step given a failure of `kind` on its Nth
    /// occurrence (1-based) for this provider.
    pub fn decide(
        &self,
        kind: ErrorKind,
        occurrence: u32,
        error_summary: Option<&str>,
        schema: SchemaId,
        current_prompt: &PreparedPrompt,
        limits: &ProviderLimits,
    ) -> RetryDecision {
        let policy = self.policy_for(kind);

        match policy.action {
            RetryAction::GiveUp => RetryDecision {
                action: RetryAction::GiveUp,
                delay: Duration::ZERO,
                adjustment: None,
            },
            RetryAction::MoveToNextProvider => RetryDecision {
                action: RetryAction::MoveToNextProvider,
                delay: Duration::ZERO,
                adjustment: None,
            },
            RetryAction::RetrySameProvider => {
                if occurrence >= policy.max_attempts {
                    return RetryDecision {
                        action: RetryAction::MoveToNextProvider,
                        delay: Duration::ZERO,
                        adjustment: None,
                    };
                }
                RetryDecision {
                    action: RetryAction::RetrySameProvider,
                    delay: self.backoff_delay(kind, &policy, occurrence),
                    adjustment: None,
                }
            }
            RetryAction::RepairAndRetry => {
                if occurrence >= policy.max_attempts {
                    return RetryDecision {
                        action: RetryAction::MoveToNextProvider,
                        delay: Duration::ZERO,
                        adjustment: None,
                    };
                }
                RetryDecision {
                    action: RetryAction::RepairAndRetry,
                    delay: Duration::ZERO,
                    adjustment: Some(self.corrective_adjustment(
                        error_summary,
                        schema,
                        current_prompt,
                        limits,
                    )),
                }
            }
        }
    }

    /// Exponential backoff with per-kind cap and ±jitter.
    fn backoff_delay(&self, kind: ErrorKind, policy: &RetryPolicy, occurrence: u32) -> Duration {
        let cap = match kind {
            ErrorKind::RateLimitExceeded => self.config.rate_limit_delay_cap,
            _ => self.config.general_delay_cap,
        };
        let exponent = occurrence.saturating_sub(1);
        let raw = policy
            .base_delay
            .mul_f64(policy.multiplier.powi(exponent as i32));
        let capped = raw.min(cap);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || capped.is_zero() {
            return capped;
        }
        let factor = 1.0 - jitter + rand::thread_rng().gen::<f64>() * 2.0 * jitter;
        capped.mul_f64(factor)
    }

    /// Synthesize the corrective prompt adjustments for a re-prompt.
    fn corrective_adjustment(
        &self,
        error_summary: Option<&str>,
        schema: SchemaId,
        current_prompt: &PreparedPrompt,
        limits: &ProviderLimits,
    ) -> PromptAdjustment {
        let mut suffix = String::from(
            "The previous response did not match the required output format.",
        );
        if let Some(summary) = error_summary {
            if !summary.is_empty() {
                suffix.push_str(" Problems found: ");
                suffix.push_str(summary);
                suffix.push('.');
            }
        }
        suffix.push_str(" Respond with only ");
        suffix.push_str(schema.description());
        suffix.push_str(". No prose, no markdown fences.");

        let temperature =
            (current_prompt.temperature - TEMPERATURE_STEP).max(TEMPERATURE_FLOOR);
        let raised = (current_prompt.max_tokens as u64 * 3 / 2) as u32;
        let max_tokens = raised.min(limits.max_tokens);

        PromptAdjustment {
            corrective_suffix: suffix,
            temperature,
            max_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orchestrator() -> RetryOrchestrator {
        RetryOrchestrator::new(RetryConfig::default())
    }

    fn prompt() -> PreparedPrompt {
        PreparedPrompt {
            system: "system".to_string(),
            user: "user".to_string(),
            temperature: 0.7,
            max_tokens: 1000,
            json_mode: true,
        }
    }

    fn decide(kind: ErrorKind, occurrence: u32) -> RetryDecision {
        orchestrator().decide(
            kind,
            occurrence,
            Some("title too short"),
            SchemaId::DreamResponse,
            &prompt(),
            &ProviderLimits::default(),
        )
    }

    #[test]
    fn transient_kinds_retry_until_their_budget_is_spent() {
        for (kind, max) in [
            (ErrorKind::RateLimitExceeded, 5),
            (ErrorKind::Timeout, 3),
            (ErrorKind::NetworkError, 4),
            (ErrorKind::ServerError, 3),
        ] {
            for occurrence in 1..max {
                assert_eq!(
                    decide(kind, occurrence).action,
                    RetryAction::RetrySameProvider,
                    "{kind} occurrence {occurrence}"
                );
            }
            assert_eq!(
                decide(kind, max).action,
                RetryAction::MoveToNextProvider,
                "{kind} exhausts at {max}"
            );
        }
    }

    #[test]
    fn rate_limit_backoff_grows_and_stays_in_jitter_bounds() {
        let orchestrator = orchestrator();
        let policy = orchestrator.policy_for(ErrorKind::RateLimitExceeded);
        // Expected raw delays: 1000, 3000, 9000ms; jitter ±10%.
        for (occurrence, expected_ms) in [(1u32, 1000.0f64), (2, 3000.0), (3, 9000.0)] {
            for _ in 0..20 {
                let delay = orchestrator
                    .backoff_delay(ErrorKind::RateLimitExceeded, &policy, occurrence)
                    .as_millis() as f64;
                assert!(
                    delay >= expected_ms * 0.9 - 1.0 && delay <= expected_ms * 1.1 + 1.0,
                    "occurrence {occurrence}: {delay}ms outside jittered bounds of {expected_ms}ms"
                );
            }
        }
    }

    #[test]
    fn backoff_is_capped_per_kind() {
        let orchestrator = orchestrator();
        let rate_policy = orchestrator.policy_for(ErrorKind::RateLimitExceeded);
        // 1000 * 3^9 is far past the 60s cap.
        let delay = orchestrator.backoff_delay(ErrorKind::RateLimitExceeded, &rate_policy, 10);
        assert!(delay <= Duration::from_secs(66)); // cap + jitter headroom

        let server_policy = orchestrator.policy_for(ErrorKind::ServerError);
        let delay = orchestrator.backoff_delay(ErrorKind::ServerError, &server_policy, 10);
        assert!(delay <= Duration::from_secs(33));
    }

    #[test]
    fn validation_failures_repair_and_retry_with_adjustment() {
        let decision = decide(ErrorKind::ValidationFailed, 1);
        assert_eq!(decision.action, RetryAction::RepairAndRetry);
        assert_eq!(decision.delay, Duration::ZERO);

        let adjustment = decision.adjustment.expect("adjustment");
        assert!(adjustment.corrective_suffix.contains("title too short"));
        assert!(adjustment.corrective_suffix.contains("scenes"));
        assert!((adjustment.temperature - 0.5).abs() < 1e-6);
        assert_eq!(adjustment.max_tokens, 1500);
    }

    #[test]
    fn temperature_never_drops_below_the_floor() {
        let orchestrator = orchestrator();
        let mut low = prompt();
        low.temperature = 0.25;
        let adjustment = orchestrator.corrective_adjustment(
            None,
            SchemaId::DreamResponse,
            &low,
            &ProviderLimits::default(),
        );
        assert!((adjustment.temperature - TEMPERATURE_FLOOR).abs() < 1e-6);
    }

    #[test]
    fn raised_token_ceiling_respects_provider_limits() {
        let orchestrator = orchestrator();
        let mut big = prompt();
        big.max_tokens = 4000;
        let limits = ProviderLimits {
            max_tokens: 4096,
            ..Default::default()
        };
        let adjustment =
            orchestrator.corrective_adjustment(None, SchemaId::DreamResponse, &big, &limits);
        assert_eq!(adjustment.max_tokens, 4096);
    }

    #[test]
    fn parsing_errors_repair_then_move() {
        assert_eq!(decide(ErrorKind::ParsingError, 1).action, RetryAction::RepairAndRetry);
        assert_eq!(
            decide(ErrorKind::ParsingError, 2).action,
            RetryAction::MoveToNextProvider
        );
    }

    #[test]
    fn non_retryable_kinds_move_immediately() {
        for kind in [
            ErrorKind::Authentication,
            ErrorKind::QuotaExceeded,
            ErrorKind::CircuitBreakerOpen,
            ErrorKind::ContentFilter,
            ErrorKind::ModelUnavailable,
            ErrorKind::TokenLimitExceeded,
            ErrorKind::InvalidResponse,
            ErrorKind::AsyncExtractionError,
        ] {
            assert_eq!(
                decide(kind, 1).action,
                RetryAction::MoveToNextProvider,
                "{kind}"
            );
        }
    }

    #[test]
    fn configuration_errors_give_up() {
        assert_eq!(decide(ErrorKind::ConfigurationError, 1).action, RetryAction::GiveUp);
    }
}
