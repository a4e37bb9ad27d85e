//! # Validation Pipeline
//!
//! Validates a candidate object against a named schema in three additive
//! phases. Phases never short-circuit: a candidate with a missing title and
//! an overlong description reports both, which is what lets the repair
//! engine fix everything in one pass.
//!
//! 1. **Structural integrity**: required fields exist with the right types.
//! 2. **Format consistency**: field-level rules (title 5-200 chars,
//!    description 10-2000, a non-empty scene list, per-scene subfields).
//! 3. **Semantic coherence**: cross-field invariants, e.g. cinematography
//!    duration must be positive exactly when scenes exist.
//!
//! A candidate is valid iff no error of severity `high` or above was
//! recorded. Low-severity findings are reported as warnings and never block.

use dreamweave_providers::{SchemaId, Severity};
use serde::Serialize;
use serde_json::Value;
use std::time::Instant;

pub const TITLE_MIN: usize = 5;
pub const TITLE_MAX: usize = 200;
pub const DESCRIPTION_MIN: usize = 10;
pub const DESCRIPTION_MAX: usize = 2000;

/// Which phase produced a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPhase {
    StructuralIntegrity,
    FormatConsistency,
    SemanticCoherence,
}

impl ValidationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationPhase::StructuralIntegrity => "structural_integrity",
            ValidationPhase::FormatConsistency => "format_consistency",
            ValidationPhase::SemanticCoherence => "semantic_coherence",
        }
    }
}

/// Machine-readable instruction for the repair engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairHint {
    /// Insert the schema default for the field
    FillDefault,
    /// The value is the right content in the wrong type
    CoerceType,
    /// Truncate or pad a bounded-length string
    ClampLength,
    /// Ensure the scene list is a non-empty array
    EnsureScenes,
}

/// One validation finding.
#[derive(Debug, Clone, Serialize)]
pub struct FieldError {
    pub phase: ValidationPhase,
    pub field: String,
    pub message: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair_hint: Option<RepairHint>,
}

impl FieldError {
    fn new(
        phase: ValidationPhase,
        field: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
        repair_hint: Option<RepairHint>,
    ) -> Self {
        Self {
            phase,
            field: field.into(),
            message: message.into(),
            severity,
            repair_hint,
        }
    }
}

/// Outcome of a validation run.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<FieldError>,
    pub warnings: Vec<FieldError>,
    pub processing_time_ms: u64,
}

impl ValidationReport {
    pub fn high_severity_count(&self) -> usize {
        self.errors
            .iter()
            .filter(|e| e.severity >= Severity::High)
            .count()
    }

    /// Compact summary for corrective prompts and logs.
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| format!("{} ({}): {}", e.field, e.phase.as_str(), e.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Stateless validator for named schemas.
#[derive(Debug, Clone, Default)]
pub struct ValidationPipeline;

impl ValidationPipeline {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, candidate: &Value, schema: SchemaId) -> ValidationReport {
        let started = Instant::now();
        let mut findings = Vec::new();

        match schema {
            SchemaId::DreamResponse => {
                if let Some(map) = candidate.as_object() {
                    structural_phase(map, &mut findings);
                    format_phase(map, &mut findings);
                    semantic_phase(map, &mut findings);
                } else {
                    findings.push(FieldError::new(
                        ValidationPhase::StructuralIntegrity,
                        "$",
                        format!("expected an object, got {}", json_type(candidate)),
                        Severity::Critical,
                        None,
                    ));
                }
            }
        }

        let (warnings, errors): (Vec<_>, Vec<_>) = findings
            .into_iter()
            .partition(|f| f.severity == Severity::Low);
        let valid = !errors.iter().any(|e| e.severity >= Severity::High);

        ValidationReport {
            valid,
            errors,
            warnings,
            processing_time_ms: started.elapsed().as_millis() as u64,
        }
    }
}

fn structural_phase(map: &serde_json::Map<String, Value>, findings: &mut Vec<FieldError>) {
    let phase = ValidationPhase::StructuralIntegrity;

    match map.get("id") {
        None => findings.push(FieldError::new(
            phase,
            "id",
            "required field is missing",
            Severity::High,
            Some(RepairHint::FillDefault),
        )),
        Some(Value::String(_)) => {}
        Some(Value::Number(_)) => findings.push(FieldError::new(
            phase,
            "id",
            "expected a string, got number",
            Severity::High,
            Some(RepairHint::CoerceType),
        )),
        Some(other) => findings.push(FieldError::new(
            phase,
            "id",
            format!("expected a string, got {}", json_type(other)),
            Severity::High,
            Some(RepairHint::FillDefault),
        )),
    }

    for field in ["title", "description"] {
        match map.get(field) {
            None => findings.push(FieldError::new(
                phase,
                field,
                "required field is missing",
                Severity::High,
                Some(RepairHint::FillDefault),
            )),
            Some(Value::String(_)) => {}
            Some(Value::Number(_)) => findings.push(FieldError::new(
                phase,
                field,
                "expected a string, got number",
                Severity::High,
                Some(RepairHint::CoerceType),
            )),
            Some(other) => findings.push(FieldError::new(
                phase,
                field,
                format!("expected a string, got {}", json_type(other)),
                Severity::High,
                Some(RepairHint::FillDefault),
            )),
        }
    }

    match map.get("scenes") {
        None => findings.push(FieldError::new(
            phase,
            "scenes",
            "required field is missing",
            Severity::High,
            Some(RepairHint::EnsureScenes),
        )),
        Some(Value::Array(scenes)) => {
            for (i, scene) in scenes.iter().enumerate() {
                let Some(scene_map) = scene.as_object() else {
                    findings.push(FieldError::new(
                        phase,
                        format!("scenes[{i}]"),
                        format!("expected an object, got {}", json_type(scene)),
                        Severity::High,
                        None,
                    ));
                    continue;
                };
                if !scene_map.get("id").is_some_and(Value::is_string) {
                    findings.push(FieldError::new(
                        phase,
                        format!("scenes[{i}].id"),
                        "scene id must be a string",
                        Severity::High,
                        Some(RepairHint::FillDefault),
                    ));
                }
                if !scene_map.get("description").is_some_and(Value::is_string) {
                    findings.push(FieldError::new(
                        phase,
                        format!("scenes[{i}].description"),
                        "scene description must be a string",
                        Severity::High,
                        Some(RepairHint::FillDefault),
                    ));
                }
                match scene_map.get("objects") {
                    Some(Value::Array(_)) => {}
                    Some(Value::String(_)) => findings.push(FieldError::new(
                        phase,
                        format!("scenes[{i}].objects"),
                        "expected an array, got string",
                        Severity::High,
                        Some(RepairHint::CoerceType),
                    )),
                    _ => findings.push(FieldError::new(
                        phase,
                        format!("scenes[{i}].objects"),
                        "scene objects must be an array",
                        Severity::High,
                        Some(RepairHint::FillDefault),
                    )),
                }
            }
        }
        Some(Value::String(_)) => findings.push(FieldError::new(
            phase,
            "scenes",
            "expected an array, got string",
            Severity::High,
            Some(RepairHint::CoerceType),
        )),
        Some(other) => findings.push(FieldError::new(
            phase,
            "scenes",
            format!("expected an array, got {}", json_type(other)),
            Severity::High,
            Some(RepairHint::EnsureScenes),
        )),
    }
}

fn format_phase(map: &serde_json::Map<String, Value>, findings: &mut Vec<FieldError>) {
    let phase = ValidationPhase::FormatConsistency;

    if let Some(Value::String(title)) = map.get("title") {
        let len = title.chars().count();
        if len < TITLE_MIN || len > TITLE_MAX {
            findings.push(FieldError::new(
                phase,
                "title",
                format!("length {len} outside {TITLE_MIN}-{TITLE_MAX}"),
                Severity::High,
                Some(RepairHint::ClampLength),
            ));
        }
    }

    if let Some(Value::String(description)) = map.get("description") {
        let len = description.chars().count();
        if len < DESCRIPTION_MIN || len > DESCRIPTION_MAX {
            findings.push(FieldError::new(
                phase,
                "description",
                format!("length {len} outside {DESCRIPTION_MIN}-{DESCRIPTION_MAX}"),
                Severity::High,
                Some(RepairHint::ClampLength),
            ));
        }
    }

    if let Some(Value::String(id)) = map.get("id") {
        if id.is_empty() {
            findings.push(FieldError::new(
                phase,
                "id",
                "id is empty",
                Severity::Low,
                Some(RepairHint::FillDefault),
            ));
        }
    }

    if let Some(Value::Array(scenes)) = map.get("scenes") {
        if scenes.is_empty() {
            findings.push(FieldError::new(
                phase,
                "scenes",
                "scene list is empty",
                Severity::High,
                Some(RepairHint::EnsureScenes),
            ));
        }
        for (i, scene) in scenes.iter().enumerate() {
            if let Some(Value::String(desc)) = scene.get("description") {
                if desc.trim().is_empty() {
                    findings.push(FieldError::new(
                        phase,
                        format!("scenes[{i}].description"),
                        "scene description is empty",
                        Severity::High,
                        Some(RepairHint::FillDefault),
                    ));
                }
            }
        }
    }
}

fn semantic_phase(map: &serde_json::Map<String, Value>, findings: &mut Vec<FieldError>) {
    let phase = ValidationPhase::SemanticCoherence;
    let scene_count = map
        .get("scenes")
        .and_then(Value::as_array)
        .map(|s| s.len())
        .unwrap_or(0);

    if let Some(cinematography) = map.get("cinematography") {
        match cinematography.get("durationSec") {
            Some(Value::Number(n)) => {
                let duration = n.as_f64().unwrap_or(0.0);
                if scene_count > 0 && duration <= 0.0 {
                    findings.push(FieldError::new(
                        phase,
                        "cinematography.durationSec",
                        "duration must be positive when scenes exist",
                        Severity::High,
                        Some(RepairHint::FillDefault),
                    ));
                }
                if scene_count == 0 && duration > 0.0 {
                    findings.push(FieldError::new(
                        phase,
                        "cinematography.durationSec",
                        "duration is positive but there are no scenes",
                        Severity::High,
                        None,
                    ));
                }
            }
            Some(Value::String(_)) => findings.push(FieldError::new(
                phase,
                "cinematography.durationSec",
                "expected a number, got string",
                Severity::High,
                Some(RepairHint::CoerceType),
            )),
            _ => findings.push(FieldError::new(
                phase,
                "cinematography.durationSec",
                "cinematography requires a numeric durationSec",
                Severity::High,
                Some(RepairHint::FillDefault),
            )),
        }

        // Shots referencing unknown scenes are suspicious but harmless.
        if let (Some(Value::Array(shots)), Some(Value::Array(scenes))) =
            (cinematography.get("shots"), map.get("scenes"))
        {
            let scene_ids: Vec<&str> = scenes
                .iter()
                .filter_map(|s| s.get("id").and_then(Value::as_str))
                .collect();
            for (i, shot) in shots.iter().enumerate() {
                if let Some(target) = shot.get("target").and_then(Value::as_str) {
                    if !scene_ids.contains(&target) {
                        findings.push(FieldError::new(
                            phase,
                            format!("cinematography.shots[{i}].target"),
                            format!("shot targets unknown scene {target}"),
                            Severity::Low,
                            None,
                        ));
                    }
                }
            }
        }
    }

    if let Some(metadata) = map.get("metadata") {
        match metadata.get("confidence") {
            Some(Value::Number(n)) => {
                let confidence = n.as_f64().unwrap_or(-1.0);
                if !(0.0..=1.0).contains(&confidence) {
                    findings.push(FieldError::new(
                        phase,
                        "metadata.confidence",
                        format!("confidence {confidence} outside [0, 1]"),
                        Severity::High,
                        Some(RepairHint::ClampLength),
                    ));
                }
            }
            Some(Value::String(_)) => findings.push(FieldError::new(
                phase,
                "metadata.confidence",
                "expected a number, got string",
                Severity::High,
                Some(RepairHint::CoerceType),
            )),
            _ => {}
        }
        if let Some(source) = metadata.get("source") {
            if !source.is_string() {
                findings.push(FieldError::new(
                    phase,
                    "metadata.source",
                    "source must be a string",
                    Severity::Medium,
                    None,
                ));
            }
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pipeline() -> ValidationPipeline {
        ValidationPipeline::new()
    }

    fn valid_candidate() -> Value {
        json!({
            "id": "d-1",
            "title": "Glass Forest",
            "description": "Trees of glass chime softly in a slow wind.",
            "scenes": [
                {"id": "s-1", "description": "A glass forest at dusk.", "objects": ["tree"]}
            ]
        })
    }

    fn title_of_len(n: usize) -> String {
        "t".repeat(n)
    }

    #[test]
    fn valid_candidate_passes_all_phases() {
        let report = pipeline().validate(&valid_candidate(), SchemaId::DreamResponse);
        assert!(report.valid, "unexpected errors: {:?}", report.errors);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn title_length_boundaries() {
        for (len, expect_valid) in [(4, false), (5, true), (200, true), (201, false)] {
            let mut candidate = valid_candidate();
            candidate["title"] = json!(title_of_len(len));
            let report = pipeline().validate(&candidate, SchemaId::DreamResponse);
            assert_eq!(
                report.valid, expect_valid,
                "title of length {len} should be valid={expect_valid}"
            );
        }
    }

    #[test]
    fn description_length_boundaries() {
        for (len, expect_valid) in [(9, false), (10, true), (2000, true), (2001, false)] {
            let mut candidate = valid_candidate();
            candidate["description"] = json!("d".repeat(len));
            let report = pipeline().validate(&candidate, SchemaId::DreamResponse);
            assert_eq!(
                report.valid, expect_valid,
                "description of length {len} should be valid={expect_valid}"
            );
        }
    }

    #[test]
    fn empty_scene_list_is_invalid_minimal_scene_is_valid() {
        let mut candidate = valid_candidate();
        candidate["scenes"] = json!([]);
        let report = pipeline().validate(&candidate, SchemaId::DreamResponse);
        assert!(!report.valid);
        assert!(report
            .errors
            .iter()
            .any(|e| e.field == "scenes" && e.phase == ValidationPhase::FormatConsistency));

        candidate["scenes"] =
            json!([{"id": "s-1", "description": "A minimal scene.", "objects": []}]);
        let report = pipeline().validate(&candidate, SchemaId::DreamResponse);
        assert!(report.valid);
    }

    #[test]
    fn short_title_reports_format_consistency_with_clamp_hint() {
        let mut candidate = valid_candidate();
        candidate["title"] = json!("Sho");
        let report = pipeline().validate(&candidate, SchemaId::DreamResponse);
        assert!(!report.valid);
        let error = &report.errors[0];
        assert_eq!(error.phase, ValidationPhase::FormatConsistency);
        assert_eq!(error.repair_hint, Some(RepairHint::ClampLength));
    }

    #[test]
    fn phases_accumulate_without_short_circuiting() {
        let candidate = json!({
            "title": 42,
            "description": "short",
            "scenes": []
        });
        let report = pipeline().validate(&candidate, SchemaId::DreamResponse);
        let phases: Vec<_> = report.errors.iter().map(|e| e.phase).collect();
        assert!(phases.contains(&ValidationPhase::StructuralIntegrity)); // id missing, title type
        assert!(phases.contains(&ValidationPhase::FormatConsistency)); // desc length, scenes empty
    }

    #[test]
    fn cinematography_duration_must_match_scene_presence() {
        let mut candidate = valid_candidate();
        candidate["cinematography"] = json!({"durationSec": 0.0, "shots": []});
        let report = pipeline().validate(&candidate, SchemaId::DreamResponse);
        assert!(!report.valid);
        assert!(report
            .errors
            .iter()
            .any(|e| e.phase == ValidationPhase::SemanticCoherence));

        candidate["cinematography"] = json!({"durationSec": 30.0, "shots": []});
        let report = pipeline().validate(&candidate, SchemaId::DreamResponse);
        assert!(report.valid);
    }

    #[test]
    fn metadata_confidence_range_is_checked_when_present() {
        let mut candidate = valid_candidate();
        candidate["metadata"] = json!({
            "source": "openai", "model": "m", "processingTimeMs": 10,
            "quality": "standard", "confidence": 1.5, "cacheHit": false
        });
        let report = pipeline().validate(&candidate, SchemaId::DreamResponse);
        assert!(!report.valid);
    }

    #[test]
    fn unknown_shot_targets_are_warnings_not_errors() {
        let mut candidate = valid_candidate();
        candidate["cinematography"] = json!({
            "durationSec": 30.0,
            "shots": [{"shotType": "orbit", "target": "nope", "durationSec": 5.0}]
        });
        let report = pipeline().validate(&candidate, SchemaId::DreamResponse);
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn non_object_candidate_is_critically_invalid() {
        let report = pipeline().validate(&json!("just a string"), SchemaId::DreamResponse);
        assert!(!report.valid);
        assert_eq!(report.errors[0].severity, Severity::Critical);
    }
}
