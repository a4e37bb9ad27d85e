//! # Repair Engine
//!
//! Bounded, hint-driven modification of a candidate that failed validation.
//! The engine fills schema defaults, coerces obviously-wrong types, and
//! clamps bounded-length strings while preserving content. It never invents
//! scene content beyond minimal placeholders.
//!
//! Repair is idempotent (fixing a fixed candidate is a no-op) and
//! non-regressive: each pass must strictly shrink the error set or the
//! engine stops. Success is only declared when a post-repair re-validation
//! passes, so the caller can trust a `success` outcome unconditionally.

use crate::validation::{
    FieldError, RepairHint, ValidationPipeline, ValidationReport, DESCRIPTION_MAX,
    DESCRIPTION_MIN, TITLE_MAX, TITLE_MIN,
};
use dreamweave_providers::SchemaId;
use serde_json::{json, Value};
use uuid::Uuid;

const SCENE_PLACEHOLDER_DESCRIPTION: &str = "A quiet dreamlike space.";
const DEFAULT_TITLE: &str = "Untitled Dream";
const DEFAULT_DESCRIPTION: &str = "A dream rendered without further detail.";

/// Outcome of a repair run.
#[derive(Debug, Clone)]
pub struct RepairOutcome {
    /// The repaired candidate, present whether or not repair succeeded
    pub repaired: Option<Value>,
    /// True only if post-repair re-validation passed
    pub success: bool,
    pub fixed_fields: Vec<String>,
    pub attempts: u32,
}

pub struct RepairEngine {
    max_attempts: u32,
    pipeline: ValidationPipeline,
}

impl RepairEngine {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            pipeline: ValidationPipeline::new(),
        }
    }

    /// Attempt to repair `candidate` given the errors from its validation.
    pub fn repair(
        &self,
        candidate: &Value,
        report: &ValidationReport,
        schema: SchemaId,
    ) -> RepairOutcome {
        if !candidate.is_object() {
            // Nothing to anchor a repair on.
            return RepairOutcome {
                repaired: None,
                success: false,
                fixed_fields: Vec::new(),
                attempts: 0,
            };
        }

        let mut working = candidate.clone();
        let mut errors = report.errors.clone();
        let mut previous_error_count = errors.len();
        let mut fixed_fields = Vec::new();
        let mut attempts = 0;

        while attempts < self.max_attempts {
            attempts += 1;
            for error in &errors {
                if let Some(field) = apply_fix(&mut working, error) {
                    if !fixed_fields.contains(&field) {
                        fixed_fields.push(field);
                    }
                }
            }

            let revalidation = self.pipeline.validate(&working, schema);
            if revalidation.valid {
                return RepairOutcome {
                    repaired: Some(working),
                    success: true,
                    fixed_fields,
                    attempts,
                };
            }
            if revalidation.errors.len() >= previous_error_count {
                // No progress; further passes would loop on the same errors.
                tracing::debug!(
                    remaining = revalidation.errors.len(),
                    "repair stalled without reducing the error set"
                );
                break;
            }
            previous_error_count = revalidation.errors.len();
            errors = revalidation.errors;
        }

        RepairOutcome {
            repaired: Some(working),
            success: false,
            fixed_fields,
            attempts,
        }
    }
}

/// Apply a single fix. Returns the field name when a change was made.
fn apply_fix(root: &mut Value, error: &FieldError) -> Option<String> {
    let hint = error.repair_hint?;
    let field = error.field.as_str();

    let changed = if let Some(rest) = field.strip_prefix("scenes[") {
        fix_scene_field(root, rest, hint)
    } else {
        match (field, hint) {
            ("id", RepairHint::FillDefault) => {
                root["id"] = json!(Uuid::new_v4().to_string());
                true
            }
            ("id", RepairHint::CoerceType) => coerce_to_string(root, "id"),
            ("title", RepairHint::FillDefault) => {
                root["title"] = json!(DEFAULT_TITLE);
                true
            }
            ("title", RepairHint::CoerceType) => coerce_to_string(root, "title"),
            ("title", RepairHint::ClampLength) => {
                clamp_string(root, "title", TITLE_MIN, TITLE_MAX)
            }
            ("description", RepairHint::FillDefault) => {
                root["description"] = json!(DEFAULT_DESCRIPTION);
                true
            }
            ("description", RepairHint::CoerceType) => coerce_to_string(root, "description"),
            ("description", RepairHint::ClampLength) => {
                clamp_string(root, "description", DESCRIPTION_MIN, DESCRIPTION_MAX)
            }
            ("scenes", _) => ensure_scenes(root),
            ("cinematography.durationSec", RepairHint::CoerceType) => {
                let parsed = root["cinematography"]["durationSec"]
                    .as_str()
                    .and_then(|s| s.trim().parse::<f64>().ok());
                match parsed {
                    Some(n) if n > 0.0 => {
                        root["cinematography"]["durationSec"] = json!(n);
                        true
                    }
                    _ => set_default_duration(root),
                }
            }
            ("cinematography.durationSec", RepairHint::FillDefault) => {
                set_default_duration(root)
            }
            ("metadata.confidence", RepairHint::ClampLength) => {
                let clamped = root["metadata"]["confidence"]
                    .as_f64()
                    .map(|c| c.clamp(0.0, 1.0));
                match clamped {
                    Some(c) => {
                        root["metadata"]["confidence"] = json!(c);
                        true
                    }
                    None => false,
                }
            }
            ("metadata.confidence", RepairHint::CoerceType) => {
                let parsed = root["metadata"]["confidence"]
                    .as_str()
                    .and_then(|s| s.trim().parse::<f64>().ok())
                    .map(|c| c.clamp(0.0, 1.0));
                match parsed {
                    Some(c) => {
                        root["metadata"]["confidence"] = json!(c);
                        true
                    }
                    None => false,
                }
            }
            _ => false,
        }
    };

    changed.then(|| error.field.clone())
}

fn fix_scene_field(root: &mut Value, rest: &str, hint: RepairHint) -> bool {
    let close = match rest.find(']') {
        Some(i) => i,
        None => return false,
    };
    let Ok(index) = rest[..close].parse::<usize>() else {
        return false;
    };
    let subfield = rest[close + 1..].strip_prefix('.');

    let Some(scene) = root
        .get_mut("scenes")
        .and_then(Value::as_array_mut)
        .and_then(|scenes| scenes.get_mut(index))
    else {
        return false;
    };
    if !scene.is_object() {
        *scene = json!({
            "id": format!("scene-{}", index + 1),
            "description": SCENE_PLACEHOLDER_DESCRIPTION,
            "objects": []
        });
        return true;
    }

    match (subfield, hint) {
        (Some("id"), _) => {
            scene["id"] = json!(format!("scene-{}", index + 1));
            true
        }
        (Some("description"), _) => {
            scene["description"] = json!(SCENE_PLACEHOLDER_DESCRIPTION);
            true
        }
        (Some("objects"), RepairHint::CoerceType) => {
            let items: Option<Vec<String>> = scene["objects"].as_str().map(|s| {
                s.split(',')
                    .map(|item| item.trim().to_string())
                    .filter(|item| !item.is_empty())
                    .collect()
            });
            match items {
                Some(items) => {
                    scene["objects"] = json!(items);
                    true
                }
                None => {
                    scene["objects"] = json!([]);
                    true
                }
            }
        }
        (Some("objects"), _) => {
            scene["objects"] = json!([]);
            true
        }
        _ => false,
    }
}

fn ensure_scenes(root: &mut Value) -> bool {
    let needs_default = match root.get("scenes") {
        Some(Value::Array(scenes)) => scenes.is_empty(),
        _ => true,
    };
    if needs_default {
        root["scenes"] = json!([{
            "id": "scene-1",
            "description": SCENE_PLACEHOLDER_DESCRIPTION,
            "objects": []
        }]);
    }
    needs_default
}

fn set_default_duration(root: &mut Value) -> bool {
    let scene_count = root
        .get("scenes")
        .and_then(Value::as_array)
        .map(|s| s.len().max(1))
        .unwrap_or(1);
    let duration = 10.0 * scene_count as f64;
    match root.get_mut("cinematography") {
        Some(c) if c.is_object() => {
            c["durationSec"] = json!(duration);
            true
        }
        Some(c) => {
            *c = json!({"durationSec": duration, "shots": []});
            true
        }
        None => false,
    }
}

fn coerce_to_string(root: &mut Value, field: &str) -> bool {
    match root.get(field) {
        Some(Value::Number(n)) => {
            let coerced = n.to_string();
            root[field] = json!(coerced);
            true
        }
        _ => false,
    }
}

/// Truncate to `max` or pad to `min` characters, preserving content.
fn clamp_string(root: &mut Value, field: &str, min: usize, max: usize) -> bool {
    let Some(current) = root.get(field).and_then(Value::as_str) else {
        return false;
    };
    let len = current.chars().count();
    let clamped = if len > max {
        current.chars().take(max).collect::<String>()
    } else if len < min {
        let mut padded = current.to_string();
        padded.extend(std::iter::repeat('.').take(min - len));
        padded
    } else {
        return false;
    };
    root[field] = json!(clamped);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> RepairEngine {
        RepairEngine::new(3)
    }

    fn pipeline() -> ValidationPipeline {
        ValidationPipeline::new()
    }

    fn repair_cycle(candidate: &Value) -> RepairOutcome {
        let report = pipeline().validate(candidate, SchemaId::DreamResponse);
        engine().repair(candidate, &report, SchemaId::DreamResponse)
    }

    #[test]
    fn pads_a_short_title_preserving_content() {
        let candidate = json!({
            "id": "d-1",
            "title": "Sho",
            "description": "A perfectly fine description of a dream.",
            "scenes": [{"id": "s-1", "description": "A scene.", "objects": []}]
        });
        let outcome = repair_cycle(&candidate);
        assert!(outcome.success);
        let repaired = outcome.repaired.expect("repaired");
        let title = repaired["title"].as_str().expect("title");
        assert_eq!(title.chars().count(), TITLE_MIN);
        assert!(title.starts_with("Sho"));
        assert!(outcome.fixed_fields.contains(&"title".to_string()));
    }

    #[test]
    fn truncates_an_overlong_title() {
        let candidate = json!({
            "id": "d-1",
            "title": "t".repeat(500),
            "description": "A perfectly fine description of a dream.",
            "scenes": [{"id": "s-1", "description": "A scene.", "objects": []}]
        });
        let outcome = repair_cycle(&candidate);
        assert!(outcome.success);
        let title = outcome.repaired.expect("repaired")["title"]
            .as_str()
            .expect("title")
            .to_string();
        assert_eq!(title.chars().count(), TITLE_MAX);
    }

    #[test]
    fn fills_missing_required_fields_with_defaults() {
        let candidate = json!({
            "description": "A perfectly fine description of a dream."
        });
        let outcome = repair_cycle(&candidate);
        assert!(outcome.success, "fixed: {:?}", outcome.fixed_fields);
        let repaired = outcome.repaired.expect("repaired");
        assert!(repaired["id"].is_string());
        assert_eq!(repaired["title"], DEFAULT_TITLE);
        assert_eq!(repaired["scenes"].as_array().map(|s| s.len()), Some(1));
    }

    #[test]
    fn coerces_comma_joined_objects_to_an_array() {
        let candidate = json!({
            "id": "d-1",
            "title": "Tide Pools",
            "description": "Moonlight over still tide pools.",
            "scenes": [{"id": "s-1", "description": "A scene.", "objects": "crab, kelp, moon"}]
        });
        let outcome = repair_cycle(&candidate);
        assert!(outcome.success);
        let repaired = outcome.repaired.expect("repaired");
        assert_eq!(
            repaired["scenes"][0]["objects"],
            json!(["crab", "kelp", "moon"])
        );
    }

    #[test]
    fn coerces_stringified_duration() {
        let candidate = json!({
            "id": "d-1",
            "title": "Tide Pools",
            "description": "Moonlight over still tide pools.",
            "scenes": [{"id": "s-1", "description": "A scene.", "objects": []}],
            "cinematography": {"durationSec": "24.5"}
        });
        let outcome = repair_cycle(&candidate);
        assert!(outcome.success);
        assert_eq!(
            outcome.repaired.expect("repaired")["cinematography"]["durationSec"],
            json!(24.5)
        );
    }

    #[test]
    fn repair_is_idempotent() {
        let candidate = json!({
            "title": "Sho",
            "description": "short",
            "scenes": []
        });
        let first = repair_cycle(&candidate);
        assert!(first.success);
        let first_value = first.repaired.expect("repaired");

        // Repairing the repaired candidate changes nothing.
        let report = pipeline().validate(&first_value, SchemaId::DreamResponse);
        assert!(report.valid);
        let second = engine().repair(&first_value, &report, SchemaId::DreamResponse);
        assert_eq!(second.repaired.expect("value"), first_value);
    }

    #[test]
    fn repair_is_non_regressive() {
        let candidate = json!({
            "title": 42,
            "description": "short",
            "scenes": []
        });
        let before = pipeline().validate(&candidate, SchemaId::DreamResponse);
        let outcome = engine().repair(&candidate, &before, SchemaId::DreamResponse);
        let repaired = outcome.repaired.expect("repaired");
        let after = pipeline().validate(&repaired, SchemaId::DreamResponse);
        assert!(after.errors.len() <= before.errors.len());
        // No new high-severity kinds appear.
        assert!(after.high_severity_count() <= before.high_severity_count());
    }

    #[test]
    fn converges_within_max_attempts() {
        let candidate = json!({
            "title": "Sho",
            "description": "short",
            "scenes": "not even an array"
        });
        let outcome = repair_cycle(&candidate);
        assert!(outcome.attempts <= 3);
        assert!(outcome.success);
    }

    #[test]
    fn non_object_candidate_cannot_be_repaired() {
        let candidate = json!("prose");
        let report = pipeline().validate(&candidate, SchemaId::DreamResponse);
        let outcome = engine().repair(&candidate, &report, SchemaId::DreamResponse);
        assert!(!outcome.success);
        assert!(outcome.repaired.is_none());
    }
}
