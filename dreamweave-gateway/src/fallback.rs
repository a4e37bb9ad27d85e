//! # Emergency Fallback
//!
//! Last-resort local synthesizer, invoked when every provider has failed or
//! the request's budget is exhausted. It derives a schema-valid artifact
//! from the prompt alone: keyword extraction feeds deterministic scene
//! templates, nothing here performs I/O, and every step is total within a
//! bounded work budget (input is capped before processing).
//!
//! Consumers distinguish these artifacts by `source = "emergency_fallback"`
//! and the low confidence sentinel.

use crate::config::ConfidenceConfig;
use dreamweave_providers::models::{
    ArtifactMetadata, CameraShot, Cinematography, DreamResponse, DreamScene, GenerationRequest,
    ValidatedArtifact, EMERGENCY_FALLBACK_SOURCE,
};
use serde_json::{json, Value};

/// Input beyond this many characters is ignored by keyword extraction.
const PROMPT_SCAN_CAP: usize = 4000;
const MAX_KEYWORDS: usize = 5;
const MAX_SCENES: usize = 3;
const SHOT_SECONDS: f64 = 10.0;

const STOPWORDS: &[&str] = &[
    "the", "and", "with", "over", "under", "into", "through", "about", "from", "that", "this",
    "there", "where", "while", "then", "them", "they", "their", "some", "very", "dream", "dreams",
];

pub struct EmergencyFallback {
    confidence: ConfidenceConfig,
}

impl EmergencyFallback {
    pub fn new(confidence: ConfidenceConfig) -> Self {
        Self { confidence }
    }

    /// Produce a schema-valid artifact from the request prompt.
    pub fn synthesize(&self, request: &GenerationRequest, elapsed_ms: u64) -> ValidatedArtifact {
        let keywords = extract_keywords(&request.prompt);
        let quality = request
            .quality
            .clone()
            .unwrap_or_else(|| "standard".to_string());

        let scenes = build_scenes(&keywords);
        let shots: Vec<CameraShot> = scenes
            .iter()
            .map(|scene| CameraShot {
                shot_type: "establish".to_string(),
                target: scene.id.clone(),
                duration_sec: SHOT_SECONDS,
            })
            .collect();

        let dream = DreamResponse {
            id: request.id.clone(),
            title: build_title(&keywords),
            description: build_description(&request.prompt, request.style.as_deref()),
            scenes,
            cinematography: Some(Cinematography {
                duration_sec: SHOT_SECONDS * shots.len() as f64,
                shots,
            }),
            metadata: Some(ArtifactMetadata {
                source: EMERGENCY_FALLBACK_SOURCE.to_string(),
                model: "template-synthesizer".to_string(),
                processing_time_ms: elapsed_ms,
                quality,
                tokens: None,
                confidence: self.confidence.fallback_confidence,
                cache_hit: false,
            }),
        };

        ValidatedArtifact {
            content: to_content(&dream),
            schema: request.schema.as_str().to_string(),
            source: EMERGENCY_FALLBACK_SOURCE.to_string(),
            confidence: self.confidence.fallback_confidence,
            processing_time_ms: elapsed_ms,
            repair_applied: false,
            extraction_notes: Vec::new(),
        }
    }
}

/// Lowercased, deduplicated keywords in prompt order.
fn extract_keywords(prompt: &str) -> Vec<String> {
    let capped: String = prompt.chars().take(PROMPT_SCAN_CAP).collect();
    let mut keywords: Vec<String> = Vec::new();
    for word in capped
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .filter(|w| !STOPWORDS.contains(w))
    {
        if !keywords.iter().any(|k| k == word) {
            keywords.push(word.to_string());
        }
        if keywords.len() >= MAX_KEYWORDS {
            break;
        }
    }
    keywords
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn build_title(keywords: &[String]) -> String {
    let title = match keywords {
        [] => "An Uncharted Dream".to_string(),
        [only] => format!("Dream of {}", capitalize(only)),
        [first, second, ..] => {
            format!("Dream of {} and {}", capitalize(first), capitalize(second))
        }
    };
    // Clamp into the schema's bounds; the template floor is already > 5.
    title.chars().take(crate::validation::TITLE_MAX).collect()
}

fn build_description(prompt: &str, style: Option<&str>) -> String {
    let excerpt: String = prompt.trim().chars().take(1500).collect();
    let styled = match style {
        Some(style) if !style.is_empty() => format!(" rendered in a {style} mood"),
        _ => String::new(),
    };
    let description = if excerpt.is_empty() {
        format!("An automatically synthesized dreamscape{styled}.")
    } else {
        format!("An automatically synthesized dreamscape{styled}, inspired by: {excerpt}")
    };
    description
        .chars()
        .take(crate::validation::DESCRIPTION_MAX)
        .collect()
}

fn build_scenes(keywords: &[String]) -> Vec<DreamScene> {
    if keywords.is_empty() {
        return vec![DreamScene {
            id: "scene-1".to_string(),
            description: "A slow drift through a formless, luminous dreamscape.".to_string(),
            objects: vec!["light".to_string()],
        }];
    }
    keywords
        .iter()
        .take(MAX_SCENES)
        .enumerate()
        .map(|(i, keyword)| DreamScene {
            id: format!("scene-{}", i + 1),
            description: format!("A drifting dreamlike space shaped around {keyword}."),
            objects: vec![keyword.clone()],
        })
        .collect()
}

/// Hand-rolled conversion so synthesis stays total: no serializer errors,
/// no panics, for any input.
fn to_content(dream: &DreamResponse) -> Value {
    let scenes: Vec<Value> = dream
        .scenes
        .iter()
        .map(|scene| {
            json!({
                "id": scene.id,
                "description": scene.description,
                "objects": scene.objects,
            })
        })
        .collect();

    let mut content = json!({
        "id": dream.id,
        "title": dream.title,
        "description": dream.description,
        "scenes": scenes,
    });

    if let Some(cinematography) = &dream.cinematography {
        let shots: Vec<Value> = cinematography
            .shots
            .iter()
            .map(|shot| {
                json!({
                    "shotType": shot.shot_type,
                    "target": shot.target,
                    "durationSec": shot.duration_sec,
                })
            })
            .collect();
        content["cinematography"] = json!({
            "durationSec": cinematography.duration_sec,
            "shots": shots,
        });
    }

    if let Some(metadata) = &dream.metadata {
        let mut meta = json!({
            "source": metadata.source,
            "model": metadata.model,
            "processingTimeMs": metadata.processing_time_ms,
            "quality": metadata.quality,
            "confidence": metadata.confidence,
            "cacheHit": metadata.cache_hit,
        });
        if let Some(tokens) = metadata.tokens {
            meta["tokens"] = json!(tokens);
        }
        content["metadata"] = meta;
    }

    content
}
