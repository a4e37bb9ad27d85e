//! # Response Extraction Module
//!
//! Turns raw provider output into a candidate object for validation. LLM
//! providers return the target JSON buried in wrapper envelopes, quoted into
//! strings, fenced in markdown, or padded with prose; this module owns all
//! of that normalization so the adapters stay thin transports.
//!
//! Three guards matter here:
//!
//! - **Pending-value detection**: an upstream SDK bug can serialize an
//!   unresolved deferred (`{"then": ...}` thenables, `[object Promise]`
//!   strings) instead of the awaited value. These are refused with
//!   `async_extraction_error` and the location is recorded, never passed
//!   downstream as content.
//! - **Wrapper descent**: known envelope paths
//!   (`choices[0].message.content`, `content[0].text`, `data.content`, ...)
//!   are tried in order until one yields usable content.
//! - **Balanced-brace salvage**: a string payload containing a JSON document
//!   embedded in prose is rescued by locating the outermost balanced
//!   `{...}` block, string- and escape-aware.

use crate::error::ProviderError;
use crate::models::RawResponse;
use serde_json::Value;

/// A candidate object plus notes about how it was obtained.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub candidate: Value,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
enum Seg {
    Key(&'static str),
    Idx(usize),
}

/// Known provider wrapper paths, most specific first.
const WRAPPER_PATHS: &[&[Seg]] = &[
    &[Seg::Key("choices"), Seg::Idx(0), Seg::Key("message"), Seg::Key("content")],
    &[Seg::Key("content"), Seg::Idx(0), Seg::Key("text")],
    &[Seg::Key("content")],
    &[Seg::Key("data"), Seg::Key("content")],
    &[Seg::Key("output")],
    &[Seg::Key("message"), Seg::Key("content")],
    &[Seg::Key("response")],
];

/// Extract a candidate object from raw provider output.
pub fn extract(raw: &RawResponse) -> Result<Extraction, ProviderError> {
    match raw {
        RawResponse::Json(value) => extract_from_value(value),
        RawResponse::Text(text) => {
            check_text_pending(text, "$")?;
            let (candidate, salvaged) = parse_or_salvage(text)?;
            let mut notes = Vec::new();
            if salvaged {
                notes.push("salvaged json embedded in prose".to_string());
            }
            finish(candidate, notes)
        }
    }
}

fn extract_from_value(value: &Value) -> Result<Extraction, ProviderError> {
    if let Some(marker) = pending_marker(value) {
        return Err(ProviderError::PendingValue {
            location: format!("$ ({marker})"),
        });
    }

    if is_candidate_shape(value) {
        return finish(value.clone(), Vec::new());
    }

    for path in WRAPPER_PATHS {
        let Some(inner) = resolve_path(value, path) else {
            continue;
        };
        let location = path_to_string(path);

        if let Some(marker) = pending_marker(inner) {
            return Err(ProviderError::PendingValue {
                location: format!("{location} ({marker})"),
            });
        }

        match inner {
            Value::String(text) => {
                check_text_pending(text, &location)?;
                let (candidate, salvaged) = parse_or_salvage(text)?;
                let mut notes = vec![format!("descended wrapper path {location}")];
                if salvaged {
                    notes.push("salvaged json embedded in prose".to_string());
                }
                return finish(candidate, notes);
            }
            Value::Object(_) if is_candidate_shape(inner) => {
                let notes = vec![format!("descended wrapper path {location}")];
                return finish(inner.clone(), notes);
            }
            _ => continue,
        }
    }

    Err(ProviderError::InvalidResponse {
        detail: "no recognized wrapper path yielded content".to_string(),
    })
}

fn finish(candidate: Value, notes: Vec<String>) -> Result<Extraction, ProviderError> {
    if let Some(marker) = pending_marker(&candidate) {
        return Err(ProviderError::PendingValue {
            location: format!("parsed candidate ({marker})"),
        });
    }
    if !candidate.is_object() {
        return Err(ProviderError::InvalidResponse {
            detail: format!("expected a JSON object, got {}", type_name(&candidate)),
        });
    }
    Ok(Extraction { candidate, notes })
}

/// Detect a deferred value that was serialized instead of awaited.
fn pending_marker(value: &Value) -> Option<&'static str> {
    match value {
        Value::Object(map) => {
            if map.contains_key("then") && map.len() <= 3 {
                return Some("thenable shape");
            }
            if map.get("_pending").and_then(Value::as_bool) == Some(true) {
                return Some("pending marker");
            }
            None
        }
        Value::String(s) if s.contains("[object Promise]") => Some("serialized promise"),
        _ => None,
    }
}

fn check_text_pending(text: &str, location: &str) -> Result<(), ProviderError> {
    if text.contains("[object Promise]") {
        return Err(ProviderError::PendingValue {
            location: format!("{location} (serialized promise)"),
        });
    }
    Ok(())
}

fn is_candidate_shape(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            map.contains_key("scenes")
                || (map.contains_key("title") && map.contains_key("description"))
        }
        _ => false,
    }
}

fn resolve_path<'a>(value: &'a Value, path: &[Seg]) -> Option<&'a Value> {
    let mut current = value;
    for seg in path {
        current = match seg {
            Seg::Key(key) => current.get(key)?,
            Seg::Idx(idx) => current.get(idx)?,
        };
    }
    Some(current)
}

fn path_to_string(path: &[Seg]) -> String {
    let mut out = String::new();
    for seg in path {
        match seg {
            Seg::Key(key) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(key);
            }
            Seg::Idx(idx) => {
                out.push('[');
                out.push_str(&idx.to_string());
                out.push(']');
            }
        }
    }
    out
}

/// Parse text as JSON, falling back to balanced-brace salvage. Returns the
/// parsed value and whether salvage was required.
fn parse_or_salvage(text: &str) -> Result<(Value, bool), ProviderError> {
    let trimmed = text.trim();
    let first_attempt = match serde_json::from_str::<Value>(trimmed) {
        Ok(value) if value.is_object() => return Ok((value, false)),
        Ok(_) => None,
        Err(e) => Some(e),
    };
    match balanced_object(trimmed) {
        Some(block) => {
            let value = serde_json::from_str::<Value>(block)?;
            Ok((value, true))
        }
        None => match first_attempt {
            // Raw prose: surface the original parse failure so the
            // orchestrator can re-prompt correctively.
            Some(e) => Err(ProviderError::Serialization(e)),
            None => Err(ProviderError::InvalidResponse {
                detail: "text payload parsed to a non-object with no embedded JSON".to_string(),
            }),
        },
    }
}

/// Locate the outermost balanced `{...}` block in `text`, ignoring braces
/// inside JSON strings and escape sequences.
fn balanced_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        let s = start?;
                        return Some(&text[s..=i]);
                    }
                }
            }
            _ => {}
        }
    }
    None
}

fn type_name(value: &Value) -> &'static str {
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
    use crate::error::ErrorKind;
    use serde_json::json;

    fn dream_body() -> Value {
        json!({
            "id": "d-1",
            "title": "Glass Forest",
            "description": "Trees of glass chime in a slow wind.",
            "scenes": [{"id": "s-1", "description": "A glass forest at dusk.", "objects": ["tree"]}]
        })
    }

    #[test]
    fn direct_candidate_passes_through() {
        let extraction = extract(&RawResponse::Json(dream_body())).expect("extraction");
        assert!(extraction.notes.is_empty());
        assert_eq!(extraction.candidate["title"], "Glass Forest");
    }

    #[test]
    fn descends_openai_envelope_with_quoted_json() {
        let body = json!({
            "choices": [{"message": {"role": "assistant", "content": dream_body().to_string()}}]
        });
        let extraction = extract(&RawResponse::Json(body)).expect("extraction");
        assert!(extraction
            .notes
            .iter()
            .any(|n| n.contains("choices[0].message.content")));
        assert_eq!(extraction.candidate["title"], "Glass Forest");
    }

    #[test]
    fn descends_anthropic_content_blocks() {
        let body = json!({
            "content": [{"type": "text", "text": dream_body().to_string()}]
        });
        let extraction = extract(&RawResponse::Json(body)).expect("extraction");
        assert!(extraction.notes.iter().any(|n| n.contains("content[0].text")));
    }

    #[test]
    fn salvages_json_from_surrounding_prose() {
        let text = format!(
            "Sure! Here is your dream:\n```json\n{}\n```\nLet me know if you need more.",
            dream_body()
        );
        let extraction = extract(&RawResponse::Text(text)).expect("extraction");
        assert!(extraction
            .notes
            .iter()
            .any(|n| n.contains("salvaged json")));
        assert_eq!(extraction.candidate["scenes"][0]["id"], "s-1");
    }

    #[test]
    fn salvage_ignores_braces_inside_strings() {
        let text = r#"note {"title": "Curly {braces} inside", "description": "ten chars ok", "scenes": []} done"#;
        let extraction = extract(&RawResponse::Text(text.to_string())).expect("extraction");
        assert_eq!(extraction.candidate["title"], "Curly {braces} inside");
    }

    #[test]
    fn raw_prose_without_json_is_a_parsing_error() {
        let err = extract(&RawResponse::Text("a dream about nothing".to_string()))
            .expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::ParsingError);
    }

    #[test]
    fn truncated_json_is_a_parsing_error() {
        let text = r#"{"title": "Broken", "description": "cut off mid"#;
        let err = extract(&RawResponse::Text(text.to_string())).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::ParsingError);
    }

    #[test]
    fn thenable_shape_is_refused_with_location() {
        let body = json!({
            "choices": [{"message": {"content": {"then": {}, "catch": {}}}}]
        });
        let err = extract(&RawResponse::Json(body)).expect_err("should fail");
        match err {
            ProviderError::PendingValue { location } => {
                assert!(location.contains("choices[0].message.content"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let kind = ProviderError::PendingValue {
            location: String::new(),
        }
        .kind();
        assert_eq!(kind, ErrorKind::AsyncExtractionError);
    }

    #[test]
    fn serialized_promise_string_is_refused() {
        let err = extract(&RawResponse::Text("[object Promise]".to_string()))
            .expect_err("should fail");
        assert!(matches!(err, ProviderError::PendingValue { .. }));
    }

    #[test]
    fn pending_marker_object_is_refused() {
        let body = json!({"_pending": true});
        let err = extract(&RawResponse::Json(body)).expect_err("should fail");
        assert!(matches!(err, ProviderError::PendingValue { .. }));
    }

    #[test]
    fn unrecognized_wrapper_is_invalid_response() {
        let body = json!({"result": {"payload": "nothing useful"}});
        let err = extract(&RawResponse::Json(body)).expect_err("should fail");
        assert!(matches!(err, ProviderError::InvalidResponse { .. }));
    }

    #[test]
    fn scalar_content_is_invalid_response() {
        let body = json!({"content": 42});
        let err = extract(&RawResponse::Json(body)).expect_err("should fail");
        assert!(matches!(err, ProviderError::InvalidResponse { .. }));
    }
}
