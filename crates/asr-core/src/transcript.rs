//! Transcript extraction from recognition responses.
//!
//! Responses arrive in one of two shapes:
//!
//! ```json
//! {"result": {"text": "...", "utterances": [{"text": "...", "definite": true}]}}
//! {"result": [{"text": "...", "utterances": [...]}]}
//! ```
//!
//! A result counts as final when the frame carries the last-packet flag, the
//! payload has a boolean `is_final`/`isFinal`, or any utterance is definite.
//! Both checks are kept and OR-ed together.

use serde_json::Value;

/// Text extracted from one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub text: String,
    pub is_final: bool,
}

/// Pull the best-effort transcript out of a response payload.
///
/// `last_packet` is the frame-level finality flag. Returns `None` when the
/// payload has no text, which is normal for interim silence.
pub fn extract_transcript(payload: &Value, last_packet: bool) -> Option<Transcript> {
    let results = result_entries(payload);

    let mut text: String = results
        .iter()
        .filter_map(|r| r.get("text").and_then(Value::as_str))
        .collect();

    let utterances: Vec<&Value> = results
        .iter()
        .filter_map(|r| r.get("utterances").and_then(Value::as_array))
        .flatten()
        .collect();

    if text.trim().is_empty() {
        text = utterances
            .iter()
            .filter_map(|u| u.get("text").and_then(Value::as_str))
            .collect();
    }

    let text = text.trim().to_string();
    if text.is_empty() {
        return None;
    }

    let any_definite = utterances
        .iter()
        .any(|u| u.get("definite").and_then(Value::as_bool).unwrap_or(false));

    Some(Transcript {
        text,
        is_final: last_packet || explicit_final(payload, &results) || any_definite,
    })
}

fn result_entries(payload: &Value) -> Vec<&Value> {
    match payload.get("result") {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(obj @ Value::Object(_)) => vec![obj],
        _ => Vec::new(),
    }
}

fn explicit_final(payload: &Value, results: &[&Value]) -> bool {
    std::iter::once(payload)
        .chain(results.iter().copied())
        .any(|v| {
            ["is_final", "isFinal"]
                .iter()
                .any(|key| v.get(*key).and_then(Value::as_bool).unwrap_or(false))
        })
}
