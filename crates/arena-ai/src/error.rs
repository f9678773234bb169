use std::collections::HashSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArenaAiErrorCode {
    MissingApiKey,
    UnknownProvider,
    Http,
    Transport,
    /// Caller-initiated cancellation.
    Aborted,
    /// Watchdog-initiated cancellation.
    TimedOut,
    Protocol,
}

/// The one failure shape every call surfaces: a code, a human-readable
/// message, and whatever call context was known at the failure site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArenaAiError {
    pub code: ArenaAiErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ArenaAiError {
    pub fn new(code: ArenaAiErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            provider: None,
            model: None,
            status: None,
            details: None,
        }
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// True for both cancellation variants; callers use this to suppress
    /// user-facing error text after a manual abort.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self.code,
            ArenaAiErrorCode::Aborted | ArenaAiErrorCode::TimedOut
        )
    }

    pub fn as_compact_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"code\":\"protocol\",\"message\":\"{}\"}}",
                self.message.replace('\"', "\\\"")
            )
        })
    }
}

impl Display for ArenaAiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)?;
        if let (Some(provider), Some(model)) = (&self.provider, &self.model) {
            write!(f, " ({provider}/{model})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ArenaAiError {}

const FLATTEN_DEPTH_LIMIT: usize = 8;
const NESTED_ERROR_KEYS: &[&str] = &["message", "detail", "error", "cause"];

/// Reduces an arbitrary provider error envelope to one display string. Every
/// backend nests its failures differently (strings, `{error: {message}}`,
/// `errors: [...]`, causes inside causes), so this walks the known wrapper
/// keys recursively, skips repeated fragments, and bounds the descent.
pub fn flatten_error_detail(value: &Value) -> String {
    let mut fragments = Vec::new();
    let mut seen = HashSet::new();
    collect_fragments(value, &mut fragments, &mut seen, 0);

    if fragments.is_empty() {
        return compact_fallback(value);
    }
    fragments.join(": ")
}

fn collect_fragments(
    value: &Value,
    fragments: &mut Vec<String>,
    seen: &mut HashSet<String>,
    depth: usize,
) {
    if depth > FLATTEN_DEPTH_LIMIT {
        return;
    }

    match value {
        Value::String(text) => {
            let trimmed = text.trim();
            if !trimmed.is_empty() && seen.insert(trimmed.to_string()) {
                fragments.push(trimmed.to_string());
            }
        }
        Value::Object(map) => {
            for key in NESTED_ERROR_KEYS {
                if let Some(nested) = map.get(*key) {
                    collect_fragments(nested, fragments, seen, depth + 1);
                }
            }
            if let Some(errors) = map.get("errors").and_then(Value::as_array) {
                for nested in errors {
                    collect_fragments(nested, fragments, seen, depth + 1);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_fragments(item, fragments, seen, depth + 1);
            }
        }
        _ => {}
    }
}

fn compact_fallback(value: &Value) -> String {
    let rendered = match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    if rendered.chars().count() <= 400 {
        return rendered;
    }
    let prefix: String = rendered.chars().take(397).collect();
    format!("{prefix}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flatten_handles_plain_strings() {
        assert_eq!(flatten_error_detail(&json!("boom")), "boom");
    }

    #[test]
    fn flatten_walks_nested_wrappers() {
        let detail = flatten_error_detail(&json!({
            "error": {
                "message": "rate limited",
                "cause": { "detail": "burst quota exceeded" },
            }
        }));
        assert_eq!(detail, "rate limited: burst quota exceeded");
    }

    #[test]
    fn flatten_collects_error_arrays() {
        let detail = flatten_error_detail(&json!({
            "errors": [
                { "message": "field `model` missing" },
                { "message": "field `input` missing" },
            ]
        }));
        assert_eq!(detail, "field `model` missing: field `input` missing");
    }

    #[test]
    fn flatten_deduplicates_repeated_fragments() {
        let detail = flatten_error_detail(&json!({
            "message": "invalid key",
            "error": { "message": "invalid key" },
        }));
        assert_eq!(detail, "invalid key");
    }

    #[test]
    fn flatten_bounds_recursion_depth() {
        let mut nested = json!("deep");
        for _ in 0..32 {
            nested = json!({ "cause": nested });
        }
        // Nothing collected inside the bound: falls back to compact JSON.
        let detail = flatten_error_detail(&nested);
        assert!(!detail.is_empty());
    }

    #[test]
    fn flatten_falls_back_to_compact_json_for_unknown_shapes() {
        let detail = flatten_error_detail(&json!({ "status": 503 }));
        assert_eq!(detail, "{\"status\":503}");
    }

    #[test]
    fn cancellation_codes_are_distinguishable() {
        assert!(ArenaAiError::new(ArenaAiErrorCode::Aborted, "stop").is_cancellation());
        assert!(ArenaAiError::new(ArenaAiErrorCode::TimedOut, "slow").is_cancellation());
        assert!(!ArenaAiError::new(ArenaAiErrorCode::Transport, "down").is_cancellation());
    }
}
