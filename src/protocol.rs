//! DAP message envelopes and error-response bodies.
//!
//! Bodies stay `serde_json::Value` on purpose: the server's dialect drifts
//! from the published protocol in several places (string sources, root+path
//! variable addressing), and a typed body per command would fight that drift
//! instead of translating it.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;

/// DAP request envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct DapRequest {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Value,
}

/// `type` field of a wire message, when present.
pub fn message_type(message: &Value) -> Option<&str> {
    message.get("type").and_then(Value::as_str)
}

/// Where a failed request's explanation goes: the user's face or telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDestination {
    User,
    Telemetry,
}

/// Structured error body carried by failed responses, per the DAP `Message`
/// type. `format` keeps its `{placeholder}` form so telemetry pipelines can
/// group on it.
pub fn error_body(id: i64, format: &str, destination: ErrorDestination) -> Value {
    json!({
        "error": {
            "id": id,
            "format": format,
            "showUser": destination == ErrorDestination::User,
            "sendTelemetry": destination == ErrorDestination::Telemetry,
        }
    })
}

static PII_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([^}]+)\}").expect("literal pattern"));

/// Expand `{placeholder}` occurrences in an error format. When
/// `exclude_pii` is set, only underscore-prefixed placeholders (the ones
/// marked safe to log) are substituted; the rest stay verbatim.
pub fn format_pii(format: &str, exclude_pii: bool, variables: &HashMap<String, String>) -> String {
    PII_PLACEHOLDER
        .replace_all(format, |caps: &regex::Captures| {
            let name = &caps[1];
            if exclude_pii && !name.starts_with('_') {
                return caps[0].to_string();
            }
            variables
                .get(name)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}
