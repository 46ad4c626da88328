//! Response normalization and error abstraction.
//!
//! Everything leaving the pipeline passes through here: raw errors become
//! standardized error objects with a correlation id, oversized payloads are
//! replaced with a `RESPONSE_SIZE_LIMIT` error, string payloads are
//! opportunistically parsed as JSON, and sensitive fields are stripped. The
//! technical detail behind an error never crosses the boundary; it is kept
//! in an internal log addressable by `error_id`.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::request::CommandRequest;

/// Standardized error taxonomy. The serialized names are the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    #[serde(rename = "SECURITY_BLOCKED")]
    SecurityBlocked,
    #[serde(rename = "CIRCUIT_BREAKER_OPEN")]
    CircuitBreakerOpen,
    #[serde(rename = "RESILIENCE_FAILURE")]
    ResilienceFailure,
    #[serde(rename = "RESPONSE_SIZE_LIMIT")]
    ResponseSizeLimit,
    #[serde(rename = "TRANSFORMATION_ERROR")]
    TransformationError,
    #[serde(rename = "CANCELLED")]
    Cancelled,
    #[serde(rename = "AIOS_SERVICE_ERROR")]
    ServiceError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SecurityBlocked => "SECURITY_BLOCKED",
            ErrorKind::CircuitBreakerOpen => "CIRCUIT_BREAKER_OPEN",
            ErrorKind::ResilienceFailure => "RESILIENCE_FAILURE",
            ErrorKind::ResponseSizeLimit => "RESPONSE_SIZE_LIMIT",
            ErrorKind::TransformationError => "TRANSFORMATION_ERROR",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::ServiceError => "AIOS_SERVICE_ERROR",
        }
    }

    fn user_message(&self) -> &'static str {
        match self {
            ErrorKind::SecurityBlocked => "The request was blocked by input validation.",
            ErrorKind::CircuitBreakerOpen => {
                "The service is cooling down after repeated failures; retry later."
            }
            ErrorKind::ResilienceFailure => {
                "The operation failed after all retry attempts were exhausted."
            }
            ErrorKind::ResponseSizeLimit => "The response exceeded the configured size limit.",
            ErrorKind::TransformationError => "The response could not be normalized.",
            ErrorKind::Cancelled => "The request was cancelled before completion.",
            ErrorKind::ServiceError => "The service reported an error; see the correlation id.",
        }
    }
}

/// Standardized error object returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedError {
    pub error_id: String,
    #[serde(rename = "error_type")]
    pub kind: ErrorKind,
    pub user_message: String,
    pub timestamp: DateTime<Utc>,
    pub command_id: String,
}

/// Bounded in-memory log of technical error detail, keyed by error id.
pub struct ErrorDetailLog {
    entries: Mutex<VecDeque<(String, String)>>,
    capacity: usize,
}

impl ErrorDetailLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn record(&self, error_id: &str, detail: String) {
        let mut entries = match self.entries.lock() {
            Ok(e) => e,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back((error_id.to_string(), detail));
    }

    pub fn lookup(&self, error_id: &str) -> Option<String> {
        let entries = match self.entries.lock() {
            Ok(e) => e,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries
            .iter()
            .rev()
            .find(|(id, _)| id == error_id)
            .map(|(_, detail)| detail.clone())
    }
}

impl Default for ErrorDetailLog {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Metadata envelope attached to every normalized result.
#[derive(Debug, Clone, Serialize)]
pub struct TransformMeta {
    pub command_id: String,
    pub command_type: String,
    pub processed_at: DateTime<Utc>,
    /// Transformation actions applied, in order.
    pub actions: Vec<String>,
}

/// A normalized payload-or-error plus its metadata.
#[derive(Debug)]
pub struct Transformed {
    pub success: bool,
    /// Normalized payload, or the serialized [`NormalizedError`].
    pub body: Value,
    pub error_kind: Option<ErrorKind>,
    pub meta: TransformMeta,
}

/// Field-name fragments that must never leave the pipeline.
const SENSITIVE_TOKENS: &[&str] = &[
    "password",
    "secret",
    "key",
    "token",
    "credential",
    "internal",
    "debug",
    "cache",
];

/// Normalizes raw results and errors into the stable outward shape.
pub struct ResponseTransformer {
    max_response_bytes: usize,
    details: ErrorDetailLog,
}

impl ResponseTransformer {
    pub fn new(max_response_bytes: usize) -> Self {
        Self {
            max_response_bytes,
            details: ErrorDetailLog::default(),
        }
    }

    /// Technical detail for a previously returned error id.
    pub fn error_detail(&self, error_id: &str) -> Option<String> {
        self.details.lookup(error_id)
    }

    /// Normalize a successful raw result.
    pub fn transform_success(&self, raw: Value, request: &CommandRequest) -> Transformed {
        let mut actions = Vec::new();

        let size = match serde_json::to_vec(&raw) {
            Ok(bytes) => bytes.len(),
            Err(e) => {
                return self.transform_error(
                    ErrorKind::TransformationError,
                    format!("payload serialization failed: {e}"),
                    request,
                    None,
                )
            }
        };
        if size > self.max_response_bytes {
            return self.transform_error(
                ErrorKind::ResponseSizeLimit,
                format!(
                    "serialized response is {size} bytes, limit is {}",
                    self.max_response_bytes
                ),
                request,
                Some(json!({ "response_bytes": size })),
            );
        }

        let objectified = objectify(raw, &mut actions);
        let mut scrubbed = objectified;
        let removed = scrub_sensitive(&mut scrubbed);
        if removed > 0 {
            actions.push(format!("removed_{removed}_sensitive_fields"));
        }

        Transformed {
            success: true,
            body: scrubbed,
            error_kind: None,
            meta: self.meta(request, actions),
        }
    }

    /// Produce a standardized error object. `extra` fields (e.g.
    /// `retry_after_ms`) are merged into the serialized error.
    pub fn transform_error(
        &self,
        kind: ErrorKind,
        detail: String,
        request: &CommandRequest,
        extra: Option<Value>,
    ) -> Transformed {
        let error_id = Uuid::new_v4().to_string();
        debug!(error_id, kind = kind.as_str(), %detail, "error normalized");
        self.details.record(&error_id, detail);

        let error = NormalizedError {
            error_id,
            kind,
            user_message: kind.user_message().to_string(),
            timestamp: Utc::now(),
            command_id: request.id.clone(),
        };

        let mut body = match serde_json::to_value(&error) {
            Ok(v) => v,
            // NormalizedError serialization cannot realistically fail; keep
            // the never-throws contract anyway.
            Err(_) => json!({
                "error_id": error.error_id,
                "error_type": kind.as_str(),
                "command_id": request.id,
            }),
        };
        if let (Value::Object(map), Some(Value::Object(extra))) = (&mut body, extra) {
            for (k, v) in extra {
                map.insert(k, v);
            }
        }

        Transformed {
            success: false,
            body,
            error_kind: Some(kind),
            meta: self.meta(request, vec![format!("error_abstracted:{}", kind.as_str())]),
        }
    }

    fn meta(&self, request: &CommandRequest, actions: Vec<String>) -> TransformMeta {
        TransformMeta {
            command_id: request.id.clone(),
            command_type: request.command_type.clone(),
            processed_at: Utc::now(),
            actions,
        }
    }
}

/// Opportunistically parse string payloads as structured data; wrap plain
/// text in a stable envelope.
fn objectify(raw: Value, actions: &mut Vec<String>) -> Value {
    match raw {
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(parsed) if parsed.is_object() || parsed.is_array() => {
                actions.push("parsed_text_payload".to_string());
                parsed
            }
            _ => {
                actions.push("wrapped_text_payload".to_string());
                json!({
                    "response_type": "TEXT",
                    "content": s,
                    "length": s.chars().count(),
                })
            }
        },
        other => other,
    }
}

/// Recursively drop object keys whose lower-cased name contains a sensitive
/// token. Returns the number of removed fields.
fn scrub_sensitive(value: &mut Value) -> usize {
    match value {
        Value::Object(map) => {
            let doomed: Vec<String> = map
                .keys()
                .filter(|k| {
                    let lower = k.to_ascii_lowercase();
                    SENSITIVE_TOKENS.iter().any(|t| lower.contains(t))
                })
                .cloned()
                .collect();
            let mut removed = doomed.len();
            for key in doomed {
                map.remove(&key);
            }
            for v in map.values_mut() {
                removed += scrub_sensitive(v);
            }
            removed
        }
        Value::Array(items) => items.iter_mut().map(scrub_sensitive).sum(),
        _ => 0,
    }
}
