//! Command request model.
//!
//! A [`CommandRequest`] is created at dispatch entry and discarded after the
//! [`crate::pipeline::PipelineResult`] is returned. Parameters are mutated
//! exactly once, by the validator's sanitization pass; after admission the
//! request is treated as immutable.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scheduling priority of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Priority::Low),
            "NORMAL" => Ok(Priority::Normal),
            "HIGH" => Ok(Priority::High),
            "CRITICAL" => Ok(Priority::Critical),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Tagged parameter value.
///
/// Parameter maps are dynamic at the call site but every value carries an
/// explicit type tag so the validator can enforce its schema table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::Int(_) => "int",
            ParamValue::Float(_) => "float",
            ParamValue::Str(_) => "string",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view used for range checks. Bools and strings have none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(i) => Some(*i as f64),
            ParamValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Str(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Str(s)
    }
}

impl From<i64> for ParamValue {
    fn from(i: i64) -> Self {
        ParamValue::Int(i)
    }
}

impl From<f64> for ParamValue {
    fn from(f: f64) -> Self {
        ParamValue::Float(f)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        ParamValue::Bool(b)
    }
}

/// Parameter map for a command.
pub type Parameters = BTreeMap<String, ParamValue>;

/// One administrative/service command flowing through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Unique id, generated per call.
    pub id: String,
    /// Command-type tag, e.g. "AI_INFERENCE" or "HEALTH_CHECK". Also the
    /// circuit-breaker partition key.
    pub command_type: String,
    pub priority: Priority,
    pub parameters: Parameters,
    pub created_at: DateTime<Utc>,
}

impl CommandRequest {
    pub fn new(
        command_type: impl Into<String>,
        priority: Priority,
        parameters: Parameters,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            command_type: command_type.into(),
            priority,
            parameters,
            created_at: Utc::now(),
        }
    }
}

/// Admission facts attached to a request after the throttle stage.
///
/// Owned by the orchestrator for the lifetime of one dispatch.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionContext {
    pub throttled: bool,
    pub delay_applied: Duration,
    pub active_load_at_admission: usize,
}
