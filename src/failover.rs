//! Degraded fallback responses per command type.
//!
//! When retries are exhausted and the caller opted in, the orchestrator asks
//! this registry for a degraded-but-valid result. Types without a registered
//! strategy get `None` and the original failure is surfaced instead. Failover
//! use is always flagged in the pipeline result.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::request::CommandRequest;

type FallbackFn = Arc<dyn Fn(&CommandRequest) -> Value + Send + Sync>;

/// Static table of degraded responses keyed by command type.
#[derive(Clone, Default)]
pub struct FailoverRegistry {
    table: HashMap<String, FallbackFn>,
}

impl FailoverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in degraded responses.
    pub fn with_defaults() -> Self {
        Self::new()
            .register_static(
                "HEALTH_CHECK",
                json!({ "status": "DEGRADED", "detail": "live check unavailable, reporting last-resort status" }),
            )
            .register_static(
                "AI_INFERENCE",
                json!({
                    "response_type": "TEXT",
                    "content": "The service is temporarily unavailable; this is a cached degraded response.",
                    "degraded": true,
                }),
            )
    }

    /// Register a computed fallback.
    pub fn register(
        mut self,
        command_type: impl Into<String>,
        f: impl Fn(&CommandRequest) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.table.insert(command_type.into(), Arc::new(f));
        self
    }

    /// Register a constant fallback value.
    pub fn register_static(self, command_type: impl Into<String>, value: Value) -> Self {
        self.register(command_type, move |_| value.clone())
    }

    /// Degraded result for a command type, or `None` when no strategy exists.
    pub fn fallback(&self, command_type: &str, request: &CommandRequest) -> Option<Value> {
        self.table.get(command_type).map(|f| f(request))
    }
}
