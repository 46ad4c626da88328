//! # aios-dispatch
//!
//! A command-dispatch middleware pipeline for administrative/service commands
//! issued to a backend process. Every dispatch flows through one reusable
//! chain:
//!
//! - **Validation**: injection deny-list, schema enforcement, guardrail
//!   redaction of instruction-override phrases
//! - **Throttling**: load-based admission delays, bounded and deterministic
//! - **Resilient execution**: bounded retries with exponential backoff and
//!   per-command-type circuit breaking over a durable store
//! - **Failover**: opt-in degraded responses when retries are exhausted
//! - **Normalization**: standardized error objects with correlation ids,
//!   response size bounds, sensitive-field filtering
//! - **Telemetry**: append-only structured records plus rolling aggregates
//!
//! The pipeline never throws: every dispatch resolves to a
//! [`PipelineResult`], successful or not.
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use aios_dispatch::{Parameters, Pipeline, PipelineConfig, Priority};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let pipeline = Pipeline::new(PipelineConfig::default())?;
//!
//! let result = pipeline
//!     .dispatch("HEALTH_CHECK", Priority::Normal, Parameters::new(), || async {
//!         // One backend operation; an HTTP call, a process invocation, ...
//!         Ok(json!({ "status": "UP" }))
//!     })
//!     .await;
//!
//! assert!(result.success);
//! println!("{} in {}ms", result.result, result.duration_ms);
//! # Ok(())
//! # }
//! ```
//!
//! The same pipeline is available as a `tower::Service` through
//! [`DispatchService`] for composition with existing Tower stacks.

pub mod breaker;
pub mod config;
pub mod error;
pub mod executor;
pub mod failover;
pub mod pipeline;
pub mod request;
pub mod service;
pub mod telemetry;
pub mod throttle;
pub mod transform;
pub mod validation;

// Public re-exports for convenience
pub use breaker::{BreakerRecord, BreakerState, BreakerStore, CircuitBreaker, JsonFileBreakerStore, MemoryBreakerStore};
pub use config::{ConfigBuilder, PipelineConfig};
pub use error::{DispatchError, Result};
pub use executor::{Backoff, BackoffKind, ExecutionReport, RetryExecutor, WorkOutcome};
pub use failover::FailoverRegistry;
pub use pipeline::{Pipeline, PipelineBuilder, PipelineResult, Stage};
pub use request::{CommandRequest, ExecutionContext, ParamValue, Parameters, Priority};
pub use service::{DispatchRequest, DispatchService, WorkFn, WorkFuture};
pub use telemetry::{
    EventType, JsonlSink, MemorySink, ReadMode, TelemetryCache, TelemetryRecord,
    TelemetryRecorder, TelemetrySink, TelemetryView,
};
pub use throttle::{
    Admission, FixedLoad, LoadSample, LoadSampler, PipelineGauge, PriorityHint, Throttle,
};
pub use transform::{ErrorKind, NormalizedError, ResponseTransformer, TransformMeta, Transformed};
pub use validation::{
    FindingKind, ParamRule, ParamSchema, ParamType, SecurityFinding, Validator, REDACTION_MARKER,
};

// Re-export Tower traits that users need
pub use tower::{BoxError, Service, ServiceExt};
