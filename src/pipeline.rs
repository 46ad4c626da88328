//! Pipeline orchestrator.
//!
//! Sequences the stages into one call contract:
//! `dispatch(command) -> PipelineResult`. Stage order within a dispatch is
//! strict (validate -> admit -> execute -> transform -> record); independent
//! dispatches interleave freely and share only the breaker store and the
//! telemetry cache.
//!
//! The outward contract is "always returns a `PipelineResult`, never
//! panics or propagates": every failure mode degrades into a standardized
//! error result.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::time::{sleep, Instant};
use tower::BoxError;
use tracing::{debug, info_span, Instrument};

use crate::breaker::{BreakerStore, CircuitBreaker, MemoryBreakerStore};
use crate::config::PipelineConfig;
use crate::executor::{RetryExecutor, WorkOutcome};
use crate::failover::FailoverRegistry;
use crate::request::{CommandRequest, Parameters, Priority};
use crate::telemetry::{
    EventType, MemorySink, ReadMode, TelemetryRecorder, TelemetrySink, TelemetryView,
};
use crate::throttle::{InFlightGuard, LoadSampler, PipelineGauge, Throttle};
use crate::transform::{ErrorKind, ResponseTransformer, TransformMeta, Transformed};
use crate::validation::{ParamSchema, Validator};

/// Dispatch stages, used in spans and telemetry metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Created,
    Validated,
    Admitted,
    Executing,
    Transformed,
    Done,
    Blocked,
    Error,
}

/// Final, immutable outcome of one dispatch.
#[derive(Debug, Serialize)]
pub struct PipelineResult {
    pub success: bool,
    /// Normalized payload, or a standardized error object.
    pub result: Value,
    pub attempts: usize,
    pub circuit_breaker_tripped: bool,
    pub failover_used: bool,
    pub duration_ms: u64,
    pub command_id: String,
    pub meta: TransformMeta,
}

/// The assembled middleware pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    validator: Validator,
    throttle: Throttle,
    executor: RetryExecutor,
    failover: FailoverRegistry,
    transformer: ResponseTransformer,
    recorder: TelemetryRecorder,
    sampler: Arc<dyn LoadSampler>,
    in_flight: Arc<AtomicUsize>,
}

impl Pipeline {
    /// Pipeline with in-memory breaker state and telemetry.
    pub fn new(config: PipelineConfig) -> crate::error::Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Dispatch one command through the full pipeline.
    pub async fn dispatch<F, Fut>(
        &self,
        command_type: &str,
        priority: Priority,
        parameters: Parameters,
        work: F,
    ) -> PipelineResult
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<Value, BoxError>>,
    {
        self.dispatch_with_deadline(command_type, priority, parameters, None, work)
            .await
    }

    /// Dispatch with a caller-supplied deadline. The deadline aborts at the
    /// next suspension point (admission delay or backoff) with a
    /// `CANCELLED` result; it does not interrupt an in-flight `work` call.
    pub async fn dispatch_with_deadline<F, Fut>(
        &self,
        command_type: &str,
        priority: Priority,
        parameters: Parameters,
        deadline: Option<Instant>,
        work: F,
    ) -> PipelineResult
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<Value, BoxError>>,
    {
        let request = CommandRequest::new(command_type, priority, parameters);
        let span = info_span!(
            "dispatch",
            command_type = %request.command_type,
            command_id = %request.id,
            priority = %request.priority,
        );
        self.run(request, deadline, work).instrument(span).await
    }

    async fn run<F, Fut>(
        &self,
        request: CommandRequest,
        deadline: Option<Instant>,
        work: F,
    ) -> PipelineResult
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<Value, BoxError>>,
    {
        let started = Instant::now();

        // CREATED -> VALIDATED | BLOCKED
        let (sanitized, findings) = self.validator.validate(&request);
        let Some(request) = sanitized else {
            let detail = findings
                .iter()
                .map(|f| f.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            let transformed = self.transformer.transform_error(
                ErrorKind::SecurityBlocked,
                detail,
                &request,
                None,
            );
            let mut metadata = Map::new();
            metadata.insert("stage".to_string(), stage_value(Stage::Blocked));
            metadata.insert(
                "findings".to_string(),
                serde_json::to_value(&findings).unwrap_or(Value::Null),
            );
            self.recorder
                .record(EventType::Error, &request, started.elapsed(), metadata)
                .await;
            return self.finish(transformed, &request, started, 0, false, false);
        };

        let mut start_meta = Map::new();
        if !findings.is_empty() {
            start_meta.insert(
                "findings".to_string(),
                serde_json::to_value(&findings).unwrap_or(Value::Null),
            );
        }
        self.recorder
            .record(EventType::Start, &request, Duration::ZERO, start_meta)
            .await;

        // VALIDATED -> ADMITTED
        let load = self.sampler.sample();
        let admission = self.throttle.admit(&request, load);
        let context = admission.context;

        if context.throttled {
            if exceeds_deadline(deadline, context.delay_applied) {
                return self.cancelled(&request, started, 0, false).await;
            }
            let mut metadata = Map::new();
            metadata.insert(
                "delay_ms".to_string(),
                Value::from(context.delay_applied.as_millis() as u64),
            );
            metadata.insert("active".to_string(), Value::from(context.active_load_at_admission as u64));
            metadata.insert(
                "cpu_percent".to_string(),
                Value::from(load.cpu_percent as f64),
            );
            self.recorder
                .record(EventType::Throttle, &request, context.delay_applied, metadata)
                .await;
            debug!(delay = ?context.delay_applied, "admission delayed");
            sleep(context.delay_applied).await;
        }

        // ADMITTED -> EXECUTING
        let report = {
            let _guard = InFlightGuard::enter(&self.in_flight);
            self.executor
                .execute(&request.command_type, deadline, work)
                .await
        };

        let report = match report {
            Ok(r) => r,
            Err(internal) => {
                // Terminal ERROR stage: internal fault, degraded into a
                // standardized result.
                let transformed = self.transformer.transform_error(
                    ErrorKind::ServiceError,
                    format!("internal pipeline fault: {internal}"),
                    &request,
                    None,
                );
                self.record_terminal(&transformed, &request, started).await;
                return self.finish(transformed, &request, started, 0, false, false);
            }
        };

        // EXECUTING -> TRANSFORMED
        let attempts = report.attempts;
        let tripped = report.circuit_tripped;
        let mut failover_used = false;

        let transformed = match report.outcome {
            WorkOutcome::Success(value) => self.transformer.transform_success(value, &request),
            WorkOutcome::BreakerOpen { retry_after } => self.transformer.transform_error(
                ErrorKind::CircuitBreakerOpen,
                format!("breaker open for {}", request.command_type),
                &request,
                Some(serde_json::json!({
                    "retry_after_ms": retry_after.as_millis() as u64,
                })),
            ),
            WorkOutcome::Cancelled => {
                return self.cancelled(&request, started, attempts, tripped).await;
            }
            WorkOutcome::Exhausted(error) => {
                let fallback = if self.config.enable_failover {
                    self.failover.fallback(&request.command_type, &request)
                } else {
                    None
                };
                match fallback {
                    Some(value) => {
                        failover_used = true;
                        let mut t = self.transformer.transform_success(value, &request);
                        t.meta.actions.push("failover_applied".to_string());
                        t
                    }
                    None => self.transformer.transform_error(
                        ErrorKind::ResilienceFailure,
                        format!("exhausted after {attempts} attempt(s): {error}"),
                        &request,
                        Some(serde_json::json!({ "attempts": attempts })),
                    ),
                }
            }
        };

        // TRANSFORMED -> DONE
        self.record_terminal(&transformed, &request, started).await;
        self.finish(transformed, &request, started, attempts, tripped, failover_used)
    }

    async fn cancelled(
        &self,
        request: &CommandRequest,
        started: Instant,
        attempts: usize,
        tripped: bool,
    ) -> PipelineResult {
        let transformed = self.transformer.transform_error(
            ErrorKind::Cancelled,
            "deadline reached at a suspension point".to_string(),
            request,
            None,
        );
        self.recorder
            .record(EventType::Cancel, request, started.elapsed(), Map::new())
            .await;
        self.finish(transformed, request, started, attempts, tripped, false)
    }

    async fn record_terminal(
        &self,
        transformed: &Transformed,
        request: &CommandRequest,
        started: Instant,
    ) {
        let event = if transformed.success {
            EventType::Complete
        } else {
            EventType::Error
        };
        let mut metadata = Map::new();
        if let Some(kind) = transformed.error_kind {
            metadata.insert("error_type".to_string(), Value::from(kind.as_str()));
        }
        self.recorder
            .record(event, request, started.elapsed(), metadata)
            .await;
    }

    fn finish(
        &self,
        transformed: Transformed,
        request: &CommandRequest,
        started: Instant,
        attempts: usize,
        circuit_breaker_tripped: bool,
        failover_used: bool,
    ) -> PipelineResult {
        PipelineResult {
            success: transformed.success,
            result: transformed.body,
            attempts,
            circuit_breaker_tripped,
            failover_used,
            duration_ms: started.elapsed().as_millis() as u64,
            command_id: request.id.clone(),
            meta: transformed.meta,
        }
    }

    /// Telemetry read-through; `Realtime` uses the pipeline's own sampler.
    pub fn telemetry(&self, mode: ReadMode) -> TelemetryView {
        self.recorder.read(mode, Some(self.sampler.as_ref()))
    }

    /// Technical detail for an error id previously returned to a caller.
    pub fn error_detail(&self, error_id: &str) -> Option<String> {
        self.transformer.error_detail(error_id)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

fn exceeds_deadline(deadline: Option<Instant>, delay: Duration) -> bool {
    deadline
        .map(|d| Instant::now() + delay >= d)
        .unwrap_or(false)
}

fn stage_value(stage: Stage) -> Value {
    serde_json::to_value(stage).unwrap_or(Value::Null)
}

/// Builder wiring stores, sinks, samplers, schema, and failover strategies
/// into a [`Pipeline`].
pub struct PipelineBuilder {
    config: PipelineConfig,
    schema: Option<ParamSchema>,
    store: Option<Arc<dyn BreakerStore>>,
    sink: Option<Arc<dyn TelemetrySink>>,
    sampler: Option<Arc<dyn LoadSampler>>,
    failover: Option<FailoverRegistry>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            schema: None,
            store: None,
            sink: None,
            sampler: None,
            failover: None,
        }
    }

    pub fn schema(mut self, schema: ParamSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn breaker_store(mut self, store: Arc<dyn BreakerStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn telemetry_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn load_sampler(mut self, sampler: Arc<dyn LoadSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn failover(mut self, registry: FailoverRegistry) -> Self {
        self.failover = Some(registry);
        self
    }

    pub fn build(self) -> crate::error::Result<Pipeline> {
        self.config.validate()?;

        let breaker = if self.config.enable_circuit_breaker {
            let store = self
                .store
                .unwrap_or_else(|| Arc::new(MemoryBreakerStore::new()));
            Some(Arc::new(CircuitBreaker::from_config(store, &self.config)))
        } else {
            None
        };

        let (sampler, in_flight): (Arc<dyn LoadSampler>, Arc<AtomicUsize>) = match self.sampler {
            Some(s) => (s, Arc::new(AtomicUsize::new(0))),
            None => {
                let gauge = PipelineGauge::new();
                let counter = gauge.counter();
                (Arc::new(gauge), counter)
            }
        };

        let sink = self.sink.unwrap_or_else(|| Arc::new(MemorySink::new()));
        let validator = Validator::new(self.schema.unwrap_or_else(ParamSchema::standard));
        let failover = self.failover.unwrap_or_else(FailoverRegistry::with_defaults);

        Ok(Pipeline {
            validator,
            throttle: Throttle::from_config(&self.config),
            executor: RetryExecutor::from_config(&self.config, breaker),
            failover,
            transformer: ResponseTransformer::new(self.config.max_response_bytes),
            recorder: TelemetryRecorder::new(sink),
            sampler,
            in_flight,
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::throttle::{FixedLoad, LoadSample};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn fast_config() -> PipelineConfig {
        ConfigBuilder::new()
            .base_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(5))
            .build()
    }

    #[tokio::test]
    async fn test_happy_path() {
        let pipeline = Pipeline::new(fast_config()).unwrap();
        let result = pipeline
            .dispatch("HEALTH_CHECK", Priority::Normal, Parameters::new(), || async {
                Ok(json!({"status": "UP"}))
            })
            .await;
        assert!(result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.result["status"], "UP");
        assert!(!result.circuit_breaker_tripped);
        assert!(!result.failover_used);
        assert_eq!(result.meta.command_id, result.command_id);
    }

    #[tokio::test]
    async fn test_blocked_request_never_executes() {
        let pipeline = Pipeline::new(fast_config()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cl = calls.clone();
        let mut params = Parameters::new();
        params.insert("prompt".to_string(), "x; rm -rf /".into());

        let result = pipeline
            .dispatch("AI_INFERENCE", Priority::Normal, params, move || {
                calls_cl.fetch_add(1, Ordering::SeqCst);
                async { Ok(json!(null)) }
            })
            .await;

        assert!(!result.success);
        assert_eq!(result.result["error_type"], "SECURITY_BLOCKED");
        assert_eq!(result.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failover_flagged() {
        let config = ConfigBuilder::new()
            .max_retries(2)
            .base_delay(Duration::from_millis(1))
            .enable_failover(true)
            .build();
        let pipeline = Pipeline::new(config).unwrap();

        let result = pipeline
            .dispatch("HEALTH_CHECK", Priority::Normal, Parameters::new(), || async {
                Err::<Value, BoxError>("backend down".into())
            })
            .await;

        assert!(result.success);
        assert!(result.failover_used);
        assert_eq!(result.result["status"], "DEGRADED");
        assert!(result
            .meta
            .actions
            .contains(&"failover_applied".to_string()));
    }

    #[tokio::test]
    async fn test_no_failover_surfaces_resilience_failure() {
        let config = ConfigBuilder::new()
            .max_retries(2)
            .base_delay(Duration::from_millis(1))
            .build();
        let pipeline = Pipeline::new(config).unwrap();

        let result = pipeline
            .dispatch("HEALTH_CHECK", Priority::Normal, Parameters::new(), || async {
                Err::<Value, BoxError>("backend down".into())
            })
            .await;

        assert!(!result.success);
        assert_eq!(result.result["error_type"], "RESILIENCE_FAILURE");
        assert_eq!(result.attempts, 2);
        assert_eq!(result.result["attempts"], 2);
    }

    #[tokio::test]
    async fn test_throttled_dispatch_still_completes() {
        let config = ConfigBuilder::new()
            .base_delay(Duration::from_millis(10))
            .max_delay(Duration::from_millis(20))
            .max_concurrency(1)
            .build();
        let pipeline = Pipeline::builder(config)
            .load_sampler(Arc::new(FixedLoad(LoadSample {
                active: 3,
                cpu_percent: 10.0,
            })))
            .build()
            .unwrap();

        let started = std::time::Instant::now();
        let result = pipeline
            .dispatch("HEALTH_CHECK", Priority::Normal, Parameters::new(), || async {
                Ok(json!({"status": "UP"}))
            })
            .await;
        assert!(result.success);
        // overload factor 3 capped at 20ms
        assert!(started.elapsed() >= Duration::from_millis(20));

        match pipeline.telemetry(ReadMode::Detailed) {
            TelemetryView::Detailed { cache } => {
                assert_eq!(cache.throttled_commands, 1);
            }
            other => panic!("unexpected view {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deadline_cancels() {
        let pipeline = Pipeline::new(
            ConfigBuilder::new()
                .max_retries(5)
                .base_delay(Duration::from_millis(100))
                .build(),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_millis(20);
        let result = pipeline
            .dispatch_with_deadline(
                "HEALTH_CHECK",
                Priority::Normal,
                Parameters::new(),
                Some(deadline),
                || async { Err::<Value, BoxError>("down".into()) },
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.result["error_type"], "CANCELLED");
    }

    #[tokio::test]
    async fn test_error_detail_lookup() {
        let pipeline = Pipeline::new(fast_config()).unwrap();
        let result = pipeline
            .dispatch("X", Priority::Normal, Parameters::new(), || async {
                Err::<Value, BoxError>("tcp connect refused 10.0.0.7:5000".into())
            })
            .await;
        assert!(!result.success);
        // Raw detail never leaks outward but stays addressable.
        assert!(!result.result.to_string().contains("10.0.0.7"));
        let error_id = result.result["error_id"].as_str().unwrap();
        assert!(pipeline
            .error_detail(error_id)
            .unwrap()
            .contains("10.0.0.7"));
    }
}
