//! Tower surface for the pipeline.
//!
//! Wraps [`Pipeline::dispatch`] as a `tower::Service` so callers can compose
//! it with their own layers (timeouts, instrumentation, buffering). The
//! pipeline's outward contract is preserved: the error arm of the service is
//! never taken in normal operation, every call resolves to a
//! [`PipelineResult`].

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tower::{BoxError, Service};

use crate::pipeline::{Pipeline, PipelineResult};
use crate::request::{Parameters, Priority};

/// Boxed future produced by a unit of work.
pub type WorkFuture = BoxFuture<'static, Result<Value, BoxError>>;

/// Cloneable unit of work performing one backend operation.
pub type WorkFn = Arc<dyn Fn() -> WorkFuture + Send + Sync>;

/// Request passed into the dispatch service stack.
#[derive(Clone)]
pub struct DispatchRequest {
    pub command_type: String,
    pub priority: Priority,
    pub parameters: Parameters,
    pub work: WorkFn,
}

impl DispatchRequest {
    pub fn new<F, Fut>(
        command_type: impl Into<String>,
        priority: Priority,
        parameters: Parameters,
        work: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        Self {
            command_type: command_type.into(),
            priority,
            parameters,
            work: Arc::new(move || Box::pin(work()) as WorkFuture),
        }
    }
}

impl std::fmt::Debug for DispatchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRequest")
            .field("command_type", &self.command_type)
            .field("priority", &self.priority)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

/// The pipeline as a Tower service.
#[derive(Clone)]
pub struct DispatchService {
    pipeline: Arc<Pipeline>,
}

impl DispatchService {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }
}

impl Service<DispatchRequest> for DispatchService {
    type Response = PipelineResult;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        // Admission control happens inside the pipeline.
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: DispatchRequest) -> Self::Future {
        let pipeline = self.pipeline.clone();
        Box::pin(async move {
            let work = req.work.clone();
            let result = pipeline
                .dispatch(&req.command_type, req.priority, req.parameters, move || {
                    (work)()
                })
                .await;
            Ok(result)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use serde_json::json;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_service_round_trip() {
        let pipeline = Arc::new(Pipeline::new(PipelineConfig::default()).unwrap());
        let mut svc = DispatchService::new(pipeline);

        let req = DispatchRequest::new(
            "HEALTH_CHECK",
            Priority::Normal,
            Parameters::new(),
            || async { Ok(json!({"status": "UP"})) },
        );

        let result = ServiceExt::ready(&mut svc)
            .await
            .unwrap()
            .call(req)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.result["status"], "UP");
    }

    #[tokio::test]
    async fn test_service_never_errors_on_failed_work() {
        let pipeline = Arc::new(
            Pipeline::new(PipelineConfig {
                max_retries: 1,
                ..Default::default()
            })
            .unwrap(),
        );
        let mut svc = DispatchService::new(pipeline);

        let req = DispatchRequest::new("X", Priority::Normal, Parameters::new(), || async {
            Err::<Value, BoxError>("down".into())
        });

        // The work fails but the service still resolves Ok with a
        // standardized error result.
        let result = ServiceExt::ready(&mut svc)
            .await
            .unwrap()
            .call(req)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.result["error_type"], "RESILIENCE_FAILURE");
    }

    #[tokio::test]
    async fn test_requests_are_cloneable() {
        let req = DispatchRequest::new("X", Priority::High, Parameters::new(), || async {
            Ok(json!(1))
        });
        let clone = req.clone();
        assert_eq!(clone.command_type, "X");
        let _fut = (clone.work)();
    }
}
