//! Retry, circuit breaking, and failover against a flaky backend.
//!
//! Run with: cargo run --example resilient_inference

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aios_dispatch::{
    BoxError, ConfigBuilder, Parameters, Pipeline, ParamValue, Priority, ReadMode,
};
use serde_json::{json, Value};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = ConfigBuilder::new()
        .max_retries(3)
        .base_delay(Duration::from_millis(100))
        .circuit_breaker(3, Duration::from_secs(5))
        .enable_failover(true)
        .build();
    let pipeline = Pipeline::new(config)?;

    // A backend that fails its first two calls, then recovers.
    let calls = Arc::new(AtomicUsize::new(0));

    let mut params = Parameters::new();
    params.insert(
        "prompt".to_string(),
        ParamValue::Str("summarize the incident report".to_string()),
    );
    params.insert("max_tokens".to_string(), ParamValue::Int(512));

    let calls_cl = calls.clone();
    let result = pipeline
        .dispatch("AI_INFERENCE", Priority::High, params, move || {
            let n = calls_cl.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err::<Value, BoxError>("upstream timed out".into())
                } else {
                    Ok(json!({ "text": "Summary: the incident is resolved." }))
                }
            }
        })
        .await;

    println!("attempts: {}", result.attempts);
    println!("result:   {}", serde_json::to_string_pretty(&result.result)?);

    // A backend that stays down: retries exhaust, failover answers.
    let result = pipeline
        .dispatch("AI_INFERENCE", Priority::Normal, Parameters::new(), || async {
            Err::<Value, BoxError>("upstream unreachable".into())
        })
        .await;

    println!("\nfailover_used: {}", result.failover_used);
    println!("result:        {}", serde_json::to_string_pretty(&result.result)?);

    println!("\ntelemetry: {:#?}", pipeline.telemetry(ReadMode::Detailed));
    Ok(())
}
