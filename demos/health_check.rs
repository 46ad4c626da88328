//! Minimal dispatch: one HEALTH_CHECK command through the default pipeline.
//!
//! Run with: cargo run --example health_check

use aios_dispatch::{Parameters, Pipeline, PipelineConfig, Priority, ReadMode};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let pipeline = Pipeline::new(PipelineConfig::default())?;

    let result = pipeline
        .dispatch("HEALTH_CHECK", Priority::Normal, Parameters::new(), || async {
            Ok(json!({
                "status": "UP",
                "uptime_secs": 86_400,
                "internal_debug": "never shown to callers",
            }))
        })
        .await;

    println!("success:  {}", result.success);
    println!("attempts: {}", result.attempts);
    println!("duration: {}ms", result.duration_ms);
    println!("result:   {}", serde_json::to_string_pretty(&result.result)?);

    println!("\ntelemetry: {:#?}", pipeline.telemetry(ReadMode::Summary));
    Ok(())
}
