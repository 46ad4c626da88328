//! Structured telemetry capture and rolling aggregates.
//!
//! What this module provides (spec)
//! - Append-only event records for every pipeline stage, plus an aggregate
//!   cache recomputed on every record
//!
//! Exports
//! - Models
//!   - `TelemetryRecord { timestamp, event, command_id, command_type, duration_ms, metadata }`
//!   - `TelemetryCache` with per-command-type sub-counters
//! - Services
//!   - `TelemetrySink` trait with `MemorySink` and `JsonlSink`
//!   - `TelemetryRecorder::record(...)` which never fails the pipeline
//! - Read modes: `Summary`, `Detailed`, `Realtime` (cache + fresh load sample)
//!
//! Recording must never take a dispatch down: sink errors are swallowed and
//! logged at debug level only.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{DispatchError, Result};
use crate::request::CommandRequest;
use crate::throttle::{LoadSample, LoadSampler};

/// Pipeline lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Start,
    Throttle,
    Complete,
    Error,
    Cancel,
}

/// One append-only telemetry record.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryRecord {
    pub timestamp: DateTime<Utc>,
    pub event: EventType,
    pub command_id: String,
    pub command_type: String,
    pub duration_ms: u64,
    pub metadata: Map<String, Value>,
}

/// Append-only destination for telemetry records.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn append(&self, record: &TelemetryRecord) -> Result<()>;
}

/// In-memory sink for tests and introspection.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<TelemetryRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<TelemetryRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn append(&self, record: &TelemetryRecord) -> Result<()> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}

/// JSON-lines file sink, one record per line. Appends are atomic at the
/// line level for a single process; concurrent writers share the lock.
pub struct JsonlSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl TelemetrySink for JsonlSink {
    async fn append(&self, record: &TelemetryRecord) -> Result<()> {
        use std::io::Write;
        let _guard = self.lock.lock().await;
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| DispatchError::Telemetry(e.to_string()))?;
        file.write_all(&line)
            .map_err(|e| DispatchError::Telemetry(e.to_string()))?;
        Ok(())
    }
}

/// Per-command-type aggregate counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TypeStats {
    pub count: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
}

/// Rolling aggregate over every recorded terminal event. Rotation/expiry is
/// an external collaborator's job; the cache itself only grows by command
/// type, not by record.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TelemetryCache {
    pub total_commands: u64,
    pub successful_commands: u64,
    pub failed_commands: u64,
    pub throttled_commands: u64,
    pub total_duration_ms: u64,
    pub per_type: BTreeMap<String, TypeStats>,
}

impl TelemetryCache {
    pub fn average_duration_ms(&self) -> f64 {
        if self.total_commands == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.total_commands as f64
        }
    }

    fn apply(&mut self, record: &TelemetryRecord) {
        match record.event {
            EventType::Start => {}
            EventType::Throttle => {
                self.throttled_commands += 1;
            }
            EventType::Complete => {
                self.total_commands += 1;
                self.successful_commands += 1;
                self.total_duration_ms += record.duration_ms;
                let stats = self.per_type.entry(record.command_type.clone()).or_default();
                stats.count += 1;
                stats.successes += 1;
                stats.total_duration_ms += record.duration_ms;
            }
            EventType::Error | EventType::Cancel => {
                self.total_commands += 1;
                self.failed_commands += 1;
                self.total_duration_ms += record.duration_ms;
                let stats = self.per_type.entry(record.command_type.clone()).or_default();
                stats.count += 1;
                stats.failures += 1;
                stats.total_duration_ms += record.duration_ms;
            }
        }
    }
}

/// How much of the telemetry state a read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Summary,
    Detailed,
    Realtime,
}

/// Telemetry read result.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "view", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TelemetryView {
    Summary {
        total_commands: u64,
        success_rate: f64,
        throttled_commands: u64,
        average_duration_ms: f64,
    },
    Detailed {
        cache: TelemetryCache,
    },
    Realtime {
        cache: TelemetryCache,
        load: LoadSample,
    },
}

/// Appends structured records and maintains the aggregate cache.
pub struct TelemetryRecorder {
    sink: Arc<dyn TelemetrySink>,
    cache: StdMutex<TelemetryCache>,
}

impl TelemetryRecorder {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            sink,
            cache: StdMutex::new(TelemetryCache::default()),
        }
    }

    /// Append one record and fold it into the cache. Never fails: sink
    /// errors are logged at debug level and swallowed.
    pub async fn record(
        &self,
        event: EventType,
        request: &CommandRequest,
        duration: Duration,
        metadata: Map<String, Value>,
    ) {
        let record = TelemetryRecord {
            timestamp: Utc::now(),
            event,
            command_id: request.id.clone(),
            command_type: request.command_type.clone(),
            duration_ms: duration.as_millis().min(u64::MAX as u128) as u64,
            metadata,
        };

        {
            let mut cache = match self.cache.lock() {
                Ok(c) => c,
                Err(poisoned) => poisoned.into_inner(),
            };
            cache.apply(&record);
        }

        if let Err(e) = self.sink.append(&record).await {
            debug!(error = %e, event = ?record.event, "telemetry append failed");
        }
    }

    /// Read telemetry state. `Realtime` needs a sampler for the fresh load
    /// reading; without one it degrades to `Detailed`.
    pub fn read(&self, mode: ReadMode, sampler: Option<&dyn LoadSampler>) -> TelemetryView {
        let cache = match self.cache.lock() {
            Ok(c) => c.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match mode {
            ReadMode::Summary => TelemetryView::Summary {
                total_commands: cache.total_commands,
                success_rate: if cache.total_commands == 0 {
                    0.0
                } else {
                    cache.successful_commands as f64 / cache.total_commands as f64
                },
                throttled_commands: cache.throttled_commands,
                average_duration_ms: cache.average_duration_ms(),
            },
            ReadMode::Detailed => TelemetryView::Detailed { cache },
            ReadMode::Realtime => match sampler {
                Some(s) => TelemetryView::Realtime {
                    load: s.sample(),
                    cache,
                },
                None => TelemetryView::Detailed { cache },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Parameters, Priority};
    use crate::throttle::FixedLoad;

    fn request(command_type: &str) -> CommandRequest {
        CommandRequest::new(command_type, Priority::Normal, Parameters::new())
    }

    fn recorder() -> (TelemetryRecorder, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        (TelemetryRecorder::new(sink.clone()), sink)
    }

    #[tokio::test]
    async fn test_records_are_appended() {
        let (rec, sink) = recorder();
        let req = request("HEALTH_CHECK");
        rec.record(EventType::Start, &req, Duration::ZERO, Map::new())
            .await;
        rec.record(
            EventType::Complete,
            &req,
            Duration::from_millis(12),
            Map::new(),
        )
        .await;

        let records = sink.records().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event, EventType::Start);
        assert_eq!(records[1].duration_ms, 12);
        assert_eq!(records[1].command_id, req.id);
    }

    #[tokio::test]
    async fn test_cache_aggregates() {
        let (rec, _) = recorder();
        let a = request("A");
        let b = request("B");
        rec.record(EventType::Complete, &a, Duration::from_millis(10), Map::new())
            .await;
        rec.record(EventType::Complete, &a, Duration::from_millis(30), Map::new())
            .await;
        rec.record(EventType::Error, &b, Duration::from_millis(20), Map::new())
            .await;
        rec.record(EventType::Throttle, &b, Duration::from_millis(5), Map::new())
            .await;

        match rec.read(ReadMode::Detailed, None) {
            TelemetryView::Detailed { cache } => {
                assert_eq!(cache.total_commands, 3);
                assert_eq!(cache.successful_commands, 2);
                assert_eq!(cache.failed_commands, 1);
                assert_eq!(cache.throttled_commands, 1);
                assert_eq!(cache.average_duration_ms(), 20.0);
                assert_eq!(cache.per_type["A"].successes, 2);
                assert_eq!(cache.per_type["B"].failures, 1);
            }
            other => panic!("expected detailed view, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_summary_view() {
        let (rec, _) = recorder();
        let req = request("A");
        rec.record(EventType::Complete, &req, Duration::from_millis(10), Map::new())
            .await;
        rec.record(EventType::Error, &req, Duration::from_millis(10), Map::new())
            .await;
        match rec.read(ReadMode::Summary, None) {
            TelemetryView::Summary {
                total_commands,
                success_rate,
                ..
            } => {
                assert_eq!(total_commands, 2);
                assert!((success_rate - 0.5).abs() < f64::EPSILON);
            }
            other => panic!("expected summary view, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_realtime_includes_load() {
        let (rec, _) = recorder();
        let sampler = FixedLoad(LoadSample {
            active: 3,
            cpu_percent: 42.0,
        });
        match rec.read(ReadMode::Realtime, Some(&sampler)) {
            TelemetryView::Realtime { load, .. } => {
                assert_eq!(load.active, 3);
            }
            other => panic!("expected realtime view, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sink_failure_is_swallowed() {
        struct FailingSink;
        #[async_trait]
        impl TelemetrySink for FailingSink {
            async fn append(&self, _record: &TelemetryRecord) -> Result<()> {
                Err(DispatchError::Telemetry("disk full".to_string()))
            }
        }

        let rec = TelemetryRecorder::new(Arc::new(FailingSink));
        let req = request("A");
        // Must not panic or propagate; cache still updates.
        rec.record(EventType::Complete, &req, Duration::from_millis(1), Map::new())
            .await;
        match rec.read(ReadMode::Summary, None) {
            TelemetryView::Summary { total_commands, .. } => assert_eq!(total_commands, 1),
            other => panic!("unexpected view {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_lines() {
        let path = std::env::temp_dir().join(format!(
            "aios-dispatch-telemetry-{}.jsonl",
            uuid::Uuid::new_v4()
        ));
        let sink = JsonlSink::new(&path);
        let req = request("A");
        let record = TelemetryRecord {
            timestamp: Utc::now(),
            event: EventType::Complete,
            command_id: req.id.clone(),
            command_type: req.command_type.clone(),
            duration_ms: 5,
            metadata: Map::new(),
        };
        sink.append(&record).await.unwrap();
        sink.append(&record).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["event"], "COMPLETE");

        let _ = std::fs::remove_file(&path);
    }
}
