//! Per-command-type circuit breaking over a durable key-value store.
//!
//! State machine per command type: CLOSED (normal) -> `failure_count >=
//! threshold` within the timeout window -> OPEN (reject immediately, carry
//! `retry_after`) -> timeout elapses -> record deleted, implicitly CLOSED.
//! A success while CLOSED deletes the record as well.
//!
//! The store is an injected abstraction so the breaker logic is testable
//! without a filesystem; a JSON-file implementation is provided for the
//! single-node durable case.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::error::Result;

/// Durable failure record for one command type.
///
/// Timestamps are millisecond unix epoch so file-backed stores round-trip
/// without timezone ambiguity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerRecord {
    pub failure_count: u32,
    pub first_failure_ms: i64,
    pub last_failure_ms: i64,
}

/// Derived breaker state at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open { retry_after: Duration },
}

/// Key-value persistence for breaker records.
#[async_trait]
pub trait BreakerStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<BreakerRecord>>;
    async fn set(&self, key: &str, record: BreakerRecord) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory store, the default for process-local breakers and tests.
#[derive(Default)]
pub struct MemoryBreakerStore {
    map: Mutex<HashMap<String, BreakerRecord>>,
}

impl MemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BreakerStore for MemoryBreakerStore {
    async fn get(&self, key: &str) -> Result<Option<BreakerRecord>> {
        Ok(self.map.lock().await.get(key).copied())
    }

    async fn set(&self, key: &str, record: BreakerRecord) -> Result<()> {
        self.map.lock().await.insert(key.to_string(), record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.map.lock().await.remove(key);
        Ok(())
    }
}

/// File-backed store: one JSON document holding every record, written with a
/// tmp-then-rename so readers never observe a partial file.
pub struct JsonFileBreakerStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileBreakerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn load_all(&self) -> Result<HashMap<String, BreakerRecord>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    fn store_all(&self, map: &HashMap<String, BreakerRecord>) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(map)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl BreakerStore for JsonFileBreakerStore {
    async fn get(&self, key: &str) -> Result<Option<BreakerRecord>> {
        let _guard = self.lock.lock().await;
        Ok(self.load_all()?.get(key).copied())
    }

    async fn set(&self, key: &str, record: BreakerRecord) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut map = self.load_all()?;
        map.insert(key.to_string(), record);
        self.store_all(&map)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut map = self.load_all()?;
        if map.remove(key).is_some() {
            self.store_all(&map)?;
        }
        Ok(())
    }
}

/// Circuit breaker keyed by command type.
pub struct CircuitBreaker {
    store: Arc<dyn BreakerStore>,
    threshold: u32,
    timeout: Duration,
    /// Serializes read-modify-write so concurrent dispatches of the same
    /// command type never undercount failures.
    update: Mutex<()>,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn BreakerStore>, threshold: u32, timeout: Duration) -> Self {
        Self {
            store,
            threshold,
            timeout,
            update: Mutex::new(()),
        }
    }

    pub fn from_config(store: Arc<dyn BreakerStore>, config: &PipelineConfig) -> Self {
        Self::new(
            store,
            config.circuit_breaker_threshold,
            config.circuit_breaker_timeout,
        )
    }

    /// Current state for a command type. Expired records are deleted as a
    /// side effect (delete-on-expiry).
    pub async fn check(&self, command_type: &str) -> Result<BreakerState> {
        let Some(record) = self.store.get(command_type).await? else {
            return Ok(BreakerState::Closed);
        };

        let timeout_ms = duration_ms(self.timeout);
        let elapsed = now_ms().saturating_sub(record.last_failure_ms);

        if elapsed >= timeout_ms {
            debug!(command_type, "breaker cooldown elapsed, clearing record");
            self.store.delete(command_type).await?;
            return Ok(BreakerState::Closed);
        }

        if record.failure_count >= self.threshold {
            let retry_after = Duration::from_millis((timeout_ms - elapsed).max(0) as u64);
            return Ok(BreakerState::Open { retry_after });
        }

        Ok(BreakerState::Closed)
    }

    /// Record one failure. Returns the updated failure count.
    pub async fn record_failure(&self, command_type: &str) -> Result<u32> {
        let _guard = self.update.lock().await;
        let now = now_ms();
        let record = match self.store.get(command_type).await? {
            // A stale window restarts counting rather than accumulating.
            Some(r) if now.saturating_sub(r.last_failure_ms) < duration_ms(self.timeout) => {
                BreakerRecord {
                    failure_count: r.failure_count.saturating_add(1),
                    first_failure_ms: r.first_failure_ms,
                    last_failure_ms: now,
                }
            }
            _ => BreakerRecord {
                failure_count: 1,
                first_failure_ms: now,
                last_failure_ms: now,
            },
        };
        self.store.set(command_type, record).await?;
        if record.failure_count == self.threshold {
            info!(
                command_type,
                failures = record.failure_count,
                "circuit breaker opened"
            );
        }
        Ok(record.failure_count)
    }

    /// A success while closed resets the failure count.
    pub async fn record_success(&self, command_type: &str) -> Result<()> {
        let _guard = self.update.lock().await;
        self.store.delete(command_type).await
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
