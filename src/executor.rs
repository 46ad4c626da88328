//! Resilient execution: bounded retries, backoff, breaker consultation.
//!
//! Every command type in the system funnels through this one executor rather
//! than carrying its own ad hoc retry loop. The unit of work is an opaque
//! async closure returning `Result<Value, BoxError>`; the executor only needs
//! success/failure signaling and a result value.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::{sleep, Instant};
use tower::BoxError;
use tracing::{debug, warn};

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::config::PipelineConfig;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub kind: BackoffKind,
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn fixed(base: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base,
            max: base,
        }
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base,
            max,
        }
    }

    /// Delay after the given failed attempt (1-based):
    /// `min(base * 2^(attempt-1), max)` for exponential, else `base`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self.kind {
            BackoffKind::Fixed => self.base,
            BackoffKind::Exponential => {
                let shift = attempt.saturating_sub(1).min(31) as u32;
                self.base
                    .checked_mul(1u32 << shift)
                    .unwrap_or(self.max)
                    .min(self.max)
            }
        }
    }
}

/// Terminal outcome of one execution.
#[derive(Debug)]
pub enum WorkOutcome {
    Success(Value),
    /// All retries spent; carries the last error.
    Exhausted(BoxError),
    /// Breaker was open; work was never invoked.
    BreakerOpen { retry_after: Duration },
    /// Caller deadline hit at a suspension point.
    Cancelled,
}

/// What happened, how many attempts it took, and whether the breaker was
/// involved.
#[derive(Debug)]
pub struct ExecutionReport {
    pub outcome: WorkOutcome,
    pub attempts: usize,
    pub circuit_tripped: bool,
}

/// Runs a unit of work with bounded retries and backoff, consulting and
/// updating the circuit breaker when one is attached.
pub struct RetryExecutor {
    max_retries: usize,
    backoff: Backoff,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl RetryExecutor {
    pub fn new(max_retries: usize, backoff: Backoff, breaker: Option<Arc<CircuitBreaker>>) -> Self {
        Self {
            max_retries,
            backoff,
            breaker,
        }
    }

    pub fn from_config(config: &PipelineConfig, breaker: Option<Arc<CircuitBreaker>>) -> Self {
        let backoff = if config.enable_exponential_backoff {
            Backoff::exponential(config.base_delay, config.max_delay)
        } else {
            Backoff::fixed(config.base_delay)
        };
        Self::new(config.max_retries, backoff, breaker)
    }

    /// Execute `work` up to `max_retries` times.
    ///
    /// The breaker is checked once before the first attempt; open means the
    /// work is never invoked. Each failure is recorded against the breaker,
    /// the first success resets it. Backoff sleeps abort at the deadline.
    pub async fn execute<F, Fut>(
        &self,
        command_type: &str,
        deadline: Option<Instant>,
        mut work: F,
    ) -> Result<ExecutionReport>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<Value, BoxError>>,
    {
        if let Some(breaker) = &self.breaker {
            if let BreakerState::Open { retry_after } = breaker.check(command_type).await? {
                debug!(command_type, ?retry_after, "short-circuited by open breaker");
                return Ok(ExecutionReport {
                    outcome: WorkOutcome::BreakerOpen { retry_after },
                    attempts: 0,
                    circuit_tripped: true,
                });
            }
        }

        let mut circuit_tripped = false;
        let mut attempt = 0usize;

        loop {
            attempt += 1;

            if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                return Ok(ExecutionReport {
                    outcome: WorkOutcome::Cancelled,
                    attempts: attempt - 1,
                    circuit_tripped,
                });
            }

            match work().await {
                Ok(value) => {
                    if let Some(breaker) = &self.breaker {
                        breaker.record_success(command_type).await?;
                    }
                    if attempt > 1 {
                        debug!(command_type, attempt, "work succeeded after retries");
                    }
                    return Ok(ExecutionReport {
                        outcome: WorkOutcome::Success(value),
                        attempts: attempt,
                        circuit_tripped,
                    });
                }
                Err(error) => {
                    if let Some(breaker) = &self.breaker {
                        let count = breaker.record_failure(command_type).await?;
                        if count >= breaker.threshold() {
                            circuit_tripped = true;
                        }
                    }

                    if attempt >= self.max_retries {
                        warn!(
                            command_type,
                            attempts = attempt,
                            %error,
                            "retries exhausted"
                        );
                        return Ok(ExecutionReport {
                            outcome: WorkOutcome::Exhausted(error),
                            attempts: attempt,
                            circuit_tripped,
                        });
                    }

                    let delay = self.backoff.delay_for_attempt(attempt);
                    if let Some(d) = deadline {
                        if Instant::now() + delay >= d {
                            return Ok(ExecutionReport {
                                outcome: WorkOutcome::Cancelled,
                                attempts: attempt,
                                circuit_tripped,
                            });
                        }
                    }
                    debug!(command_type, attempt, ?delay, %error, "attempt failed, backing off");
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::MemoryBreakerStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn executor(max_retries: usize) -> RetryExecutor {
        RetryExecutor::new(
            max_retries,
            Backoff::exponential(Duration::from_millis(1), Duration::from_millis(8)),
            None,
        )
    }

    #[test]
    fn test_backoff_schedule() {
        let b = Backoff::exponential(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(b.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(b.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(b.delay_for_attempt(3), Duration::from_millis(350)); // capped
        assert_eq!(b.delay_for_attempt(40), Duration::from_millis(350));

        let f = Backoff::fixed(Duration::from_millis(100));
        assert_eq!(f.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(f.delay_for_attempt(5), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let report = executor(3)
            .execute("HEALTH_CHECK", None, || async { Ok(json!({"status": "UP"})) })
            .await
            .unwrap();
        assert_eq!(report.attempts, 1);
        assert!(matches!(report.outcome, WorkOutcome::Success(_)));
        assert!(!report.circuit_tripped);
    }

    #[tokio::test]
    async fn test_eventual_success_counts_attempts() {
        let calls = AtomicUsize::new(0);
        let report = executor(3)
            .execute("X", None, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err::<Value, BoxError>("transient".into())
                    } else {
                        Ok(json!(1))
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(report.attempts, 3);
        assert!(matches!(report.outcome, WorkOutcome::Success(_)));
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let report = executor(2)
            .execute("X", None, || async {
                Err::<Value, BoxError>("backend down".into())
            })
            .await
            .unwrap();
        assert_eq!(report.attempts, 2);
        match report.outcome {
            WorkOutcome::Exhausted(e) => assert!(e.to_string().contains("backend down")),
            other => panic!("expected exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_breaker_skips_work() {
        let breaker = Arc::new(CircuitBreaker::new(
            Arc::new(MemoryBreakerStore::new()),
            1,
            Duration::from_secs(60),
        ));
        breaker.record_failure("X").await.unwrap();

        let exec = RetryExecutor::new(3, Backoff::fixed(Duration::from_millis(1)), Some(breaker));
        let calls = AtomicUsize::new(0);
        let report = exec
            .execute("X", None, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(json!(null)) }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.attempts, 0);
        assert!(report.circuit_tripped);
        assert!(matches!(report.outcome, WorkOutcome::BreakerOpen { .. }));
    }

    #[tokio::test]
    async fn test_breaker_trips_during_execution() {
        let breaker = Arc::new(CircuitBreaker::new(
            Arc::new(MemoryBreakerStore::new()),
            2,
            Duration::from_secs(60),
        ));
        let exec = RetryExecutor::new(
            3,
            Backoff::fixed(Duration::from_millis(1)),
            Some(breaker.clone()),
        );
        let report = exec
            .execute("X", None, || async {
                Err::<Value, BoxError>("down".into())
            })
            .await
            .unwrap();
        assert!(report.circuit_tripped);
        assert!(matches!(
            breaker.check("X").await.unwrap(),
            BreakerState::Open { .. }
        ));
    }

    #[tokio::test]
    async fn test_success_resets_breaker() {
        let breaker = Arc::new(CircuitBreaker::new(
            Arc::new(MemoryBreakerStore::new()),
            3,
            Duration::from_secs(60),
        ));
        breaker.record_failure("X").await.unwrap();
        breaker.record_failure("X").await.unwrap();

        let exec = RetryExecutor::new(
            1,
            Backoff::fixed(Duration::from_millis(1)),
            Some(breaker.clone()),
        );
        exec.execute("X", None, || async { Ok(json!(null)) })
            .await
            .unwrap();

        // Count went back to zero: one new failure is not enough to open.
        breaker.record_failure("X").await.unwrap();
        assert_eq!(breaker.check("X").await.unwrap(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_deadline_cancels_at_backoff() {
        let exec = RetryExecutor::new(
            5,
            Backoff::fixed(Duration::from_millis(200)),
            None,
        );
        let deadline = Instant::now() + Duration::from_millis(50);
        let started = std::time::Instant::now();
        let report = exec
            .execute("X", Some(deadline), || async {
                Err::<Value, BoxError>("down".into())
            })
            .await
            .unwrap();
        assert!(matches!(report.outcome, WorkOutcome::Cancelled));
        // Aborted at the delay boundary instead of sleeping through it.
        assert!(started.elapsed() < Duration::from_millis(150));
    }
}
