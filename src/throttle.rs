//! Adaptive admission throttling.
//!
//! Converts a load sample into a bounded admission delay. The decision is
//! deterministic given the sampled load and never blocks indefinitely: any
//! delay is capped at `max_delay`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::request::{CommandRequest, ExecutionContext, Priority};

/// Snapshot of system pressure at admission time.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct LoadSample {
    /// Concurrent units of work currently active.
    pub active: usize,
    /// CPU utilization, 0.0..=100.0.
    pub cpu_percent: f32,
}

/// Reads current concurrency/CPU pressure from the environment.
pub trait LoadSampler: Send + Sync {
    fn sample(&self) -> LoadSample;
}

/// Fixed sample, for tests and offline replay.
#[derive(Debug, Clone, Copy)]
pub struct FixedLoad(pub LoadSample);

impl LoadSampler for FixedLoad {
    fn sample(&self) -> LoadSample {
        self.0
    }
}

/// Sampler backed by the pipeline's own in-flight counter plus an injectable
/// CPU reading.
///
/// The CPU source is a plain closure so callers can wire in whatever their
/// platform offers; the default reports 0%.
#[derive(Clone)]
pub struct PipelineGauge {
    in_flight: Arc<AtomicUsize>,
    cpu_source: Arc<dyn Fn() -> f32 + Send + Sync>,
}

impl Default for PipelineGauge {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineGauge {
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(AtomicUsize::new(0)),
            cpu_source: Arc::new(|| 0.0),
        }
    }

    pub fn with_cpu_source(f: impl Fn() -> f32 + Send + Sync + 'static) -> Self {
        Self {
            in_flight: Arc::new(AtomicUsize::new(0)),
            cpu_source: Arc::new(f),
        }
    }

    /// Shared counter the pipeline increments around work execution.
    pub(crate) fn counter(&self) -> Arc<AtomicUsize> {
        self.in_flight.clone()
    }
}

impl LoadSampler for PipelineGauge {
    fn sample(&self) -> LoadSample {
        LoadSample {
            active: self.in_flight.load(Ordering::Relaxed),
            cpu_percent: (self.cpu_source)(),
        }
    }
}

/// Advisory scheduling hint emitted under load for High/Critical commands.
///
/// Best-effort only: consumers may deprioritize in-flight background work,
/// but nothing in the pipeline depends on the hint having any effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityHint {
    None,
    DeprioritizeBackground,
}

/// Outcome of the admission decision.
#[derive(Debug, Clone, Copy)]
pub struct Admission {
    pub context: ExecutionContext,
    pub hint: PriorityHint,
}

/// Load-based admission control.
#[derive(Debug, Clone, Copy)]
pub struct Throttle {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_concurrency: usize,
    pub cpu_threshold: f32,
}

impl Throttle {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            max_concurrency: config.max_concurrency,
            cpu_threshold: config.cpu_threshold,
        }
    }

    /// Admission decision for one request given a load sample.
    pub fn admit(&self, request: &CommandRequest, load: LoadSample) -> Admission {
        let overloaded =
            load.active >= self.max_concurrency || load.cpu_percent > self.cpu_threshold;

        let delay = if overloaded {
            let overload_factor: u32 = load
                .active
                .saturating_sub(self.max_concurrency)
                .saturating_add(1)
                .max(1)
                .min(u32::MAX as usize) as u32;
            let cpu_factor: u32 = if load.cpu_percent > self.cpu_threshold {
                2
            } else {
                1
            };
            let factor = overload_factor.saturating_mul(cpu_factor);
            self.base_delay
                .checked_mul(factor)
                .unwrap_or(self.max_delay)
                .min(self.max_delay)
        } else {
            Duration::ZERO
        };

        let hint = if request.priority >= Priority::High && load.active > 0 {
            PriorityHint::DeprioritizeBackground
        } else {
            PriorityHint::None
        };

        Admission {
            context: ExecutionContext {
                throttled: !delay.is_zero(),
                delay_applied: delay,
                active_load_at_admission: load.active,
            },
            hint,
        }
    }
}

/// RAII guard for the in-flight gauge.
pub(crate) struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl InFlightGuard {
    pub(crate) fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self {
            counter: counter.clone(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}
