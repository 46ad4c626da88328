//! Configuration for the dispatch pipeline.
//!
//! One [`PipelineConfig`] covers every stage: retry/backoff bounds, circuit
//! breaker thresholds, throttle limits, and the response size cap. Configs
//! can come from `Default`, the builder, environment variables, or a TOML
//! file.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DispatchError, Result};

/// Pipeline-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum work attempts per dispatch (first try included).
    pub max_retries: usize,

    /// Base delay between attempts, and base admission delay unit.
    pub base_delay: Duration,

    /// Upper bound for any single backoff or admission delay.
    pub max_delay: Duration,

    /// Failures within the timeout window before the breaker opens.
    pub circuit_breaker_threshold: u32,

    /// Cooldown after which an open breaker resets to closed.
    pub circuit_breaker_timeout: Duration,

    /// Exponential backoff between attempts; constant `base_delay` otherwise.
    pub enable_exponential_backoff: bool,

    pub enable_circuit_breaker: bool,

    /// Degraded fallback responses after retry exhaustion (opt-in).
    pub enable_failover: bool,

    /// Concurrency level above which admission delays kick in.
    pub max_concurrency: usize,

    /// Serialized responses larger than this are replaced with a
    /// `RESPONSE_SIZE_LIMIT` error.
    pub max_response_bytes: usize,

    /// CPU percentage above which admission delays kick in.
    pub cpu_threshold: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(60),
            enable_exponential_backoff: true,
            enable_circuit_breaker: true,
            enable_failover: false,
            max_concurrency: 8,
            max_response_bytes: 1024 * 1024,
            cpu_threshold: 85.0,
        }
    }
}

impl PipelineConfig {
    /// Basic sanity checks; called by the pipeline builder.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(DispatchError::InvalidConfig(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(DispatchError::InvalidConfig(
                "max_delay must be >= base_delay".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(DispatchError::InvalidConfig(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.max_response_bytes == 0 {
            return Err(DispatchError::InvalidConfig(
                "max_response_bytes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration builder.
pub struct ConfigBuilder {
    config: PipelineConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
        }
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn circuit_breaker(mut self, threshold: u32, timeout: Duration) -> Self {
        self.config.circuit_breaker_threshold = threshold;
        self.config.circuit_breaker_timeout = timeout;
        self
    }

    pub fn exponential_backoff(mut self, enabled: bool) -> Self {
        self.config.enable_exponential_backoff = enabled;
        self
    }

    pub fn enable_circuit_breaker(mut self, enabled: bool) -> Self {
        self.config.enable_circuit_breaker = enabled;
        self
    }

    pub fn enable_failover(mut self, enabled: bool) -> Self {
        self.config.enable_failover = enabled;
        self
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.config.max_concurrency = n;
        self
    }

    pub fn max_response_bytes(mut self, bytes: usize) -> Self {
        self.config.max_response_bytes = bytes;
        self
    }

    pub fn cpu_threshold(mut self, percent: f32) -> Self {
        self.config.cpu_threshold = percent;
        self
    }

    pub fn build(self) -> PipelineConfig {
        self.config
    }
}

/// Load configuration from `AIOS_DISPATCH_*` environment variables.
///
/// Unset or unparsable variables leave the default in place.
pub fn from_env() -> PipelineConfig {
    let mut config = PipelineConfig::default();

    if let Ok(v) = std::env::var("AIOS_DISPATCH_MAX_RETRIES") {
        if let Ok(n) = v.parse::<usize>() {
            config.max_retries = n;
        }
    }

    if let Ok(v) = std::env::var("AIOS_DISPATCH_BASE_DELAY_MS") {
        if let Ok(ms) = v.parse::<u64>() {
            config.base_delay = Duration::from_millis(ms);
        }
    }

    if let Ok(v) = std::env::var("AIOS_DISPATCH_MAX_DELAY_MS") {
        if let Ok(ms) = v.parse::<u64>() {
            config.max_delay = Duration::from_millis(ms);
        }
    }

    if let Ok(v) = std::env::var("AIOS_DISPATCH_BREAKER_THRESHOLD") {
        if let Ok(n) = v.parse::<u32>() {
            config.circuit_breaker_threshold = n;
        }
    }

    if let Ok(v) = std::env::var("AIOS_DISPATCH_BREAKER_TIMEOUT_MS") {
        if let Ok(ms) = v.parse::<u64>() {
            config.circuit_breaker_timeout = Duration::from_millis(ms);
        }
    }

    if let Ok(v) = std::env::var("AIOS_DISPATCH_MAX_CONCURRENCY") {
        if let Ok(n) = v.parse::<usize>() {
            config.max_concurrency = n;
        }
    }

    if let Ok(v) = std::env::var("AIOS_DISPATCH_FAILOVER") {
        config.enable_failover = v == "1" || v.eq_ignore_ascii_case("true");
    }

    config
}

/// Load configuration from a TOML file.
pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<PipelineConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: PipelineConfig =
        toml::from_str(&contents).map_err(|e| DispatchError::InvalidConfig(e.to_string()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.circuit_breaker_threshold, 5);
        assert!(config.enable_circuit_breaker);
        assert!(!config.enable_failover);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .max_retries(5)
            .base_delay(Duration::from_millis(50))
            .circuit_breaker(3, Duration::from_secs(30))
            .enable_failover(true)
            .max_concurrency(2)
            .build();

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_delay, Duration::from_millis(50));
        assert_eq!(config.circuit_breaker_threshold, 3);
        assert!(config.enable_failover);
        assert_eq!(config.max_concurrency, 2);
    }

    #[test]
    fn test_validate_rejects_zero_retries() {
        let config = ConfigBuilder::new().max_retries(0).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let config = ConfigBuilder::new()
            .base_delay(Duration::from_secs(5))
            .max_delay(Duration::from_secs(1))
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = PipelineConfig::default();
        let text = toml::to_string(&config).unwrap();
        let back: PipelineConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.max_retries, config.max_retries);
        assert_eq!(back.base_delay, config.base_delay);
    }
}
