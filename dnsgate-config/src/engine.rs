//! Policy engine tunables.
//!
//! Governs the per-VM consumer loop: sweep cadence, hub queue sizing, how
//! long a kernel-facing backend call may block, and the retry envelope for
//! transient backend failures.

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

/// Policy engine configuration parameters.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct EngineConfig {
    /// Interval between expiry sweeps (seconds).
    #[serde(default = "default_sweep_interval")]
    #[validate(range(min = 1, max = 60))]
    pub sweep_interval_secs: u64,

    /// Per-VM event queue capacity; on overflow the oldest unconsumed
    /// event is dropped.
    #[serde(default = "default_hub_capacity")]
    #[validate(range(min = 8, max = 1048576))]
    pub hub_capacity: usize,

    /// Upper bound on a single firewall backend invocation (seconds);
    /// matches the iptables `-w` lock wait.
    #[serde(default = "default_backend_timeout")]
    #[validate(range(min = 1, max = 120))]
    pub backend_timeout_secs: u64,

    /// Extra seconds a rule outlives its DNS TTL. Zero keeps expiry exactly
    /// at `observed_at + ttl`.
    #[serde(default)]
    #[validate(range(max = 600))]
    pub expiry_grace_secs: u64,

    /// Retry envelope for transient backend failures.
    #[validate(nested)]
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Bounded exponential backoff parameters.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct RetryConfig {
    /// Attempt ceiling, including the first try.
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 10))]
    pub max_attempts: u32,

    /// Delay before the first retry (milliseconds); doubles per attempt.
    #[serde(default = "default_base_delay")]
    #[validate(range(min = 10, max = 10000))]
    pub base_delay_ms: u64,

    /// Cap on any single delay (milliseconds).
    #[serde(default = "default_max_delay")]
    #[validate(range(min = 10, max = 60000))]
    pub max_delay_ms: u64,
}

fn default_sweep_interval() -> u64 {
    1
}
fn default_hub_capacity() -> usize {
    1024
}
fn default_backend_timeout() -> u64 {
    20
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay() -> u64 {
    100
}
fn default_max_delay() -> u64 {
    5000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            hub_capacity: default_hub_capacity(),
            backend_timeout_secs: default_backend_timeout(),
            expiry_grace_secs: 0,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_sweep_interval_is_rejected() {
        let config = EngineConfig {
            sweep_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
