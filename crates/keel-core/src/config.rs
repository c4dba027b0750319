use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::ConfigError;

const MAX_BACKOFF_FACTOR: f64 = 1_000.0;

/// Top-level configuration consumed by [`crate::governor::Governor`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub scheduler: SchedulerConfig,
    pub lock: LockConfig,
    pub janitor: JanitorConfig,
    pub pressure: PressureConfig,
}

impl GovernorConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let pressure = &self.pressure;
        for (name, value) in [
            ("pressure.warning_threshold", pressure.warning_threshold),
            ("pressure.critical_threshold", pressure.critical_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if pressure.warning_threshold > pressure.critical_threshold {
            return Err(ConfigError::Invalid(
                "pressure.warning_threshold must not exceed pressure.critical_threshold"
                    .to_string(),
            ));
        }
        if pressure.sample_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "pressure.sample_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.janitor.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "janitor.sweep_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.janitor.max_resources == 0 {
            return Err(ConfigError::Invalid(
                "janitor.max_resources must be non-zero".to_string(),
            ));
        }
        let factor = self.scheduler.max_backoff_factor;
        if !(1.0..=MAX_BACKOFF_FACTOR).contains(&factor) {
            return Err(ConfigError::Invalid(format!(
                "scheduler.max_backoff_factor must be within [1, {MAX_BACKOFF_FACTOR}], \
                 got {factor}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Terminated task snapshots kept for inspection.
    pub history_limit: usize,
    /// Upper bound on how far adaptive tasks stretch their period.
    pub max_backoff_factor: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            history_limit: 256,
            max_backoff_factor: 4.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub default_timeout_ms: u64,
    /// Contention count at which a lock logs a single warning.
    pub contention_warn_threshold: Option<u64>,
}

impl LockConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            contention_warn_threshold: Some(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JanitorConfig {
    pub max_resources: usize,
    pub max_idle_ms: u64,
    pub sweep_interval_ms: u64,
    pub sweep_task_id: String,
}

impl JanitorConfig {
    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            max_resources: 100,
            max_idle_ms: 5 * 60 * 1_000,
            sweep_interval_ms: 60 * 1_000,
            sweep_task_id: "resource-janitor-sweep".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureConfig {
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub sample_interval_ms: u64,
    /// Active task count that an emergency drain shrinks the scheduler to.
    pub drain_hard_cap: usize,
}

impl PressureConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 0.75,
            critical_threshold: 0.90,
            sample_interval_ms: 1_000,
            drain_hard_cap: 16,
        }
    }
}
