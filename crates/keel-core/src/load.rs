use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::config::PressureConfig;

/// Provider of a pressure reading. Must be cheap enough to call on every tick.
pub trait LoadSource: Send + Sync {
    fn pressure(&self) -> f64;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PressureLevel {
    Normal,
    Warning,
    Critical,
}

#[derive(Clone)]
pub struct LoadMonitor {
    source: Arc<dyn LoadSource>,
    warning_threshold: f64,
    critical_threshold: f64,
}

impl LoadMonitor {
    pub fn new(source: Arc<dyn LoadSource>, config: &PressureConfig) -> Self {
        Self {
            source,
            warning_threshold: config.warning_threshold,
            critical_threshold: config.critical_threshold,
        }
    }

    pub fn idle() -> Self {
        Self::new(Arc::new(StaticLoad::new(0.0)), &PressureConfig::default())
    }

    pub fn pressure(&self) -> f64 {
        clamp_pressure(self.source.pressure())
    }

    pub fn level(&self) -> PressureLevel {
        self.classify(self.pressure())
    }

    pub fn classify(&self, pressure: f64) -> PressureLevel {
        if pressure >= self.critical_threshold {
            PressureLevel::Critical
        } else if pressure >= self.warning_threshold {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }

    /// Adaptive delay: grows linearly from `base` at the warning threshold to
    /// `max_factor * base` at full pressure.
    pub fn scale_interval(&self, base: Duration, pressure: f64, max_factor: f64) -> Duration {
        let pressure = clamp_pressure(pressure);
        if pressure < self.warning_threshold || max_factor.is_nan() || max_factor <= 1.0 {
            return base;
        }
        let span = (1.0 - self.warning_threshold).max(f64::EPSILON);
        let progress = ((pressure - self.warning_threshold) / span).min(1.0);
        let factor = 1.0 + progress * (max_factor - 1.0);
        Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(Duration::MAX)
    }
}

impl std::fmt::Debug for LoadMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadMonitor")
            .field("warning_threshold", &self.warning_threshold)
            .field("critical_threshold", &self.critical_threshold)
            .finish_non_exhaustive()
    }
}

fn clamp_pressure(raw: f64) -> f64 {
    if raw.is_nan() { 0.0 } else { raw.clamp(0.0, 1.0) }
}

#[derive(Debug, Default)]
pub struct StaticLoad {
    bits: AtomicU64,
}

impl StaticLoad {
    pub fn new(pressure: f64) -> Self {
        Self {
            bits: AtomicU64::new(pressure.to_bits()),
        }
    }

    pub fn set(&self, pressure: f64) {
        self.bits.store(pressure.to_bits(), Ordering::SeqCst);
    }
}

impl LoadSource for StaticLoad {
    fn pressure(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemoryLoad;

impl LoadSource for SystemMemoryLoad {
    fn pressure(&self) -> f64 {
        #[cfg(target_os = "linux")]
        {
            std::fs::read_to_string("/proc/meminfo")
                .ok()
                .and_then(|content| meminfo_pressure(&content))
                .unwrap_or(0.0)
        }
        #[cfg(not(target_os = "linux"))]
        {
            0.0
        }
    }
}

#[cfg_attr(not(any(target_os = "linux", test)), allow(dead_code))]
fn meminfo_pressure(content: &str) -> Option<f64> {
    let mut total_kb = None;
    let mut available_kb = None;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = first_number(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = first_number(rest);
        }
    }
    let total = total_kb.filter(|total| *total > 0)?;
    let available = available_kb?.min(total);
    Some(1.0 - available as f64 / total as f64)
}

fn first_number(rest: &str) -> Option<u64> {
    rest.split_whitespace().next()?.parse().ok()
}
