use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::GovernorConfig;
use crate::janitor::ResourceJanitor;
use crate::load::{LoadMonitor, LoadSource, PressureLevel};
use crate::models::{JanitorError, ShutdownReport};
use crate::orchestration::TaskScheduler;
use crate::sync::ExclusiveLock;

pub struct Governor {
    config: GovernorConfig,
    responder: PressureResponder,
    watch: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
struct PressureResponder {
    monitor: LoadMonitor,
    scheduler: TaskScheduler,
    janitor: ResourceJanitor,
    drain_hard_cap: usize,
    sweep_task_id: String,
}

impl Governor {
    /// Builds the monitor, scheduler and janitor. Must run inside a tokio
    /// runtime since the janitor arms its sweep task immediately.
    pub fn new(config: GovernorConfig, source: Arc<dyn LoadSource>) -> Result<Self, JanitorError> {
        let monitor = LoadMonitor::new(source, &config.pressure);
        let scheduler = TaskScheduler::new(monitor.clone(), config.scheduler.clone());
        let janitor = ResourceJanitor::new(config.janitor.clone(), scheduler.clone())?;

        Ok(Self {
            responder: PressureResponder {
                monitor,
                scheduler,
                janitor,
                drain_hard_cap: config.pressure.drain_hard_cap,
                sweep_task_id: config.janitor.sweep_task_id.clone(),
            },
            config,
            watch: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.responder.scheduler
    }

    pub fn janitor(&self) -> &ResourceJanitor {
        &self.responder.janitor
    }

    pub fn monitor(&self) -> &LoadMonitor {
        &self.responder.monitor
    }

    pub fn new_lock(&self, name: impl Into<String>) -> ExclusiveLock {
        ExclusiveLock::from_config(name, &self.config.lock)
    }

    pub fn check_pressure(&self) -> PressureLevel {
        self.responder.respond().0
    }

    pub fn start_pressure_watch(&self) -> bool {
        let mut watch = self.watch.lock().unwrap_or_else(PoisonError::into_inner);
        if watch.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        let responder = self.responder.clone();
        let interval = self.config.pressure.sample_interval();
        *watch = Some(tokio::spawn(run_pressure_watch(responder, interval)));
        true
    }

    fn stop_pressure_watch(&self) {
        let handle = self
            .watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            debug!("pressure watch stopped");
        }
    }

    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.stop_pressure_watch();
        let report = self.responder.scheduler.shutdown(grace).await;
        self.responder.janitor.dispose();
        report
    }
}

impl Drop for Governor {
    fn drop(&mut self) {
        self.stop_pressure_watch();
    }
}

impl PressureResponder {
    fn respond(&self) -> (PressureLevel, f64) {
        let pressure = self.monitor.pressure();
        let level = self.monitor.classify(pressure);
        if level == PressureLevel::Critical {
            let spared = [self.sweep_task_id.as_str()];
            let drained = self
                .scheduler
                .emergency_drain_sparing(self.drain_hard_cap, &spared);
            let evicted = self.janitor.emergency_evict();
            if let Err(error) = self.janitor.ensure_sweep() {
                debug!(error = %error, "idle sweep not re-armed after drain");
            }
            if !drained.is_empty() || !evicted.is_empty() {
                warn!(
                    pressure,
                    drained = drained.len(),
                    evicted = evicted.len(),
                    "critical pressure; shed scheduled work and resources"
                );
            }
        }
        (level, pressure)
    }
}

async fn run_pressure_watch(responder: PressureResponder, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_level = PressureLevel::Normal;
    info!(interval_ms = interval.as_millis() as u64, "pressure watch started");

    loop {
        ticker.tick().await;
        let (level, pressure) = responder.respond();
        if level == last_level {
            continue;
        }
        match level {
            PressureLevel::Warning => warn!(pressure, "pressure: WARNING"),
            PressureLevel::Critical => warn!(pressure, "pressure: CRITICAL"),
            PressureLevel::Normal => info!(pressure, "pressure: cleared"),
        }
        last_level = level;
    }
}
