//! Keel host harness: `keel [config.json]`.

use std::process;
use std::sync::Arc;
use std::time::Duration;

use keel_core::config::GovernorConfig;
use keel_core::governor::Governor;
use keel_core::load::SystemMemoryLoad;
use keel_core::logging::init_logging;
use keel_core::models::BoxError;
use keel_core::orchestration::{PeriodicTask, TaskScheduler};
use tracing::{error, info};

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    init_logging("info");

    let config = match std::env::args().nth(1) {
        Some(path) => match GovernorConfig::from_path(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading config {path}: {e}");
                process::exit(2);
            }
        },
        None => GovernorConfig::default(),
    };

    let governor = match Governor::new(config, Arc::new(SystemMemoryLoad)) {
        Ok(governor) => governor,
        Err(e) => {
            eprintln!("Error starting governor: {e}");
            process::exit(1);
        }
    };
    governor.start_pressure_watch();

    if let Err(e) = register_heartbeat(governor.scheduler()) {
        error!(error = %e, "heartbeat task not registered");
    }
    info!(pressure = governor.monitor().pressure(), "keel running; press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C; shutting down");
    }

    let report = governor.shutdown(SHUTDOWN_GRACE).await;
    match serde_json::to_string(&report) {
        Ok(json) => info!(report = %json, "keel stopped"),
        Err(e) => error!(error = %e, "failed to encode shutdown report"),
    }
}

fn register_heartbeat(scheduler: &TaskScheduler) -> Result<(), BoxError> {
    let handle = scheduler.clone();
    scheduler.register_periodic(
        PeriodicTask::new(HEARTBEAT_PERIOD, move || {
            let scheduler = handle.clone();
            async move {
                let diagnostics = serde_json::to_string(&scheduler.diagnostics())?;
                info!(diagnostics = %diagnostics, "heartbeat");
                Ok::<(), BoxError>(())
            }
        })
        .id("keel-heartbeat"),
    )?;
    Ok(())
}
