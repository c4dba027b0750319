use std::borrow::Borrow;
use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for TaskId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
pub enum TaskKind {
    Periodic,
    Deferred,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
pub enum TaskStatus {
    Active,
    Terminated,
}

/// Why a task left the active registry.
///
/// The first four variants are policy outcomes and are listed in the order
/// used to break ties when several conditions hold on the same tick.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
pub enum TerminationReason {
    MaxRuns,
    Ttl,
    Pressure,
    Manual,
    /// A deferred task ran its single execution.
    Fired,
    Cancelled,
    Replaced,
    Drained,
    Shutdown,
}

impl Display for TerminationReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::MaxRuns => "max_runs",
            Self::Ttl => "ttl",
            Self::Pressure => "pressure",
            Self::Manual => "manual",
            Self::Fired => "fired",
            Self::Cancelled => "cancelled",
            Self::Replaced => "replaced",
            Self::Drained => "drained",
            Self::Shutdown => "shutdown",
        };
        f.write_str(label)
    }
}

/// Termination policy for a periodic task. Every field is optional; a task
/// with the default policy runs until cancelled, drained or shut down.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TaskPolicy {
    pub max_runs: Option<u64>,
    pub ttl: Option<Duration>,
    /// The task terminates once the sampled pressure is strictly above this.
    pub pressure_limit: Option<f64>,
    /// Stretch the delay between ticks while the host is under pressure.
    pub adaptive_interval: bool,
}

impl TaskPolicy {
    pub fn with_max_runs(mut self, max_runs: u64) -> Self {
        self.max_runs = Some(max_runs);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_pressure_limit(mut self, limit: f64) -> Self {
        self.pressure_limit = Some(limit);
        self
    }

    pub fn with_adaptive_interval(mut self) -> Self {
        self.adaptive_interval = true;
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub kind: TaskKind,
    pub period: Duration,
    pub created_at: Instant,
    pub last_run_at: Option<Instant>,
    pub run_count: u64,
    pub failure_count: u64,
    pub policy: TaskPolicy,
    pub manual_completion: bool,
    pub status: TaskStatus,
    pub termination_reason: Option<TerminationReason>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SchedulerDiagnostics {
    pub total_timers: usize,
    pub periodic_count: usize,
    pub deferred_count: usize,
    pub oldest_task_age_ms: Option<u64>,
    pub total_executions: u64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ShutdownReport {
    /// Tasks that terminated on their own during the grace window.
    pub completed_in_grace: usize,
    /// Tasks still active when the grace window closed.
    pub force_cancelled: Vec<TaskId>,
}
