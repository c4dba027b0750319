use std::time::Duration;

use crate::models::{ResourceId, TaskId};

/// Boxed error returned by callbacks and cleanup hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FailureKind {
    Failed(String),
    Panicked(String),
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(message) => write!(f, "returned error: {message}"),
            Self::Panicked(message) => write!(f, "panicked: {message}"),
        }
    }
}

/// A task callback failed. Logged and counted; the task keeps running.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("task '{task_id}' callback {kind} (run {run_count})")]
pub struct TaskCallbackError {
    pub task_id: TaskId,
    pub run_count: u64,
    pub kind: FailureKind,
}

/// An acquire did not obtain the lock before its deadline.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error(
    "lock '{lock}' not acquired within {timeout:?} (holder: {}, queue depth: {queue_depth})",
    .holder.as_deref().unwrap_or("<untagged>")
)]
pub struct LockTimeoutError {
    pub lock: String,
    pub holder: Option<String>,
    pub queue_depth: usize,
    pub timeout: Duration,
}

/// A resource's cleanup hook failed during unregister. The record is removed
/// from tracking regardless.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("cleanup of resource '{resource_id}' {kind}")]
pub struct ResourceCleanupError {
    pub resource_id: ResourceId,
    pub kind: FailureKind,
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler is shutting down; task '{0}' was not registered")]
    ShuttingDown(TaskId),
    #[error("periodic task '{0}' needs a non-zero period")]
    InvalidPeriod(TaskId),
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum JanitorError {
    #[error("resource janitor has been disposed; '{0}' was not registered")]
    Disposed(ResourceId),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Renders a panic payload from a failed join or `catch_unwind`.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
