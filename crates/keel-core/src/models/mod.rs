pub mod error;
pub mod resource;
pub mod task;

pub use error::{
    BoxError, ConfigError, FailureKind, JanitorError, LockTimeoutError, ResourceCleanupError,
    SchedulerError, TaskCallbackError,
};
pub use resource::{ResourceId, ResourceStats};
pub use task::{
    SchedulerDiagnostics, ShutdownReport, TaskId, TaskKind, TaskPolicy, TaskSnapshot, TaskStatus,
    TerminationReason,
};
