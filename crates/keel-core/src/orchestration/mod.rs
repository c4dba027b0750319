pub mod runnable;
pub mod scheduler;

pub use runnable::{CallbackResult, Runnable, TaskFuture};
pub use scheduler::{DeferredTask, PeriodicTask, TaskScheduler};
