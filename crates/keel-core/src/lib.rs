pub mod config;
pub mod governor;
pub mod janitor;
pub mod load;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod sync;
pub(crate) mod task_context;

pub use task_context::current_task_id;
