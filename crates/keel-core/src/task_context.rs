use std::future::Future;

use crate::models::TaskId;

tokio::task_local! {
    static CURRENT_TASK_ID: TaskId;
}

/// Id of the scheduled task whose callback is currently running, if any.
pub fn current_task_id() -> Option<TaskId> {
    CURRENT_TASK_ID.try_with(Clone::clone).ok()
}

pub(crate) async fn with_task_id<F>(task_id: TaskId, operation: F) -> F::Output
where
    F: Future,
{
    CURRENT_TASK_ID.scope(task_id, operation).await
}
