use std::future::Future;
use std::pin::Pin;

use crate::models::BoxError;

pub type CallbackResult = Result<(), BoxError>;

pub type TaskFuture = Pin<Box<dyn Future<Output = CallbackResult> + Send>>;

/// Work invoked by the scheduler on every tick.
///
/// Any `Fn() -> impl Future<Output = CallbackResult>` closure implements
/// this, so most callers never name the trait.
pub trait Runnable: Send + Sync + 'static {
    fn run(&self) -> TaskFuture;
}

impl<F, Fut> Runnable for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallbackResult> + Send + 'static,
{
    fn run(&self) -> TaskFuture {
        Box::pin(self())
    }
}
