use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::LockConfig;
use crate::models::LockTimeoutError;

#[derive(Clone)]
pub struct ExclusiveLock {
    inner: Arc<LockInner>,
}

struct LockInner {
    name: String,
    default_timeout: Duration,
    contention_warn_threshold: Option<u64>,
    state: Mutex<LockState>,
}

#[derive(Default)]
struct LockState {
    held: bool,
    holder: Option<String>,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    acquisitions: u64,
    contentions: u64,
    max_queue_depth: usize,
    contention_warned: bool,
}

struct Waiter {
    id: u64,
    tag: Option<String>,
    grant: oneshot::Sender<()>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct LockStats {
    pub acquisitions: u64,
    pub contentions: u64,
    pub max_queue_depth: usize,
    pub queue_depth: usize,
    pub is_locked: bool,
    pub holder: Option<String>,
}

#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    lock: Arc<LockInner>,
}

impl LockGuard {
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("lock", &self.lock.name)
            .finish()
    }
}

impl ExclusiveLock {
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(name, &LockConfig::default())
    }

    pub fn from_config(name: impl Into<String>, config: &LockConfig) -> Self {
        Self {
            inner: Arc::new(LockInner {
                name: name.into(),
                default_timeout: config.default_timeout(),
                contention_warn_threshold: config.contention_warn_threshold,
                state: Mutex::new(LockState::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    /// Waits up to `timeout` for the lock. Waiters are granted the lock in
    /// arrival order; a waiter that times out leaves the queue and never
    /// receives the lock afterwards.
    pub async fn acquire(
        &self,
        timeout: Duration,
        tag: Option<&str>,
    ) -> Result<LockGuard, LockTimeoutError> {
        let mut pending = {
            let mut state = self.inner.lock_state();
            if !state.held {
                state.held = true;
                state.holder = tag.map(str::to_string);
                state.acquisitions = state.acquisitions.saturating_add(1);
                return Ok(self.guard());
            }

            state.contentions = state.contentions.saturating_add(1);
            self.inner.warn_on_contention(&mut state);

            let id = state.next_waiter_id;
            state.next_waiter_id = state.next_waiter_id.wrapping_add(1);
            let (grant, granted) = oneshot::channel();
            state.waiters.push_back(Waiter {
                id,
                tag: tag.map(str::to_string),
                grant,
            });
            state.max_queue_depth = state.max_queue_depth.max(state.waiters.len());
            debug!(
                lock = %self.inner.name,
                queue_depth = state.waiters.len(),
                holder = ?state.holder,
                "waiting for exclusive lock"
            );

            PendingWaiter {
                lock: Arc::clone(&self.inner),
                id,
                granted,
                settled: false,
            }
        };

        if let Ok(Ok(())) = tokio::time::timeout(timeout, &mut pending.granted).await {
            pending.settled = true;
            return Ok(self.guard());
        }

        {
            let mut state = self.inner.lock_state();
            if let Some(position) = state.waiters.iter().position(|w| w.id == pending.id) {
                state.waiters.remove(position);
                pending.settled = true;
                let error = LockTimeoutError {
                    lock: self.inner.name.clone(),
                    holder: state.holder.clone(),
                    queue_depth: state.waiters.len(),
                    timeout,
                };
                debug!(lock = %self.inner.name, error = %error, "exclusive lock acquire timed out");
                return Err(error);
            }
        }

        // Popped by a release between the deadline and the queue check: the
        // grant is already in the channel.
        pending.settled = true;
        match (&mut pending.granted).await {
            Ok(()) => Ok(self.guard()),
            Err(_) => Err(self.timeout_error(timeout)),
        }
    }

    /// Runs `operation` while holding the lock. The lock is released on every
    /// exit path, including an `Err` output, a panic, or the returned future
    /// being dropped.
    pub async fn with_lock<F, Fut, T>(
        &self,
        timeout: Duration,
        tag: Option<&str>,
        operation: F,
    ) -> Result<T, LockTimeoutError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire(timeout, tag).await?;
        let output = operation().await;
        guard.release();
        Ok(output)
    }

    pub fn stats(&self) -> LockStats {
        let state = self.inner.lock_state();
        LockStats {
            acquisitions: state.acquisitions,
            contentions: state.contentions,
            max_queue_depth: state.max_queue_depth,
            queue_depth: state.waiters.len(),
            is_locked: state.held,
            holder: state.holder.clone(),
        }
    }

    pub fn reset_stats(&self) {
        let mut state = self.inner.lock_state();
        state.acquisitions = 0;
        state.contentions = 0;
        state.max_queue_depth = state.waiters.len();
        state.contention_warned = false;
    }

    fn guard(&self) -> LockGuard {
        LockGuard {
            lock: Arc::clone(&self.inner),
        }
    }

    fn timeout_error(&self, timeout: Duration) -> LockTimeoutError {
        let state = self.inner.lock_state();
        LockTimeoutError {
            lock: self.inner.name.clone(),
            holder: state.holder.clone(),
            queue_depth: state.waiters.len(),
            timeout,
        }
    }
}

impl LockInner {
    fn lock_state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self) {
        let mut state = self.lock_state();
        while let Some(Waiter { tag, grant, .. }) = state.waiters.pop_front() {
            if grant.send(()).is_ok() {
                state.holder = tag;
                state.acquisitions = state.acquisitions.saturating_add(1);
                return;
            }
        }
        state.held = false;
        state.holder = None;
    }

    fn warn_on_contention(&self, state: &mut LockState) {
        let Some(threshold) = self.contention_warn_threshold else {
            return;
        };
        if !state.contention_warned && state.contentions >= threshold {
            state.contention_warned = true;
            warn!(
                lock = %self.name,
                contentions = state.contentions,
                threshold,
                holder = ?state.holder,
                queue_depth = state.waiters.len(),
                "exclusive lock contention crossed warning threshold"
            );
        }
    }
}

/// A queued acquire. If the acquiring future is dropped before it settles,
/// the waiter leaves the queue, or gives back a grant it already received.
struct PendingWaiter {
    lock: Arc<LockInner>,
    id: u64,
    granted: oneshot::Receiver<()>,
    settled: bool,
}

impl Drop for PendingWaiter {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let still_queued = {
            let mut state = self.lock.lock_state();
            match state.waiters.iter().position(|w| w.id == self.id) {
                Some(position) => {
                    state.waiters.remove(position);
                    true
                }
                None => false,
            }
        };
        if !still_queued {
            self.lock.release();
        }
    }
}
