use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::JanitorConfig;
use crate::models::error::panic_message;
use crate::models::{
    BoxError, FailureKind, JanitorError, ResourceCleanupError, ResourceId, ResourceStats,
    SchedulerError,
};
use crate::orchestration::{PeriodicTask, TaskScheduler};

pub trait ManagedResource: Send + 'static {
    fn kind(&self) -> &str;

    fn memory_estimate(&self) -> Option<u64> {
        None
    }

    /// Releases the underlying resource. Called at most once.
    fn cleanup(&mut self) -> Result<(), BoxError>;
}

pub struct CallbackResource<F> {
    kind: String,
    memory_estimate: Option<u64>,
    cleanup: Option<F>,
}

impl<F> CallbackResource<F>
where
    F: FnOnce() -> Result<(), BoxError> + Send + 'static,
{
    pub fn new(kind: impl Into<String>, cleanup: F) -> Self {
        Self {
            kind: kind.into(),
            memory_estimate: None,
            cleanup: Some(cleanup),
        }
    }

    pub fn with_memory_estimate(mut self, bytes: u64) -> Self {
        self.memory_estimate = Some(bytes);
        self
    }
}

impl<F> ManagedResource for CallbackResource<F>
where
    F: FnOnce() -> Result<(), BoxError> + Send + 'static,
{
    fn kind(&self) -> &str {
        &self.kind
    }

    fn memory_estimate(&self) -> Option<u64> {
        self.memory_estimate
    }

    fn cleanup(&mut self) -> Result<(), BoxError> {
        match self.cleanup.take() {
            Some(cleanup) => cleanup(),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct ResourceJanitor {
    inner: Arc<JanitorInner>,
}

struct JanitorInner {
    config: JanitorConfig,
    scheduler: TaskScheduler,
    state: Mutex<JanitorState>,
}

#[derive(Default)]
struct JanitorState {
    records: HashMap<ResourceId, ResourceRecord>,
    disposed: bool,
}

struct ResourceRecord {
    created_at: Instant,
    last_accessed_at: Instant,
    access_count: u64,
    memory_estimate: u64,
    resource: Box<dyn ManagedResource>,
}

impl ResourceJanitor {
    pub fn new(config: JanitorConfig, scheduler: TaskScheduler) -> Result<Self, JanitorError> {
        let janitor = Self {
            inner: Arc::new(JanitorInner {
                config,
                scheduler,
                state: Mutex::new(JanitorState::default()),
            }),
        };
        janitor.ensure_sweep()?;
        Ok(janitor)
    }

    /// Starts tracking `resource`. When the table is full, the least recently
    /// accessed quarter is evicted (cleanup included) before this returns.
    pub fn register(
        &self,
        id: impl Into<ResourceId>,
        resource: impl ManagedResource,
    ) -> Result<ResourceId, JanitorError> {
        let id = id.into();
        let resource: Box<dyn ManagedResource> = Box::new(resource);

        let evicted = {
            let mut state = self.inner.lock_state();
            if state.disposed {
                drop(state);
                run_cleanup(&id, resource);
                return Err(JanitorError::Disposed(id));
            }

            let mut evicted = Vec::new();
            if let Some(previous) = state.records.remove(&id) {
                evicted.push((id.clone(), previous));
            }

            let max_resources = self.inner.config.max_resources;
            if state.records.len() >= max_resources {
                let count = eviction_count(state.records.len());
                let victims = state.take_least_recent(count);
                warn!(
                    tracked = state.records.len() + victims.len(),
                    max_resources,
                    evicted = victims.len(),
                    "resource capacity reached; evicting least recently used"
                );
                evicted.extend(victims);
            }

            let now = Instant::now();
            state.records.insert(
                id.clone(),
                ResourceRecord {
                    created_at: now,
                    last_accessed_at: now,
                    access_count: 0,
                    memory_estimate: resource.memory_estimate().unwrap_or(0),
                    resource,
                },
            );
            evicted
        };

        for (evicted_id, record) in evicted {
            run_cleanup(&evicted_id, record.resource);
        }

        if let Err(error) = self.ensure_sweep() {
            debug!(error = %error, "idle sweep not re-armed");
        }

        debug!(resource_id = %id, "registered resource");
        Ok(id)
    }

    pub fn access(&self, id: &str) -> bool {
        let mut state = self.inner.lock_state();
        let Some(record) = state.records.get_mut(id) else {
            return false;
        };
        record.last_accessed_at = Instant::now();
        record.access_count = record.access_count.saturating_add(1);
        if let Some(estimate) = record.resource.memory_estimate() {
            record.memory_estimate = estimate;
        }
        true
    }

    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.inner.lock_state().records.remove_entry(id);
        match removed {
            Some((id, record)) => {
                run_cleanup(&id, record.resource);
                true
            }
            None => false,
        }
    }

    pub fn sweep_idle(&self) -> Vec<ResourceId> {
        let max_idle = self.inner.config.max_idle();
        let now = Instant::now();
        let expired = {
            let mut state = self.inner.lock_state();
            let ids: Vec<ResourceId> = state
                .records
                .iter()
                .filter(|(_, record)| {
                    now.saturating_duration_since(record.last_accessed_at) > max_idle
                })
                .map(|(id, _)| id.clone())
                .collect();
            state.remove_all(ids)
        };

        let ids = cleanup_all(expired);
        if !ids.is_empty() {
            info!(evicted = ids.len(), "idle sweep released resources");
        }
        ids
    }

    pub fn emergency_evict(&self) -> Vec<ResourceId> {
        let victims = {
            let mut state = self.inner.lock_state();
            if state.records.is_empty() {
                return Vec::new();
            }
            let count = eviction_count(state.records.len());
            state.take_least_recent(count)
        };

        let ids = cleanup_all(victims);
        warn!(evicted = ids.len(), "emergency eviction released resources");
        ids
    }

    /// Re-arms the idle sweep task if it is not scheduled. Returns true when a
    /// new sweep task was registered.
    pub fn ensure_sweep(&self) -> Result<bool, SchedulerError> {
        let sweep_id = self.inner.config.sweep_task_id.as_str();
        if self.inner.lock_state().disposed || self.inner.scheduler.is_active(sweep_id) {
            return Ok(false);
        }

        let janitor = Arc::downgrade(&self.inner);
        let sweep = move || {
            let janitor: Weak<JanitorInner> = janitor.clone();
            async move {
                if let Some(inner) = janitor.upgrade() {
                    ResourceJanitor { inner }.sweep_idle();
                }
                Ok::<(), BoxError>(())
            }
        };
        let task = PeriodicTask::new(self.inner.config.sweep_interval(), sweep).id(sweep_id);
        self.inner.scheduler.register_periodic(task)?;
        Ok(true)
    }

    pub fn dispose(&self) -> Vec<ResourceId> {
        let records = {
            let mut state = self.inner.lock_state();
            state.disposed = true;
            let ids: Vec<ResourceId> = state.records.keys().cloned().collect();
            state.remove_all(ids)
        };
        self.inner
            .scheduler
            .cancel(self.inner.config.sweep_task_id.as_str());

        let ids = cleanup_all(records);
        info!(released = ids.len(), "resource janitor disposed");
        ids
    }

    pub fn stats(&self) -> ResourceStats {
        let state = self.inner.lock_state();
        let now = Instant::now();
        let mut resources_by_type = BTreeMap::new();
        for record in state.records.values() {
            *resources_by_type
                .entry(record.resource.kind().to_string())
                .or_insert(0) += 1;
        }
        ResourceStats {
            total_resources: state.records.len(),
            total_memory_estimate: state
                .records
                .values()
                .map(|record| record.memory_estimate)
                .fold(0u64, u64::saturating_add),
            resources_by_type,
            oldest_resource_age_ms: state
                .records
                .values()
                .map(|record| record.created_at)
                .min()
                .map(|created_at| {
                    u64::try_from(now.duration_since(created_at).as_millis()).unwrap_or(u64::MAX)
                }),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock_state().records.contains_key(id)
    }

    pub fn access_count(&self, id: &str) -> Option<u64> {
        self.inner
            .lock_state()
            .records
            .get(id)
            .map(|record| record.access_count)
    }

    pub fn len(&self) -> usize {
        self.inner.lock_state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock_state().disposed
    }
}

impl JanitorInner {
    fn lock_state(&self) -> MutexGuard<'_, JanitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl JanitorState {
    fn take_least_recent(&mut self, count: usize) -> Vec<(ResourceId, ResourceRecord)> {
        let mut ranked: Vec<(Instant, Instant, ResourceId)> = self
            .records
            .iter()
            .map(|(id, record)| (record.last_accessed_at, record.created_at, id.clone()))
            .collect();
        ranked.sort();
        let ids = ranked.into_iter().take(count).map(|(_, _, id)| id).collect();
        self.remove_all(ids)
    }

    fn remove_all(&mut self, ids: Vec<ResourceId>) -> Vec<(ResourceId, ResourceRecord)> {
        ids.into_iter()
            .filter_map(|id| self.records.remove_entry(&id))
            .collect()
    }
}

fn eviction_count(tracked: usize) -> usize {
    tracked.div_ceil(4).max(1)
}

fn cleanup_all(mut records: Vec<(ResourceId, ResourceRecord)>) -> Vec<ResourceId> {
    records.sort_by(|a, b| a.0.cmp(&b.0));
    records
        .into_iter()
        .map(|(id, record)| {
            run_cleanup(&id, record.resource);
            id
        })
        .collect()
}

fn run_cleanup(id: &ResourceId, mut resource: Box<dyn ManagedResource>) {
    let kind = match catch_unwind(AssertUnwindSafe(|| resource.cleanup())) {
        Ok(Ok(())) => {
            debug!(resource_id = %id, "resource cleaned up");
            return;
        }
        Ok(Err(error)) => FailureKind::Failed(error.to_string()),
        Err(payload) => FailureKind::Panicked(panic_message(&*payload)),
    };
    let error = ResourceCleanupError {
        resource_id: id.clone(),
        kind,
    };
    warn!(resource_id = %id, error = %error, "resource cleanup failed; record removed anyway");
}
