use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::load::LoadMonitor;
use crate::models::error::panic_message;
use crate::models::{
    FailureKind, SchedulerDiagnostics, SchedulerError, ShutdownReport, TaskCallbackError, TaskId,
    TaskKind, TaskPolicy, TaskSnapshot, TaskStatus, TerminationReason,
};
use crate::orchestration::runnable::Runnable;
use crate::task_context;

pub struct PeriodicTask {
    id: Option<TaskId>,
    period: Duration,
    policy: TaskPolicy,
    callback: Arc<dyn Runnable>,
}

impl PeriodicTask {
    pub fn new(period: Duration, callback: impl Runnable) -> Self {
        Self {
            id: None,
            period,
            policy: TaskPolicy::default(),
            callback: Arc::new(callback),
        }
    }

    pub fn id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn policy(mut self, policy: TaskPolicy) -> Self {
        self.policy = policy;
        self
    }
}

pub struct DeferredTask {
    id: Option<TaskId>,
    delay: Duration,
    callback: Arc<dyn Runnable>,
}

impl DeferredTask {
    pub fn new(delay: Duration, callback: impl Runnable) -> Self {
        Self {
            id: None,
            delay,
            callback: Arc::new(callback),
        }
    }

    pub fn id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    state: Mutex<RegistryState>,
    monitor: LoadMonitor,
    config: SchedulerConfig,
    retired: Notify,
}

struct RegistryState {
    accepting: bool,
    next_generation: u64,
    next_auto_id: u64,
    total_executions: u64,
    tasks: HashMap<TaskId, TaskEntry>,
    history: VecDeque<TaskSnapshot>,
}

struct TaskEntry {
    generation: u64,
    kind: TaskKind,
    period: Duration,
    created_at: Instant,
    last_run_at: Option<Instant>,
    run_count: u64,
    failure_count: u64,
    policy: TaskPolicy,
    manual_completion: bool,
    abort_handle: Option<AbortHandle>,
}

enum Tick {
    Run,
    Wait,
    Stop,
}

#[derive(Clone)]
struct DriverPlan {
    id: TaskId,
    generation: u64,
    period: Duration,
    policy: TaskPolicy,
    created_at: Instant,
}

impl TaskScheduler {
    pub fn new(monitor: LoadMonitor, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(RegistryState {
                    accepting: true,
                    next_generation: 0,
                    next_auto_id: 0,
                    total_executions: 0,
                    tasks: HashMap::new(),
                    history: VecDeque::new(),
                }),
                monitor,
                config,
                retired: Notify::new(),
            }),
        }
    }

    pub fn monitor(&self) -> &LoadMonitor {
        &self.inner.monitor
    }

    pub fn register_periodic(&self, task: PeriodicTask) -> Result<TaskId, SchedulerError> {
        let mut state = self.inner.lock_state();
        let id = task.id.unwrap_or_else(|| state.auto_id());
        if !state.accepting {
            return Err(SchedulerError::ShuttingDown(id));
        }
        if task.period.is_zero() {
            return Err(SchedulerError::InvalidPeriod(id));
        }

        let plan = self.inner.install(
            &mut state,
            id.clone(),
            TaskKind::Periodic,
            task.period,
            task.policy,
        );
        let handle = tokio::spawn(drive_periodic(
            Arc::downgrade(&self.inner),
            plan.clone(),
            task.callback,
        ));
        state.attach(&plan, handle.abort_handle());

        debug!(
            task_id = %id,
            period_ms = duration_ms(task.period),
            max_runs = ?task.policy.max_runs,
            ttl_ms = ?task.policy.ttl.map(duration_ms),
            pressure_limit = ?task.policy.pressure_limit,
            "registered periodic task"
        );
        Ok(id)
    }

    pub fn register_deferred(&self, task: DeferredTask) -> Result<TaskId, SchedulerError> {
        let mut state = self.inner.lock_state();
        let id = task.id.unwrap_or_else(|| state.auto_id());
        if !state.accepting {
            return Err(SchedulerError::ShuttingDown(id));
        }

        let plan = self.inner.install(
            &mut state,
            id.clone(),
            TaskKind::Deferred,
            task.delay,
            TaskPolicy::default(),
        );
        let handle = tokio::spawn(drive_deferred(
            Arc::downgrade(&self.inner),
            plan.clone(),
            task.callback,
        ));
        state.attach(&plan, handle.abort_handle());

        debug!(task_id = %id, delay_ms = duration_ms(task.delay), "registered deferred task");
        Ok(id)
    }

    /// Returns true only when an active task was cancelled by this call.
    pub fn cancel(&self, id: &str) -> bool {
        let mut state = self.inner.lock_state();
        self.inner
            .retire(&mut state, id, TerminationReason::Cancelled)
            .is_some()
    }

    /// Flags a task for termination at its next evaluation.
    pub fn mark_complete(&self, id: &str) -> bool {
        let mut state = self.inner.lock_state();
        match state.tasks.get_mut(id) {
            Some(entry) => {
                entry.manual_completion = true;
                true
            }
            None => false,
        }
    }

    pub fn emergency_drain(&self, hard_cap: usize) -> Vec<TaskId> {
        self.emergency_drain_sparing(hard_cap, &[])
    }

    pub fn emergency_drain_sparing(&self, hard_cap: usize, spared: &[&str]) -> Vec<TaskId> {
        let mut state = self.inner.lock_state();
        let ranked: Vec<TaskId> = drain_order(&state.tasks)
            .into_iter()
            .filter(|id| !spared.contains(&id.as_str()))
            .collect();
        let protected = state.tasks.len() - ranked.len();
        let victims = if protected > hard_cap {
            ranked.len()
        } else {
            state.tasks.len().saturating_sub(hard_cap)
        };

        let mut cancelled = Vec::with_capacity(victims);
        for id in ranked.into_iter().take(victims) {
            if self
                .inner
                .retire(&mut state, id.as_str(), TerminationReason::Drained)
                .is_some()
            {
                cancelled.push(id);
            }
        }

        if !cancelled.is_empty() {
            info!(
                hard_cap,
                cancelled = cancelled.len(),
                remaining = state.tasks.len(),
                "emergency drain cancelled periodic tasks"
            );
        }
        cancelled
    }

    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let initial = {
            let mut state = self.inner.lock_state();
            state.accepting = false;
            state.tasks.len()
        };
        info!(
            active = initial,
            grace_ms = duration_ms(grace),
            "scheduler shutdown started"
        );

        let deadline = deadline_after(Instant::now(), grace);
        loop {
            let notified = self.inner.retired.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.lock_state().tasks.is_empty() {
                break;
            }
            if timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let force_cancelled = {
            let mut state = self.inner.lock_state();
            let mut remaining: Vec<TaskId> = state.tasks.keys().cloned().collect();
            remaining.sort();
            for id in &remaining {
                self.inner
                    .retire(&mut state, id.as_str(), TerminationReason::Shutdown);
            }
            remaining
        };

        let report = ShutdownReport {
            completed_in_grace: initial.saturating_sub(force_cancelled.len()),
            force_cancelled,
        };
        info!(
            completed_in_grace = report.completed_in_grace,
            force_cancelled = report.force_cancelled.len(),
            "scheduler shutdown finished"
        );
        report
    }

    pub fn diagnostics(&self) -> SchedulerDiagnostics {
        let state = self.inner.lock_state();
        let now = Instant::now();
        let periodic_count = state
            .tasks
            .values()
            .filter(|entry| entry.kind == TaskKind::Periodic)
            .count();
        SchedulerDiagnostics {
            total_timers: state.tasks.len(),
            periodic_count,
            deferred_count: state.tasks.len() - periodic_count,
            oldest_task_age_ms: state
                .tasks
                .values()
                .map(|entry| entry.created_at)
                .min()
                .map(|created_at| duration_ms(now.duration_since(created_at))),
            total_executions: state.total_executions,
        }
    }

    pub fn snapshot(&self, id: &str) -> Option<TaskSnapshot> {
        let state = self.inner.lock_state();
        if let Some(entry) = state.tasks.get(id) {
            return Some(entry.snapshot(TaskId::from(id), TaskStatus::Active, None));
        }
        state
            .history
            .iter()
            .rev()
            .find(|snapshot| snapshot.id.as_str() == id)
            .cloned()
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.inner.lock_state().tasks.contains_key(id)
    }

    pub fn active_ids(&self) -> Vec<TaskId> {
        let state = self.inner.lock_state();
        let mut ids: Vec<TaskId> = state.tasks.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.lock_state().accepting
    }
}

impl SchedulerInner {
    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn install(
        &self,
        state: &mut RegistryState,
        id: TaskId,
        kind: TaskKind,
        period: Duration,
        policy: TaskPolicy,
    ) -> DriverPlan {
        self.retire(state, id.as_str(), TerminationReason::Replaced);

        let generation = state.next_generation;
        state.next_generation = state.next_generation.saturating_add(1);
        let created_at = Instant::now();
        state.tasks.insert(
            id.clone(),
            TaskEntry {
                generation,
                kind,
                period,
                created_at,
                last_run_at: None,
                run_count: 0,
                failure_count: 0,
                policy,
                manual_completion: false,
                abort_handle: None,
            },
        );

        DriverPlan {
            id,
            generation,
            period,
            policy,
            created_at,
        }
    }

    fn retire(
        &self,
        state: &mut RegistryState,
        id: &str,
        reason: TerminationReason,
    ) -> Option<TaskSnapshot> {
        let (id, entry) = state.tasks.remove_entry(id)?;
        if let Some(handle) = &entry.abort_handle {
            handle.abort();
        }

        let snapshot = entry.snapshot(id, TaskStatus::Terminated, Some(reason));
        info!(
            task_id = %snapshot.id,
            reason = %reason,
            run_count = snapshot.run_count,
            "task terminated"
        );

        if self.config.history_limit > 0 {
            while state.history.len() >= self.config.history_limit {
                state.history.pop_front();
            }
            state.history.push_back(snapshot.clone());
        }
        self.retired.notify_waiters();
        Some(snapshot)
    }

    // `due` is false when the wake-up only observes a TTL deadline.
    fn before_tick(&self, plan: &DriverPlan, due: bool, pressure: Option<f64>) -> Tick {
        let mut state = self.lock_state();
        let Some(entry) = state.current(plan) else {
            return Tick::Stop;
        };

        if let Some(reason) = termination_reason(entry, Instant::now(), pressure) {
            self.retire(&mut state, plan.id.as_str(), reason);
            return Tick::Stop;
        }
        if due { Tick::Run } else { Tick::Wait }
    }

    fn after_tick(
        &self,
        plan: &DriverPlan,
        outcome: Result<(), FailureKind>,
        pressure: Option<f64>,
    ) -> bool {
        let mut state = self.lock_state();
        state.total_executions = state.total_executions.saturating_add(1);
        let Some(entry) = state.current_mut(plan) else {
            return false;
        };

        let now = Instant::now();
        entry.run_count = entry.run_count.saturating_add(1);
        entry.last_run_at = Some(now);
        if let Err(kind) = outcome {
            entry.failure_count = entry.failure_count.saturating_add(1);
            let error = TaskCallbackError {
                task_id: plan.id.clone(),
                run_count: entry.run_count,
                kind,
            };
            warn!(
                task_id = %plan.id,
                run_count = entry.run_count,
                error = %error,
                "task callback failed; task stays scheduled"
            );
        }

        let reason = match entry.kind {
            TaskKind::Periodic => termination_reason(entry, now, pressure),
            TaskKind::Deferred => Some(TerminationReason::Fired),
        };
        match reason {
            Some(reason) => {
                self.retire(&mut state, plan.id.as_str(), reason);
                false
            }
            None => true,
        }
    }

    fn sample_pressure(&self, policy: &TaskPolicy) -> Option<f64> {
        policy.pressure_limit.map(|_| self.monitor.pressure())
    }

    fn next_delay(&self, plan: &DriverPlan) -> Duration {
        if plan.policy.adaptive_interval {
            self.monitor.scale_interval(
                plan.period,
                self.monitor.pressure(),
                self.config.max_backoff_factor,
            )
        } else {
            plan.period
        }
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for entry in state.tasks.values() {
            if let Some(handle) = &entry.abort_handle {
                handle.abort();
            }
        }
    }
}

impl RegistryState {
    fn auto_id(&mut self) -> TaskId {
        loop {
            let candidate = TaskId(format!("task-{}", self.next_auto_id));
            self.next_auto_id = self.next_auto_id.saturating_add(1);
            if !self.tasks.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    fn attach(&mut self, plan: &DriverPlan, handle: AbortHandle) {
        match self.current_mut(plan) {
            Some(entry) => entry.abort_handle = Some(handle),
            None => handle.abort(),
        }
    }

    fn current(&self, plan: &DriverPlan) -> Option<&TaskEntry> {
        self.tasks
            .get(&plan.id)
            .filter(|entry| entry.generation == plan.generation)
    }

    fn current_mut(&mut self, plan: &DriverPlan) -> Option<&mut TaskEntry> {
        self.tasks
            .get_mut(&plan.id)
            .filter(|entry| entry.generation == plan.generation)
    }
}

impl TaskEntry {
    fn snapshot(
        &self,
        id: TaskId,
        status: TaskStatus,
        reason: Option<TerminationReason>,
    ) -> TaskSnapshot {
        TaskSnapshot {
            id,
            kind: self.kind,
            period: self.period,
            created_at: self.created_at,
            last_run_at: self.last_run_at,
            run_count: self.run_count,
            failure_count: self.failure_count,
            policy: self.policy,
            manual_completion: self.manual_completion,
            status,
            termination_reason: reason,
        }
    }
}

/// Checked in priority order: max runs, TTL, pressure, manual completion.
fn termination_reason(
    entry: &TaskEntry,
    now: Instant,
    pressure: Option<f64>,
) -> Option<TerminationReason> {
    let policy = &entry.policy;
    if let Some(max_runs) = policy.max_runs
        && entry.run_count >= max_runs
    {
        return Some(TerminationReason::MaxRuns);
    }
    if let Some(ttl) = policy.ttl
        && now.saturating_duration_since(entry.created_at) >= ttl
    {
        return Some(TerminationReason::Ttl);
    }
    if let (Some(limit), Some(pressure)) = (policy.pressure_limit, pressure)
        && pressure > limit
    {
        return Some(TerminationReason::Pressure);
    }
    if entry.manual_completion {
        return Some(TerminationReason::Manual);
    }
    None
}

fn drain_order(tasks: &HashMap<TaskId, TaskEntry>) -> Vec<TaskId> {
    let mut ranked: Vec<(Instant, Reverse<u64>, u64, &TaskId)> = tasks
        .iter()
        .filter(|(_, entry)| entry.kind == TaskKind::Periodic)
        .map(|(id, entry)| {
            (
                entry.created_at,
                Reverse(entry.run_count),
                entry.generation,
                id,
            )
        })
        .collect();
    ranked.sort();
    ranked.into_iter().map(|(_, _, _, id)| id.clone()).collect()
}

async fn drive_periodic(
    inner: Weak<SchedulerInner>,
    plan: DriverPlan,
    callback: Arc<dyn Runnable>,
) {
    // A TTL past the end of the clock never expires.
    let ttl_deadline = plan
        .policy
        .ttl
        .and_then(|ttl| plan.created_at.checked_add(ttl));
    let mut next_fire = match inner.upgrade() {
        Some(inner) => deadline_after(plan.created_at, inner.next_delay(&plan)),
        None => return,
    };

    loop {
        let wake_at = ttl_deadline.map_or(next_fire, |deadline| deadline.min(next_fire));
        sleep_until(wake_at).await;

        let Some(scheduler) = inner.upgrade() else {
            return;
        };
        let due = Instant::now() >= next_fire;
        let pressure = scheduler.sample_pressure(&plan.policy);
        match scheduler.before_tick(&plan, due, pressure) {
            Tick::Stop => return,
            Tick::Wait => continue,
            Tick::Run => {}
        }
        drop(scheduler);

        let outcome = invoke(&plan.id, &callback).await;

        let Some(scheduler) = inner.upgrade() else {
            return;
        };
        let pressure = scheduler.sample_pressure(&plan.policy);
        if !scheduler.after_tick(&plan, outcome, pressure) {
            return;
        }

        let now = Instant::now();
        let delay = scheduler.next_delay(&plan);
        next_fire = deadline_after(next_fire, delay);
        if next_fire <= now {
            next_fire = deadline_after(now, delay);
        }
    }
}

async fn drive_deferred(
    inner: Weak<SchedulerInner>,
    plan: DriverPlan,
    callback: Arc<dyn Runnable>,
) {
    sleep_until(deadline_after(plan.created_at, plan.period)).await;

    {
        let Some(scheduler) = inner.upgrade() else {
            return;
        };
        let mut state = scheduler.lock_state();
        let Some(entry) = state.current(&plan) else {
            return;
        };
        if entry.manual_completion {
            scheduler.retire(&mut state, plan.id.as_str(), TerminationReason::Manual);
            return;
        }
    }

    let outcome = invoke(&plan.id, &callback).await;
    if let Some(scheduler) = inner.upgrade() {
        scheduler.after_tick(&plan, outcome, None);
    }
}

// Each invocation runs in its own tokio task so a panic surfaces as a join error.
async fn invoke(id: &TaskId, callback: &Arc<dyn Runnable>) -> Result<(), FailureKind> {
    let callback = Arc::clone(callback);
    let handle = tokio::spawn(task_context::with_task_id(id.clone(), async move {
        callback.run().await
    }));
    let _abort_on_drop = AbortOnDrop(handle.abort_handle());

    match handle.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(FailureKind::Failed(error.to_string())),
        Err(join_error) if join_error.is_panic() => Err(FailureKind::Panicked(panic_message(
            &*join_error.into_panic(),
        ))),
        Err(_) => Err(FailureKind::Failed("callback was cancelled".to_string())),
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// `start + delay`, clamped to roughly 30 years out like tokio's own timers.
fn deadline_after(start: Instant, delay: Duration) -> Instant {
    start
        .checked_add(delay.min(FAR_FUTURE))
        .unwrap_or_else(|| Instant::now() + FAR_FUTURE)
}

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
