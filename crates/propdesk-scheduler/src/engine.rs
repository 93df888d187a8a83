use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use propdesk_core::config::{SchedulerConfig, DEFAULT_LEASE_SECS};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    catalog::{default_catalog, CatalogEntry},
    clock::Clock,
    error::{Result, SchedulerError, StoreError},
    handlers::{HandlerContext, HandlerRegistry, TaskHandler},
    schedule::compute_next_run,
    store::TaskStore,
    types::{Frequency, NewTask, Task, TaskParams, TaskStatus},
};

const CANCELLED_WHILE_RUNNING: &str = "cancelled while running";

/// How a single execution ended. Failures here are business outcomes that
/// were already recorded on the task, not transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "message", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded(String),
    Failed(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Outcome::Succeeded(m) | Outcome::Failed(m) => m,
        }
    }
}

/// Committed result of one execution: the saved record plus its outcome.
#[derive(Debug, Clone)]
pub struct Execution {
    pub task: Task,
    pub outcome: Outcome,
}

/// Aggregate of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Due tasks left alone because another execution held them.
    pub skipped: usize,
    /// One entry per failed task: `<name> [<type>]: <message>`.
    pub errors: Vec<String>,
}

/// Aggregate of one bootstrap pass over the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BootstrapReport {
    pub created: usize,
    /// Entries whose task type already existed. Those tasks are left as they are.
    pub updated: usize,
    pub errors: Vec<String>,
}

/// Store lease on one task, released when dropped.
struct Lease<'a> {
    store: &'a dyn TaskStore,
    id: String,
    token: String,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.release_lease(&self.id, &self.token) {
            warn!(task_id = %self.id, "failed to release task lease: {e}");
        }
    }
}

/// Dispatcher: selects due tasks, runs their handlers, records the outcome
/// and reschedules them.
///
/// Shared behind an `Arc` by every trigger (CLI command, tick loop). A task
/// is executed by at most one caller at a time, across every manager on the
/// same store: the caller must hold the task's store lease, and overlapping
/// sweeps skip it.
pub struct TaskManager {
    store: Arc<dyn TaskStore>,
    registry: HandlerRegistry,
    clock: Arc<dyn Clock>,
    handler_timeout: Option<Duration>,
    lease_ttl: Duration,
}

impl TaskManager {
    pub fn new(store: Arc<dyn TaskStore>, registry: HandlerRegistry, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            registry,
            clock,
            handler_timeout: None,
            lease_ttl: Duration::from_secs(DEFAULT_LEASE_SECS),
        }
    }

    /// Bound every handler call; an expired call is recorded as a failure.
    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// How long a lease protects a task before another manager may take it
    /// over. Must outlast the slowest handler.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Apply the `[scheduler]` section of the config file.
    pub fn configure(self, cfg: &SchedulerConfig) -> Self {
        // A lease never goes stale before the handler timeout has fired.
        let floor = cfg.handler_timeout_secs.map_or(0, |t| t.saturating_add(60));
        self.with_handler_timeout(cfg.handler_timeout_secs.map(Duration::from_secs))
            .with_lease_ttl(Duration::from_secs(cfg.lease_secs.max(floor)))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // --- trigger surface -----------------------------------------------------

    /// Run every task due at `now`, one after another.
    ///
    /// A failing task never stops the sweep; its message lands in
    /// [`SweepReport::errors`]. Store errors abort the sweep and propagate.
    #[instrument(skip_all, fields(now = %now))]
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for candidate in self.store.find_due(now)? {
            let _lease = match self.try_lease(&candidate.id) {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    debug!(task_id = %candidate.id, "task already in flight, skipping");
                    report.skipped += 1;
                    continue;
                }
                Err(SchedulerError::TaskNotFound { .. }) => {
                    debug!(task_id = %candidate.id, "task deleted since the due query, skipping");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            // Re-read under the lease: an execution that committed after our
            // snapshot has already pushed next_run_at forward.
            let task = match self.store.get(&candidate.id)? {
                Some(task) if task.is_due(now) => task,
                _ => {
                    debug!(task_id = %candidate.id, "task no longer due, skipping");
                    report.skipped += 1;
                    continue;
                }
            };

            report.attempted += 1;
            let label = format!("{} [{}]", task.name, task.task_type);
            match self.execute(task, None).await {
                Ok(exec) => match exec.outcome {
                    Outcome::Succeeded(_) => report.succeeded += 1,
                    Outcome::Failed(message) => {
                        report.failed += 1;
                        report.errors.push(format!("{label}: {message}"));
                    }
                },
                Err(e @ SchedulerError::Store(_)) => return Err(e),
                Err(e) => {
                    error!(task = %label, "task execution aborted: {e}");
                    report.failed += 1;
                    report.errors.push(format!("{label}: {e}"));
                }
            }
        }

        if report.attempted > 0 || report.skipped > 0 {
            info!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                failed = report.failed,
                skipped = report.skipped,
                "sweep finished"
            );
        }
        Ok(report)
    }

    /// Run one task by id, whatever its status or frequency.
    ///
    /// Returns the handler's summary. A handler failure is recorded first and
    /// then returned as [`SchedulerError::TaskFailed`].
    pub async fn execute_one(&self, id: &str) -> Result<String> {
        self.execute_one_inner(id, None).await
    }

    /// Like [`execute_one`](Self::execute_one), but gives up when `cancel` fires.
    ///
    /// Cancelled before the handler starts: nothing is recorded and
    /// [`SchedulerError::Cancelled`] is returned. Cancelled afterwards: the
    /// handler's result is discarded and the attempt is recorded as failed.
    pub async fn execute_one_cancellable(&self, id: &str, cancel: &CancellationToken) -> Result<String> {
        self.execute_one_inner(id, Some(cancel)).await
    }

    /// Seed the compiled-in default tasks.
    pub fn create_default_tasks(&self) -> Result<BootstrapReport> {
        self.create_tasks_from(&default_catalog())
    }

    /// Insert the entries of `catalog` whose task type is missing. Existing
    /// tasks are never modified.
    ///
    /// Bad entries (unknown frequency or task type) are reported in
    /// [`BootstrapReport::errors`] and the rest are still processed.
    pub fn create_tasks_from(&self, catalog: &[CatalogEntry]) -> Result<BootstrapReport> {
        let mut report = BootstrapReport::default();

        for entry in catalog {
            match self.upsert_entry(entry) {
                Ok(Upsert::Created) => report.created += 1,
                Ok(Upsert::Existing) => report.updated += 1,
                Err(e @ SchedulerError::Configuration(_)) => {
                    warn!(task_type = %entry.task_type, "catalog entry skipped: {e}");
                    report.errors.push(format!("{}: {e}", entry.task_type));
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            created = report.created,
            updated = report.updated,
            errors = report.errors.len(),
            "default tasks bootstrapped"
        );
        Ok(report)
    }

    /// Full snapshot of one task.
    pub fn inspect(&self, id: &str) -> Result<Task> {
        self.store
            .get(id)?
            .ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })
    }

    pub fn list(&self) -> Result<Vec<Task>> {
        self.store.list()
    }

    /// Insert a new task, scheduling it from the current time.
    pub fn create_task(&self, spec: NewTask) -> Result<Task> {
        let now = self.clock.now();
        let next = compute_next_run(spec.frequency, now)?;
        let task = Task::new(spec, next, now);
        self.store.insert(&task)?;
        info!(task_id = %task.id, task_type = %task.task_type, "task created");
        Ok(task)
    }

    pub fn set_status(&self, id: &str, status: TaskStatus) -> Result<Task> {
        self.modify(id, |task, _| {
            task.status = status;
            Ok(())
        })
    }

    /// Change the cadence. The next run is recomputed from now so a task
    /// moved off `Manual` is immediately scheduled.
    pub fn set_frequency(&self, id: &str, frequency: Frequency) -> Result<Task> {
        self.modify(id, |task, now| {
            task.frequency = frequency;
            task.next_run_at = compute_next_run(frequency, now)?;
            Ok(())
        })
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let _lease = self
            .try_lease(id)?
            .ok_or_else(|| SchedulerError::AlreadyRunning { id: id.to_string() })?;
        self.store.delete(id)?;
        info!(task_id = %id, "task deleted");
        Ok(())
    }

    /// Tick loop: one sweep every `tick` until `shutdown` broadcasts `true`.
    pub async fn run(self: Arc<Self>, tick: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(tick_secs = tick.as_secs(), "task scheduler started");

        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_due(self.clock.now()).await {
                        error!("scheduler sweep error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("task scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    // --- private helpers ---------------------------------------------------

    /// Take the store lease on `id`, or `None` while someone else holds it.
    fn try_lease(&self, id: &str) -> Result<Option<Lease<'_>>> {
        let now = self.clock.now();
        let stale_before = chrono::Duration::from_std(self.lease_ttl)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let token = Uuid::now_v7().to_string();
        let acquired = self.store.acquire_lease(id, &token, now, stale_before)?;
        Ok(acquired.then(|| Lease {
            store: self.store.as_ref(),
            id: id.to_string(),
            token,
        }))
    }

    async fn execute_one_inner(&self, id: &str, cancel: Option<&CancellationToken>) -> Result<String> {
        let cancelled = || cancel.is_some_and(CancellationToken::is_cancelled);
        if cancelled() {
            return Err(SchedulerError::Cancelled { id: id.to_string() });
        }

        let _lease = self
            .try_lease(id)?
            .ok_or_else(|| SchedulerError::AlreadyRunning { id: id.to_string() })?;
        let task = self.inspect(id)?;
        if cancelled() {
            return Err(SchedulerError::Cancelled { id: id.to_string() });
        }

        let exec = self.execute(task, cancel).await?;
        match exec.outcome {
            Outcome::Succeeded(summary) => Ok(summary),
            Outcome::Failed(message) => Err(SchedulerError::TaskFailed {
                id: id.to_string(),
                message,
            }),
        }
    }

    /// Run `task` end to end and commit its bookkeeping. The caller holds the
    /// task's lease.
    ///
    /// All fields are computed on a local copy and written by a single
    /// `save`; if that save fails nothing of this attempt is persisted.
    #[instrument(skip(self, task, cancel), fields(task_id = %task.id, task_type = %task.task_type))]
    async fn execute(&self, mut task: Task, cancel: Option<&CancellationToken>) -> Result<Execution> {
        let started = self.clock.now();
        task.last_run_at = Some(started);
        task.run_count += 1;

        let mut outcome = match self.registry.resolve(&task.task_type) {
            None => Outcome::Failed(format!("unknown task type: {}", task.task_type)),
            Some(handler) => {
                let ctx = HandlerContext {
                    task_id: task.id.clone(),
                    task_type: task.task_type.clone(),
                    started_at: started,
                };
                self.invoke(handler, ctx, task.parameters.clone(), cancel).await
            }
        };

        if !task.frequency.is_manual() {
            match compute_next_run(task.frequency, started) {
                Ok(next) => task.next_run_at = next,
                Err(e) => {
                    // Left active, the task would stay due on every tick.
                    error!("cannot schedule next run, deactivating task: {e}");
                    task.status = TaskStatus::Inactive;
                    outcome = Outcome::Failed(format!(
                        "next run could not be scheduled, task deactivated: {e}"
                    ));
                }
            }
        }

        match &outcome {
            Outcome::Succeeded(summary) => {
                task.success_count += 1;
                task.result = Some(summary.clone());
            }
            Outcome::Failed(message) => {
                task.failure_count += 1;
                task.last_error = Some(message.clone());
            }
        }

        task.updated_at = self.clock.now();

        self.store.save(&task)?;

        match &outcome {
            Outcome::Succeeded(summary) => info!(
                run = task.run_count,
                next_run_at = ?task.next_run_at,
                "task succeeded: {summary}"
            ),
            Outcome::Failed(message) => warn!(
                run = task.run_count,
                failures = task.failure_count,
                next_run_at = ?task.next_run_at,
                "task failed: {message}"
            ),
        }

        Ok(Execution { task, outcome })
    }

    /// Call the handler on its own tokio task, turning errors, panics,
    /// timeouts and cancellation into outcomes.
    async fn invoke(
        &self,
        handler: Arc<dyn TaskHandler>,
        ctx: HandlerContext,
        params: TaskParams,
        cancel: Option<&CancellationToken>,
    ) -> Outcome {
        let task_id = ctx.task_id.clone();
        let mut call = tokio::spawn(async move { handler.run(&ctx, &params).await });

        let joined = tokio::select! {
            biased;
            joined = &mut call => joined,
            _ = cancelled(cancel) => {
                call.abort();
                return Outcome::Failed(CANCELLED_WHILE_RUNNING.to_string());
            }
            _ = expired(self.handler_timeout) => {
                call.abort();
                let limit = self.handler_timeout.unwrap_or_default();
                return Outcome::Failed(format!("handler timed out after {}s", limit.as_secs_f64()));
            }
        };

        match joined {
            Ok(Ok(summary)) => Outcome::Succeeded(summary),
            Ok(Err(e)) => Outcome::Failed(e.to_string()),
            Err(join_err) => {
                let detail = panic_detail(join_err);
                error!(task_id = %task_id, "handler panicked: {detail}");
                Outcome::Failed(format!("handler panicked: {detail}"))
            }
        }
    }

    fn upsert_entry(&self, entry: &CatalogEntry) -> Result<Upsert> {
        let frequency: Frequency = entry.frequency.parse()?;
        if !self.registry.contains(&entry.task_type) {
            return Err(SchedulerError::Configuration(format!(
                "unknown task type: {}",
                entry.task_type
            )));
        }

        if self.store.find_by_type(&entry.task_type)?.is_some() {
            return Ok(Upsert::Existing);
        }
        let spec = NewTask::new(&entry.name, &entry.task_type, frequency)
            .description(&entry.description)
            .parameters(entry.parameters.clone());
        match self.create_task(spec) {
            Ok(_) => Ok(Upsert::Created),
            // Another manager seeded the same type in the meantime.
            Err(SchedulerError::Store(StoreError::DuplicateKey(_))) => Ok(Upsert::Existing),
            Err(e) => Err(e),
        }
    }

    fn modify(&self, id: &str, change: impl FnOnce(&mut Task, DateTime<Utc>) -> Result<()>) -> Result<Task> {
        let _lease = self
            .try_lease(id)?
            .ok_or_else(|| SchedulerError::AlreadyRunning { id: id.to_string() })?;
        let mut task = self.inspect(id)?;
        let now = self.clock.now();
        change(&mut task, now)?;
        task.updated_at = now;
        self.store.save(&task)?;
        info!(task_id = %id, status = %task.status, frequency = %task.frequency, "task updated");
        Ok(task)
    }
}

enum Upsert {
    Created,
    Existing,
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn expired(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

fn panic_detail(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(err) => err.to_string(),
    }
}
