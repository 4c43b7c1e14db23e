//! Cron scheduler and task registry.
//!
//! One timer task per registered job. Every firing runs the guarded
//! sequence: `can_run()` gate, distributed lock acquisition, job-history
//! record, execution raced against a hard timeout with the lease renewed at
//! TTL/3 in the background, then finalize + release. Failures retry with
//! exponential backoff and disable the task once `max_retries` is reached -
//! a disabled task stays disabled until an operator calls `start_task`
//! again.
//!
//! The scheduler is an explicit value constructed at process start; there is
//! no ambient global registry. Errors inside a firing never propagate to
//! other tasks or crash the scheduler.
//!
//! # Cancellation
//!
//! Cancellation is cooperative. Each execution receives a
//! [`CancellationToken`] it is expected to poll; reaching the execution
//! timeout (or `stop_task`) cancels that token and stops the scheduler's
//! wait, but it cannot preempt a body that never polls. There is no forced
//! kill path.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::history::{JobHistoryStore, JobStatus};
use super::locks::DistributedLock;
use crate::config::SchedulerConfig;

/// A named recurring job.
///
/// `execute` receives a cancellation token that long-running bodies should
/// poll between units of work. `can_run` gates a firing before the lock is
/// even attempted (e.g. a dependency table is missing, or a crawl is already
/// active in this process) - returning false skips the firing without a
/// failure record.
#[async_trait::async_trait]
pub trait CronTask: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn default_schedule(&self) -> &str;

    async fn execute(&self, cancel: CancellationToken) -> Result<()>;

    async fn can_run(&self) -> Result<bool> {
        Ok(true)
    }

    /// Optional task-specific status payload for the dashboard.
    async fn status(&self) -> Option<serde_json::Value> {
        None
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidSchedule { expr: String, reason: String },
    #[error("unknown task: {0}")]
    UnknownTask(String),
    #[error("task already registered: {0}")]
    DuplicateTask(String),
}

/// Result of one guarded firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiringOutcome {
    /// Executed and succeeded.
    Completed,
    /// Not executed: `can_run` was false or another instance holds the lock.
    Skipped,
    /// Executed and failed (error, timeout, or lock store outage).
    Failed,
}

/// Scheduler-facing view of one task, serializable for status routes.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub name: String,
    pub description: String,
    pub schedule: String,
    pub default_schedule: String,
    pub is_running: bool,
    pub is_executing: bool,
    pub disabled: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
}

/// Per-task mutable state shared between the registry and the timer loop.
struct TaskRuntime {
    retry_count: AtomicU32,
    executing: AtomicBool,
    disabled: AtomicBool,
    next_run: Mutex<Option<DateTime<Utc>>>,
}

impl TaskRuntime {
    fn new() -> Self {
        Self {
            retry_count: AtomicU32::new(0),
            executing: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            next_run: Mutex::new(None),
        }
    }

    fn set_next_run(&self, next: Option<DateTime<Utc>>) {
        *self.next_run.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    fn next_run(&self) -> Option<DateTime<Utc>> {
        *self.next_run.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct TaskEntry {
    task: Arc<dyn CronTask>,
    default_schedule: String,
    schedule: String,
    runtime: Arc<TaskRuntime>,
    timer: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

enum LoopControl {
    Continue,
    Disable,
}

/// Registry and timers for all recurring tasks of this instance.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    config: SchedulerConfig,
    lock: Arc<DistributedLock>,
    history: Arc<dyn JobHistoryStore>,
    instance_id: String,
    tasks: Mutex<HashMap<String, TaskEntry>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        lock: Arc<DistributedLock>,
        history: Arc<dyn JobHistoryStore>,
    ) -> Self {
        Self::with_instance_id(config, lock, history, super::locks::generate_instance_id())
    }

    pub fn with_instance_id(
        config: SchedulerConfig,
        lock: Arc<DistributedLock>,
        history: Arc<dyn JobHistoryStore>,
        instance_id: String,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                lock,
                history,
                instance_id,
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Add a task to the registry. Does not start its timer.
    pub fn register_task(&self, task: Arc<dyn CronTask>) -> Result<(), SchedulerError> {
        let name = task.name().to_string();
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if tasks.contains_key(&name) {
            return Err(SchedulerError::DuplicateTask(name));
        }
        let default_schedule = task.default_schedule().to_string();
        tasks.insert(
            name.clone(),
            TaskEntry {
                task,
                schedule: default_schedule.clone(),
                default_schedule,
                runtime: Arc::new(TaskRuntime::new()),
                timer: None,
                cancel: CancellationToken::new(),
            },
        );
        info!(task = %name, "task registered");
        Ok(())
    }

    /// Start (or restart) a task's timer, optionally overriding its
    /// schedule. Malformed cron expressions are rejected here with a
    /// descriptive error - never silently corrected. Restarting clears the
    /// disabled flag and retry counter.
    pub fn start_task(
        &self,
        name: &str,
        schedule_override: Option<&str>,
    ) -> Result<(), SchedulerError> {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let entry = tasks
            .get_mut(name)
            .ok_or_else(|| SchedulerError::UnknownTask(name.to_string()))?;

        let expr = schedule_override
            .unwrap_or(&entry.default_schedule)
            .to_string();
        let schedule = validate_schedule(&expr)?;

        // Replace any existing timer.
        entry.cancel.cancel();
        let cancel = CancellationToken::new();
        entry.cancel = cancel.clone();
        entry.schedule = expr.clone();
        entry.runtime.disabled.store(false, Ordering::SeqCst);
        entry.runtime.retry_count.store(0, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let task = Arc::clone(&entry.task);
        let runtime = Arc::clone(&entry.runtime);
        entry.timer = Some(tokio::spawn(async move {
            inner.run_task_loop(task, runtime, schedule, cancel).await;
        }));

        info!(task = %name, schedule = %expr, "task started");
        Ok(())
    }

    /// Cancel a task's timer and any pending retry, and best-effort release
    /// the lease it may hold. In-flight work is cancelled cooperatively.
    pub async fn stop_task(&self, name: &str) -> Result<(), SchedulerError> {
        {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            let entry = tasks
                .get_mut(name)
                .ok_or_else(|| SchedulerError::UnknownTask(name.to_string()))?;
            entry.cancel.cancel();
            entry.timer = None;
            entry.runtime.set_next_run(None);
        }
        self.inner
            .lock
            .release(name, &self.inner.instance_id)
            .await;
        info!(task = %name, "task stopped");
        Ok(())
    }

    /// Start every registered task on its current schedule. Validation
    /// errors are logged per task and do not stop the iteration.
    pub fn start_all(&self) {
        for name in self.task_names() {
            if let Err(e) = self.start_task(&name, None) {
                error!(task = %name, error = %e, "failed to start task");
            }
        }
    }

    pub async fn stop_all(&self) {
        for name in self.task_names() {
            let _ = self.stop_task(&name).await;
        }
    }

    /// Stop everything and wait (bounded) for in-flight executions, then
    /// release their leases regardless.
    pub async fn shutdown(&self) {
        info!("scheduler shutting down");
        let names = self.task_names();
        self.stop_all().await;

        let deadline = Instant::now() + self.inner.config.shutdown_timeout;
        loop {
            let executing = {
                let tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
                tasks
                    .values()
                    .filter(|e| e.runtime.executing.load(Ordering::SeqCst))
                    .count()
            };
            if executing == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(executing, "shutdown timeout reached, abandoning in-flight executions");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for name in &names {
            self.inner.lock.release(name, &self.inner.instance_id).await;
        }
        info!("scheduler stopped");
    }

    /// Run one guarded firing immediately, outside the cron timer. Used by
    /// the execute-now control route and by tests.
    pub async fn execute_now(&self, name: &str) -> Result<FiringOutcome, SchedulerError> {
        let (task, runtime, cancel) = {
            let tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            let entry = tasks
                .get(name)
                .ok_or_else(|| SchedulerError::UnknownTask(name.to_string()))?;
            let cancel = if entry.cancel.is_cancelled() {
                CancellationToken::new()
            } else {
                entry.cancel.child_token()
            };
            (Arc::clone(&entry.task), Arc::clone(&entry.runtime), cancel)
        };
        Ok(self.inner.run_firing(&task, &runtime, &cancel).await)
    }

    pub fn status(&self, name: &str) -> Option<TaskStatus> {
        let tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.get(name).map(|e| self.inner.task_status(e))
    }

    pub fn status_all(&self) -> Vec<TaskStatus> {
        let tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let mut statuses: Vec<TaskStatus> =
            tasks.values().map(|e| self.inner.task_status(e)).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn task_names(&self) -> Vec<String> {
        let tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.keys().cloned().collect()
    }
}

impl SchedulerInner {
    fn task_status(&self, entry: &TaskEntry) -> TaskStatus {
        TaskStatus {
            name: entry.task.name().to_string(),
            description: entry.task.description().to_string(),
            schedule: entry.schedule.clone(),
            default_schedule: entry.default_schedule.clone(),
            is_running: entry.timer.as_ref().is_some_and(|t| !t.is_finished()),
            is_executing: entry.runtime.executing.load(Ordering::SeqCst),
            disabled: entry.runtime.disabled.load(Ordering::SeqCst),
            next_run: entry.runtime.next_run(),
            retry_count: entry.runtime.retry_count.load(Ordering::SeqCst),
            max_retries: self.config.max_retries,
        }
    }

    async fn run_task_loop(
        self: Arc<Self>,
        task: Arc<dyn CronTask>,
        runtime: Arc<TaskRuntime>,
        schedule: cron::Schedule,
        cancel: CancellationToken,
    ) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!(task = %task.name(), "schedule yields no future firings, stopping timer");
                break;
            };
            runtime.set_next_run(Some(next));

            let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            if matches!(
                self.run_with_retries(&task, &runtime, &cancel).await,
                LoopControl::Disable
            ) {
                break;
            }
        }
        runtime.set_next_run(None);
        debug!(task = %task.name(), "task timer stopped");
    }

    /// One firing plus its retry chain. Returns `Disable` once the retry
    /// budget is exhausted.
    async fn run_with_retries(
        &self,
        task: &Arc<dyn CronTask>,
        runtime: &TaskRuntime,
        cancel: &CancellationToken,
    ) -> LoopControl {
        loop {
            match self.run_firing(task, runtime, cancel).await {
                FiringOutcome::Completed => {
                    runtime.retry_count.store(0, Ordering::SeqCst);
                    return LoopControl::Continue;
                }
                FiringOutcome::Skipped => return LoopControl::Continue,
                FiringOutcome::Failed => {
                    let failures = runtime.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
                    if failures >= self.config.max_retries {
                        runtime.disabled.store(true, Ordering::SeqCst);
                        error!(
                            task = %task.name(),
                            failures,
                            "task disabled after repeated failures; manual restart required"
                        );
                        return LoopControl::Disable;
                    }

                    let delay = backoff_delay(self.config.retry_base_delay, failures);
                    warn!(
                        task = %task.name(),
                        attempt = failures + 1,
                        delay_ms = delay.as_millis() as u64,
                        "task failed, retrying after backoff"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return LoopControl::Continue,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// The guarded execution sequence for a single firing.
    ///
    /// The `executing` flag is the in-process gate: the lock is re-entrant
    /// for this instance, so without it an execute-now overlapping a timer
    /// firing of the same task would run the body twice. An overlapping
    /// firing is skipped, the same way cross-instance lock contention is.
    async fn run_firing(
        &self,
        task: &Arc<dyn CronTask>,
        runtime: &TaskRuntime,
        cancel: &CancellationToken,
    ) -> FiringOutcome {
        if runtime
            .executing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(task = %task.name(), "skipping firing: already executing in this process");
            return FiringOutcome::Skipped;
        }
        let outcome = self.run_guarded(task, cancel).await;
        runtime.executing.store(false, Ordering::SeqCst);
        outcome
    }

    async fn run_guarded(
        &self,
        task: &Arc<dyn CronTask>,
        cancel: &CancellationToken,
    ) -> FiringOutcome {
        let name = task.name().to_string();

        match task.can_run().await {
            Ok(true) => {}
            Ok(false) => {
                debug!(task = %name, "skipping firing: can_run returned false");
                return FiringOutcome::Skipped;
            }
            Err(e) => {
                warn!(task = %name, error = %e, "skipping firing: can_run failed");
                return FiringOutcome::Skipped;
            }
        }

        match self.lock.try_acquire(&name, &self.instance_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(task = %name, "skipping firing: lock held by another instance");
                return FiringOutcome::Skipped;
            }
            Err(e) => {
                // Fail closed, but make the outage visible in job history
                // instead of skipping silently.
                error!(task = %name, error = %e, "lock store unavailable, firing not executed");
                let message = format!("lock store unavailable: {}", e);
                match self.history.record_start(&name).await {
                    Ok(id) => {
                        if let Err(e) = self
                            .history
                            .record_completion(id, JobStatus::Failed, Some(&message))
                            .await
                        {
                            error!(task = %name, error = %e, "failed to finalize job record");
                        }
                    }
                    Err(e) => error!(task = %name, error = %e, "failed to write job record"),
                }
                return FiringOutcome::Failed;
            }
        }

        let record_id = match self.history.record_start(&name).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!(task = %name, error = %e, "failed to write job record, executing anyway");
                None
            }
        };

        let started = Instant::now();

        // Keep the lease alive while the task runs. Renewing at TTL/3 keeps
        // the near-expiry overlap window negligible.
        let renew_cancel = CancellationToken::new();
        let renew_handle = {
            let lock = Arc::clone(&self.lock);
            let lock_name = name.clone();
            let holder = self.instance_id.clone();
            let token = renew_cancel.clone();
            let interval = (lock.lease_ttl() / 3).max(Duration::from_millis(10));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // Skip first immediate tick
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            if !lock.renew(&lock_name, &holder).await {
                                warn!(lock = %lock_name, "lease renewal failed; lock may have been reclaimed");
                            }
                        }
                    }
                }
            })
        };

        let exec_cancel = cancel.child_token();
        let outcome = match tokio::time::timeout(
            self.config.execution_timeout,
            task.execute(exec_cancel.clone()),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => {
                // Cancellation is cooperative: this stops our wait, not
                // necessarily the underlying work.
                exec_cancel.cancel();
                Err(format!(
                    "execution timed out after {}s",
                    self.config.execution_timeout.as_secs()
                ))
            }
        };

        renew_cancel.cancel();
        let _ = renew_handle.await;

        match &outcome {
            Ok(()) => {
                if let Some(id) = record_id {
                    if let Err(e) = self
                        .history
                        .record_completion(id, JobStatus::Success, None)
                        .await
                    {
                        error!(task = %name, error = %e, "failed to finalize job record");
                    }
                }
                info!(
                    task = %name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "task firing succeeded"
                );
            }
            Err(message) => {
                if let Some(id) = record_id {
                    if let Err(e) = self
                        .history
                        .record_completion(id, JobStatus::Failed, Some(message))
                        .await
                    {
                        error!(task = %name, error = %e, "failed to finalize job record");
                    }
                }
                warn!(task = %name, error = %message, "task firing failed");
            }
        }

        self.lock.release(&name, &self.instance_id).await;

        match outcome {
            Ok(()) => FiringOutcome::Completed,
            Err(_) => FiringOutcome::Failed,
        }
    }
}

/// Validate a cron expression, accepting both the classic 5-field form and
/// the 6/7-field form with seconds. The 5-field form is normalized to fire
/// at second zero.
pub fn validate_schedule(expr: &str) -> Result<cron::Schedule, SchedulerError> {
    let fields = expr.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", expr),
        6 | 7 => expr.to_string(),
        n => {
            return Err(SchedulerError::InvalidSchedule {
                expr: expr.to_string(),
                reason: format!("expected 5 to 7 whitespace-separated fields, got {}", n),
            })
        }
    };

    cron::Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidSchedule {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Delay before retry number `failures` (1-based): `base * 2^(failures-1)`.
fn backoff_delay(base: Duration, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    base * 2u32.saturating_pow(exp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_expressions_are_accepted() {
        let schedule = validate_schedule("* * * * *").unwrap();
        assert!(schedule.upcoming(Utc).next().is_some());

        validate_schedule("0 0 * * *").unwrap();
        validate_schedule("*/5 9-17 * * MON-FRI").unwrap();
    }

    #[test]
    fn six_field_expressions_are_accepted() {
        validate_schedule("0 0 * * * *").unwrap();
        validate_schedule("*/30 * * * * *").unwrap();
    }

    #[test]
    fn malformed_expressions_are_rejected_with_reason() {
        let err = validate_schedule("every hour").unwrap_err();
        match err {
            SchedulerError::InvalidSchedule { expr, reason } => {
                assert_eq!(expr, "every hour");
                assert!(!reason.is_empty());
            }
            other => panic!("unexpected error: {:?}", other),
        }

        assert!(validate_schedule("61 * * * *").is_err());
        assert!(validate_schedule("").is_err());
        assert!(validate_schedule("* * * * * * * *").is_err());
    }

    #[test]
    fn backoff_doubles_per_failure() {
        let base = Duration::from_secs(300);
        assert_eq!(backoff_delay(base, 1), base);
        assert_eq!(backoff_delay(base, 2), base * 2);
        assert_eq!(backoff_delay(base, 3), base * 4);
        assert_eq!(backoff_delay(base, 4), base * 8);
    }
}
