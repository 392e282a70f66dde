//! Background tasks: submission, status, cancellation and target locks.
//!
//! A task is externally visible as `pending → running → completed | failed | cancelled`.
//! Locks are taken on submission, all or none, and released when the task ends.

use crate::error::{EngineError, Result};
use crate::merge::ValidationResult;
use crate::store::{AgencyId, FeedId};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Merge,
    Split,
}

/// What a lock protects
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LockKey {
    Agency(AgencyId),
    /// An agency that is about to be created
    AgencyName(String),
    Feed(FeedId),
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LockKey::Agency(id) => write!(f, "agency {id}"),
            LockKey::AgencyName(name) => write!(f, "agency '{name}'"),
            LockKey::Feed(id) => write!(f, "feed {id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub key: LockKey,
    pub mode: LockMode,
}

impl Lock {
    pub fn shared(key: LockKey) -> Self {
        Lock {
            key,
            mode: LockMode::Shared,
        }
    }

    pub fn exclusive(key: LockKey) -> Self {
        Lock {
            key,
            mode: LockMode::Exclusive,
        }
    }
}

/// What a completed task produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    pub agency_id: Option<AgencyId>,
    pub feed_id: Option<FeedId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub id: TaskId,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub message: Option<String>,
    pub outcome: Option<TaskOutcome>,
    /// Last validation of a merge, kept so that a failure can be explained
    pub validation_result: Option<ValidationResult>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct TaskRequest {
    pub kind: TaskKind,
    pub locks: Vec<Lock>,
    pub validation_result: Option<ValidationResult>,
}

pub type Job = Box<dyn FnOnce(&TaskContext) -> Result<TaskOutcome> + Send + 'static>;

/// Handed to a running job
#[derive(Debug, Clone)]
pub struct TaskContext {
    id: TaskId,
    cancelled: Arc<AtomicBool>,
}

impl TaskContext {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fails with [EngineError::Cancelled] once the task has been cancelled
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Submit, poll, cancel
pub trait TaskScheduler: Send + Sync {
    /// Takes the locks of the request and queues the job. A held lock fails with
    /// [EngineError::TargetLocked], the job is not queued behind it.
    fn submit(&self, request: TaskRequest, job: Job) -> Result<TaskId>;
    fn status(&self, id: TaskId) -> Result<Option<TaskInfo>>;
    /// Cancels a task that is not finished yet. Returns false when it already is
    fn cancel(&self, id: TaskId) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Held {
    Shared(usize),
    Exclusive,
}

#[derive(Debug, Default)]
struct LockTable {
    held: BTreeMap<LockKey, Held>,
}

impl LockTable {
    /// The strongest mode requested per key
    fn normalize(locks: &[Lock]) -> BTreeMap<&LockKey, LockMode> {
        let mut modes: BTreeMap<&LockKey, LockMode> = BTreeMap::new();
        for lock in locks {
            let mode = modes.entry(&lock.key).or_insert(lock.mode);
            *mode = (*mode).max(lock.mode);
        }
        modes
    }

    fn try_acquire(&mut self, locks: &[Lock]) -> Result<()> {
        let modes = Self::normalize(locks);
        for (key, mode) in &modes {
            let available = match (self.held.get(*key), mode) {
                (None, _) => true,
                (Some(Held::Shared(_)), LockMode::Shared) => true,
                _ => false,
            };
            if !available {
                return Err(EngineError::TargetLocked(key.to_string()));
            }
        }
        for (key, mode) in modes {
            let held = match (self.held.get(key), mode) {
                (Some(Held::Shared(n)), LockMode::Shared) => Held::Shared(n + 1),
                (_, LockMode::Shared) => Held::Shared(1),
                (_, LockMode::Exclusive) => Held::Exclusive,
            };
            self.held.insert(key.clone(), held);
        }
        Ok(())
    }

    fn release(&mut self, locks: &[Lock]) {
        for key in Self::normalize(locks).into_keys() {
            match self.held.get(key) {
                Some(Held::Shared(n)) if *n > 1 => {
                    self.held.insert(key.clone(), Held::Shared(n - 1));
                }
                _ => {
                    self.held.remove(key);
                }
            }
        }
    }
}

struct Entry {
    info: TaskInfo,
    cancelled: Arc<AtomicBool>,
    locks: Vec<Lock>,
}

/// Task states and lock table shared by the schedulers
#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<BTreeMap<TaskId, Entry>>,
    locks: Mutex<LockTable>,
    last_id: AtomicU64,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the locks and records a pending task
    pub fn register(&self, request: TaskRequest) -> Result<TaskContext> {
        self.locks.lock()?.try_acquire(&request.locks)?;
        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = Entry {
            info: TaskInfo {
                id,
                kind: request.kind,
                status: TaskStatus::Pending,
                message: None,
                outcome: None,
                validation_result: request.validation_result,
                submitted_at: now,
                updated_at: now,
            },
            cancelled: cancelled.clone(),
            locks: request.locks,
        };
        match self.tasks.lock() {
            Ok(mut tasks) => {
                tasks.insert(id, entry);
            }
            Err(e) => {
                self.locks.lock()?.release(&entry.locks);
                return Err(e.into());
            }
        }
        debug!("task {id} ({:?}) registered", request.kind);
        Ok(TaskContext { id, cancelled })
    }

    /// Runs a registered task to its end, unless it was cancelled before starting
    pub fn run(&self, ctx: TaskContext, job: Job) -> Result<()> {
        {
            let mut tasks = self.tasks.lock()?;
            let entry = tasks
                .get_mut(&ctx.id)
                .ok_or_else(|| EngineError::Task(format!("unknown task {}", ctx.id)))?;
            if ctx.is_cancelled() {
                info!("task {} cancelled before it started", ctx.id);
                let locks = std::mem::take(&mut entry.locks);
                drop(tasks);
                return self.finish(ctx.id, Err(EngineError::Cancelled), &locks);
            }
            entry.info.status = TaskStatus::Running;
            entry.info.updated_at = Utc::now();
        }

        info!("task {} running", ctx.id);
        let result = catch_unwind(AssertUnwindSafe(|| job(&ctx)))
            .unwrap_or_else(|_| Err(EngineError::Task("job panicked".to_owned())));

        let locks = {
            let mut tasks = self.tasks.lock()?;
            tasks
                .get_mut(&ctx.id)
                .map(|e| std::mem::take(&mut e.locks))
                .unwrap_or_default()
        };
        self.finish(ctx.id, result, &locks)
    }

    fn finish(&self, id: TaskId, result: Result<TaskOutcome>, locks: &[Lock]) -> Result<()> {
        self.locks.lock()?.release(locks);
        let mut tasks = self.tasks.lock()?;
        let Some(entry) = tasks.get_mut(&id) else {
            return Ok(());
        };
        let info = &mut entry.info;
        info.updated_at = Utc::now();
        match result {
            Ok(outcome) => {
                info!("task {id} completed: {outcome:?}");
                info.status = TaskStatus::Completed;
                info.message = None;
                info.outcome = Some(outcome);
            }
            Err(EngineError::Cancelled) => {
                warn!("task {id} cancelled");
                info.status = TaskStatus::Cancelled;
                info.message = Some("cancelled".to_owned());
            }
            Err(e) => {
                error!("task {id} failed: {e}");
                info.status = TaskStatus::Failed;
                info.message = Some(e.to_string());
            }
        }
        Ok(())
    }

    pub fn status(&self, id: TaskId) -> Result<Option<TaskInfo>> {
        Ok(self.tasks.lock()?.get(&id).map(|e| e.info.clone()))
    }

    pub fn cancel(&self, id: TaskId) -> Result<bool> {
        let mut tasks = self.tasks.lock()?;
        let Some(entry) = tasks.get_mut(&id) else {
            return Ok(false);
        };
        match entry.info.status {
            TaskStatus::Pending => {
                entry.cancelled.store(true, Ordering::SeqCst);
                entry.info.status = TaskStatus::Cancelled;
                entry.info.message = Some("cancelled".to_owned());
                entry.info.updated_at = Utc::now();
                Ok(true)
            }
            TaskStatus::Running => {
                entry.cancelled.store(true, Ordering::SeqCst);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Runs every job synchronously, inside `submit`
#[derive(Default, Clone)]
pub struct InlineScheduler {
    registry: Arc<TaskRegistry>,
}

impl InlineScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskScheduler for InlineScheduler {
    fn submit(&self, request: TaskRequest, job: Job) -> Result<TaskId> {
        let ctx = self.registry.register(request)?;
        let id = ctx.id();
        self.registry.run(ctx, job)?;
        Ok(id)
    }

    fn status(&self, id: TaskId) -> Result<Option<TaskInfo>> {
        self.registry.status(id)
    }

    fn cancel(&self, id: TaskId) -> Result<bool> {
        self.registry.cancel(id)
    }
}

/// Runs jobs on the blocking thread pool of a tokio runtime
#[derive(Clone)]
pub struct TokioScheduler {
    registry: Arc<TaskRegistry>,
    handle: tokio::runtime::Handle,
}

impl TokioScheduler {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        TokioScheduler {
            registry: Arc::new(TaskRegistry::new()),
            handle,
        }
    }

    /// Scheduler bound to the runtime of the caller
    pub fn current() -> Result<Self> {
        tokio::runtime::Handle::try_current()
            .map(Self::new)
            .map_err(|e| EngineError::Task(e.to_string()))
    }

    /// Polls a task until it reaches a terminal state
    pub async fn wait(&self, id: TaskId, poll: Duration) -> Result<TaskInfo> {
        loop {
            match self.registry.status(id)? {
                Some(info) if info.status.is_terminal() => return Ok(info),
                Some(_) => tokio::time::sleep(poll).await,
                None => return Err(EngineError::Task(format!("unknown task {id}"))),
            }
        }
    }
}

impl TaskScheduler for TokioScheduler {
    fn submit(&self, request: TaskRequest, job: Job) -> Result<TaskId> {
        let ctx = self.registry.register(request)?;
        let id = ctx.id();
        let registry = self.registry.clone();
        self.handle.spawn_blocking(move || {
            if let Err(e) = registry.run(ctx, job) {
                error!("task {id} could not be run: {e}");
            }
        });
        Ok(id)
    }

    fn status(&self, id: TaskId) -> Result<Option<TaskInfo>> {
        self.registry.status(id)
    }

    fn cancel(&self, id: TaskId) -> Result<bool> {
        self.registry.cancel(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(locks: Vec<Lock>) -> TaskRequest {
        TaskRequest {
            kind: TaskKind::Merge,
            locks,
            validation_result: None,
        }
    }

    fn done() -> Job {
        Box::new(|_: &TaskContext| -> Result<TaskOutcome> {
            Ok(TaskOutcome {
                agency_id: Some(1),
                feed_id: Some(2),
            })
        })
    }

    #[test]
    fn inline_completion() {
        let scheduler = InlineScheduler::new();
        let id = scheduler.submit(request(vec![]), done()).unwrap();
        let info = scheduler.status(id).unwrap().unwrap();
        assert_eq!(TaskStatus::Completed, info.status);
        assert_eq!(Some(2), info.outcome.unwrap().feed_id);
        assert!(!scheduler.cancel(id).unwrap());
    }

    #[test]
    fn failure_keeps_the_message_and_releases_locks() {
        let scheduler = InlineScheduler::new();
        let lock = || vec![Lock::exclusive(LockKey::Agency(1))];
        let id = scheduler
            .submit(
                request(lock()),
                Box::new(|_: &TaskContext| -> Result<TaskOutcome> {
                    Err(EngineError::Task("disk full".to_owned()))
                }),
            )
            .unwrap();
        let info = scheduler.status(id).unwrap().unwrap();
        assert_eq!(TaskStatus::Failed, info.status);
        assert_eq!(Some("task failure: disk full".to_owned()), info.message);
        assert!(scheduler.submit(request(lock()), done()).is_ok());
    }

    #[test]
    fn panicking_job_fails() {
        let scheduler = InlineScheduler::new();
        let id = scheduler
            .submit(
                request(vec![]),
                Box::new(|_: &TaskContext| -> Result<TaskOutcome> { panic!("boom") }),
            )
            .unwrap();
        assert_eq!(
            TaskStatus::Failed,
            scheduler.status(id).unwrap().unwrap().status
        );
    }

    #[test]
    fn exclusive_lock_is_not_queued_behind() {
        let registry = TaskRegistry::new();
        let _first = registry
            .register(request(vec![Lock::exclusive(LockKey::Agency(7))]))
            .unwrap();
        match registry.register(request(vec![Lock::shared(LockKey::Agency(7))])) {
            Err(e @ EngineError::TargetLocked(_)) => {
                assert!(e.is_retryable());
                assert_eq!("agency 7 is locked by another task, retry later", e.to_string());
            }
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("lock should be held"),
        }
    }

    #[test]
    fn shared_locks_are_compatible() {
        let registry = TaskRegistry::new();
        let a = registry
            .register(request(vec![Lock::shared(LockKey::Feed(1))]))
            .unwrap();
        let b = registry
            .register(request(vec![Lock::shared(LockKey::Feed(1))]))
            .unwrap();
        assert!(registry
            .register(request(vec![Lock::exclusive(LockKey::Feed(1))]))
            .is_err());
        registry.run(a, done()).unwrap();
        assert!(registry
            .register(request(vec![Lock::exclusive(LockKey::Feed(1))]))
            .is_err());
        registry.run(b, done()).unwrap();
        assert!(registry
            .register(request(vec![Lock::exclusive(LockKey::Feed(1))]))
            .is_ok());
    }

    #[test]
    fn locks_are_all_or_nothing() {
        let registry = TaskRegistry::new();
        let _held = registry
            .register(request(vec![Lock::exclusive(LockKey::Feed(2))]))
            .unwrap();
        assert!(registry
            .register(request(vec![
                Lock::exclusive(LockKey::Feed(1)),
                Lock::exclusive(LockKey::Feed(2)),
            ]))
            .is_err());
        assert!(registry
            .register(request(vec![Lock::exclusive(LockKey::Feed(1))]))
            .is_ok());
    }

    #[test]
    fn cancelled_before_start() {
        let registry = TaskRegistry::new();
        let ctx = registry
            .register(request(vec![Lock::exclusive(LockKey::Feed(1))]))
            .unwrap();
        let id = ctx.id();
        assert!(registry.cancel(id).unwrap());
        registry
            .run(
                ctx,
                Box::new(|_: &TaskContext| -> Result<TaskOutcome> {
                    panic!("a cancelled task must not run")
                }),
            )
            .unwrap();
        let info = registry.status(id).unwrap().unwrap();
        assert_eq!(TaskStatus::Cancelled, info.status);
        assert!(registry
            .register(request(vec![Lock::exclusive(LockKey::Feed(1))]))
            .is_ok());
    }

    #[test]
    fn cancelled_while_running() {
        let registry = Arc::new(TaskRegistry::new());
        let ctx = registry.register(request(vec![])).unwrap();
        let id = ctx.id();
        let inner = registry.clone();
        registry
            .run(
                ctx,
                Box::new(move |ctx: &TaskContext| -> Result<TaskOutcome> {
                    ctx.checkpoint()?;
                    inner.cancel(ctx.id())?;
                    ctx.checkpoint()?;
                    Ok(TaskOutcome::default())
                }),
            )
            .unwrap();
        assert_eq!(
            TaskStatus::Cancelled,
            registry.status(id).unwrap().unwrap().status
        );
    }

    #[tokio::test]
    async fn tokio_scheduler() {
        let scheduler = TokioScheduler::current().unwrap();
        let id = scheduler.submit(request(vec![]), done()).unwrap();
        let info = scheduler
            .wait(id, Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(TaskStatus::Completed, info.status);
        assert!(info.updated_at >= info.submitted_at);
    }
}
