//! Process-wide registry of background tasks with log capture.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{StoreError, UpstreamError};

#[derive(Debug, Error)]
#[error("task cancelled")]
pub struct Cancelled;

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Growing, timestamped log buffer owned by one task.
#[derive(Debug, Default)]
pub struct TaskLog {
    lines: Mutex<Vec<String>>,
}

impl TaskLog {
    fn push(&self, level: &str, msg: &str) {
        let line = format!("{} {level:<5} {msg}", Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"));
        self.lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn flush_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut body = self.lines().join("\n");
        body.push('\n');
        std::fs::write(path, body)
    }
}

/// Handed to every component a task runs; logging goes both to `tracing`
/// and to the task's own buffer.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: Option<Uuid>,
    kind: String,
    log: Arc<TaskLog>,
    cancel: CancelToken,
}

impl TaskContext {
    /// Context for work that is not tracked by a registry (CLI runs, tests).
    pub fn detached(kind: &str) -> Self {
        Self {
            task_id: None,
            kind: kind.to_string(),
            log: Arc::new(TaskLog::default()),
            cancel: CancelToken::default(),
        }
    }

    pub fn task_id(&self) -> Option<Uuid> {
        self.task_id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        info!(task_id = ?self.task_id, kind = %self.kind, "{msg}");
        self.log.push("INFO", msg);
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        warn!(task_id = ?self.task_id, kind = %self.kind, "{msg}");
        self.log.push("WARN", msg);
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        error!(task_id = ?self.task_id, kind = %self.kind, "{msg}");
        self.log.push("ERROR", msg);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Called at stage and batch boundaries.
    pub fn check_cancelled(&self) -> Result<(), Cancelled> {
        if self.cancel.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.log.lines()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed { code: String, message: String },
    Cancelled,
}

impl TaskStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, TaskStatus::Running)
    }
}

/// Stable failure code for an error that escaped a task.
pub fn failure_code(err: &anyhow::Error) -> &'static str {
    if let Some(e) = err.downcast_ref::<StoreError>() {
        return match e {
            StoreError::DependencyMissing(_) => "dependency_missing",
            StoreError::IntegrityViolation(_) => "integrity_violation",
            StoreError::Transient(_) => "store_transient",
            StoreError::NotFound(_) => "not_found",
            StoreError::Database(_) => "store_error",
        };
    }
    if let Some(e) = err.downcast_ref::<UpstreamError>() {
        return match e {
            UpstreamError::Transient { .. } => "upstream_transient",
            UpstreamError::Captcha(_) | UpstreamError::Blocked { .. } => "upstream_blocked",
            _ => "upstream_error",
        };
    }
    "internal"
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub kind: String,
    /// Game or source code the task works on.
    pub subject: String,
    #[serde(flatten)]
    pub status: TaskStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub result: Option<Value>,
}

type TaskOutput = Result<Value>;

struct TaskRecord {
    kind: String,
    subject: String,
    status: TaskStatus,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    result: Option<Value>,
    log: Arc<TaskLog>,
    cancel: CancelToken,
    handle: Option<JoinHandle<TaskOutput>>,
}

impl TaskRecord {
    fn snapshot(&self, id: Uuid) -> TaskSnapshot {
        TaskSnapshot {
            id,
            kind: self.kind.clone(),
            subject: self.subject.clone(),
            status: self.status.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            result: self.result.clone(),
        }
    }

    fn settle(&mut self, joined: Result<TaskOutput, tokio::task::JoinError>) {
        self.end_time = Some(Utc::now());
        self.status = match joined {
            Ok(Ok(value)) => {
                self.result = Some(value);
                TaskStatus::Completed
            }
            Ok(Err(err)) if err.downcast_ref::<Cancelled>().is_some() => TaskStatus::Cancelled,
            Ok(Err(err)) => TaskStatus::Failed {
                code: failure_code(&err).to_string(),
                message: format!("{err:#}"),
            },
            Err(join_err) => TaskStatus::Failed {
                code: if join_err.is_panic() { "panic" } else { "aborted" }.to_string(),
                message: join_err.to_string(),
            },
        };
    }
}

/// Finished tasks kept in memory; older ones survive only as log files.
pub const DEFAULT_MAX_FINISHED: usize = 200;

pub struct TaskRegistry {
    tasks: Mutex<HashMap<Uuid, TaskRecord>>,
    log_dir: PathBuf,
    max_finished: usize,
}

impl TaskRegistry {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            log_dir: log_dir.into(),
            max_finished: DEFAULT_MAX_FINISHED,
        }
    }

    pub fn with_max_finished(mut self, n: usize) -> Self {
        self.max_finished = n;
        self
    }

    /// Drop the oldest settled records beyond `max_finished`.
    fn prune(&self, tasks: &mut HashMap<Uuid, TaskRecord>) {
        let mut finished: Vec<(DateTime<Utc>, Uuid)> = tasks
            .iter()
            .filter(|(_, r)| !r.status.is_running())
            .map(|(id, r)| (r.end_time.unwrap_or(r.start_time), *id))
            .collect();
        if finished.len() <= self.max_finished {
            return;
        }
        finished.sort_unstable();
        let excess = finished.len() - self.max_finished;
        for (_, id) in finished.into_iter().take(excess) {
            tasks.remove(&id);
        }
        info!(evicted = excess, "pruned finished tasks");
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, TaskRecord>> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn log_path(&self, kind: &str, id: Uuid) -> PathBuf {
        self.log_dir.join(format!("{kind}_{id}.log"))
    }

    /// Launch `work` on the runtime and return its task id immediately.
    pub fn spawn<F, Fut>(&self, kind: &str, subject: &str, work: F) -> Uuid
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = TaskOutput> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let ctx = TaskContext {
            task_id: Some(id),
            kind: kind.to_string(),
            log: Arc::new(TaskLog::default()),
            cancel: CancelToken::default(),
        };
        let log = ctx.log.clone();
        let cancel = ctx.cancel.clone();
        let log_path = self.log_path(kind, id);
        let fut = work(ctx.clone());
        let handle = tokio::spawn(async move {
            ctx.info(format!("task started ({})", ctx.kind()));
            let out = fut.await;
            match &out {
                Ok(_) => ctx.info("task completed"),
                Err(e) => ctx.error(format!("task failed: {e:#}")),
            }
            if let Err(e) = ctx.log.flush_to(&log_path) {
                warn!(error = %e, path = %log_path.display(), "failed to write task log");
            }
            out
        });
        let mut tasks = self.lock();
        self.prune(&mut tasks);
        tasks.insert(
            id,
            TaskRecord {
                kind: kind.to_string(),
                subject: subject.to_string(),
                status: TaskStatus::Running,
                start_time: Utc::now(),
                end_time: None,
                result: None,
                log,
                cancel,
                handle: Some(handle),
            },
        );
        drop(tasks);
        info!(%id, kind, subject, "task launched");
        id
    }

    /// Poll every finished handle without blocking, update statuses, and
    /// return all tasks newest first.
    pub fn list(&self) -> Vec<TaskSnapshot> {
        let mut tasks = self.lock();
        for record in tasks.values_mut() {
            let finished = record.handle.as_ref().is_some_and(|h| h.is_finished());
            if !finished {
                continue;
            }
            if let Some(mut handle) = record.handle.take() {
                match (&mut handle).now_or_never() {
                    Some(joined) => record.settle(joined),
                    None => record.handle = Some(handle),
                }
            }
        }
        self.prune(&mut tasks);
        let mut out: Vec<TaskSnapshot> = tasks.iter().map(|(id, r)| r.snapshot(*id)).collect();
        out.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        out
    }

    pub fn get(&self, id: Uuid) -> Option<TaskSnapshot> {
        self.list().into_iter().find(|t| t.id == id)
    }

    pub fn logs(&self, id: Uuid) -> Option<Vec<String>> {
        self.lock().get(&id).map(|r| r.log.lines())
    }

    /// Set the cancel flag; the task stops at its next stage or batch boundary.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.lock().get(&id) {
            Some(r) if r.status.is_running() => {
                r.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Block until the task settles. Used by the CLI and tests.
    pub async fn wait(&self, id: Uuid) -> Option<TaskSnapshot> {
        let handle = self.lock().get_mut(&id)?.handle.take();
        if let Some(handle) = handle {
            let joined = handle.await;
            if let Some(record) = self.lock().get_mut(&id) {
                record.settle(joined);
            }
        }
        self.lock().get(&id).map(|r| r.snapshot(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn completed_task_keeps_result_and_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TaskRegistry::new(dir.path());
        let id = registry.spawn("sync", "mtg", |ctx| async move {
            ctx.info("syncing");
            Ok(json!({"sets": 1}))
        });
        let snap = registry.wait(id).await.unwrap();
        assert_eq!(snap.status, TaskStatus::Completed);
        assert_eq!(snap.result, Some(json!({"sets": 1})));
        assert_eq!(snap.subject, "mtg");
        let logs = registry.logs(id).unwrap();
        assert!(logs.iter().any(|l| l.contains("syncing")));
        let file = std::fs::read_to_string(registry.log_path("sync", id)).unwrap();
        assert!(file.contains("task completed"));
    }

    #[tokio::test]
    async fn failures_carry_a_code() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TaskRegistry::new(dir.path());
        let id = registry.spawn("harvest", "cardkingdom", |_ctx| async move {
            Err(StoreError::DependencyMissing("game mtg".into()).into())
        });
        let snap = registry.wait(id).await.unwrap();
        assert!(matches!(
            snap.status,
            TaskStatus::Failed { ref code, .. } if code == "dependency_missing"
        ));
    }

    #[tokio::test]
    async fn cancellation_is_cooperative() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TaskRegistry::new(dir.path());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let id = registry.spawn("nightly", "all", |ctx| async move {
            let _ = rx.await;
            ctx.check_cancelled()?;
            Ok(Value::Null)
        });
        assert!(registry.cancel(id));
        tx.send(()).unwrap();
        let snap = registry.wait(id).await.unwrap();
        assert_eq!(snap.status, TaskStatus::Cancelled);
        assert!(!registry.cancel(id));
    }

    #[tokio::test]
    async fn list_polls_finished_handles() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TaskRegistry::new(dir.path());
        let id = registry.spawn("sync", "pokemon", |_ctx| async move { Ok(Value::Null) });
        for _ in 0..100 {
            if registry.list().iter().any(|t| t.id == id && !t.status.is_running()) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(registry.get(id).unwrap().status, TaskStatus::Completed);
        assert!(registry.logs(Uuid::new_v4()).is_none());
    }

    #[tokio::test]
    async fn oldest_finished_tasks_are_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TaskRegistry::new(dir.path()).with_max_finished(2);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = registry.spawn("sync", "mtg", |_ctx| async move { Ok(Value::Null) });
            registry.wait(id).await.unwrap();
            ids.push(id);
        }
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let running = registry.spawn("nightly", "all", |_ctx| async move {
            let _ = rx.await;
            Ok(Value::Null)
        });

        let listed: Vec<Uuid> = registry.list().iter().map(|t| t.id).collect();
        assert_eq!(listed.len(), 3);
        assert!(!listed.contains(&ids[0]));
        assert!(listed.contains(&ids[1]) && listed.contains(&ids[2]));
        assert!(listed.contains(&running));
        assert!(registry.log_path("sync", ids[0]).exists());

        tx.send(()).unwrap();
        registry.wait(running).await.unwrap();
    }
}
