use crate::features::observability::controller::global_observability_controller;
use crate::features::provisioning::repo::TaskRepository;
use crate::shared::config::SyncConfig;
use crate::shared::error::{SyncError, SyncResult};
use crate::shared::types::{Task, TaskId, TaskStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskPollerConfig {
    pub interval: Duration,
    /// Delay before retrying after a failed status fetch.
    pub backoff: Duration,
}

impl Default for TaskPollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            backoff: Duration::from_secs(3),
        }
    }
}

impl TaskPollerConfig {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            interval: config.task_interval,
            backoff: config.task_backoff,
        }
    }
}

/// What the owner of a task sees while it is being polled.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskProgress {
    pub task_id: TaskId,
    /// Last payload the endpoint returned. Fetch errors never change it.
    pub task: Option<Task>,
    pub polls: u32,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
}

impl TaskProgress {
    fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            task: None,
            polls: 0,
            consecutive_errors: 0,
            last_error: None,
        }
    }

    pub fn status(&self) -> Option<TaskStatus> {
        self.task.as_ref().map(|task| task.status)
    }

    pub fn is_terminal(&self) -> bool {
        self.task.as_ref().map(Task::is_terminal).unwrap_or(false)
    }

    pub fn percent(&self) -> Option<u8> {
        self.task.as_ref().and_then(Task::percent)
    }
}

pub struct TaskProgressPoller {
    repo: Arc<dyn TaskRepository>,
    config: TaskPollerConfig,
}

impl TaskProgressPoller {
    pub fn new(repo: Arc<dyn TaskRepository>, config: TaskPollerConfig) -> Self {
        Self { repo, config }
    }

    /// Polls `task_id` right away and then on every interval until a terminal
    /// status, teardown of the handle, or every receiver is gone.
    pub fn spawn(&self, task_id: impl Into<TaskId>) -> TaskPollHandle {
        let task_id = task_id.into();
        let (tx, rx) = watch::channel(TaskProgress::new(task_id.clone()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_task_poll(
            Arc::clone(&self.repo),
            self.config,
            task_id.clone(),
            tx,
            cancel.clone(),
        ));

        TaskPollHandle {
            task_id,
            progress: rx,
            cancel,
            task,
        }
    }
}

async fn run_task_poll(
    repo: Arc<dyn TaskRepository>,
    config: TaskPollerConfig,
    task_id: TaskId,
    tx: watch::Sender<TaskProgress>,
    cancel: CancellationToken,
) {
    let observability = global_observability_controller();

    loop {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tx.closed() => break,
            fetched = repo.task_status(&task_id) => fetched,
        };

        let delay = match fetched.and_then(|task| {
            task.validate()?;
            Ok(task)
        }) {
            Ok(task) => {
                let terminal = task.is_terminal();
                observability.record_task_poll(&task.status.to_string().to_ascii_lowercase());
                debug!(
                    task_id = %task_id,
                    status = %task.status,
                    completed = task.completed,
                    total = task.total,
                    "Task status polled"
                );
                tx.send_modify(|progress| {
                    progress.polls += 1;
                    progress.consecutive_errors = 0;
                    progress.last_error = None;
                    progress.task = Some(task.clone());
                });

                if terminal {
                    info!(
                        task_id = %task_id,
                        status = %task.status,
                        resource_id = ?task.resource_id,
                        "Task reached terminal state"
                    );
                    break;
                }
                config.interval
            }
            Err(err) => {
                observability.record_task_poll("error");
                warn!(
                    task_id = %task_id,
                    error = %err,
                    backoff_secs = config.backoff.as_secs_f64(),
                    "Task status fetch failed, backing off"
                );
                tx.send_modify(|progress| {
                    progress.polls += 1;
                    progress.consecutive_errors += 1;
                    progress.last_error = Some(err.to_string());
                });
                config.backoff
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tx.closed() => break,
            _ = time::sleep(delay) => {}
        }
    }

    debug!(task_id = %task_id, "Task poller stopped");
}

/// Owner of one task poll. Dropping it stops polling.
pub struct TaskPollHandle {
    task_id: TaskId,
    progress: watch::Receiver<TaskProgress>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TaskPollHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn latest(&self) -> TaskProgress {
        self.progress.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskProgress> {
        self.progress.clone()
    }

    /// Waits for a terminal payload. Fails with `Cancelled` if polling stops
    /// before one arrives.
    pub async fn wait_terminal(&mut self) -> SyncResult<Task> {
        loop {
            if let Some(task) = self.progress.borrow_and_update().task.as_ref() {
                if task.is_terminal() {
                    return Ok(task.clone());
                }
            }
            if self.progress.changed().await.is_err() {
                return self
                    .progress
                    .borrow()
                    .task
                    .clone()
                    .filter(Task::is_terminal)
                    .ok_or(SyncError::Cancelled);
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops polling; no further request is issued.
    pub fn abandon(&self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

impl Drop for TaskPollHandle {
    fn drop(&mut self) {
        self.abandon();
    }
}
