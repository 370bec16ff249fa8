use crate::shared::config::{Endpoints, SyncConfig};
use crate::shared::error::{SyncError, SyncResult};
use crate::shared::http::BackendClient;
use crate::shared::types::{ProvisionAccepted, ProvisionRequest, Task, TaskId};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use tracing::debug;
use uuid::Uuid;

/// Backend access for long-running provisioning operations
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Start an operation and return the backend's task id
    async fn provision(&self, request: &ProvisionRequest) -> SyncResult<TaskId>;

    /// Current status of a task
    async fn task_status(&self, task_id: &str) -> SyncResult<Task>;
}

pub struct HttpTaskRepository {
    client: BackendClient,
    endpoints: Endpoints,
}

impl HttpTaskRepository {
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        Ok(Self::with_client(BackendClient::new(config)?, config.endpoints.clone()))
    }

    pub fn with_client(client: BackendClient, endpoints: Endpoints) -> Self {
        Self { client, endpoints }
    }
}

#[async_trait]
impl TaskRepository for HttpTaskRepository {
    async fn provision(&self, request: &ProvisionRequest) -> SyncResult<TaskId> {
        let accepted: ProvisionAccepted = self
            .client
            .post_json(&[&self.endpoints.resources], request)
            .await?;
        debug!(task_id = %accepted.task_id, name = %request.name, "Provisioning accepted");
        Ok(accepted.task_id)
    }

    async fn task_status(&self, task_id: &str) -> SyncResult<Task> {
        self.client
            .get_json(&[&self.endpoints.tasks, task_id], &[])
            .await
    }
}

/// One scripted answer of the in-memory task endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskStep {
    Status(Task),
    /// Answer with a transport error.
    Unreachable,
}

#[derive(Default)]
struct TaskState {
    scripts: HashMap<TaskId, VecDeque<TaskStep>>,
    next_script: Option<Vec<TaskStep>>,
    polls: HashMap<TaskId, usize>,
    provisioned: Vec<ProvisionRequest>,
}

/// In-memory task endpoint driven by per-task scripts. Each poll consumes one
/// step; the last step repeats forever.
#[derive(Clone, Default)]
pub struct InMemoryTaskRepository {
    state: Arc<RwLock<TaskState>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, task_id: impl Into<TaskId>, steps: Vec<TaskStep>) {
        if let Ok(mut state) = self.state.write() {
            state.scripts.insert(task_id.into(), steps.into());
        }
    }

    /// Script used for the task created by the next `provision` call.
    pub fn script_next_provision(&self, steps: Vec<TaskStep>) {
        if let Ok(mut state) = self.state.write() {
            state.next_script = Some(steps);
        }
    }

    pub fn polls(&self, task_id: &str) -> usize {
        self.state
            .read()
            .ok()
            .and_then(|state| state.polls.get(task_id).copied())
            .unwrap_or(0)
    }

    pub fn provisioned(&self) -> Vec<ProvisionRequest> {
        self.state
            .read()
            .map(|state| state.provisioned.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn provision(&self, request: &ProvisionRequest) -> SyncResult<TaskId> {
        let mut state = self
            .state
            .write()
            .map_err(|_| SyncError::Storage("Lock poisoned".to_string()))?;

        let task_id = Uuid::new_v4().to_string();
        let steps = state
            .next_script
            .take()
            .unwrap_or_else(|| vec![TaskStep::Status(Task::queued(0))]);
        state.scripts.insert(task_id.clone(), steps.into());
        state.provisioned.push(request.clone());
        Ok(task_id)
    }

    async fn task_status(&self, task_id: &str) -> SyncResult<Task> {
        let mut state = self
            .state
            .write()
            .map_err(|_| SyncError::Storage("Lock poisoned".to_string()))?;

        *state.polls.entry(task_id.to_string()).or_insert(0) += 1;

        let script = state
            .scripts
            .get_mut(task_id)
            .ok_or_else(|| SyncError::HttpStatus {
                status: 404,
                message: format!("unknown task {task_id}"),
            })?;
        let step = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };

        match step {
            Some(TaskStep::Status(task)) => Ok(task),
            Some(TaskStep::Unreachable) => {
                Err(SyncError::Transport("task endpoint unreachable".to_string()))
            }
            None => Err(SyncError::Decode(format!("empty script for task {task_id}"))),
        }
    }
}
