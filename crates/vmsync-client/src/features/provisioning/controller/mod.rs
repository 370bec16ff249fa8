use crate::features::provisioning::repo::TaskRepository;
use crate::features::provisioning::service::{TaskPollHandle, TaskPollerConfig, TaskProgressPoller};
use crate::features::resource_sync::service::{RefreshMode, RequestGate};
use crate::shared::error::{SyncError, SyncResult};
use crate::shared::types::{ProvisionRequest, ResourceId, TaskId, TaskStatus};
use std::sync::Arc;
use tracing::{info, warn};

/// Starts provisioning operations and follows them to completion.
pub struct ProvisioningController {
    repo: Arc<dyn TaskRepository>,
    poller: TaskProgressPoller,
    gate: Option<Arc<RequestGate>>,
}

impl ProvisioningController {
    /// `gate`, when given, is refreshed after a successful operation so the
    /// new resource shows up without waiting for the next tick.
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        config: TaskPollerConfig,
        gate: Option<Arc<RequestGate>>,
    ) -> Self {
        let poller = TaskProgressPoller::new(Arc::clone(&repo), config);
        Self { repo, poller, gate }
    }

    pub async fn submit(&self, request: &ProvisionRequest) -> SyncResult<TaskPollHandle> {
        let task_id = self.repo.provision(request).await?;
        info!(task_id = %task_id, name = %request.name, "Provisioning started");
        Ok(self.poller.spawn(task_id))
    }

    /// Resumes following a task whose id is already known.
    pub fn track(&self, task_id: impl Into<TaskId>) -> TaskPollHandle {
        self.poller.spawn(task_id)
    }

    /// Submits `request` and waits for the terminal status. Returns the id of
    /// the created resource when the backend reports one.
    pub async fn provision_and_wait(&self, request: &ProvisionRequest) -> SyncResult<Option<ResourceId>> {
        let mut handle = self.submit(request).await?;
        let task = handle.wait_terminal().await?;

        match task.status {
            TaskStatus::Succeeded => {
                if let Some(gate) = &self.gate {
                    gate.refresh(RefreshMode::Resync).await;
                }
                Ok(task.resource_id)
            }
            _ => {
                warn!(
                    task_id = %handle.task_id(),
                    completed = task.completed,
                    total = task.total,
                    "Provisioning failed"
                );
                Err(SyncError::TaskFailed(format!(
                    "task {} failed at {}/{}",
                    handle.task_id(),
                    task.completed,
                    task.total
                )))
            }
        }
    }
}
