pub mod http;

use crate::shared::error::{SyncError, SyncResult};
use crate::shared::types::{ActionKind, ListQuery, Resource, ResourceDetail, ResourceId, ResourceStatus};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Semaphore;

pub use http::HttpResourceRepository;

/// Backend access for resource state and state-changing actions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceRepository: Send + Sync {
    /// Fetch the resource list
    async fn list_resources(&self, query: &ListQuery) -> SyncResult<Vec<Resource>>;

    /// Fetch one resource with its nested collections
    async fn get_resource(&self, id: ResourceId) -> SyncResult<ResourceDetail>;

    /// Ask the backend to start/stop/restart/sync a resource. Success only
    /// means the request was accepted, not that the resource converged.
    async fn perform_action(&self, id: ResourceId, action: ActionKind) -> SyncResult<()>;
}

#[derive(Default)]
struct InMemoryState {
    resources: Vec<Resource>,
    list_failures: u32,
    failing_actions: HashSet<(ResourceId, ActionKind)>,
    apply_actions: bool,
    list_calls: usize,
    detail_calls: usize,
    action_calls: Vec<(ResourceId, ActionKind)>,
}

/// In-memory backend with failure injection and a list gate that lets a
/// caller hold list responses in flight.
#[derive(Clone, Default)]
pub struct InMemoryResourceRepository {
    state: Arc<RwLock<InMemoryState>>,
    list_gate: Arc<Mutex<Option<Arc<Semaphore>>>>,
}

impl InMemoryResourceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resources(resources: Vec<Resource>) -> Self {
        let repo = Self::new();
        repo.set_resources(resources);
        repo
    }

    /// Actions also update the stored status, like a backend that converges
    /// instantly.
    pub fn with_action_effects(self) -> Self {
        self.write(|state| state.apply_actions = true);
        self
    }

    pub fn set_resources(&self, resources: Vec<Resource>) {
        self.write(|state| state.resources = resources);
    }

    pub fn set_status(&self, id: ResourceId, status: ResourceStatus) {
        self.write(|state| {
            if let Some(resource) = state.resources.iter_mut().find(|r| r.id == id) {
                resource.status = status;
            }
        });
    }

    pub fn fail_next_lists(&self, count: u32) {
        self.write(|state| state.list_failures = count);
    }

    pub fn fail_action(&self, id: ResourceId, action: ActionKind) {
        self.write(|state| {
            state.failing_actions.insert((id, action));
        });
    }

    pub fn list_calls(&self) -> usize {
        self.read(|state| state.list_calls)
    }

    pub fn detail_calls(&self) -> usize {
        self.read(|state| state.detail_calls)
    }

    pub fn action_calls(&self) -> Vec<(ResourceId, ActionKind)> {
        self.read(|state| state.action_calls.clone())
    }

    /// Park every subsequent list call until `release_lists` or
    /// `resume_lists`. The response content is captured when the call
    /// starts, so a held call returns data as of that moment.
    pub fn hold_lists(&self) {
        if let Ok(mut gate) = self.list_gate.lock() {
            *gate = Some(Arc::new(Semaphore::new(0)));
        }
    }

    pub fn release_lists(&self, count: usize) {
        if let Ok(gate) = self.list_gate.lock() {
            if let Some(semaphore) = gate.as_ref() {
                semaphore.add_permits(count);
            }
        }
    }

    pub fn resume_lists(&self) {
        if let Ok(mut gate) = self.list_gate.lock() {
            if let Some(semaphore) = gate.take() {
                semaphore.close();
            }
        }
    }

    fn write<F: FnOnce(&mut InMemoryState)>(&self, f: F) {
        if let Ok(mut state) = self.state.write() {
            f(&mut state);
        }
    }

    fn read<T: Default, F: FnOnce(&InMemoryState) -> T>(&self, f: F) -> T {
        self.state.read().map(|state| f(&state)).unwrap_or_default()
    }

    fn lock_poisoned() -> SyncError {
        SyncError::Storage("Lock poisoned".to_string())
    }
}

#[async_trait]
impl ResourceRepository for InMemoryResourceRepository {
    async fn list_resources(&self, _query: &ListQuery) -> SyncResult<Vec<Resource>> {
        let result = {
            let mut state = self.state.write().map_err(|_| Self::lock_poisoned())?;
            state.list_calls += 1;
            if state.list_failures > 0 {
                state.list_failures -= 1;
                Err(SyncError::Transport("injected list failure".to_string()))
            } else {
                Ok(state.resources.clone())
            }
        };

        let gate = self
            .list_gate
            .lock()
            .map_err(|_| Self::lock_poisoned())?
            .clone();
        if let Some(semaphore) = gate {
            // A closed gate lets the call through.
            if let Ok(permit) = semaphore.acquire().await {
                permit.forget();
            }
        }

        result
    }

    async fn get_resource(&self, id: ResourceId) -> SyncResult<ResourceDetail> {
        let mut state = self.state.write().map_err(|_| Self::lock_poisoned())?;
        state.detail_calls += 1;
        state
            .resources
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .map(ResourceDetail::new)
            .ok_or(SyncError::ResourceNotFound(id))
    }

    async fn perform_action(&self, id: ResourceId, action: ActionKind) -> SyncResult<()> {
        let mut state = self.state.write().map_err(|_| Self::lock_poisoned())?;
        state.action_calls.push((id, action));

        if state.failing_actions.contains(&(id, action)) {
            return Err(SyncError::HttpStatus {
                status: 502,
                message: format!("{action} rejected by hypervisor"),
            });
        }

        let apply = state.apply_actions;
        let resource = state
            .resources
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(SyncError::ResourceNotFound(id))?;

        if apply {
            match action {
                ActionKind::Start | ActionKind::Restart => resource.status = ResourceStatus::PoweredOn,
                ActionKind::Stop => resource.status = ResourceStatus::PoweredOff,
                ActionKind::Sync => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fleet() -> Vec<Resource> {
        vec![
            Resource::new(1, ResourceStatus::PoweredOn),
            Resource::new(2, ResourceStatus::PoweredOff),
        ]
    }

    #[tokio::test]
    async fn test_list_returns_configured_resources() {
        let repo = InMemoryResourceRepository::with_resources(fleet());
        let list = repo.list_resources(&ListQuery::default()).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(repo.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_injected_list_failures_are_consumed() {
        let repo = InMemoryResourceRepository::with_resources(fleet());
        repo.fail_next_lists(1);

        assert!(repo.list_resources(&ListQuery::default()).await.is_err());
        assert!(repo.list_resources(&ListQuery::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_get_resource_not_found() {
        let repo = InMemoryResourceRepository::with_resources(fleet());
        let result = repo.get_resource(99).await;
        assert!(matches!(result, Err(SyncError::ResourceNotFound(99))));
        assert_eq!(repo.detail_calls(), 1);
    }

    #[tokio::test]
    async fn test_actions_recorded_without_effect_by_default() {
        let repo = InMemoryResourceRepository::with_resources(fleet());
        repo.perform_action(2, ActionKind::Start).await.unwrap();

        assert_eq!(repo.action_calls(), vec![(2, ActionKind::Start)]);
        let detail = repo.get_resource(2).await.unwrap();
        assert_eq!(detail.resource.status, ResourceStatus::PoweredOff);
    }

    #[tokio::test]
    async fn test_action_effects() {
        let repo = InMemoryResourceRepository::with_resources(fleet()).with_action_effects();
        repo.perform_action(2, ActionKind::Start).await.unwrap();

        let detail = repo.get_resource(2).await.unwrap();
        assert_eq!(detail.resource.status, ResourceStatus::PoweredOn);
    }

    #[tokio::test]
    async fn test_failing_action() {
        let repo = InMemoryResourceRepository::with_resources(fleet());
        repo.fail_action(1, ActionKind::Stop);

        let result = repo.perform_action(1, ActionKind::Stop).await;
        assert!(matches!(result, Err(SyncError::HttpStatus { status: 502, .. })));
        assert!(repo.perform_action(1, ActionKind::Restart).await.is_ok());
    }

    #[tokio::test]
    async fn test_held_list_returns_data_from_call_start() {
        let repo = InMemoryResourceRepository::with_resources(fleet());
        repo.hold_lists();

        let pending = {
            let repo = repo.clone();
            tokio::spawn(async move { repo.list_resources(&ListQuery::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!pending.is_finished());

        repo.set_resources(vec![]);
        repo.release_lists(1);

        let list = pending.await.unwrap().unwrap();
        assert_eq!(list.len(), 2);
    }
}
