pub mod features;
pub mod shared;

use crate::features::actions::controller::ActionRequester;
use crate::features::actions::repo::ActionBus;
use crate::features::actions::service::{ActionExecutor, OptimisticTransitionEngine};
use crate::features::provisioning::controller::ProvisioningController;
use crate::features::provisioning::repo::{HttpTaskRepository, TaskRepository};
use crate::features::provisioning::service::TaskPollerConfig;
use crate::features::resource_sync::controller::{PollController, PollHandle, PollInterval};
use crate::features::resource_sync::repo::{HttpResourceRepository, ResourceRepository};
use crate::features::resource_sync::service::{
    CycleOutcome, FetchScope, RefreshMode, RequestGate, SnapshotStore,
};
use crate::shared::config::{SettingsStore, SyncConfig};
use crate::shared::error::SyncResult;
use crate::shared::http::BackendClient;
use crate::shared::types::{ActionKind, ActionResult, Resource, ResourceDetail, ResourceId};
use std::sync::Arc;
use tracing::info;

/// Everything one dashboard session shares: the action bus, the list store
/// with its gate, persisted settings and the backend repositories.
pub struct SyncSession {
    config: SyncConfig,
    bus: ActionBus,
    list_gate: Arc<RequestGate>,
    settings: SettingsStore,
    resources: Arc<dyn ResourceRepository>,
    tasks: Arc<dyn TaskRepository>,
}

impl SyncSession {
    pub fn new(
        config: SyncConfig,
        resources: Arc<dyn ResourceRepository>,
        tasks: Arc<dyn TaskRepository>,
        settings: SettingsStore,
    ) -> Self {
        let list_gate = Arc::new(RequestGate::new(
            Arc::clone(&resources),
            SnapshotStore::new(),
            FetchScope::List(config.list_query()),
        ));
        Self {
            config,
            bus: ActionBus::new(),
            list_gate,
            settings,
            resources,
            tasks,
        }
    }

    /// Session against the REST backend described by `config`.
    pub fn connect(config: SyncConfig) -> SyncResult<Self> {
        let client = BackendClient::new(&config)?;
        let settings = SettingsStore::from_config(&config)?;
        let resources = Arc::new(HttpResourceRepository::with_client(
            client.clone(),
            config.endpoints.clone(),
        ));
        let tasks = Arc::new(HttpTaskRepository::with_client(
            client,
            config.endpoints.clone(),
        ));
        info!(base_url = %config.base_url, live_mode = settings.live_mode(), "Sync session connected");
        Ok(Self::new(config, resources, tasks, settings))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn bus(&self) -> &ActionBus {
        &self.bus
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    /// Store behind the resource list.
    pub fn store(&self) -> &SnapshotStore {
        self.list_gate.store()
    }

    pub fn list_gate(&self) -> &Arc<RequestGate> {
        &self.list_gate
    }

    pub fn start_list_polling(&self) -> PollHandle {
        PollController::new(
            Arc::clone(&self.list_gate),
            PollInterval::Fixed(self.config.cadence.list),
        )
        .spawn()
    }

    /// Mounts the detail surface for one resource: its own store and gate
    /// polled at live-mode cadence, plus the executor that owns actions on
    /// that resource. Optimistic transitions show in both the detail store
    /// and the list store.
    pub fn mount_detail(&self, resource_id: ResourceId) -> SyncResult<DetailView> {
        let store = SnapshotStore::new();
        let gate = Arc::new(RequestGate::new(
            Arc::clone(&self.resources),
            store.clone(),
            FetchScope::Detail(resource_id),
        ));
        let engine = OptimisticTransitionEngine::new(vec![store.clone(), self.store().clone()]);
        let executor = ActionExecutor::mount(
            self.bus.clone(),
            Arc::clone(&self.resources),
            engine,
            Some(Arc::clone(&gate)),
            Some(resource_id),
        )?;
        let poll = PollController::new(
            Arc::clone(&gate),
            PollInterval::detail(&self.settings, self.config.cadence),
        )
        .spawn();

        Ok(DetailView {
            resource_id,
            store,
            gate,
            poll,
            executor,
        })
    }

    pub fn requester(&self) -> SyncResult<ActionRequester> {
        ActionRequester::mount(self.bus.clone(), self.config.action_timeout)
    }

    pub fn provisioning(&self) -> ProvisioningController {
        ProvisioningController::new(
            Arc::clone(&self.tasks),
            TaskPollerConfig::from_config(&self.config),
            Some(Arc::clone(&self.list_gate)),
        )
    }

    pub fn teardown(&self) {
        self.list_gate.teardown();
    }
}

/// A mounted detail surface. Dropping it stops its poller and unsubscribes
/// its executor.
pub struct DetailView {
    resource_id: ResourceId,
    store: SnapshotStore,
    gate: Arc<RequestGate>,
    poll: PollHandle,
    executor: ActionExecutor,
}

impl DetailView {
    pub fn resource_id(&self) -> ResourceId {
        self.resource_id
    }

    pub fn resource(&self) -> Option<Arc<Resource>> {
        self.store.get(self.resource_id)
    }

    pub fn detail(&self) -> Option<Arc<ResourceDetail>> {
        self.gate.detail()
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn gate(&self) -> &Arc<RequestGate> {
        &self.gate
    }

    pub fn executor(&self) -> &ActionExecutor {
        &self.executor
    }

    pub async fn refresh_now(&self) -> CycleOutcome {
        self.gate.refresh(RefreshMode::Visible).await
    }

    pub async fn dispatch(&self, action: ActionKind) -> SyncResult<ActionResult> {
        self.executor.dispatch(self.resource_id, action).await
    }

    pub fn teardown(&self) {
        self.poll.teardown();
        self.gate.teardown();
    }
}

impl Drop for DetailView {
    fn drop(&mut self) {
        self.gate.teardown();
    }
}
