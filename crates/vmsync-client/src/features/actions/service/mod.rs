pub mod pending;
pub mod transition;

pub use pending::{PendingActions, PendingToken};
pub use transition::{provisional_status, AppliedTransition, OptimisticTransitionEngine};

use crate::features::actions::repo::{ActionBus, ActionEvent, ActionEventKind, Subscription};
use crate::features::observability::controller::{
    global_observability_controller, ObservabilityController,
};
use crate::features::resource_sync::repo::ResourceRepository;
use crate::features::resource_sync::service::{RefreshMode, RequestGate};
use crate::shared::error::{SyncError, SyncResult};
use crate::shared::types::{ActionKind, ActionResult, ResourceId};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

struct Started {
    resource_id: ResourceId,
    action: ActionKind,
    token: PendingToken,
    applied: AppliedTransition,
}

struct ExecutorInner {
    bus: ActionBus,
    repo: Arc<dyn ResourceRepository>,
    engine: OptimisticTransitionEngine,
    gate: Option<Arc<RequestGate>>,
    scope: Option<ResourceId>,
    pending: PendingActions,
    observability: Arc<ObservabilityController>,
}

impl ExecutorInner {
    fn accepts(&self, resource_id: ResourceId) -> bool {
        self.scope.map_or(true, |scoped| scoped == resource_id)
    }

    /// Synchronous half: claim the pair and show the provisional status.
    fn begin(&self, resource_id: ResourceId, action: ActionKind) -> Option<Started> {
        let token = self.pending.try_begin(resource_id, action)?;
        let applied = self.engine.apply(resource_id, action);
        Some(Started {
            resource_id,
            action,
            token,
            applied,
        })
    }

    /// Asynchronous half: perform the call, settle local state and report.
    async fn complete(&self, started: Started) -> ActionResult {
        let Started {
            resource_id,
            action,
            token,
            applied,
        } = started;

        let result = match self.repo.perform_action(resource_id, action).await {
            Ok(()) => {
                info!(resource_id, action = %action, "Action accepted by backend");
                ActionResult::success(resource_id, action)
            }
            Err(err) => {
                warn!(resource_id, action = %action, error = %err, "Action failed");
                self.engine.rollback(&applied);
                ActionResult::failure(resource_id, action, err.to_string())
            }
        };

        self.pending.finish_if(resource_id, action, token);
        self.observability
            .record_action(action.as_str(), result.is_success());
        self.bus.publish_completed(result.clone());

        if !result.is_success() {
            if let Some(gate) = &self.gate {
                let outcome = gate.refresh(RefreshMode::Resync).await;
                debug!(resource_id, outcome = outcome.as_str(), "Corrective poll after failed action");
            }
        }

        result
    }
}

/// Performs actions for the surface that owns the authoritative network
/// call, answering every accepted `action-requested` with exactly one
/// `action-completed`.
pub struct ActionExecutor {
    inner: Arc<ExecutorInner>,
    runtime: Handle,
    _subscription: Subscription,
}

impl ActionExecutor {
    /// Subscribes to `action-requested` on `bus`. With `scope` set only
    /// requests for that resource are handled. Must be called inside a tokio
    /// runtime.
    pub fn mount(
        bus: ActionBus,
        repo: Arc<dyn ResourceRepository>,
        engine: OptimisticTransitionEngine,
        gate: Option<Arc<RequestGate>>,
        scope: Option<ResourceId>,
    ) -> SyncResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| SyncError::Config(format!("action executor needs a tokio runtime: {e}")))?;

        let inner = Arc::new(ExecutorInner {
            bus: bus.clone(),
            repo,
            engine,
            gate,
            scope,
            pending: PendingActions::new(),
            observability: global_observability_controller(),
        });

        let weak = Arc::downgrade(&inner);
        let spawner = runtime.clone();
        let subscription = bus.subscribe(ActionEventKind::Requested, move |event| {
            let ActionEvent::Requested(request) = event else {
                return;
            };
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !inner.accepts(request.resource_id) {
                return;
            }

            match inner.begin(request.resource_id, request.action) {
                Some(started) => {
                    spawner.spawn(async move {
                        inner.complete(started).await;
                    });
                }
                None => debug!(
                    resource_id = request.resource_id,
                    action = %request.action,
                    "Action already executing, request ignored"
                ),
            }
        });

        Ok(Self {
            inner,
            runtime,
            _subscription: subscription,
        })
    }

    /// Runs an action directly, without going through the bus for the
    /// request. Completion is still published. Once the pair is claimed the
    /// call runs to completion even if the returned future is dropped.
    pub async fn dispatch(&self, resource_id: ResourceId, action: ActionKind) -> SyncResult<ActionResult> {
        if !self.inner.accepts(resource_id) {
            return Err(SyncError::ResourceNotFound(resource_id));
        }
        let started = self
            .inner
            .begin(resource_id, action)
            .ok_or(SyncError::ActionPending {
                resource_id,
                action,
            })?;
        let inner = Arc::clone(&self.inner);
        self.runtime
            .spawn(async move { inner.complete(started).await })
            .await
            .map_err(|e| {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
                SyncError::Cancelled
            })
    }

    pub fn is_pending(&self, resource_id: ResourceId, action: ActionKind) -> bool {
        self.inner.pending.is_pending(resource_id, action)
    }

    pub fn is_busy(&self, resource_id: ResourceId) -> bool {
        self.inner.pending.is_busy(resource_id)
    }

    pub fn scope(&self) -> Option<ResourceId> {
        self.inner.scope
    }
}
