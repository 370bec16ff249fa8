use crate::features::resource_sync::service::SnapshotStore;
use crate::shared::types::{ActionKind, ResourceId, ResourcePatch, ResourceStatus};
use tracing::{debug, info};

/// Status shown while `action` is in flight, if it has one.
pub fn provisional_status(action: ActionKind) -> Option<ResourceStatus> {
    match action {
        ActionKind::Start | ActionKind::Restart => Some(ResourceStatus::Restarting),
        ActionKind::Stop => Some(ResourceStatus::PoweredOff),
        ActionKind::Sync => None,
    }
}

/// Record of one optimistic write, enough to undo it.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedTransition {
    pub resource_id: ResourceId,
    pub action: ActionKind,
    pub provisional: Option<ResourceStatus>,
    /// `(store index, status before the write)` for every store touched.
    previous: Vec<(usize, ResourceStatus)>,
}

impl AppliedTransition {
    pub fn touched(&self) -> usize {
        self.previous.len()
    }
}

/// Writes provisional statuses into every store that shows the resource.
#[derive(Clone, Default)]
pub struct OptimisticTransitionEngine {
    stores: Vec<SnapshotStore>,
}

impl OptimisticTransitionEngine {
    pub fn new(stores: Vec<SnapshotStore>) -> Self {
        Self { stores }
    }

    pub fn with_store(mut self, store: SnapshotStore) -> Self {
        self.stores.push(store);
        self
    }

    /// Applies the provisional status synchronously. Stores that do not hold
    /// the resource, or already show that status, are left alone.
    pub fn apply(&self, resource_id: ResourceId, action: ActionKind) -> AppliedTransition {
        let provisional = provisional_status(action);
        let mut previous = Vec::new();

        if let Some(status) = provisional {
            for (index, store) in self.stores.iter().enumerate() {
                let Some(before) = store.status(resource_id) else {
                    continue;
                };
                if before == status {
                    continue;
                }
                if store.apply_transition(resource_id, ResourcePatch::status(status)) {
                    previous.push((index, before));
                }
            }
            info!(
                resource_id,
                action = %action,
                status = %status,
                stores = previous.len(),
                "Applied optimistic transition"
            );
        }

        AppliedTransition {
            resource_id,
            action,
            provisional,
            previous,
        }
    }

    /// Restores the pre-transition status in each store that still shows the
    /// provisional one. A store already overwritten by a poll keeps the polled
    /// value. Returns how many stores were restored.
    pub fn rollback(&self, applied: &AppliedTransition) -> usize {
        let Some(provisional) = applied.provisional else {
            return 0;
        };

        let mut restored = 0;
        for (index, before) in &applied.previous {
            let Some(store) = self.stores.get(*index) else {
                continue;
            };
            if store.compare_and_transition(
                applied.resource_id,
                provisional,
                ResourcePatch::status(*before),
            ) {
                restored += 1;
            } else {
                debug!(
                    resource_id = applied.resource_id,
                    "Optimistic status already replaced, not rolling back"
                );
            }
        }

        if restored > 0 {
            info!(
                resource_id = applied.resource_id,
                action = %applied.action,
                restored,
                "Rolled back optimistic transition"
            );
        }
        restored
    }
}
