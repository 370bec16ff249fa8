pub mod gate;

pub use gate::{CycleOutcome, FetchScope, RefreshMode, RequestGate};

use crate::shared::types::{Resource, ResourceId, ResourcePatch, ResourceStatus, Snapshot};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Owner of the cached resource list.
///
/// Readers get immutable `Arc<Snapshot>` values; the only writers are `replace`
/// and the transition methods, each of which publishes a whole new snapshot.
#[derive(Clone)]
pub struct SnapshotStore {
    tx: Arc<watch::Sender<Arc<Snapshot>>>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(Snapshot::empty()));
        Self { tx: Arc::new(tx) }
    }

    /// Merge a freshly fetched list. This is the only way to add or remove
    /// resources.
    pub fn replace(&self, next: Vec<Resource>) -> Arc<Snapshot> {
        let synced_at = Utc::now();
        let mut published = None;
        self.tx.send_modify(|current| {
            let merged = Arc::new(current.merged(next, synced_at));
            published = Some(Arc::clone(&merged));
            *current = merged;
        });
        published.unwrap_or_else(|| self.read())
    }

    /// Overwrite the patched fields of one existing resource. Returns false
    /// and leaves the snapshot alone when the id is absent.
    pub fn apply_transition(&self, id: ResourceId, patch: ResourcePatch) -> bool {
        self.tx.send_if_modified(|current| match current.patched(id, &patch) {
            Some(next) => {
                *current = Arc::new(next);
                true
            }
            None => {
                debug!(resource_id = id, "Transition for unknown resource ignored");
                false
            }
        })
    }

    /// Like `apply_transition`, but only while the resource still has
    /// `expected` as its status.
    pub fn compare_and_transition(
        &self,
        id: ResourceId,
        expected: ResourceStatus,
        patch: ResourcePatch,
    ) -> bool {
        self.tx.send_if_modified(|current| {
            let matches = current
                .get(id)
                .map(|resource| resource.status == expected)
                .unwrap_or(false);
            if !matches {
                return false;
            }
            match current.patched(id, &patch) {
                Some(next) => {
                    *current = Arc::new(next);
                    true
                }
                None => false,
            }
        })
    }

    pub fn read(&self) -> Arc<Snapshot> {
        Arc::clone(&*self.tx.borrow())
    }

    pub fn get(&self, id: ResourceId) -> Option<Arc<Resource>> {
        self.tx.borrow().get(id).cloned()
    }

    pub fn status(&self, id: ResourceId) -> Option<ResourceStatus> {
        self.tx.borrow().get(id).map(|resource| resource.status)
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.tx.subscribe()
    }
}
