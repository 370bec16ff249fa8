use crate::features::observability::controller::{
    global_observability_controller, ObservabilityController,
};
use crate::features::resource_sync::repo::ResourceRepository;
use crate::features::resource_sync::service::SnapshotStore;
use crate::shared::error::{SyncError, SyncResult};
use crate::shared::types::{ListQuery, Resource, ResourceDetail, ResourceId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What one poll cycle fetches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchScope {
    List(ListQuery),
    Detail(ResourceId),
}

impl FetchScope {
    pub fn label(&self) -> &'static str {
        match self {
            FetchScope::List(_) => "list",
            FetchScope::Detail(_) => "detail",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// User-initiated. Supersedes any in-flight fetch and drives the loading
    /// indicator.
    Visible,
    /// Background tick. Skipped while another fetch is in flight and never
    /// touches the loading indicator.
    Silent,
    /// Corrective refresh after a failed action. Supersedes like `Visible`
    /// without raising the indicator.
    Resync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Merged { version: u64, resources: usize },
    Skipped,
    Superseded,
    Cancelled,
    Failed,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Merged { .. } => "merged",
            CycleOutcome::Skipped => "skipped",
            CycleOutcome::Superseded => "superseded",
            CycleOutcome::Cancelled => "cancelled",
            CycleOutcome::Failed => "failed",
        }
    }

    pub fn is_merged(&self) -> bool {
        matches!(self, CycleOutcome::Merged { .. })
    }
}

enum Fetched {
    List(Vec<Resource>),
    Detail(ResourceDetail),
}

struct InFlight {
    seq: u64,
    token: CancellationToken,
}

/// Held by a running cycle. If the cycle's future is dropped before it
/// settles, the slot and the loading indicator are released here so later
/// cycles are not skipped forever.
struct InFlightGuard<'a> {
    gate: &'a RequestGate,
    seq: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let abandoned = {
            let mut in_flight = self.gate.lock_in_flight();
            match in_flight.as_ref() {
                Some(registered) if registered.seq == self.seq => in_flight.take(),
                _ => None,
            }
        };
        if let Some(abandoned) = abandoned {
            debug!(scope = self.gate.scope.label(), seq = self.seq, "Fetch abandoned before settling");
            abandoned.token.cancel();
            self.gate.set_loading(false);
        }
    }
}

/// Serializes fetch-and-merge cycles for one store.
///
/// Every fetch gets a sequence number and a child of the gate's shutdown
/// token. Only the fetch whose number is still registered as in flight when
/// it resolves may write to the store.
pub struct RequestGate {
    repo: Arc<dyn ResourceRepository>,
    store: SnapshotStore,
    scope: FetchScope,
    sequence: AtomicU64,
    in_flight: Mutex<Option<InFlight>>,
    loading: watch::Sender<bool>,
    detail: watch::Sender<Option<Arc<ResourceDetail>>>,
    shutdown: CancellationToken,
    observability: Arc<ObservabilityController>,
}

impl RequestGate {
    pub fn new(repo: Arc<dyn ResourceRepository>, store: SnapshotStore, scope: FetchScope) -> Self {
        let (loading, _) = watch::channel(false);
        let (detail, _) = watch::channel(None);
        Self {
            repo,
            store,
            scope,
            sequence: AtomicU64::new(0),
            in_flight: Mutex::new(None),
            loading,
            detail,
            shutdown: CancellationToken::new(),
            observability: global_observability_controller(),
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn scope(&self) -> &FetchScope {
        &self.scope
    }

    /// Run one fetch-and-merge cycle. Never returns an error: failures are
    /// logged and leave the cached snapshot as it was. Dropping the future
    /// mid-fetch cancels that fetch and frees the gate.
    pub async fn refresh(&self, mode: RefreshMode) -> CycleOutcome {
        if self.shutdown.is_cancelled() {
            return self.record(CycleOutcome::Cancelled);
        }

        let (seq, token) = {
            let mut in_flight = self.lock_in_flight();
            if mode == RefreshMode::Silent {
                if let Some(current) = in_flight.as_ref() {
                    debug!(scope = self.scope.label(), in_flight = current.seq, "Fetch in flight, skipping cycle");
                    return self.record(CycleOutcome::Skipped);
                }
            }
            if let Some(previous) = in_flight.take() {
                debug!(scope = self.scope.label(), superseded = previous.seq, "Cancelling superseded fetch");
                previous.token.cancel();
            }

            let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            let token = self.shutdown.child_token();
            *in_flight = Some(InFlight {
                seq,
                token: token.clone(),
            });
            (seq, token)
        };
        let _guard = InFlightGuard { gate: self, seq };

        if mode == RefreshMode::Visible {
            self.set_loading(true);
        }

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(SyncError::Cancelled),
            fetched = self.fetch() => fetched,
        };

        let outcome = self.settle(seq, result);
        self.record(outcome)
    }

    /// Cancel the in-flight fetch, if any. Later cycles still run.
    pub fn cancel_in_flight(&self) {
        if let Some(previous) = self.lock_in_flight().take() {
            debug!(scope = self.scope.label(), seq = previous.seq, "Cancelling in-flight fetch");
            previous.token.cancel();
        }
        self.set_loading(false);
    }

    /// Cancel the in-flight fetch and refuse every later cycle.
    pub fn teardown(&self) {
        self.shutdown.cancel();
        self.lock_in_flight().take();
        self.set_loading(false);
        debug!(scope = self.scope.label(), "Request gate torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn is_fetching(&self) -> bool {
        self.lock_in_flight().is_some()
    }

    pub fn loading(&self) -> watch::Receiver<bool> {
        self.loading.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        *self.loading.borrow()
    }

    /// Latest detail payload, only ever set for `FetchScope::Detail`.
    pub fn detail(&self) -> Option<Arc<ResourceDetail>> {
        self.detail.borrow().clone()
    }

    pub fn subscribe_detail(&self) -> watch::Receiver<Option<Arc<ResourceDetail>>> {
        self.detail.subscribe()
    }

    async fn fetch(&self) -> SyncResult<Fetched> {
        match &self.scope {
            FetchScope::List(query) => self.repo.list_resources(query).await.map(Fetched::List),
            FetchScope::Detail(id) => self.repo.get_resource(*id).await.map(Fetched::Detail),
        }
    }

    fn settle(&self, seq: u64, result: SyncResult<Fetched>) -> CycleOutcome {
        if self.shutdown.is_cancelled() {
            return CycleOutcome::Cancelled;
        }

        {
            let mut in_flight = self.lock_in_flight();
            match in_flight.as_ref() {
                Some(registered) if registered.seq == seq => {
                    in_flight.take();
                }
                Some(_) => {
                    debug!(scope = self.scope.label(), seq, "Discarding result of superseded fetch");
                    return CycleOutcome::Superseded;
                }
                None => return CycleOutcome::Cancelled,
            }
        }

        self.set_loading(false);

        match result {
            Ok(Fetched::List(resources)) => {
                let snapshot = self.store.replace(resources);
                self.observability.set_snapshot_size(snapshot.len());
                CycleOutcome::Merged {
                    version: snapshot.version(),
                    resources: snapshot.len(),
                }
            }
            Ok(Fetched::Detail(detail)) => {
                let snapshot = self.store.replace(vec![detail.resource.clone()]);
                self.detail.send_replace(Some(Arc::new(detail)));
                CycleOutcome::Merged {
                    version: snapshot.version(),
                    resources: snapshot.len(),
                }
            }
            Err(SyncError::Cancelled) => CycleOutcome::Cancelled,
            Err(err) => {
                warn!(
                    scope = self.scope.label(),
                    error = %err,
                    transient = err.is_transient(),
                    "Fetch failed, keeping cached snapshot"
                );
                CycleOutcome::Failed
            }
        }
    }

    fn record(&self, outcome: CycleOutcome) -> CycleOutcome {
        self.observability
            .record_poll_cycle(self.scope.label(), outcome.as_str());
        outcome
    }

    fn set_loading(&self, value: bool) {
        self.loading.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, Option<InFlight>> {
        // The guarded state is a plain Option; a panic elsewhere cannot leave
        // it half-written.
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RequestGate {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::resource_sync::repo::{InMemoryResourceRepository, MockResourceRepository};
    use crate::shared::types::ResourceStatus;
    use std::time::Duration;

    fn fleet() -> Vec<Resource> {
        vec![
            Resource::new(1, ResourceStatus::PoweredOn),
            Resource::new(2, ResourceStatus::PoweredOff),
        ]
    }

    fn list_gate(repo: &InMemoryResourceRepository) -> Arc<RequestGate> {
        Arc::new(RequestGate::new(
            Arc::new(repo.clone()),
            SnapshotStore::new(),
            FetchScope::List(ListQuery::default()),
        ))
    }

    async fn wait_for_list_calls(repo: &InMemoryResourceRepository, calls: usize) {
        while repo.list_calls() < calls {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_visible_refresh_merges_and_toggles_loading() {
        let repo = InMemoryResourceRepository::with_resources(fleet());
        repo.hold_lists();
        let gate = list_gate(&repo);

        let pending = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.refresh(RefreshMode::Visible).await })
        };
        wait_for_list_calls(&repo, 1).await;
        assert!(gate.is_loading());
        assert!(gate.is_fetching());

        repo.release_lists(1);
        let outcome = pending.await.unwrap();

        assert_eq!(
            outcome,
            CycleOutcome::Merged {
                version: 1,
                resources: 2
            }
        );
        assert!(!gate.is_loading());
        assert!(!gate.is_fetching());
        assert_eq!(gate.store().read().ids(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_silent_refresh_never_toggles_loading() {
        let repo = InMemoryResourceRepository::with_resources(fleet());
        let gate = list_gate(&repo);
        let mut loading = gate.loading();

        assert!(gate.refresh(RefreshMode::Silent).await.is_merged());
        assert!(!loading.has_changed().unwrap());
        assert!(!*loading.borrow_and_update());
    }

    #[tokio::test]
    async fn test_silent_refresh_skipped_while_fetch_in_flight() {
        let repo = InMemoryResourceRepository::with_resources(fleet());
        repo.hold_lists();
        let gate = list_gate(&repo);

        let first = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.refresh(RefreshMode::Silent).await })
        };
        wait_for_list_calls(&repo, 1).await;

        assert_eq!(gate.refresh(RefreshMode::Silent).await, CycleOutcome::Skipped);
        assert_eq!(repo.list_calls(), 1);

        repo.release_lists(1);
        assert!(first.await.unwrap().is_merged());
    }

    #[tokio::test]
    async fn test_manual_refresh_supersedes_background_fetch() {
        let repo = InMemoryResourceRepository::with_resources(fleet());
        repo.hold_lists();
        let gate = list_gate(&repo);

        let background = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.refresh(RefreshMode::Silent).await })
        };
        wait_for_list_calls(&repo, 1).await;

        repo.set_resources(vec![Resource::new(3, ResourceStatus::Suspended)]);
        let manual = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.refresh(RefreshMode::Visible).await })
        };
        wait_for_list_calls(&repo, 2).await;

        assert_eq!(background.await.unwrap(), CycleOutcome::Superseded);
        assert!(gate.store().read().is_empty());

        repo.release_lists(2);
        assert!(manual.await.unwrap().is_merged());

        let snapshot = gate.store().read();
        assert_eq!(snapshot.ids(), vec![3]);
        assert_eq!(snapshot.version(), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_cached_snapshot() {
        let repo = InMemoryResourceRepository::with_resources(fleet());
        let gate = list_gate(&repo);
        assert!(gate.refresh(RefreshMode::Silent).await.is_merged());
        let cached = gate.store().read();

        repo.fail_next_lists(1);
        assert_eq!(gate.refresh(RefreshMode::Visible).await, CycleOutcome::Failed);

        assert!(Arc::ptr_eq(&cached, &gate.store().read()));
        assert!(!gate.is_loading());
    }

    #[tokio::test]
    async fn test_http_error_from_mock_is_swallowed() {
        let mut repo = MockResourceRepository::new();
        repo.expect_list_resources().times(1).returning(|_| {
            Err(SyncError::HttpStatus {
                status: 500,
                message: "internal error".to_string(),
            })
        });

        let gate = RequestGate::new(
            Arc::new(repo),
            SnapshotStore::new(),
            FetchScope::List(ListQuery::default()),
        );

        assert_eq!(gate.refresh(RefreshMode::Silent).await, CycleOutcome::Failed);
        assert_eq!(gate.store().read().version(), 0);
    }

    #[tokio::test]
    async fn test_teardown_cancels_in_flight_and_later_cycles() {
        let repo = InMemoryResourceRepository::with_resources(fleet());
        repo.hold_lists();
        let gate = list_gate(&repo);

        let pending = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.refresh(RefreshMode::Visible).await })
        };
        wait_for_list_calls(&repo, 1).await;

        gate.teardown();
        assert_eq!(pending.await.unwrap(), CycleOutcome::Cancelled);
        assert!(!gate.is_loading());

        repo.resume_lists();
        assert_eq!(gate.refresh(RefreshMode::Visible).await, CycleOutcome::Cancelled);
        assert_eq!(repo.list_calls(), 1);
        assert!(gate.store().read().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_in_flight_discards_result_but_keeps_gate_usable() {
        let repo = InMemoryResourceRepository::with_resources(fleet());
        repo.hold_lists();
        let gate = list_gate(&repo);

        let pending = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.refresh(RefreshMode::Visible).await })
        };
        wait_for_list_calls(&repo, 1).await;

        gate.cancel_in_flight();
        assert_eq!(pending.await.unwrap(), CycleOutcome::Cancelled);
        assert!(gate.store().read().is_empty());

        repo.resume_lists();
        assert!(gate.refresh(RefreshMode::Silent).await.is_merged());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_refresh_frees_gate_for_silent_cycles() {
        let repo = InMemoryResourceRepository::with_resources(fleet());
        repo.hold_lists();
        let gate = list_gate(&repo);

        let abandoned =
            tokio::time::timeout(Duration::from_secs(1), gate.refresh(RefreshMode::Visible)).await;
        assert!(abandoned.is_err());
        assert_eq!(repo.list_calls(), 1);
        assert!(!gate.is_fetching());
        assert!(!gate.is_loading());

        repo.resume_lists();
        repo.set_resources(vec![Resource::new(9, ResourceStatus::Suspended)]);
        assert!(gate.refresh(RefreshMode::Silent).await.is_merged());
        assert_eq!(gate.store().read().ids(), vec![9]);
    }

    #[tokio::test]
    async fn test_superseded_cycle_leaves_newer_fetch_registered() {
        let repo = InMemoryResourceRepository::with_resources(fleet());
        repo.hold_lists();
        let gate = list_gate(&repo);

        let background = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.refresh(RefreshMode::Silent).await })
        };
        wait_for_list_calls(&repo, 1).await;

        let manual = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.refresh(RefreshMode::Visible).await })
        };
        wait_for_list_calls(&repo, 2).await;
        assert_eq!(background.await.unwrap(), CycleOutcome::Superseded);

        assert!(gate.is_fetching());
        assert!(gate.is_loading());

        repo.release_lists(2);
        assert!(manual.await.unwrap().is_merged());
        assert!(!gate.is_loading());
    }

    #[tokio::test]
    async fn test_detail_scope_keeps_latest_detail() {
        let repo = InMemoryResourceRepository::with_resources(fleet());
        let gate = RequestGate::new(
            Arc::new(repo.clone()),
            SnapshotStore::new(),
            FetchScope::Detail(2),
        );

        assert!(gate.refresh(RefreshMode::Visible).await.is_merged());

        let detail = gate.detail().unwrap();
        assert_eq!(detail.resource.id, 2);
        assert_eq!(gate.store().read().ids(), vec![2]);
        assert_eq!(repo.detail_calls(), 1);
        assert_eq!(repo.list_calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_detail_is_a_failed_cycle() {
        let repo = InMemoryResourceRepository::with_resources(fleet());
        let gate = RequestGate::new(
            Arc::new(repo),
            SnapshotStore::new(),
            FetchScope::Detail(404),
        );

        assert_eq!(gate.refresh(RefreshMode::Silent).await, CycleOutcome::Failed);
        assert!(gate.detail().is_none());
    }
}
