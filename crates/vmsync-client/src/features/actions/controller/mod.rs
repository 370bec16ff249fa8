use crate::features::actions::repo::{ActionBus, ActionEvent, ActionEventKind, Subscription};
use crate::features::actions::service::{PendingActions, PendingToken};
use crate::shared::error::{SyncError, SyncResult};
use crate::shared::types::{ActionKind, ActionResult, ResourceId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type ActionKey = (ResourceId, ActionKind);

struct RequesterInner {
    pending: PendingActions,
    timers: Mutex<HashMap<ActionKey, JoinHandle<()>>>,
    results: Mutex<HashMap<ActionKey, ActionResult>>,
}

impl RequesterInner {
    fn timers(&self) -> MutexGuard<'_, HashMap<ActionKey, JoinHandle<()>>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn results(&self) -> MutexGuard<'_, HashMap<ActionKey, ActionResult>> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_completed(&self, result: &ActionResult) {
        let key = (result.resource_id, result.action);
        if !self.pending.finish(result.resource_id, result.action) {
            debug!(
                resource_id = result.resource_id,
                action = %result.action,
                "Completion without matching request ignored"
            );
            return;
        }

        if let Some(timer) = self.timers().remove(&key) {
            timer.abort();
        }
        self.results().insert(key, result.clone());
        info!(
            resource_id = result.resource_id,
            action = %result.action,
            success = result.is_success(),
            "Pending action cleared"
        );
    }

    fn on_timeout(&self, key: ActionKey, token: PendingToken, timeout: Duration) {
        if self.pending.finish_if(key.0, key.1, token) {
            self.timers().remove(&key);
            warn!(
                resource_id = key.0,
                action = %key.1,
                timeout_secs = timeout.as_secs_f64(),
                "No completion received, clearing pending action"
            );
        }
    }
}

/// Requesting side of the action bus, for surfaces that show action controls
/// but do not perform the call themselves.
pub struct ActionRequester {
    bus: ActionBus,
    inner: Arc<RequesterInner>,
    timeout: Duration,
    runtime: Handle,
    _subscription: Subscription,
}

impl ActionRequester {
    /// Must be called inside a tokio runtime; the local timeout runs on it.
    pub fn mount(bus: ActionBus, timeout: Duration) -> SyncResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| SyncError::Config(format!("action requester needs a tokio runtime: {e}")))?;

        let inner = Arc::new(RequesterInner {
            pending: PendingActions::new(),
            timers: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
        });

        let weak: Weak<RequesterInner> = Arc::downgrade(&inner);
        let subscription = bus.subscribe(ActionEventKind::Completed, move |event| {
            if let (ActionEvent::Completed(result), Some(inner)) = (event, weak.upgrade()) {
                inner.on_completed(result);
            }
        });

        Ok(Self {
            bus,
            inner,
            timeout,
            runtime,
            _subscription: subscription,
        })
    }

    /// Publishes `action-requested` and marks the pair pending until a
    /// matching completion arrives or the timeout elapses.
    pub fn request(&self, resource_id: ResourceId, action: ActionKind) -> SyncResult<()> {
        let token = self
            .inner
            .pending
            .try_begin(resource_id, action)
            .ok_or(SyncError::ActionPending {
                resource_id,
                action,
            })?;

        let key = (resource_id, action);
        let weak = Arc::downgrade(&self.inner);
        let timeout = self.timeout;
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_timeout(key, token, timeout);
            }
        });
        if let Some(stale) = self.inner.timers().insert(key, timer) {
            stale.abort();
        }

        let delivered = self.bus.publish_requested(resource_id, action);
        if delivered == 0 {
            debug!(resource_id, action = %action, "No executor mounted, waiting for timeout");
        }
        Ok(())
    }

    pub fn is_pending(&self, resource_id: ResourceId, action: ActionKind) -> bool {
        self.inner.pending.is_pending(resource_id, action)
    }

    /// True while any action on the resource is outstanding.
    pub fn is_busy(&self, resource_id: ResourceId) -> bool {
        self.inner.pending.is_busy(resource_id)
    }

    /// Outcome of the last completion that cleared this pair.
    pub fn last_result(&self, resource_id: ResourceId, action: ActionKind) -> Option<ActionResult> {
        self.inner.results().get(&(resource_id, action)).cloned()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Drop for ActionRequester {
    fn drop(&mut self) {
        for (_, timer) in self.inner.timers().drain() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::actions::service::{ActionExecutor, OptimisticTransitionEngine};
    use crate::features::resource_sync::repo::InMemoryResourceRepository;
    use crate::features::resource_sync::service::SnapshotStore;
    use crate::shared::types::{ActionOutcome, Resource, ResourceStatus};

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_round_trip_clears_pending_exactly_once() {
        let bus = ActionBus::new();
        let requester = ActionRequester::mount(bus.clone(), TIMEOUT).unwrap();

        requester.request(3, ActionKind::Start).unwrap();
        assert!(requester.is_pending(3, ActionKind::Start));
        assert!(requester.is_busy(3));

        bus.publish_completed(ActionResult::success(3, ActionKind::Start));
        assert!(!requester.is_pending(3, ActionKind::Start));
        assert_eq!(
            requester.last_result(3, ActionKind::Start).map(|r| r.outcome),
            Some(ActionOutcome::Success)
        );

        bus.publish_completed(ActionResult::failure(3, ActionKind::Start, "late"));
        assert_eq!(
            requester.last_result(3, ActionKind::Start).map(|r| r.outcome),
            Some(ActionOutcome::Success)
        );
    }

    #[tokio::test]
    async fn test_unmatched_completion_is_ignored() {
        let bus = ActionBus::new();
        let requester = ActionRequester::mount(bus.clone(), TIMEOUT).unwrap();
        requester.request(3, ActionKind::Start).unwrap();

        bus.publish_completed(ActionResult::success(99, ActionKind::Start));
        bus.publish_completed(ActionResult::success(3, ActionKind::Stop));

        assert!(requester.is_pending(3, ActionKind::Start));
        assert!(requester.last_result(99, ActionKind::Start).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_request_rejected_while_pending() {
        let bus = ActionBus::new();
        let requester = ActionRequester::mount(bus, TIMEOUT).unwrap();

        requester.request(1, ActionKind::Restart).unwrap();
        let second = requester.request(1, ActionKind::Restart);
        assert!(matches!(second, Err(SyncError::ActionPending { .. })));
        assert!(requester.request(2, ActionKind::Restart).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_clears_pending_without_completion() {
        let bus = ActionBus::new();
        let requester = ActionRequester::mount(bus.clone(), TIMEOUT).unwrap();
        requester.request(5, ActionKind::Stop).unwrap();

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(requester.is_pending(5, ActionKind::Stop));

        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert!(!requester.is_pending(5, ActionKind::Stop));
        assert!(requester.last_result(5, ActionKind::Stop).is_none());

        bus.publish_completed(ActionResult::success(5, ActionKind::Stop));
        assert!(requester.last_result(5, ActionKind::Stop).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_before_timeout_cancels_timer() {
        let bus = ActionBus::new();
        let requester = ActionRequester::mount(bus.clone(), TIMEOUT).unwrap();
        requester.request(5, ActionKind::Stop).unwrap();
        bus.publish_completed(ActionResult::success(5, ActionKind::Stop));

        requester.request(5, ActionKind::Stop).unwrap();
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(requester.is_pending(5, ActionKind::Stop));
    }

    #[tokio::test]
    async fn test_requester_and_executor_round_trip() {
        let repo = InMemoryResourceRepository::with_resources(vec![Resource::new(
            3,
            ResourceStatus::PoweredOff,
        )])
        .with_action_effects();
        let store = SnapshotStore::new();
        store.replace(vec![Resource::new(3, ResourceStatus::PoweredOff)]);

        let bus = ActionBus::new();
        let _executor = ActionExecutor::mount(
            bus.clone(),
            Arc::new(repo.clone()),
            OptimisticTransitionEngine::default().with_store(store.clone()),
            None,
            Some(3),
        )
        .unwrap();
        let requester = ActionRequester::mount(bus, TIMEOUT).unwrap();

        requester.request(3, ActionKind::Start).unwrap();
        assert_eq!(store.status(3), Some(ResourceStatus::Restarting));
        assert!(requester.is_pending(3, ActionKind::Start));

        for _ in 0..16 {
            tokio::task::yield_now().await;
        }

        assert!(!requester.is_pending(3, ActionKind::Start));
        assert_eq!(repo.action_calls(), vec![(3, ActionKind::Start)]);
        assert!(requester
            .last_result(3, ActionKind::Start)
            .map(|r| r.is_success())
            .unwrap_or(false));
    }
}
