use crate::shared::types::{ActionKind, ActionRequest, ActionResult, ResourceId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionEventKind {
    Requested,
    Completed,
}

impl ActionEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionEventKind::Requested => "action-requested",
            ActionEventKind::Completed => "action-completed",
        }
    }
}

impl fmt::Display for ActionEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionEvent {
    Requested(ActionRequest),
    Completed(ActionResult),
}

impl ActionEvent {
    pub fn kind(&self) -> ActionEventKind {
        match self {
            ActionEvent::Requested(_) => ActionEventKind::Requested,
            ActionEvent::Completed(_) => ActionEventKind::Completed,
        }
    }

    pub fn resource_id(&self) -> ResourceId {
        match self {
            ActionEvent::Requested(request) => request.resource_id,
            ActionEvent::Completed(result) => result.resource_id,
        }
    }

    pub fn action(&self) -> ActionKind {
        match self {
            ActionEvent::Requested(request) => request.action,
            ActionEvent::Completed(result) => result.action,
        }
    }
}

pub type ActionHandler = Arc<dyn Fn(&ActionEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<ActionEventKind, Vec<(u64, ActionHandler)>>,
}

impl Registry {
    fn contains(&self, kind: ActionEventKind, id: u64) -> bool {
        self.handlers
            .get(&kind)
            .map(|handlers| handlers.iter().any(|(handler_id, _)| *handler_id == id))
            .unwrap_or(false)
    }

    fn remove(&mut self, kind: ActionEventKind, id: u64) -> bool {
        let Some(handlers) = self.handlers.get_mut(&kind) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            self.handlers.remove(&kind);
        }
        removed
    }
}

/// Session-scoped observer registry keyed by event kind.
///
/// Delivery is synchronous on the publishing task, at most once per handler,
/// and only to handlers registered at publish time. Nothing is buffered.
#[derive(Clone, Default)]
pub struct ActionBus {
    registry: Arc<Mutex<Registry>>,
}

impl ActionBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` until the returned subscription is dropped.
    pub fn subscribe<F>(&self, kind: ActionEventKind, handler: F) -> Subscription
    where
        F: Fn(&ActionEvent) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));

        Subscription {
            registry: Arc::downgrade(&self.registry),
            kind,
            id,
        }
    }

    /// Delivers `event` to every current subscriber of its kind and returns
    /// how many received it. Handlers run outside the registry lock, so they
    /// may publish or (un)subscribe themselves.
    pub fn publish(&self, event: &ActionEvent) -> usize {
        let kind = event.kind();
        let handlers: Vec<(u64, ActionHandler)> = self
            .lock()
            .handlers
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        let mut delivered = 0;
        for (id, handler) in handlers {
            if !self.lock().contains(kind, id) {
                continue;
            }
            handler(event);
            delivered += 1;
        }

        trace!(
            event = %kind,
            resource_id = event.resource_id(),
            action = %event.action(),
            delivered,
            "Published action event"
        );
        delivered
    }

    pub fn publish_requested(&self, resource_id: ResourceId, action: ActionKind) -> usize {
        self.publish(&ActionEvent::Requested(ActionRequest::new(resource_id, action)))
    }

    pub fn publish_completed(&self, result: ActionResult) -> usize {
        self.publish(&ActionEvent::Completed(result))
    }

    pub fn subscriber_count(&self, kind: ActionEventKind) -> usize {
        self.lock().handlers.get(&kind).map(Vec::len).unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keeps a handler registered. Dropping it unsubscribes.
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    kind: ActionEventKind,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> ActionEventKind {
        self.kind
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(self.kind, self.id);
        }
    }
}
