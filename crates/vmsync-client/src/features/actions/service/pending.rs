use crate::shared::types::{ActionKind, ResourceId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Marks one outstanding `(resource, action)` pair. A newer mark for the same
/// pair gets a different token, so a stale finisher cannot clear it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingToken(u64);

#[derive(Default)]
struct PendingInner {
    next: u64,
    entries: HashMap<(ResourceId, ActionKind), u64>,
}

/// Outstanding actions keyed by `(resource, action)`.
#[derive(Clone, Default)]
pub struct PendingActions {
    inner: Arc<Mutex<PendingInner>>,
}

impl PendingActions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the pair as outstanding, or returns `None` if it already is.
    pub fn try_begin(&self, resource_id: ResourceId, action: ActionKind) -> Option<PendingToken> {
        let mut inner = self.lock();
        if inner.entries.contains_key(&(resource_id, action)) {
            return None;
        }
        inner.next += 1;
        let token = inner.next;
        inner.entries.insert((resource_id, action), token);
        Some(PendingToken(token))
    }

    pub fn finish(&self, resource_id: ResourceId, action: ActionKind) -> bool {
        self.lock().entries.remove(&(resource_id, action)).is_some()
    }

    /// Clears the pair only if it is still marked with `token`.
    pub fn finish_if(&self, resource_id: ResourceId, action: ActionKind, token: PendingToken) -> bool {
        let mut inner = self.lock();
        match inner.entries.get(&(resource_id, action)) {
            Some(current) if *current == token.0 => {
                inner.entries.remove(&(resource_id, action));
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self, resource_id: ResourceId, action: ActionKind) -> bool {
        self.lock().entries.contains_key(&(resource_id, action))
    }

    /// True while any action on the resource is outstanding.
    pub fn is_busy(&self, resource_id: ResourceId) -> bool {
        self.lock().entries.keys().any(|(id, _)| *id == resource_id)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, PendingInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
