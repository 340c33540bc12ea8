//! Per-kind listener registry with detachable handles.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::change::{ChangeEvent, EntityKind};

pub(crate) type Listener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Registered listeners, in registration order.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: u64,
    entries: BTreeMap<u64, (EntityKind, Listener)>,
}

impl ListenerRegistry {
    pub(crate) fn insert(&mut self, kind: EntityKind, listener: Listener) -> u64 {
        self.next_id += 1;
        self.entries.insert(self.next_id, (kind, listener));
        self.next_id
    }

    pub(crate) fn remove(&mut self, id: u64) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    /// Listeners for `kind`, cloned so they can run without the lock held.
    pub(crate) fn snapshot(&self, kind: EntityKind) -> Vec<Listener> {
        self.entries
            .values()
            .filter(|(k, _)| *k == kind)
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }

    pub(crate) fn count(&self, kind: EntityKind) -> usize {
        self.entries.values().filter(|(k, _)| *k == kind).count()
    }

    /// Detach everything. Ids are never reused, so outstanding handles
    /// cannot remove a later registration.
    pub(crate) fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }
}

pub(crate) type SharedRegistry = Arc<Mutex<ListenerRegistry>>;

pub(crate) fn lock(registry: &Mutex<ListenerRegistry>) -> MutexGuard<'_, ListenerRegistry> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

/// Registration of one change listener.
///
/// Dropping the handle unregisters the listener, so a consumer that is
/// torn down and rebuilt cannot leave a stale callback behind. After the
/// bridge detaches listeners (owner switch or disconnect) the handle is
/// inert.
#[must_use = "dropping the handle unregisters the listener"]
pub struct ListenerHandle {
    id: u64,
    kind: EntityKind,
    registry: Weak<Mutex<ListenerRegistry>>,
}

impl ListenerHandle {
    pub(crate) fn new(id: u64, kind: EntityKind, registry: &SharedRegistry) -> Self {
        Self {
            id,
            kind,
            registry: Arc::downgrade(registry),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Whether the listener is still registered.
    pub fn is_attached(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| lock(&registry).contains(self.id))
    }

    /// Unregister now. Equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).remove(self.id);
        }
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Listener {
        Arc::new(|_: &ChangeEvent| {})
    }

    #[test]
    fn dropping_handle_unregisters() {
        let registry: SharedRegistry = Arc::default();
        let id = lock(&registry).insert(EntityKind::Coupon, noop());
        let handle = ListenerHandle::new(id, EntityKind::Coupon, &registry);

        assert!(handle.is_attached());
        drop(handle);

        assert_eq!(lock(&registry).count(EntityKind::Coupon), 0);
    }

    #[test]
    fn handle_after_clear_does_not_touch_new_registrations() {
        let registry: SharedRegistry = Arc::default();
        let old_id = lock(&registry).insert(EntityKind::CheckIn, noop());
        let old = ListenerHandle::new(old_id, EntityKind::CheckIn, &registry);

        lock(&registry).clear();
        let new_id = lock(&registry).insert(EntityKind::CheckIn, noop());
        let _new = ListenerHandle::new(new_id, EntityKind::CheckIn, &registry);

        assert!(!old.is_attached());
        old.unsubscribe();
        assert_eq!(lock(&registry).count(EntityKind::CheckIn), 1);
    }

    #[test]
    fn snapshot_filters_by_kind() {
        let mut registry = ListenerRegistry::default();
        registry.insert(EntityKind::Coupon, noop());
        registry.insert(EntityKind::SpinBalance, noop());
        registry.insert(EntityKind::Coupon, noop());

        assert_eq!(registry.snapshot(EntityKind::Coupon).len(), 2);
        assert_eq!(registry.snapshot(EntityKind::CheckIn).len(), 0);
    }
}
