//! Process-wide state store shared by the realtime bridge, the spin lock
//! controller and the UI layer.
//!
//! Every mutation is applied in full under a single lock acquisition, so
//! a reader never observes a half-applied change or a half-written lock
//! transition. The [`LockState`] lives in a [`watch`] channel so that
//! followers (the navigation guard) are woken on every transition.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::watch;

use crate::lock::LockState;
use crate::models::{CheckIn, Coupon, SpinBalance};
use crate::types::{RecordId, Timestamp, UserId};

/// A cached row together with the server timestamp of the change that
/// produced it.
///
/// `value` is `None` after a delete. The tombstone keeps its timestamp so
/// that a replayed insert older than the delete cannot resurrect the row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: Option<T>,
    pub server_timestamp: Timestamp,
}

/// Result of offering a change to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The change was not newer than the cached row and was dropped.
    Stale,
}

#[derive(Debug, Default)]
struct EntityCache {
    spin_balances: HashMap<UserId, Versioned<SpinBalance>>,
    check_ins: HashMap<RecordId, Versioned<CheckIn>>,
    coupons: HashMap<RecordId, Versioned<Coupon>>,
}

/// Shared cache of entity rows plus the session's spin lock.
///
/// One instance per running session, held in an `Arc` by the
/// composition root and handed to each service.
pub struct StateStore {
    entities: RwLock<EntityCache>,
    lock: watch::Sender<LockState>,
    writer_claimed: AtomicBool,
}

impl StateStore {
    pub fn new() -> Self {
        let (lock, _) = watch::channel(LockState::idle());
        Self {
            entities: RwLock::new(EntityCache::default()),
            lock,
            writer_claimed: AtomicBool::new(false),
        }
    }

    /// A fresh store together with the only [`LockWriter`] for it.
    pub fn with_lock_writer() -> (Arc<Self>, LockWriter) {
        let store = Arc::new(Self::new());
        store.writer_claimed.store(true, Ordering::SeqCst);
        let writer = LockWriter {
            store: Arc::clone(&store),
        };
        (store, writer)
    }

    /// Claim the lock writer. `None` once it has been handed out.
    pub fn claim_lock_writer(self: &Arc<Self>) -> Option<LockWriter> {
        if self.writer_claimed.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(LockWriter {
            store: Arc::clone(self),
        })
    }

    // ---- entity cache ----

    /// Offer a spin-balance change. `value` is `None` for deletes.
    pub fn apply_spin_balance(
        &self,
        user_id: UserId,
        value: Option<SpinBalance>,
        server_timestamp: Timestamp,
    ) -> ApplyOutcome {
        apply_latest(
            &mut self.write().spin_balances,
            user_id,
            value,
            server_timestamp,
        )
    }

    /// Offer a check-in change. `value` is `None` for deletes.
    pub fn apply_check_in(
        &self,
        id: RecordId,
        value: Option<CheckIn>,
        server_timestamp: Timestamp,
    ) -> ApplyOutcome {
        apply_latest(&mut self.write().check_ins, id, value, server_timestamp)
    }

    /// Offer a coupon change. `value` is `None` for deletes.
    pub fn apply_coupon(
        &self,
        id: RecordId,
        value: Option<Coupon>,
        server_timestamp: Timestamp,
    ) -> ApplyOutcome {
        apply_latest(&mut self.write().coupons, id, value, server_timestamp)
    }

    pub fn spin_balance(&self, user_id: UserId) -> Option<SpinBalance> {
        self.read()
            .spin_balances
            .get(&user_id)
            .and_then(|v| v.value.clone())
    }

    /// Full versioned entry, including delete tombstones.
    pub fn spin_balance_entry(&self, user_id: UserId) -> Option<Versioned<SpinBalance>> {
        self.read().spin_balances.get(&user_id).cloned()
    }

    pub fn check_in(&self, id: RecordId) -> Option<CheckIn> {
        self.read().check_ins.get(&id).and_then(|v| v.value.clone())
    }

    /// Live check-ins for `user_id`, newest first.
    pub fn check_ins_for(&self, user_id: UserId) -> Vec<CheckIn> {
        let mut rows: Vec<CheckIn> = self
            .read()
            .check_ins
            .values()
            .filter_map(|v| v.value.as_ref())
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows
    }

    pub fn coupon(&self, id: RecordId) -> Option<Coupon> {
        self.read().coupons.get(&id).and_then(|v| v.value.clone())
    }

    /// Live coupons for `user_id`, ordered by code.
    pub fn coupons_for(&self, user_id: UserId) -> Vec<Coupon> {
        let mut rows: Vec<Coupon> = self
            .read()
            .coupons
            .values()
            .filter_map(|v| v.value.as_ref())
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.code.cmp(&b.code));
        rows
    }

    /// Drop every cached row. Used when the session switches owner.
    pub fn clear_entities(&self) {
        *self.write() = EntityCache::default();
    }

    // ---- lock state ----

    /// Current lock snapshot.
    pub fn lock_state(&self) -> LockState {
        self.lock.borrow().clone()
    }

    /// Follow lock transitions.
    pub fn watch_lock(&self) -> watch::Receiver<LockState> {
        self.lock.subscribe()
    }

    fn update_lock<F>(&self, next: F) -> bool
    where
        F: FnOnce(&LockState) -> Option<LockState>,
    {
        self.lock.send_if_modified(|state| match next(state) {
            Some(replacement) => {
                *state = replacement;
                true
            }
            None => false,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, EntityCache> {
        self.entities.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, EntityCache> {
        self.entities.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Exclusive right to publish lock transitions on one [`StateStore`].
///
/// At most one exists per store. The spin lock controller owns it, so
/// every other holder of the store can only read and follow the lock.
pub struct LockWriter {
    store: Arc<StateStore>,
}

impl LockWriter {
    /// Atomically compute and publish the next lock state.
    ///
    /// `next` sees the current state and returns the replacement, or
    /// `None` to leave it untouched. Returns whether a new state was
    /// published.
    pub fn update<F>(&self, next: F) -> bool
    where
        F: FnOnce(&LockState) -> Option<LockState>,
    {
        self.store.update_lock(next)
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }
}

impl std::fmt::Debug for LockWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockWriter").finish_non_exhaustive()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Last-write-wins by server timestamp: a change not strictly newer than
/// the cached entry is discarded.
fn apply_latest<K, T>(
    map: &mut HashMap<K, Versioned<T>>,
    key: K,
    value: Option<T>,
    server_timestamp: Timestamp,
) -> ApplyOutcome
where
    K: Eq + Hash,
{
    if let Some(current) = map.get(&key) {
        if server_timestamp <= current.server_timestamp {
            return ApplyOutcome::Stale;
        }
    }
    map.insert(
        key,
        Versioned {
            value,
            server_timestamp,
        },
    );
    ApplyOutcome::Applied
}
