//! Realtime bridge: one live subscription per active user.
//!
//! [`RealtimeBridge`] owns the subscription to the backend change
//! channel. For the connected user it opens three filtered streams (spin
//! balance, check-ins, coupons), applies every incoming change to the
//! [`StateStore`] with last-write-wins by server timestamp, and then
//! notifies the listeners registered for that entity kind.
//!
//! Switching users tears the previous subscription down completely
//! (streams cancelled, listeners detached) before the new one opens, and
//! a change that arrives from a superseded subscription is never applied.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::{FutureExt, StreamExt};
use loyalty_core::models::{CheckIn, Coupon, SpinBalance};
use loyalty_core::store::{ApplyOutcome, StateStore};
use loyalty_core::types::UserId;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::change::{Change, ChangeEvent, EntityKind};
use crate::channel::{ChangeChannel, StreamFilter, StreamItem};
use crate::listeners::{self, Listener, ListenerHandle, SharedRegistry};

/// Lifecycle of the subscription as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    /// Streams requested, not all confirmed yet.
    Connecting,
    /// Every stream is delivering.
    Open,
    /// At least one stream failed and has not recovered.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamStatus {
    Opening,
    Open,
    Failed,
}

struct Session {
    id: u64,
    owner: UserId,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    streams: HashMap<EntityKind, StreamStatus>,
}

impl Session {
    fn status(&self) -> ConnectionStatus {
        if self.streams.values().any(|s| *s == StreamStatus::Failed) {
            ConnectionStatus::Error
        } else if self.streams.values().all(|s| *s == StreamStatus::Open) {
            ConnectionStatus::Open
        } else {
            ConnectionStatus::Connecting
        }
    }
}

#[derive(Default)]
struct BridgeState {
    active: Option<Session>,
    /// Owner of the most recent subscription, kept across disconnects so
    /// the cache is only cleared when a different user connects.
    last_owner: Option<UserId>,
}

/// State shared between the bridge handle and its stream tasks.
struct Shared {
    store: Arc<StateStore>,
    state: Mutex<BridgeState>,
    /// Bumped on every open and every teardown. A stream task only
    /// applies changes while this still equals its session id.
    generation: AtomicU64,
    listeners: SharedRegistry,
    status: watch::Sender<ConnectionStatus>,
}

/// Bridges backend change streams into the shared [`StateStore`].
///
/// Constructed once per process by the composition root via
/// [`configure`](Self::configure).
pub struct RealtimeBridge {
    shared: Arc<Shared>,
    channel: Arc<dyn ChangeChannel>,
}

impl RealtimeBridge {
    /// Wire the bridge to the store it writes into and the channel it
    /// reads from.
    pub fn configure<C: ChangeChannel>(store: Arc<StateStore>, channel: C) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            shared: Arc::new(Shared {
                store,
                state: Mutex::new(BridgeState::default()),
                generation: AtomicU64::new(0),
                listeners: SharedRegistry::default(),
                status,
            }),
            channel: Arc::new(channel),
        }
    }

    /// Subscribe to `user_id`'s changes.
    ///
    /// A no-op if a healthy subscription for `user_id` is already open or
    /// opening. Otherwise any current subscription is torn down first.
    /// Returns as soon as the stream requests are issued; watch
    /// [`status`](Self::status) for the outcome.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self, user_id: UserId) {
        let mut state = self.shared.lock_state();

        if let Some(active) = &state.active {
            if active.owner == user_id && active.status() != ConnectionStatus::Error {
                tracing::debug!(user_id = %user_id, "Already subscribed");
                return;
            }
        }

        if let Some(previous) = state.active.take() {
            let owner_changed = previous.owner != user_id;
            self.shared.teardown(previous, owner_changed);
        }

        if state.last_owner.is_some_and(|owner| owner != user_id) {
            self.shared.store.clear_entities();
        }
        state.last_owner = Some(user_id);

        let id = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();

        let tasks = EntityKind::ALL
            .iter()
            .map(|&kind| {
                tokio::spawn(run_stream(
                    Arc::clone(&self.shared),
                    Arc::clone(&self.channel),
                    id,
                    StreamFilter::new(kind, user_id),
                    cancel.child_token(),
                ))
            })
            .collect();

        state.active = Some(Session {
            id,
            owner: user_id,
            cancel,
            tasks,
            streams: EntityKind::ALL
                .iter()
                .map(|&kind| (kind, StreamStatus::Opening))
                .collect(),
        });

        tracing::info!(user_id = %user_id, session = id, "Opening realtime subscription");
        self.shared.publish_status(ConnectionStatus::Connecting);
    }

    /// Tear down the current subscription, if any. Idempotent.
    pub fn disconnect(&self) {
        let mut state = self.shared.lock_state();
        if let Some(session) = state.active.take() {
            self.shared.teardown(session, true);
        }
        self.shared.publish_status(ConnectionStatus::Disconnected);
    }

    /// Whether every stream of the current subscription is delivering.
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Open
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    /// Follow subscription status changes.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// The user the current subscription belongs to.
    pub fn owner(&self) -> Option<UserId> {
        self.shared.lock_state().active.as_ref().map(|s| s.owner)
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.shared.store
    }

    /// Call `listener` for every applied spin-balance change.
    pub fn on_spin_balance_update<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&Change<SpinBalance>) + Send + Sync + 'static,
    {
        self.register(
            EntityKind::SpinBalance,
            Arc::new(move |event| {
                if let ChangeEvent::SpinBalance(change) = event {
                    listener(change);
                }
            }),
        )
    }

    /// Call `listener` for every applied check-in change.
    pub fn on_check_in_update<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&Change<CheckIn>) + Send + Sync + 'static,
    {
        self.register(
            EntityKind::CheckIn,
            Arc::new(move |event| {
                if let ChangeEvent::CheckIn(change) = event {
                    listener(change);
                }
            }),
        )
    }

    /// Call `listener` for every applied coupon change.
    pub fn on_coupon_update<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&Change<Coupon>) + Send + Sync + 'static,
    {
        self.register(
            EntityKind::Coupon,
            Arc::new(move |event| {
                if let ChangeEvent::Coupon(change) = event {
                    listener(change);
                }
            }),
        )
    }

    /// Number of listeners currently registered for `kind`.
    pub fn listener_count(&self, kind: EntityKind) -> usize {
        listeners::lock(&self.shared.listeners).count(kind)
    }

    fn register(&self, kind: EntityKind, listener: Listener) -> ListenerHandle {
        let id = listeners::lock(&self.shared.listeners).insert(kind, listener);
        ListenerHandle::new(id, kind, &self.shared.listeners)
    }
}

impl Drop for RealtimeBridge {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cancel the session's streams, and detach every listener when
    /// `detach_listeners` is set (owner switch or disconnect). Reopening
    /// the same user's streams keeps the registry.
    ///
    /// Callers hold the state lock, so no change can be applied between
    /// the generation bump and the next session opening.
    fn teardown(&self, session: Session, detach_listeners: bool) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        session.cancel.cancel();
        for task in &session.tasks {
            task.abort();
        }
        let detached = if detach_listeners {
            listeners::lock(&self.listeners).clear()
        } else {
            0
        };

        tracing::info!(
            user_id = %session.owner,
            session = session.id,
            detached,
            "Closed realtime subscription",
        );
    }

    fn publish_status(&self, next: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            match next {
                ConnectionStatus::Error => tracing::warn!("Realtime subscription in error state"),
                other => tracing::debug!(status = ?other, "Realtime subscription status changed"),
            }
        }
    }

    fn mark_stream(&self, session_id: u64, kind: EntityKind, status: StreamStatus) {
        let mut state = self.lock_state();
        let Some(session) = state.active.as_mut().filter(|s| s.id == session_id) else {
            return;
        };
        session.streams.insert(kind, status);
        let overall = session.status();
        self.publish_status(overall);
    }

    /// Apply one change and fan it out to listeners.
    fn deliver(&self, session_id: u64, filter: StreamFilter, event: ChangeEvent) {
        let targets = {
            let state = self.lock_state();
            if !state.active.as_ref().is_some_and(|s| s.id == session_id) {
                tracing::trace!(stream = %filter.kind, "Dropping change from closed subscription");
                return;
            }
            if event.kind() != filter.kind || event.owner_user_id() != filter.owner_user_id {
                tracing::debug!(
                    stream = %filter.kind,
                    kind = %event.kind(),
                    "Ignoring change outside the stream filter",
                );
                return;
            }
            match event.apply_to(&self.store) {
                ApplyOutcome::Stale => {
                    tracing::debug!(
                        stream = %filter.kind,
                        server_timestamp = %event.server_timestamp(),
                        "Discarding stale change",
                    );
                    return;
                }
                ApplyOutcome::Applied => {
                    tracing::trace!(
                        stream = %filter.kind,
                        operation = ?event.operation(),
                        server_timestamp = %event.server_timestamp(),
                        "Applied change",
                    );
                }
            }
            listeners::lock(&self.listeners).snapshot(filter.kind)
        };

        // Listeners run without locks held so they may call back into
        // the bridge; stop as soon as the session is superseded.
        for listener in targets {
            if self.generation.load(Ordering::SeqCst) != session_id {
                break;
            }
            listener(&event);
        }
    }
}

/// Drive one filtered stream until it ends or the session is cancelled.
async fn run_stream(
    shared: Arc<Shared>,
    channel: Arc<dyn ChangeChannel>,
    session_id: u64,
    filter: StreamFilter,
    cancel: CancellationToken,
) {
    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        result = channel.open(filter) => result,
    };

    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(
                stream = %filter.kind,
                user_id = %filter.owner_user_id,
                error = %e,
                "Failed to open realtime stream",
            );
            shared.mark_stream(session_id, filter.kind, StreamStatus::Failed);
            return;
        }
    };
    // A transport may report an immediate failure as the first item;
    // the stream is only marked open if it did not.
    let mut pending = stream.next().now_or_never();
    let failed_at_once = matches!(&pending, Some(Some(Err(e))) if e.is_stream_failure());
    if !failed_at_once {
        shared.mark_stream(session_id, filter.kind, StreamStatus::Open);
    }
    let mut healthy = !failed_at_once;

    loop {
        let item = match pending.take() {
            Some(item) => item,
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                item = stream.next() => item,
            },
        };

        match item {
            Some(Ok(StreamItem::Change(event))) => {
                if !healthy {
                    healthy = true;
                    shared.mark_stream(session_id, filter.kind, StreamStatus::Open);
                }
                shared.deliver(session_id, filter, event);
            }
            Some(Ok(StreamItem::Resumed)) => {
                healthy = true;
                shared.mark_stream(session_id, filter.kind, StreamStatus::Open);
            }
            Some(Err(e)) if !e.is_stream_failure() => {
                tracing::warn!(stream = %filter.kind, error = %e, "Skipping undecodable frame");
            }
            Some(Err(e)) => {
                tracing::warn!(stream = %filter.kind, error = %e, "Realtime stream error");
                healthy = false;
                shared.mark_stream(session_id, filter.kind, StreamStatus::Failed);
            }
            None => {
                tracing::warn!(stream = %filter.kind, "Realtime stream ended");
                shared.mark_stream(session_id, filter.kind, StreamStatus::Failed);
                return;
            }
        }
    }
}
