//! The assembled client.

use std::sync::Arc;

use loyalty_core::types::UserId;
use loyalty_core::{StateStore, SystemClock};
use loyalty_realtime::{
    ChangeChannel, ListenerHandle, RealtimeBridge, ReconnectingChannel, WsChangeChannel,
};
use loyalty_spin::{NavigationGuard, NavigationHost, Notifier, SpinLockConfig, SpinLockController};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;

/// One store, bridge, controller and guard for the whole session.
pub struct Client {
    store: Arc<StateStore>,
    bridge: RealtimeBridge,
    controller: SpinLockController,
    guard: Arc<NavigationGuard>,
    follow: JoinHandle<()>,
    _listeners: Vec<ListenerHandle>,
}

impl Client {
    /// Wire everything against the configured WebSocket endpoint and
    /// subscribe for the configured user.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<H>(config: &ClientConfig, host: Arc<H>) -> Self
    where
        H: NavigationHost + Notifier + 'static,
    {
        let channel = ReconnectingChannel::new(
            WsChangeChannel::new(config.ws_url.clone()),
            config.reconnect.clone(),
        );
        Self::start_with(config.user_id, config.spin.clone(), channel, host)
    }

    /// [`start`](Self::start) over an arbitrary change channel.
    pub fn start_with<C, H>(user_id: UserId, spin: SpinLockConfig, channel: C, host: Arc<H>) -> Self
    where
        C: ChangeChannel,
        H: NavigationHost + Notifier + 'static,
    {
        let (store, lock_writer) = StateStore::with_lock_writer();
        let bridge = RealtimeBridge::configure(Arc::clone(&store), channel);
        let controller = SpinLockController::new(lock_writer, Arc::new(SystemClock), spin);

        let guard = Arc::new(NavigationGuard::new(controller.watch(), host.clone(), host));
        controller.observe(guard.clone());
        let follow = guard.follow();

        let listeners = log_changes(&bridge);
        bridge.connect(user_id);
        tracing::info!(user_id = %user_id, "Client started");

        Self {
            store,
            bridge,
            controller,
            guard,
            follow,
            _listeners: listeners,
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn bridge(&self) -> &RealtimeBridge {
        &self.bridge
    }

    pub fn controller(&self) -> &SpinLockController {
        &self.controller
    }

    pub fn guard(&self) -> &Arc<NavigationGuard> {
        &self.guard
    }

    /// Close the subscription, end any spin in flight and remove the
    /// navigation intercepts.
    pub fn shutdown(self) {
        self.bridge.disconnect();
        if self.controller.release() {
            tracing::info!("Spin in flight at shutdown released");
        }
        self.follow.abort();
        self.guard.sync(&self.controller.state());
        tracing::info!("Client stopped");
    }
}

/// Log every applied change at info level.
fn log_changes(bridge: &RealtimeBridge) -> Vec<ListenerHandle> {
    vec![
        bridge.on_spin_balance_update(|change| {
            tracing::info!(
                operation = ?change.operation,
                spins_available = change.record.spins_available,
                "Spin balance changed",
            );
        }),
        bridge.on_check_in_update(|change| {
            tracing::info!(
                operation = ?change.operation,
                check_in_id = %change.record.id,
                status = ?change.record.status,
                "Check-in changed",
            );
        }),
        bridge.on_coupon_update(|change| {
            tracing::info!(
                operation = ?change.operation,
                coupon_id = %change.record.id,
                prize = %change.record.prize,
                status = ?change.record.status,
                "Coupon changed",
            );
        }),
    ]
}
