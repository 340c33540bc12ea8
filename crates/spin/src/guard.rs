//! Navigation guard.
//!
//! While a spin is in flight the guard asks the host to confirm unloads,
//! undoes history moves by restoring the pinned location, and suppresses
//! in-app navigation. One warning is shown per lock episode no matter how
//! many attempts are made. Intercepts are installed when the lock enters
//! `Locked` and removed as soon as it returns to `Idle`.

use std::sync::{Arc, Mutex, MutexGuard};

use loyalty_core::LockState;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::controller::LockObserver;
#[cfg(doc)]
use crate::controller::SpinLockController;

/// Shown the first time navigation is blocked in an episode.
pub const SPIN_IN_PROGRESS_WARNING: &str = "A spin is in progress. Please wait until it finishes.";

/// An app location (route path plus query).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location(pub String);

impl Location {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The environment the guard intercepts navigation in.
pub trait NavigationHost: Send + Sync {
    /// Make page unload or reload ask for confirmation.
    fn install_unload_prompt(&self);
    /// Undo [`install_unload_prompt`](Self::install_unload_prompt).
    fn remove_unload_prompt(&self);
    fn current_location(&self) -> Location;
    /// Put `location` back after a history move.
    fn restore_location(&self, location: &Location);
}

/// User-facing warning sink (toast, banner).
pub trait Notifier: Send + Sync {
    fn warn(&self, message: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationDecision {
    Allow,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadDecision {
    Allow,
    Confirm,
}

struct Armed {
    episode: u64,
    pinned: Location,
    warned: bool,
}

/// Host effects decided under the state mutex and run after it is
/// released, so hosts may call back into the guard.
#[derive(Default)]
struct Effects {
    install: bool,
    remove: bool,
    restore: Option<Location>,
    warn: bool,
}

/// Blocks navigation while the spin lock is held.
pub struct NavigationGuard {
    host: Arc<dyn NavigationHost>,
    notifier: Arc<dyn Notifier>,
    lock: watch::Receiver<LockState>,
    armed: Mutex<Option<Armed>>,
}

impl NavigationGuard {
    /// Guard navigation against the lock published on `lock`.
    ///
    /// Decisions always reflect the latest lock state. Register the guard
    /// with [`SpinLockController::observe`] so the location is pinned
    /// inside `acquire`, before any navigation can run. Lock writers that
    /// only publish on the channel are picked up by
    /// [`follow`](Self::follow), which also installs and removes the
    /// unload prompt as transitions happen.
    pub fn new(
        lock: watch::Receiver<LockState>,
        host: Arc<dyn NavigationHost>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let guard = Self {
            host,
            notifier,
            lock,
            armed: Mutex::new(None),
        };
        guard.refresh();
        guard
    }

    /// Spawn a task that syncs the guard on every lock transition.
    ///
    /// The task ends when the lock's store is dropped.
    pub fn follow(self: &Arc<Self>) -> JoinHandle<()> {
        let guard = Arc::clone(self);
        let mut lock = self.lock.clone();
        tokio::spawn(async move {
            loop {
                let state = lock.borrow_and_update().clone();
                guard.sync(&state);
                if lock.changed().await.is_err() {
                    break;
                }
            }
            tracing::debug!("Lock publisher gone, navigation guard stopped following");
        })
    }

    /// Install or remove intercepts to match `state`.
    pub fn sync(&self, state: &LockState) {
        // Read before taking the state mutex: hosts may call back in.
        let here = self.needs_pin(state).then(|| self.host.current_location());

        let effects = {
            let mut armed = self.armed();
            let mut effects = Effects::default();
            let armed_episode = armed.as_ref().map(|current| current.episode);
            match (state.is_locked(), armed_episode, here) {
                (true, Some(episode), _) if episode == state.episode => Some(effects),
                (true, armed_episode, Some(pinned)) => {
                    // With an episode already armed, the idle between the
                    // two was coalesced away.
                    effects.install = armed_episode.is_none();
                    *armed = Some(Armed {
                        episode: state.episode,
                        pinned,
                        warned: false,
                    });
                    Some(effects)
                }
                // A concurrent sync changed the episode after the read.
                (true, _, None) => None,
                (false, Some(_), _) => {
                    *armed = None;
                    effects.remove = true;
                    Some(effects)
                }
                (false, None, _) => Some(effects),
            }
        };
        let Some(effects) = effects else {
            return self.sync(state);
        };

        if effects.install {
            tracing::debug!(episode = state.episode, "Navigation guard armed");
        }
        if effects.remove {
            tracing::debug!(episode = state.episode, "Navigation guard disarmed");
        }
        self.run(effects);
    }

    pub fn is_armed(&self) -> bool {
        self.refresh();
        self.armed().is_some()
    }

    /// Page unload or reload requested.
    pub fn before_unload(&self) -> UnloadDecision {
        if self.is_armed() {
            UnloadDecision::Confirm
        } else {
            UnloadDecision::Allow
        }
    }

    /// The user moved back or forward in history.
    ///
    /// While locked the pinned location is restored immediately.
    pub fn on_history_navigation(&self) -> NavigationDecision {
        self.refresh();
        let effects = {
            let mut armed = self.armed();
            let Some(current) = armed.as_mut() else {
                return NavigationDecision::Allow;
            };
            Effects {
                restore: Some(current.pinned.clone()),
                warn: warn_once(current),
                ..Effects::default()
            }
        };
        self.run(effects);
        NavigationDecision::Block
    }

    /// In-app navigation to `target` requested.
    pub fn request_navigation(&self, target: &Location) -> NavigationDecision {
        self.refresh();
        let effects = {
            let mut armed = self.armed();
            let Some(current) = armed.as_mut() else {
                return NavigationDecision::Allow;
            };
            tracing::debug!(episode = current.episode, %target, "In-app navigation suppressed");
            Effects {
                warn: warn_once(current),
                ..Effects::default()
            }
        };
        self.run(effects);
        NavigationDecision::Block
    }

    fn needs_pin(&self, state: &LockState) -> bool {
        state.is_locked()
            && !self
                .armed()
                .as_ref()
                .is_some_and(|current| current.episode == state.episode)
    }

    fn refresh(&self) {
        let state = self.lock.borrow().clone();
        self.sync(&state);
    }

    fn run(&self, effects: Effects) {
        if effects.install {
            self.host.install_unload_prompt();
        }
        if effects.remove {
            self.host.remove_unload_prompt();
        }
        if let Some(location) = effects.restore {
            self.host.restore_location(&location);
        }
        if effects.warn {
            self.notifier.warn(SPIN_IN_PROGRESS_WARNING);
        }
    }

    fn armed(&self) -> MutexGuard<'_, Option<Armed>> {
        self.armed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LockObserver for NavigationGuard {
    fn lock_changed(&self, _state: &LockState) {
        // Observers of racing transitions may run out of order; the
        // published state is the latest.
        self.refresh();
    }
}

fn warn_once(armed: &mut Armed) -> bool {
    !std::mem::replace(&mut armed.warned, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use loyalty_core::lock::LockPhase;
    use std::sync::{OnceLock, Weak};

    #[derive(Default)]
    struct RecordingHost {
        prompts: Mutex<i32>,
        restores: Mutex<Vec<Location>>,
        warnings: Mutex<usize>,
    }

    impl NavigationHost for RecordingHost {
        fn install_unload_prompt(&self) {
            *self.prompts.lock().unwrap() += 1;
        }
        fn remove_unload_prompt(&self) {
            *self.prompts.lock().unwrap() -= 1;
        }
        fn current_location(&self) -> Location {
            Location::new("/roulette")
        }
        fn restore_location(&self, location: &Location) {
            self.restores.lock().unwrap().push(location.clone());
        }
    }

    impl Notifier for RecordingHost {
        fn warn(&self, _message: &str) {
            *self.warnings.lock().unwrap() += 1;
        }
    }

    fn locked(episode: u64) -> LockState {
        LockState {
            phase: LockPhase::Locked,
            started_at: Some(loyalty_core::types::Timestamp::UNIX_EPOCH),
            expected_duration_ms: 8000,
            reason: None,
            episode,
        }
    }

    fn guard() -> (NavigationGuard, watch::Sender<LockState>, Arc<RecordingHost>) {
        let (tx, rx) = watch::channel(LockState::idle());
        let host = Arc::new(RecordingHost::default());
        let guard = NavigationGuard::new(rx, host.clone(), host.clone());
        (guard, tx, host)
    }

    #[test]
    fn idle_allows_everything() {
        let (guard, _tx, host) = guard();

        assert_eq!(guard.before_unload(), UnloadDecision::Allow);
        assert_eq!(guard.on_history_navigation(), NavigationDecision::Allow);
        assert_eq!(guard.request_navigation(&Location::new("/coupons")), NavigationDecision::Allow);
        assert_eq!(*host.warnings.lock().unwrap(), 0);
    }

    #[test]
    fn locked_prompt_is_installed_once_and_removed_on_idle() {
        let (guard, tx, host) = guard();

        tx.send_replace(locked(1));
        assert_eq!(guard.before_unload(), UnloadDecision::Confirm);
        assert_eq!(guard.before_unload(), UnloadDecision::Confirm);
        assert_eq!(*host.prompts.lock().unwrap(), 1);

        tx.send_replace(LockState { episode: 1, ..LockState::idle() });
        assert_eq!(guard.before_unload(), UnloadDecision::Allow);
        assert_eq!(*host.prompts.lock().unwrap(), 0);
    }

    /// Reports whether the guard was armed each time the location is read.
    #[derive(Default)]
    struct ReentrantHost {
        guard: OnceLock<Weak<NavigationGuard>>,
        armed_on_read: Mutex<Vec<bool>>,
    }

    impl NavigationHost for ReentrantHost {
        fn install_unload_prompt(&self) {}
        fn remove_unload_prompt(&self) {}
        fn current_location(&self) -> Location {
            if let Some(guard) = self.guard.get().and_then(Weak::upgrade) {
                let armed = guard.armed().is_some();
                self.armed_on_read.lock().unwrap().push(armed);
            }
            Location::new("/roulette")
        }
        fn restore_location(&self, _location: &Location) {}
    }

    impl Notifier for ReentrantHost {
        fn warn(&self, _message: &str) {}
    }

    #[test]
    fn location_is_read_without_holding_the_guard_state() {
        let (tx, rx) = watch::channel(LockState::idle());
        let host = Arc::new(ReentrantHost::default());
        let guard = Arc::new(NavigationGuard::new(rx, host.clone(), host.clone()));
        host.guard.set(Arc::downgrade(&guard)).ok();

        tx.send_replace(locked(1));
        assert!(guard.is_armed());
        tx.send_replace(locked(2));
        assert!(guard.is_armed());

        assert_eq!(*host.armed_on_read.lock().unwrap(), vec![false, true]);
    }

    #[test]
    fn coalesced_new_episode_warns_again() {
        let (guard, tx, host) = guard();

        tx.send_replace(locked(1));
        guard.request_navigation(&Location::new("/home"));
        tx.send_replace(locked(2));
        guard.request_navigation(&Location::new("/home"));

        assert_eq!(*host.warnings.lock().unwrap(), 2);
        assert_eq!(*host.prompts.lock().unwrap(), 1);
    }
}
