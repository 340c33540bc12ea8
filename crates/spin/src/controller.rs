//! The spin lock controller.
//!
//! Owns the [`LockState`] in the [`StateStore`] through the store's
//! single [`LockWriter`].
//! Every successful [`acquire`](SpinLockController::acquire) arms one
//! watchdog task for that episode which runs the recurring elapsed-time
//! check and the safety timeout. Whichever unlock path wins cancels the
//! watchdog; the others find the lock idle and do nothing.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use loyalty_core::clock::elapsed_ms;
use loyalty_core::{Clock, LockState, LockWriter, StateStore};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::SpinLockConfig;
use crate::machine::{self, transition, LockTrigger, Outcome, UnlockCause};

/// Guards the "at most one spin in flight" invariant.
///
/// Cheap to clone; clones share the same lock and timers. Timers need a
/// tokio runtime: acquiring outside one still locks, but only explicit
/// release and foreground recovery can end the episode.
#[derive(Clone)]
pub struct SpinLockController {
    inner: Arc<Inner>,
}

/// Told about every lock transition on the thread that made it, before
/// the triggering call returns.
pub trait LockObserver: Send + Sync {
    fn lock_changed(&self, state: &LockState);
}

struct Inner {
    store: Arc<StateStore>,
    writer: LockWriter,
    clock: Arc<dyn Clock>,
    config: SpinLockConfig,
    timers: Mutex<Option<EpisodeTimers>>,
    last_unlock: Mutex<Option<UnlockCause>>,
    observers: Mutex<Vec<Arc<dyn LockObserver>>>,
}

struct EpisodeTimers {
    episode: u64,
    cancel: CancellationToken,
}

impl SpinLockController {
    pub fn new(writer: LockWriter, clock: Arc<dyn Clock>, config: SpinLockConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: Arc::clone(writer.store()),
                writer,
                clock,
                config,
                timers: Mutex::new(None),
                last_unlock: Mutex::new(None),
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register `observer` for every later transition.
    pub fn observe(&self, observer: Arc<dyn LockObserver>) {
        lock(&self.inner.observers).push(observer);
    }

    /// Start a spin expected to take `expected_duration_ms`.
    ///
    /// Returns `false` without touching the lock when another spin is
    /// already in flight.
    pub fn acquire(&self, expected_duration_ms: i64) -> bool {
        self.acquire_inner(expected_duration_ms, None)
    }

    /// [`acquire`](Self::acquire) with a tag describing what holds the lock.
    pub fn acquire_with_reason(&self, expected_duration_ms: i64, reason: impl Into<String>) -> bool {
        self.acquire_inner(expected_duration_ms, Some(reason.into()))
    }

    fn acquire_inner(&self, expected_duration_ms: i64, reason: Option<String>) -> bool {
        let trigger = LockTrigger::Acquire {
            expected_duration_ms,
            reason,
        };
        matches!(self.inner.apply(trigger), Outcome::Acquired { .. })
    }

    /// Normal completion. Returns whether an episode was ended.
    pub fn release(&self) -> bool {
        self.unlocked_by(LockTrigger::Release)
    }

    /// Whether the held lock has outlived its expected duration.
    pub fn should_auto_unlock(&self) -> bool {
        machine::should_auto_unlock(&self.inner.store.lock_state(), self.inner.clock.now())
    }

    /// Run the elapsed-time check now. Returns whether it unlocked.
    pub fn check_elapsed(&self) -> bool {
        self.unlocked_by(LockTrigger::Tick)
    }

    /// The app became visible (`true`) or hidden (`false`).
    ///
    /// Regaining visibility well past the expected duration ends the
    /// episode. Hiding never changes the lock.
    pub fn on_visibility_change(&self, visible: bool) -> bool {
        visible && self.unlocked_by(LockTrigger::Foregrounded)
    }

    /// The window regained focus.
    pub fn on_focus(&self) -> bool {
        self.unlocked_by(LockTrigger::Foregrounded)
    }

    pub fn state(&self) -> LockState {
        self.inner.store.lock_state()
    }

    pub fn is_locked(&self) -> bool {
        self.state().is_locked()
    }

    /// Follow lock transitions.
    pub fn watch(&self) -> watch::Receiver<LockState> {
        self.inner.store.watch_lock()
    }

    /// Which path ended the most recent episode.
    pub fn last_unlock(&self) -> Option<UnlockCause> {
        *lock(&self.inner.last_unlock)
    }

    /// Whether a watchdog is currently armed.
    pub fn has_armed_timers(&self) -> bool {
        lock(&self.inner.timers).is_some()
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.inner.store
    }

    fn unlocked_by(&self, trigger: LockTrigger) -> bool {
        matches!(self.inner.apply(trigger), Outcome::Unlocked { .. })
    }
}

impl std::fmt::Debug for SpinLockController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpinLockController")
            .field("state", &self.state())
            .field("last_unlock", &self.last_unlock())
            .finish()
    }
}

impl Inner {
    fn apply(self: &Arc<Self>, trigger: LockTrigger) -> Outcome {
        let now = self.clock.now();
        let mut outcome = Outcome::Unchanged;
        let mut before = LockState::idle();
        let mut after = None;

        self.writer.update(|state| {
            let (next, result) = transition(state, &trigger, now, &self.config.policy);
            outcome = result;
            before = state.clone();
            after = next.clone();
            next
        });

        if let Some(state) = &after {
            self.notify(state);
        }

        match outcome {
            Outcome::Acquired { episode } => {
                let state = after.unwrap_or_else(|| self.store.lock_state());
                tracing::info!(
                    episode,
                    expected_duration_ms = state.expected_duration_ms,
                    reason = state.reason.as_deref().unwrap_or(""),
                    "Spin lock acquired",
                );
                self.arm(episode, state.expected_duration_ms);
            }
            Outcome::Denied => {
                tracing::debug!(episode = before.episode, "Spin already in flight, acquire denied");
            }
            Outcome::Unlocked { episode, cause } => {
                self.disarm(episode);
                *lock(&self.last_unlock) = Some(cause);

                let held_ms = before.started_at.map(|at| elapsed_ms(at, now)).unwrap_or(0);
                if cause == UnlockCause::SafetyTimeout {
                    tracing::warn!(
                        episode,
                        held_ms,
                        expected_duration_ms = before.expected_duration_ms,
                        "Spin lock safety timeout, forcing unlock",
                    );
                } else {
                    tracing::info!(episode, %cause, held_ms, "Spin lock released");
                }
            }
            Outcome::Unchanged => {}
        }

        outcome
    }

    fn notify(&self, state: &LockState) {
        let observers = lock(&self.observers).clone();
        for observer in observers {
            observer.lock_changed(state);
        }
    }

    fn arm(self: &Arc<Self>, episode: u64, expected_duration_ms: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(episode, "No tokio runtime, spin lock timers not armed");
            return;
        };

        let mut timers = lock(&self.timers);
        if let Some(previous) = timers.take() {
            previous.cancel.cancel();
        }

        // A racing unlock may already have ended this episode.
        let current = self.store.lock_state();
        if !current.is_locked() || current.episode != episode {
            return;
        }

        let armed_at = Instant::now();
        let cancel = CancellationToken::new();
        runtime.spawn(watch_episode(
            Arc::downgrade(self),
            episode,
            safety_deadline(armed_at, self.config.policy.safety_timeout(expected_duration_ms)),
            armed_at,
            self.config.check_interval,
            cancel.clone(),
        ));
        *timers = Some(EpisodeTimers { episode, cancel });
    }

    fn disarm(&self, episode: u64) {
        let mut timers = lock(&self.timers);
        if timers.as_ref().is_some_and(|t| t.episode <= episode) {
            if let Some(done) = timers.take() {
                done.cancel.cancel();
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(timers) = lock(&self.timers).take() {
            timers.cancel.cancel();
        }
    }
}

/// Watchdog for one lock episode: recurring elapsed-time check plus the
/// safety timeout. Exits when cancelled, when the episode ends, or when
/// the controller is dropped.
async fn watch_episode(
    inner: Weak<Inner>,
    episode: u64,
    safety_deadline: Instant,
    armed_at: Instant,
    check_every: Duration,
    cancel: CancellationToken,
) {
    let deadline = tokio::time::sleep_until(safety_deadline);
    tokio::pin!(deadline);

    let mut checks = tokio::time::interval_at(armed_at + check_every, check_every);
    checks.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return,

            _ = &mut deadline => {
                if let Some(inner) = inner.upgrade() {
                    inner.apply(LockTrigger::SafetyTimeout { episode });
                }
                return;
            }

            _ = checks.tick() => {
                let Some(inner) = inner.upgrade() else { return };
                if inner.store.lock_state().episode != episode {
                    return;
                }
                if let Outcome::Unlocked { .. } = inner.apply(LockTrigger::Tick) {
                    return;
                }
            }
        }
    }
}

/// `armed_at + timeout`, saturating to a deadline that never comes.
fn safety_deadline(armed_at: Instant, timeout: Duration) -> Instant {
    armed_at
        .checked_add(timeout)
        .unwrap_or_else(|| armed_at + NEVER)
}

const NEVER: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
