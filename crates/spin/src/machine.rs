//! Pure spin-lock transitions.
//!
//! [`transition`] maps `(state, trigger, now)` to the next state without
//! touching timers or the store, so every unlock path can be exercised
//! with fixed timestamps. The controller is the only caller outside
//! tests.

use std::time::Duration;

use loyalty_core::clock::elapsed_ms;
use loyalty_core::lock::{LockPhase, LockState};
use loyalty_core::types::Timestamp;
use serde::Serialize;

/// Default grace period past the expected duration before a returning
/// foreground forces an unlock.
pub const DEFAULT_VISIBILITY_MARGIN_MS: u64 = 5_000;

/// Default multiple of the expected duration after which the safety
/// timeout fires.
pub const DEFAULT_SAFETY_MULTIPLIER: u32 = 2;

/// Timing parameters of the unlock paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub visibility_margin_ms: u64,
    pub safety_multiplier: u32,
}

impl LockPolicy {
    /// Delay after acquisition at which the safety timeout fires.
    pub fn safety_timeout(&self, expected_duration_ms: u64) -> Duration {
        Duration::from_millis(expected_duration_ms.saturating_mul(u64::from(self.safety_multiplier)))
    }
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            visibility_margin_ms: DEFAULT_VISIBILITY_MARGIN_MS,
            safety_multiplier: DEFAULT_SAFETY_MULTIPLIER,
        }
    }
}

/// Something that may move the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockTrigger {
    /// A spin wants to start. Negative durations are clamped to zero.
    Acquire {
        expected_duration_ms: i64,
        reason: Option<String>,
    },
    /// The UI finished showing the outcome.
    Release,
    /// Recurring elapsed-time check.
    Tick,
    /// The safety timer armed for `episode` fired.
    SafetyTimeout { episode: u64 },
    /// The app regained visibility or window focus.
    Foregrounded,
}

/// Which path ended a lock episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockCause {
    Released,
    Elapsed,
    SafetyTimeout,
    Foregrounded,
}

impl std::fmt::Display for UnlockCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Released => "released",
            Self::Elapsed => "elapsed",
            Self::SafetyTimeout => "safety_timeout",
            Self::Foregrounded => "foregrounded",
        })
    }
}

/// Result of applying one trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A new lock episode started.
    Acquired { episode: u64 },
    /// `Acquire` while already locked. Another spin is running.
    Denied,
    /// The current episode ended.
    Unlocked { episode: u64, cause: UnlockCause },
    /// Nothing to do.
    Unchanged,
}

/// Whether the expected duration has fully elapsed for a held lock.
pub fn should_auto_unlock(state: &LockState, now: Timestamp) -> bool {
    match (state.phase, state.started_at) {
        (LockPhase::Locked, Some(started_at)) => {
            elapsed_ms(started_at, now) >= state.expected_duration_ms
        }
        _ => false,
    }
}

/// Compute the next lock state for `trigger`.
///
/// Returns `None` as the state when nothing changes. Only `Acquire` can
/// produce a locked state; every other trigger either unlocks the
/// current episode or is a no-op, so racing unlock paths converge.
pub fn transition(
    state: &LockState,
    trigger: &LockTrigger,
    now: Timestamp,
    policy: &LockPolicy,
) -> (Option<LockState>, Outcome) {
    let held_for = state.started_at.map(|at| elapsed_ms(at, now));

    let cause = match (trigger, state.phase) {
        (
            LockTrigger::Acquire {
                expected_duration_ms,
                reason,
            },
            LockPhase::Idle,
        ) => {
            let episode = state.episode + 1;
            let next = LockState {
                phase: LockPhase::Locked,
                started_at: Some(now),
                expected_duration_ms: (*expected_duration_ms).max(0) as u64,
                reason: reason.clone(),
                episode,
            };
            return (Some(next), Outcome::Acquired { episode });
        }
        (LockTrigger::Acquire { .. }, LockPhase::Locked) => return (None, Outcome::Denied),
        (_, LockPhase::Idle) => return (None, Outcome::Unchanged),

        (LockTrigger::Release, LockPhase::Locked) => UnlockCause::Released,
        (LockTrigger::Tick, LockPhase::Locked) if should_auto_unlock(state, now) => {
            UnlockCause::Elapsed
        }
        (LockTrigger::SafetyTimeout { episode }, LockPhase::Locked)
            if *episode == state.episode =>
        {
            UnlockCause::SafetyTimeout
        }
        (LockTrigger::Foregrounded, LockPhase::Locked)
            if held_for.is_some_and(|held| {
                held > state.expected_duration_ms.saturating_add(policy.visibility_margin_ms)
            }) =>
        {
            UnlockCause::Foregrounded
        }
        _ => return (None, Outcome::Unchanged),
    };

    let next = LockState {
        episode: state.episode,
        ..LockState::idle()
    };
    (
        Some(next),
        Outcome::Unlocked {
            episode: state.episode,
            cause,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn at(ms: i64) -> Timestamp {
        Timestamp::UNIX_EPOCH + chrono::Duration::milliseconds(ms)
    }

    fn acquire(ms: i64) -> LockTrigger {
        LockTrigger::Acquire {
            expected_duration_ms: ms,
            reason: Some("roulette".into()),
        }
    }

    fn locked(expected_ms: i64) -> LockState {
        let (next, _) = transition(&LockState::idle(), &acquire(expected_ms), at(0), &LockPolicy::default());
        next.unwrap()
    }

    #[test]
    fn acquire_from_idle_starts_episode() {
        let (next, outcome) = transition(&LockState::idle(), &acquire(8000), at(0), &LockPolicy::default());

        let next = next.unwrap();
        assert!(next.is_locked());
        assert_eq!(next.started_at, Some(at(0)));
        assert_eq!(next.expected_duration_ms, 8000);
        assert_eq!(next.reason.as_deref(), Some("roulette"));
        assert_eq!(outcome, Outcome::Acquired { episode: 1 });
    }

    #[test]
    fn acquire_while_locked_is_denied() {
        let state = locked(8000);

        let (next, outcome) = transition(&state, &acquire(1000), at(500), &LockPolicy::default());

        assert_eq!(next, None);
        assert_eq!(outcome, Outcome::Denied);
    }

    #[test]
    fn negative_duration_clamps_to_zero() {
        let state = locked(-50);
        assert_eq!(state.expected_duration_ms, 0);
        assert!(should_auto_unlock(&state, at(0)));
    }

    #[test]
    fn release_clears_started_at_and_keeps_episode() {
        let state = locked(8000);

        let (next, outcome) = transition(&state, &LockTrigger::Release, at(3000), &LockPolicy::default());

        let next = next.unwrap();
        assert!(!next.is_locked());
        assert_eq!(next.started_at, None);
        assert_eq!(next.episode, 1);
        assert_eq!(
            outcome,
            Outcome::Unlocked {
                episode: 1,
                cause: UnlockCause::Released
            }
        );
    }

    #[test]
    fn every_unlock_trigger_is_noop_when_idle() {
        let idle = LockState::idle();
        let policy = LockPolicy::default();
        for trigger in [
            LockTrigger::Release,
            LockTrigger::Tick,
            LockTrigger::SafetyTimeout { episode: 0 },
            LockTrigger::Foregrounded,
        ] {
            assert_eq!(transition(&idle, &trigger, at(99_000), &policy), (None, Outcome::Unchanged));
        }
    }

    #[test]
    fn tick_unlocks_only_once_duration_elapsed() {
        let state = locked(8000);
        let policy = LockPolicy::default();

        assert_matches!(transition(&state, &LockTrigger::Tick, at(7999), &policy), (None, Outcome::Unchanged));
        assert_matches!(
            transition(&state, &LockTrigger::Tick, at(8000), &policy),
            (Some(_), Outcome::Unlocked { cause: UnlockCause::Elapsed, .. })
        );
    }

    #[test]
    fn safety_timeout_for_other_episode_is_ignored() {
        let state = locked(8000);
        let policy = LockPolicy::default();

        let stale = LockTrigger::SafetyTimeout { episode: 7 };
        assert_matches!(transition(&state, &stale, at(16_000), &policy), (None, Outcome::Unchanged));

        let current = LockTrigger::SafetyTimeout { episode: 1 };
        assert_matches!(
            transition(&state, &current, at(16_000), &policy),
            (Some(_), Outcome::Unlocked { cause: UnlockCause::SafetyTimeout, .. })
        );
    }

    #[test]
    fn foreground_unlocks_only_past_margin() {
        let state = locked(8000);
        let policy = LockPolicy::default();

        assert_matches!(
            transition(&state, &LockTrigger::Foregrounded, at(13_000), &policy),
            (None, Outcome::Unchanged)
        );
        assert_matches!(
            transition(&state, &LockTrigger::Foregrounded, at(20_000), &policy),
            (Some(_), Outcome::Unlocked { cause: UnlockCause::Foregrounded, .. })
        );
    }

    #[test]
    fn safety_timeout_scales_with_multiplier() {
        let policy = LockPolicy::default();
        assert_eq!(policy.safety_timeout(8000), Duration::from_millis(16_000));
        assert_eq!(policy.safety_timeout(u64::MAX), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn reacquire_after_unlock_bumps_episode() {
        let policy = LockPolicy::default();
        let (idle, _) = transition(&locked(8000), &LockTrigger::Release, at(1000), &policy);

        let (_, outcome) = transition(&idle.unwrap(), &acquire(8000), at(2000), &policy);

        assert_eq!(outcome, Outcome::Acquired { episode: 2 });
    }
}
