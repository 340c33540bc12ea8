//! The single spin-lock record shared by the whole session.
//!
//! Only the spin lock controller writes it; everything else reads it
//! from the [`StateStore`](crate::store::StateStore).

use serde::Serialize;

use crate::types::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPhase {
    Idle,
    Locked,
}

/// Snapshot of the spin lock.
///
/// `started_at` is `Some` exactly when `phase` is [`LockPhase::Locked`].
/// `episode` counts successful acquisitions and is never reset, so a
/// timer armed for one lock episode can tell it has been superseded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockState {
    pub phase: LockPhase,
    pub started_at: Option<Timestamp>,
    pub expected_duration_ms: u64,
    pub reason: Option<String>,
    pub episode: u64,
}

impl LockState {
    /// The state every session starts in.
    pub const fn idle() -> Self {
        Self {
            phase: LockPhase::Idle,
            started_at: None,
            expected_duration_ms: 0,
            reason: None,
            episode: 0,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.phase == LockPhase::Locked
    }
}

impl Default for LockState {
    fn default() -> Self {
        Self::idle()
    }
}
