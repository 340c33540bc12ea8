//! Shared building blocks for the loyalty client core.
//!
//! - [`types`]: id and timestamp aliases used across crates.
//! - [`models`]: cached entity rows (spin balance, check-in, coupon).
//! - [`lock`]: the process-wide [`LockState`] record.
//! - [`store`]: the [`StateStore`] holding cached entities and the lock.
//! - [`clock`]: injectable time source.

pub mod clock;
pub mod config;
pub mod error;
pub mod lock;
pub mod models;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::CoreError;
pub use lock::{LockPhase, LockState};
pub use store::{ApplyOutcome, LockWriter, StateStore, Versioned};
