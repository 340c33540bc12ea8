//! Spin concurrency: the "at most one spin in flight" lock and the
//! navigation guard that follows it.
//!
//! - [`machine`]: pure `(state, trigger, now) -> next` transition
//!   function covering acquisition and the four unlock paths.
//! - [`SpinLockController`]: owns the lock, arms the elapsed-time check
//!   and safety timeout per lock episode.
//! - [`NavigationGuard`]: blocks unload, history and in-app navigation
//!   while a spin is in flight, warning once per episode.

pub mod config;
pub mod controller;
pub mod guard;
pub mod machine;

pub use config::SpinLockConfig;
pub use controller::{LockObserver, SpinLockController};
pub use guard::{Location, NavigationDecision, NavigationGuard, NavigationHost, Notifier, UnloadDecision};
pub use machine::{LockPolicy, LockTrigger, Outcome, UnlockCause};
