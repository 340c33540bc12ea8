//! Live bridge between the backend change channel and the client state
//! store.
//!
//! - [`RealtimeBridge`]: one subscription per active user, three change
//!   streams, last-write-wins application into the
//!   [`StateStore`](loyalty_core::StateStore).
//! - [`ChangeEvent`]: closed union of pushed row changes.
//! - [`ChangeChannel`]: transport seam, with a WebSocket implementation
//!   ([`WsChangeChannel`]), a backoff wrapper ([`ReconnectingChannel`])
//!   and an in-memory double for tests ([`MemoryChannel`]).

pub mod bridge;
pub mod change;
pub mod channel;
pub mod listeners;
pub mod memory;
pub mod reconnect;
pub mod ws;

pub use bridge::{ConnectionStatus, RealtimeBridge};
pub use change::{Change, ChangeEvent, EntityKind, Operation};
pub use channel::{ChangeChannel, ChangeStream, ChannelError, StreamFilter, StreamItem};
pub use listeners::ListenerHandle;
pub use memory::MemoryChannel;
pub use reconnect::{ReconnectConfig, ReconnectingChannel};
pub use ws::WsChangeChannel;
