//! Transport seam between the bridge and the backend change channel.
//!
//! A [`ChangeChannel`] opens one filtered [`ChangeStream`] per entity
//! kind and owner. Connection lifecycle (handshakes, reconnects) is the
//! transport's business; the bridge only observes what the stream
//! yields.

use std::sync::Arc;

use futures::stream::BoxStream;
use loyalty_core::types::UserId;

use crate::change::{ChangeEvent, EntityKind};

/// Which rows a stream carries: one entity kind, one owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamFilter {
    pub kind: EntityKind,
    pub owner_user_id: UserId,
}

impl StreamFilter {
    pub fn new(kind: EntityKind, owner_user_id: UserId) -> Self {
        Self {
            kind,
            owner_user_id,
        }
    }
}

/// Something a stream can yield besides an error.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Change(ChangeEvent),
    /// The transport re-established the stream after a failure. A replay
    /// of already-seen changes may follow.
    Resumed,
}

/// A live, filtered stream of changes.
///
/// `Err` items are not necessarily terminal: a reconnecting transport
/// reports each failure and keeps going. The stream ends (`None`) when
/// the transport gives up or the server closes it.
pub type ChangeStream = BoxStream<'static, Result<StreamItem, ChannelError>>;

/// Backend push transport.
#[async_trait::async_trait]
pub trait ChangeChannel: Send + Sync + 'static {
    /// Open a stream for `filter`. Resolves once the transport has
    /// accepted the subscription.
    async fn open(&self, filter: StreamFilter) -> Result<ChangeStream, ChannelError>;
}

#[async_trait::async_trait]
impl<C> ChangeChannel for Arc<C>
where
    C: ChangeChannel + ?Sized,
{
    async fn open(&self, filter: StreamFilter) -> Result<ChangeStream, ChannelError> {
        (**self).open(filter).await
    }
}

/// Errors raised by a change channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Failed to establish the subscription.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A protocol-level error on an established stream.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A frame could not be decoded into a change.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The server closed the stream.
    #[error("Stream closed")]
    Closed,
}

impl ChannelError {
    /// Decode errors affect one frame; everything else means the stream
    /// is no longer delivering.
    pub fn is_stream_failure(&self) -> bool {
        !matches!(self, ChannelError::Decode(_))
    }
}
