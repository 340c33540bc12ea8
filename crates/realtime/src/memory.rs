//! In-memory [`ChangeChannel`] for tests and local development.
//!
//! Streams are plain unbounded channels keyed by [`StreamFilter`]. Tests
//! push changes, inject failures, and inspect which streams are still
//! held open by a consumer.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use futures::StreamExt;
use tokio::sync::mpsc;

use crate::change::{ChangeEvent, EntityKind};
use crate::channel::{ChangeChannel, ChangeStream, ChannelError, StreamFilter, StreamItem};

type ItemSender = mpsc::UnboundedSender<Result<StreamItem, ChannelError>>;

#[derive(Default)]
struct MemoryState {
    streams: HashMap<StreamFilter, ItemSender>,
    fail_next: HashSet<EntityKind>,
    opens: HashMap<StreamFilter, usize>,
}

/// Change channel backed by in-process queues.
#[derive(Default)]
pub struct MemoryChannel {
    state: Mutex<MemoryState>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` on the stream matching its kind and owner.
    ///
    /// Returns `false` when no consumer holds such a stream.
    pub fn push(&self, event: ChangeEvent) -> bool {
        let filter = StreamFilter::new(event.kind(), event.owner_user_id());
        self.send(filter, Ok(StreamItem::Change(event)))
    }

    /// Deliver `event` on `filter`'s stream regardless of its content.
    ///
    /// Lets tests simulate a transport that ignores the filter.
    pub fn push_to(&self, filter: StreamFilter, event: ChangeEvent) -> bool {
        self.send(filter, Ok(StreamItem::Change(event)))
    }

    /// Report `error` on `filter`'s stream without closing it.
    pub fn fail_stream(&self, filter: StreamFilter, error: ChannelError) -> bool {
        self.send(filter, Err(error))
    }

    /// End `filter`'s stream as if the server had closed it.
    pub fn close_stream(&self, filter: StreamFilter) {
        self.lock().streams.remove(&filter);
    }

    /// Make the next [`open`](ChangeChannel::open) for `kind` fail.
    pub fn fail_next_open(&self, kind: EntityKind) {
        self.lock().fail_next.insert(kind);
    }

    /// Whether a consumer still holds `filter`'s stream.
    pub fn is_open(&self, filter: StreamFilter) -> bool {
        self.lock()
            .streams
            .get(&filter)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Every stream a consumer still holds.
    pub fn open_streams(&self) -> Vec<StreamFilter> {
        let mut open: Vec<StreamFilter> = self
            .lock()
            .streams
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .map(|(filter, _)| *filter)
            .collect();
        open.sort_by_key(|f| (f.kind, f.owner_user_id));
        open
    }

    /// Number of successful opens for `filter` so far.
    pub fn open_count(&self, filter: StreamFilter) -> usize {
        self.lock().opens.get(&filter).copied().unwrap_or(0)
    }

    fn send(&self, filter: StreamFilter, item: Result<StreamItem, ChannelError>) -> bool {
        match self.lock().streams.get(&filter) {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl ChangeChannel for MemoryChannel {
    async fn open(&self, filter: StreamFilter) -> Result<ChangeStream, ChannelError> {
        let rx = {
            let mut state = self.lock();
            if state.fail_next.remove(&filter.kind) {
                return Err(ChannelError::Connection(format!(
                    "injected failure opening {} stream",
                    filter.kind
                )));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            state.streams.insert(filter, tx);
            *state.opens.entry(filter).or_default() += 1;
            rx
        };

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}
