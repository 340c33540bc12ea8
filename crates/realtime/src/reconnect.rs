//! Exponential-backoff reconnection for change streams.
//!
//! [`ReconnectingChannel`] wraps another [`ChangeChannel`]. When a
//! stream it opened fails or is closed by the server, it reports the
//! failure as an `Err` item, waits, and reopens the stream with
//! increasing delays until it succeeds or the stream is dropped. A
//! successful reopen yields [`StreamItem::Resumed`]; any changes the
//! server replays afterwards are absorbed by the bridge's stale-event
//! rule.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use crate::channel::{ChangeChannel, ChangeStream, ChannelError, StreamFilter, StreamItem};

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// A [`ChangeChannel`] that keeps its streams alive across drops.
///
/// `open` always succeeds. When the first open fails, the stream starts
/// with that failure as an `Err` item, so the subscription records the
/// error, and then backs off and retries like any later drop.
pub struct ReconnectingChannel<C> {
    inner: Arc<C>,
    config: ReconnectConfig,
}

impl<C: ChangeChannel> ReconnectingChannel<C> {
    pub fn new(inner: C, config: ReconnectConfig) -> Self {
        Self::from_arc(Arc::new(inner), config)
    }

    pub fn from_arc(inner: Arc<C>, config: ReconnectConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait::async_trait]
impl<C: ChangeChannel> ChangeChannel for ReconnectingChannel<C> {
    async fn open(&self, filter: StreamFilter) -> Result<ChangeStream, ChannelError> {
        let phase = match self.inner.open(filter).await {
            Ok(stream) => Phase::Streaming(stream),
            Err(e) => {
                tracing::warn!(
                    stream = %filter.kind,
                    error = %e,
                    "Initial realtime stream open failed, retrying",
                );
                Phase::Failed(e)
            }
        };
        let state = ReopenState {
            inner: Arc::clone(&self.inner),
            filter,
            config: self.config.clone(),
            phase,
        };
        Ok(futures::stream::unfold(state, next_item).boxed())
    }
}

enum Phase {
    /// The first open failed; report it, then back off.
    Failed(ChannelError),
    Streaming(ChangeStream),
    Waiting { delay: Duration, attempt: u32 },
}

struct ReopenState<C> {
    inner: Arc<C>,
    filter: StreamFilter,
    config: ReconnectConfig,
    phase: Phase,
}

async fn next_item<C: ChangeChannel>(
    mut state: ReopenState<C>,
) -> Option<(Result<StreamItem, ChannelError>, ReopenState<C>)> {
    let backoff = Phase::Waiting {
        delay: state.config.initial_delay,
        attempt: 0,
    };

    match std::mem::replace(&mut state.phase, backoff) {
        Phase::Failed(e) => Some((Err(e), state)),
        Phase::Streaming(mut stream) => match stream.next().await {
            Some(Err(e)) if e.is_stream_failure() => {
                tracing::warn!(
                    stream = %state.filter.kind,
                    error = %e,
                    "Realtime stream failed, reconnecting",
                );
                Some((Err(e), state))
            }
            Some(item) => {
                state.phase = Phase::Streaming(stream);
                Some((item, state))
            }
            None => {
                tracing::warn!(
                    stream = %state.filter.kind,
                    "Realtime stream ended, reconnecting",
                );
                Some((Err(ChannelError::Closed), state))
            }
        },
        Phase::Waiting { delay, attempt } => {
            let attempt = attempt + 1;
            tracing::info!(
                stream = %state.filter.kind,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Reopening realtime stream",
            );
            tokio::time::sleep(delay).await;

            match state.inner.open(state.filter).await {
                Ok(stream) => {
                    tracing::info!(stream = %state.filter.kind, attempt, "Realtime stream resumed");
                    state.phase = Phase::Streaming(stream);
                    Some((Ok(StreamItem::Resumed), state))
                }
                Err(e) => {
                    tracing::warn!(
                        stream = %state.filter.kind,
                        error = %e,
                        "Reopen attempt {attempt} failed",
                    );
                    state.phase = Phase::Waiting {
                        delay: next_delay(delay, &state.config),
                        attempt,
                    };
                    Some((Err(e), state))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::EntityKind;
    use crate::memory::MemoryChannel;
    use assert_matches::assert_matches;

    #[test]
    fn next_delay_doubles() {
        let config = ReconnectConfig::default();
        let d = next_delay(Duration::from_secs(1), &config);
        assert_eq!(d, Duration::from_secs(2));
    }

    #[test]
    fn next_delay_clamps_at_max() {
        let config = ReconnectConfig {
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        let d = next_delay(Duration::from_secs(8), &config);
        assert_eq!(d, Duration::from_secs(10));
    }

    #[test]
    fn full_backoff_sequence() {
        let config = ReconnectConfig::default();
        let mut delay = config.initial_delay;
        let expected = [1, 2, 4, 8, 16, 30, 30, 30];

        for &expected_secs in &expected {
            assert_eq!(delay.as_secs(), expected_secs);
            delay = next_delay(delay, &config);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn initial_open_failure_is_reported_then_retried() {
        let memory = Arc::new(MemoryChannel::new());
        let filter = StreamFilter::new(EntityKind::Coupon, uuid::Uuid::nil());
        memory.fail_next_open(EntityKind::Coupon);
        let channel = ReconnectingChannel::from_arc(Arc::clone(&memory), ReconnectConfig::default());

        let mut stream = channel.open(filter).await.unwrap();

        assert_matches!(stream.next().await, Some(Err(ChannelError::Connection(_))));
        assert_matches!(stream.next().await, Some(Ok(StreamItem::Resumed)));
        assert_eq!(memory.open_count(filter), 1);
        assert!(memory.is_open(filter));
    }

    #[tokio::test(start_paused = true)]
    async fn closed_stream_is_reported_then_resumed() {
        let memory = Arc::new(MemoryChannel::new());
        let filter = StreamFilter::new(EntityKind::CheckIn, uuid::Uuid::new_v4());
        let channel = ReconnectingChannel::from_arc(Arc::clone(&memory), ReconnectConfig::default());

        let mut stream = channel.open(filter).await.unwrap();
        memory.close_stream(filter);

        assert_matches!(stream.next().await, Some(Err(ChannelError::Closed)));
        assert_matches!(stream.next().await, Some(Ok(StreamItem::Resumed)));
        assert_eq!(memory.open_count(filter), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reopen_backs_off_and_retries() {
        let memory = Arc::new(MemoryChannel::new());
        let filter = StreamFilter::new(EntityKind::SpinBalance, uuid::Uuid::new_v4());
        let channel = ReconnectingChannel::from_arc(Arc::clone(&memory), ReconnectConfig::default());

        let mut stream = channel.open(filter).await.unwrap();
        memory.fail_stream(filter, ChannelError::Protocol("reset".into()));
        memory.fail_next_open(EntityKind::SpinBalance);

        assert_matches!(stream.next().await, Some(Err(ChannelError::Protocol(_))));
        assert_matches!(stream.next().await, Some(Err(ChannelError::Connection(_))));
        assert_matches!(stream.next().await, Some(Ok(StreamItem::Resumed)));
        assert_eq!(memory.open_count(filter), 2);
    }
}
