//! WebSocket implementation of [`ChangeChannel`].
//!
//! Each stream gets its own WebSocket at
//! `{base_url}?stream=<kind>&owner=<user id>`. Text frames are decoded
//! with [`decode_frame`]; binary, ping and pong frames are ignored.

use futures::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::change::decode_frame;
use crate::channel::{ChangeChannel, ChangeStream, ChannelError, StreamFilter, StreamItem};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connection settings for the backend realtime endpoint.
pub struct WsChangeChannel {
    base_url: String,
}

impl WsChangeChannel {
    /// * `base_url` - realtime endpoint, e.g. `wss://host/realtime`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full URL for one filtered stream.
    pub fn stream_url(&self, filter: &StreamFilter) -> String {
        let separator = if self.base_url.contains('?') { '&' } else { '?' };
        format!(
            "{}{separator}stream={}&owner={}",
            self.base_url, filter.kind, filter.owner_user_id
        )
    }
}

#[async_trait::async_trait]
impl ChangeChannel for WsChangeChannel {
    async fn open(&self, filter: StreamFilter) -> Result<ChangeStream, ChannelError> {
        let url = self.stream_url(&filter);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ChannelError::Connection(format!(
                "Failed to open {} stream at {}: {e}",
                filter.kind, self.base_url
            ))
        })?;

        tracing::info!(
            stream = %filter.kind,
            user_id = %filter.owner_user_id,
            "Realtime stream opened",
        );

        Ok(futures::stream::unfold(Some(ws_stream), next_item).boxed())
    }
}

/// Pull the next change out of the socket.
///
/// After a receive error the socket is dropped and the stream ends on
/// the following poll.
async fn next_item(
    state: Option<WsStream>,
) -> Option<(Result<StreamItem, ChannelError>, Option<WsStream>)> {
    let mut ws = state?;

    while let Some(msg_result) = ws.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                let item = decode_frame(&text).map(StreamItem::Change);
                return Some((item, Some(ws)));
            }
            Ok(Message::Binary(_)) => {
                tracing::trace!("Ignoring binary frame on realtime stream");
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                // Handled automatically by tungstenite.
            }
            Ok(Message::Close(frame)) => {
                tracing::info!(?frame, "Realtime stream closed by server");
                return None;
            }
            Ok(Message::Frame(_)) => {}
            Err(e) => {
                return Some((Err(ChannelError::Protocol(e.to_string())), None));
            }
        }
    }

    None
}
