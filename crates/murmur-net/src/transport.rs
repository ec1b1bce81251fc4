//! Relay transports.
//!
//! A [`Connector`] turns a relay URL into a text-frame sink and stream. The
//! pool only ever sees these two halves, so tests can swap the WebSocket
//! connector for an in-memory one.

use std::pin::Pin;

use futures::future::BoxFuture;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::debug;

use crate::error::NetError;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = NetError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, NetError>> + Send>>;

pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<(FrameSink, FrameStream), NetError>>;
}

/// Trim and validate a relay URL. Only `ws://` and `wss://` are accepted.
pub fn normalize_relay_url(url: &str) -> Result<String, NetError> {
    let trimmed = url.trim().trim_end_matches('/');
    let host = trimmed
        .strip_prefix("wss://")
        .or_else(|| trimmed.strip_prefix("ws://"))
        .ok_or_else(|| NetError::InvalidUrl(format!("{trimmed}: must start with ws:// or wss://")))?;
    if host.is_empty() {
        return Err(NetError::InvalidUrl(format!("{trimmed}: missing host")));
    }
    Ok(trimmed.to_string())
}

/// Real relays over WebSocket (tokio-tungstenite).
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<(FrameSink, FrameStream), NetError>> {
        let url = url.to_string();
        Box::pin(async move {
            let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| NetError::Connect(e.to_string()))?;
            debug!(relay = %url, "WebSocket handshake complete");

            let (write, read) = ws_stream.split();

            let sink = write
                .sink_map_err(|e| NetError::Transport(e.to_string()))
                .with(|text: String| futures::future::ready(Ok::<_, NetError>(WsMessage::Text(text))));

            let stream = read.filter_map(|msg| async move {
                match msg {
                    Ok(WsMessage::Text(text)) => Some(Ok(text)),
                    Ok(WsMessage::Binary(bytes)) => String::from_utf8(bytes).ok().map(Ok),
                    Ok(WsMessage::Close(_)) => Some(Err(NetError::Closed)),
                    // Ping/Pong are answered by tungstenite itself
                    Ok(_) => None,
                    Err(e) => Some(Err(NetError::Transport(e.to_string()))),
                }
            });

            let sink: FrameSink = Box::pin(sink);
            let stream: FrameStream = Box::pin(stream);
            Ok((sink, stream))
        })
    }
}
