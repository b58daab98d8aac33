//! Transport factory for physical sockets
//!
//! The connection layer never talks to a WebSocket library directly. It is
//! given a `Transport` once, at construction, and asks it for a fresh
//! socket every time it (re)connects. A socket is a pair:
//!
//! - a `SocketSink` accepting outbound text frames; closing the sink closes
//!   the socket
//! - a `SocketStream` of `SocketEvent`s
//!
//! A stream that ends without a `Closed` event is treated as an abnormal
//! close (code 1006).
//!
//! `WsTransport` is the default implementation on top of tokio-tungstenite.
//! Tests substitute an in-process transport to script disconnects.

use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use tiip_core::{Error, Result};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;
/// Closed without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Close code a server sends to ask clients to reconnect
pub const CLOSE_RECONNECT: u16 = 4000;

/// Outbound half of a physical socket
pub type SocketSink = Pin<Box<dyn Sink<String, Error = Error> + Send>>;

/// Inbound half of a physical socket
pub type SocketStream = Pin<Box<dyn Stream<Item = SocketEvent> + Send>>;

/// Event observed on a physical socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// Text frame
    Message(String),
    /// Transport error; does not by itself close the socket
    Error(String),
    /// Close frame
    Closed { code: u16, reason: String },
}

/// Creates physical sockets
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a socket to `url`, offering `protocols` as sub-protocols
    async fn connect(&self, url: &str, protocols: &[String]) -> Result<(SocketSink, SocketStream)>;
}

/// True if `url` uses the `ws://` or `wss://` scheme
pub fn is_websocket_url(url: &str) -> bool {
    let lower = url.trim().to_ascii_lowercase();
    lower.starts_with("ws://") || lower.starts_with("wss://")
}

/// Check a URL before any socket is created
pub fn validate_url(url: &str) -> Result<()> {
    if is_websocket_url(url) {
        Ok(())
    } else {
        Err(Error::InvalidUrl(url.to_string()))
    }
}

/// WebSocket transport backed by tokio-tungstenite
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &str, protocols: &[String]) -> Result<(SocketSink, SocketStream)> {
        let mut request = url
            .into_client_request()
            .map_err(|e| Error::InvalidUrl(e.to_string()))?;

        if !protocols.is_empty() {
            let value = HeaderValue::from_str(&protocols.join(", "))
                .map_err(|e| Error::WebSocket(e.to_string()))?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;

        let (sender, receiver) = ws_stream.split();

        let sink = sender
            .with(|text: String| future::ready(Ok::<_, WsError>(Message::Text(text))))
            .sink_map_err(|e| Error::WebSocket(e.to_string()));

        let stream = receiver.filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(SocketEvent::Message(text)),
                Ok(Message::Close(frame)) => Some(match frame {
                    Some(frame) => SocketEvent::Closed {
                        code: u16::from(frame.code),
                        reason: frame.reason.into_owned(),
                    },
                    None => SocketEvent::Closed {
                        code: CLOSE_NORMAL,
                        reason: String::new(),
                    },
                }),
                Ok(_) => None,
                Err(e) => Some(SocketEvent::Error(e.to_string())),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_validation() {
        assert!(validate_url("ws://localhost:8080").is_ok());
        assert!(validate_url("wss://example.com/wsh").is_ok());
        assert!(validate_url("WSS://EXAMPLE.COM").is_ok());

        assert!(matches!(validate_url("http://localhost"), Err(Error::InvalidUrl(_))));
        assert!(matches!(validate_url("localhost:8080"), Err(Error::InvalidUrl(_))));
        assert!(matches!(validate_url(""), Err(Error::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_ws_transport_refused() {
        // Port 1 is never listening
        let result = WsTransport.connect("ws://127.0.0.1:1", &[]).await;
        assert!(matches!(result, Err(Error::WebSocket(_))));
    }
}
