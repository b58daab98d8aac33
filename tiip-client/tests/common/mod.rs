//! Common test utilities for tiip-client integration tests
//!
//! `MockTiipServer` is a small WebSocket server that records every frame the
//! client sends, answers through a scripted responder and lets a test push
//! frames or drop the connection at will.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

type Responder = Arc<dyn Fn(&Value) -> Vec<Value> + Send + Sync>;

enum Command {
    Text(String),
    Drop,
}

/// Scripted TIIP server
pub struct MockTiipServer {
    addr: SocketAddr,
    frames: mpsc::UnboundedReceiver<Value>,
    connections: Arc<Mutex<Vec<mpsc::UnboundedSender<Command>>>>,
    accepted: Arc<AtomicUsize>,
}

impl MockTiipServer {
    /// Server that replies `ok: true` with an empty payload to every
    /// correlated frame
    pub async fn new() -> Self {
        Self::with_responder(|frame| match frame.get("mid") {
            Some(_) => vec![reply(frame, true, json!([]))],
            None => Vec::new(),
        })
        .await
    }

    /// Server answering each parsed frame with whatever `responder` returns
    pub async fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&Value) -> Vec<Value> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (frame_tx, frames) = mpsc::unbounded_channel();
        let connections = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));
        let responder: Responder = Arc::new(responder);

        {
            let connections = Arc::clone(&connections);
            let accepted = Arc::clone(&accepted);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let Ok(ws) = accept_async(stream).await else {
                        continue;
                    };
                    accepted.fetch_add(1, Ordering::SeqCst);

                    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
                    connections.lock().unwrap().push(cmd_tx);
                    tokio::spawn(serve(ws, cmd_rx, frame_tx.clone(), Arc::clone(&responder)));
                }
            });
        }

        Self {
            addr,
            frames,
            connections,
            accepted,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Number of WebSocket handshakes completed so far
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Next frame the client sent, failing the test after 5 s
    pub async fn next_frame(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(5), self.frames.recv())
            .await
            .expect("no frame within 5s")
            .expect("server stopped")
    }

    /// Next frame of the given type, skipping others
    pub async fn next_frame_of(&mut self, kind: &str) -> Value {
        loop {
            let frame = self.next_frame().await;
            if frame["type"] == kind {
                return frame;
            }
        }
    }

    /// Send a raw text frame on the newest connection
    pub fn push(&self, text: impl Into<String>) {
        if let Some(conn) = self.connections.lock().unwrap().last() {
            let _ = conn.send(Command::Text(text.into()));
        }
    }

    /// Send a JSON frame on the newest connection
    pub fn push_json(&self, value: Value) {
        self.push(value.to_string());
    }

    /// Drop every open connection without a close handshake
    pub fn drop_connections(&self) {
        for conn in self.connections.lock().unwrap().drain(..) {
            let _ = conn.send(Command::Drop);
        }
    }
}

async fn serve(
    ws: WebSocketStream<TcpStream>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    frames: mpsc::UnboundedSender<Value>,
    responder: Responder,
) {
    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    let _ = frames.send(frame.clone());
                    for answer in responder(&frame) {
                        if write.send(Message::Text(answer.to_string())).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
            cmd = commands.recv() => match cmd {
                Some(Command::Text(text)) => {
                    let _ = write.send(Message::Text(text)).await;
                }
                Some(Command::Drop) | None => return,
            },
        }
    }
}

/// Reply to `frame`, echoing its correlation id
pub fn reply(frame: &Value, ok: bool, payload: Value) -> Value {
    json!({
        "type": "rep",
        "mid": frame["mid"],
        "ok": ok,
        "payload": payload,
    })
}

/// Publication on `channel`
pub fn publication(channel: &str, payload: Value) -> Value {
    json!({
        "type": "pub",
        "channel": channel,
        "signal": "update",
        "payload": payload,
    })
}

/// Poll `check` until it holds, failing the test after 5 s
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not met within 5s");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_echoes_mid() {
        let frame = json!({"type": "req", "mid": "7"});
        let rep = reply(&frame, false, json!(["denied"]));
        assert_eq!(rep["type"], "rep");
        assert_eq!(rep["mid"], "7");
        assert_eq!(rep["ok"], false);
        assert_eq!(rep["payload"][0], "denied");
    }

    #[tokio::test]
    async fn test_mock_server_url() {
        let server = MockTiipServer::new().await;
        assert!(server.url().starts_with("ws://127.0.0.1:"));
        assert_eq!(server.accepted(), 0);
    }
}
