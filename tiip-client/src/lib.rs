//! TIIP client over WebSocket
//!
//! This crate implements the client side of TIIP, a request/reply plus
//! publish/subscribe protocol carried over one persistent WebSocket. It is
//! built in layers, leaves first:
//!
//! - **Connection**: one logical socket with send queueing and randomized
//!   exponential backoff reconnection
//! - **Correlator**: correlation ids, pending requests and their deadlines
//! - **Router**: channel subscriptions with prefix matching of publications
//! - **Session**: login, credential caching and automatic relogin after a
//!   reconnect
//!
//! `TiipSocket` combines the first three; `Session` sits on top of it.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use tiip_client::{ClientBuilder, LoginOptions, SubscriptionKey};
//! use serde_json::Map;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = ClientBuilder::new("wss://example.com/wsh").build_session()?;
//!     session.connect().await?;
//!     session.authenticate("alice", "secret", LoginOptions::default()).await?;
//!
//!     let socket = session.socket();
//!     let reply = socket.req("Conf", "readUsers", None, None).await?;
//!     println!("{:?}", reply.payload);
//!
//!     socket
//!         .subscribe(SubscriptionKey::new("#17"), Map::new(), |publication| async move {
//!             println!("{:?}", publication.payload);
//!         })
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

mod client;
mod client_builder;
mod connection;
mod hooks;
mod metrics;
mod reconnect;
mod request;
mod session;
mod storage;
mod subscription;
mod transport;

pub use client::{PublishOptions, TiipSocket, DEFAULT_INIT_TARGET};
pub use client_builder::ClientBuilder;
pub use connection::{CloseEvent, Connection, ConnectionConfig, ReadyState};
pub use hooks::{Diagnostic, Hooks, Received};
pub use metrics::ClientMetrics;
pub use reconnect::{ExponentialBackoff, ReconnectionStrategy};
pub use request::{Correlator, PendingReply, DEFAULT_MID_MAX, DEFAULT_TIMEOUT};
pub use session::{hash_password, AuthContext, LoginOptions, Session, SessionState, UserSettings};
pub use storage::{CredentialStore, MemoryCredentialStore, AUTH_STORAGE_KEY};
pub use subscription::{subscriber, Router, SubscriberFn, SubscriptionKey};
pub use transport::{
    is_websocket_url, validate_url, SocketEvent, SocketSink, SocketStream, Transport,
    WsTransport, CLOSE_ABNORMAL, CLOSE_NORMAL, CLOSE_RECONNECT,
};
