//! TIIP - request/reply and publish/subscribe over WebSocket
//!
//! This is the convenience crate that re-exports the TIIP sub-crates. Use it
//! if you want a single dependency for the client and its protocol types.
//!
//! # Architecture
//!
//! - **tiip-core**: envelope types, codec, errors, observability setup
//! - **tiip-client**: connection, correlator, router and session layers
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use tiip::{ClientBuilder, LoginOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = ClientBuilder::new("ws://localhost:8080/wsh").build_session()?;
//!     session.connect().await?;
//!     session.authenticate("alice", "secret", LoginOptions::default()).await?;
//!
//!     let reply = session.socket().req("Conf", "readUsers", None, None).await?;
//!     println!("{:?}", reply.payload);
//!
//!     session.logout().await?;
//!     Ok(())
//! }
//! ```

pub use tiip_client as client;
pub use tiip_core as core;

pub use tiip_client::{ClientBuilder, LoginOptions, Session, SubscriptionKey, TiipSocket};
pub use tiip_core::{Envelope, Error, MessageType, Publication, Result};
