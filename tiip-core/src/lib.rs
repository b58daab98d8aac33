//! Core TIIP types, codec and errors
//!
//! This crate holds everything the client and its tests share:
//!
//! - **Types**: the `Envelope` message unit and the `Publication` view
//!   handed to subscribers
//! - **Codec**: the `Codec` boundary and the default `JsonCodec`
//! - **Error handling**: one `Error` enum for every failure a caller can see
//! - **Observability**: `tracing` subscriber and OpenTelemetry setup
//!
//! # Example
//!
//! ```rust
//! use tiip_core::{codec::{Codec, JsonCodec}, Envelope, MessageType};
//!
//! let sub = Envelope::new(MessageType::Sub)
//!     .with_channel("#17")
//!     .with_argument("subChannel", serde_json::json!("0"))
//!     .with_correlation_id("1");
//!
//! let text = JsonCodec.encode(&sub).unwrap();
//! assert_eq!(JsonCodec.decode(&text).unwrap(), sub);
//! ```

pub mod codec;
pub mod error;
pub mod observability;
pub mod types;

pub use codec::{Codec, JsonCodec};
pub use error::{Error, Result};
pub use observability::{init_observability, shutdown_observability, ObservabilityConfig};
pub use types::{Envelope, MessageType, Publication};
