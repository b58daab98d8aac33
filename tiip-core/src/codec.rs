//! Codec boundary for envelope serialization
//!
//! The client never formats frames itself. It hands envelopes to a `Codec`
//! and gets text back, and it hands inbound text to the same codec to find
//! out whether a frame belongs to the protocol at all.
//!
//! # Decode Failures
//!
//! `decode` must fail with `Error::NotProtocol` for any text that is not a
//! well-formed envelope. The client treats that as "someone else's message"
//! and forwards the raw text to the application instead of dropping it.
//!
//! # Examples
//!
//! ```rust
//! use tiip_core::{codec::{Codec, JsonCodec}, Envelope, MessageType};
//!
//! let codec = JsonCodec;
//! let text = codec.encode(&Envelope::new(MessageType::Req).with_signal("ping")).unwrap();
//! let decoded = codec.decode(&text).unwrap();
//! assert_eq!(decoded.signal.as_deref(), Some("ping"));
//!
//! assert!(codec.decode("hello").is_err());
//! ```

use crate::error::{Error, Result};
use crate::types::Envelope;

/// Envelope encoder/decoder pair
pub trait Codec: Send + Sync {
    /// Serialize an envelope to a text frame
    fn encode(&self, envelope: &Envelope) -> Result<String>;

    /// Parse a text frame, failing with `Error::NotProtocol` on foreign text
    fn decode(&self, text: &str) -> Result<Envelope>;
}

/// JSON form of the envelope
///
/// Fields are the envelope's serde names (`type`, `mid`, `ts`, ...), unset
/// fields are omitted.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, envelope: &Envelope) -> Result<String> {
        serde_json::to_string(envelope).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn decode(&self, text: &str) -> Result<Envelope> {
        // Parse to a value first so that valid JSON which is not an object
        // is rejected with the same error as garbage.
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| Error::NotProtocol(e.to_string()))?;

        if !value.is_object() {
            return Err(Error::NotProtocol("not a JSON object".to_string()));
        }

        serde_json::from_value(value).map_err(|e| Error::NotProtocol(e.to_string()))
    }
}
