//! Envelope types
//!
//! An `Envelope` is one protocol message unit. The same struct is used for
//! every direction and every message type; which fields are meaningful
//! depends on `kind`:
//!
//! | kind    | direction | notable fields |
//! |---------|-----------|----------------|
//! | `init`  | out       | `target`, `arguments.id`, `arguments.password`, `mid` |
//! | `req`   | out       | `target`, `signal`, `arguments`, `mid` |
//! | `sub`   | out       | `channel`, `arguments.subChannel`, `mid` |
//! | `unsub` | out       | `channel` (the server-assigned handle), `mid` |
//! | `pub`   | both      | `channel`, `source`, `signal`, `payload` |
//! | `rep`   | in        | `mid` (echoed), `ok`, `payload`, `channel` on sub replies |
//!
//! Envelopes are plain values. The client stamps the correlation id before
//! sending and never mutates an envelope afterwards.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Envelope message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Authentication request
    Init,
    /// Generic request
    Req,
    /// Subscribe to a channel
    Sub,
    /// Unsubscribe from a channel handle
    Unsub,
    /// Publication
    Pub,
    /// Reply to an `init`, `req`, `sub` or `unsub`
    Rep,
    /// Any type this client does not know; only ever produced by decoding
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Wire name of the type
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Init => "init",
            MessageType::Req => "req",
            MessageType::Sub => "sub",
            MessageType::Unsub => "unsub",
            MessageType::Pub => "pub",
            MessageType::Rep => "rep",
            MessageType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol message
///
/// Optional fields are omitted from the encoded form when unset.
///
/// # Examples
///
/// ```rust
/// use tiip_core::{Envelope, MessageType};
/// use serde_json::json;
///
/// let env = Envelope::new(MessageType::Req)
///     .with_target("Conf")
///     .with_signal("readUsers")
///     .with_argument("rids", json!(["u1"]));
///
/// assert_eq!(env.kind, MessageType::Req);
/// assert_eq!(env.arguments.unwrap()["rids"], json!(["u1"]));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Routing destination on the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Operation name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    /// Named arguments, in insertion order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,
    /// Positional values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<Value>>,
    /// Tenant the message belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    /// Origin path of the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Vec<String>>,
    /// Channel for `sub`, `unsub` and `pub`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Correlation id, echoed by the server on `rep`
    #[serde(rename = "mid", default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Outcome flag on `rep`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    /// Server timestamp
    #[serde(rename = "ts", default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Envelope {
    /// Create an empty envelope of the given type
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            target: None,
            signal: None,
            arguments: None,
            payload: None,
            tenant: None,
            source: None,
            channel: None,
            correlation_id: None,
            ok: None,
            timestamp: None,
        }
    }

    /// Create a reply envelope, mostly useful for tests and mock servers
    pub fn reply(correlation_id: impl Into<String>, ok: bool) -> Self {
        let mut env = Self::new(MessageType::Rep);
        env.correlation_id = Some(correlation_id.into());
        env.ok = Some(ok);
        env
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_signal(mut self, signal: impl Into<String>) -> Self {
        self.signal = Some(signal.into());
        self
    }

    /// Replace all arguments
    pub fn with_arguments(mut self, arguments: Map<String, Value>) -> Self {
        self.arguments = Some(arguments);
        self
    }

    /// Set one argument, overwriting an existing key in place
    pub fn with_argument(mut self, key: impl Into<String>, value: Value) -> Self {
        self.arguments
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    pub fn with_payload(mut self, payload: Vec<Value>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_source(mut self, source: Vec<String>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// True if the reply reports success
    pub fn is_ok(&self) -> bool {
        self.ok.unwrap_or(false)
    }

    /// First payload element, where servers put the primary result
    pub fn first_payload(&self) -> Option<&Value> {
        self.payload.as_ref().and_then(|p| p.first())
    }

    /// Human readable reason taken from the first payload element
    pub fn reason(&self) -> String {
        match self.first_payload() {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    /// Channel a publication was addressed to
    ///
    /// Uses `channel` when present and falls back to the first `source`
    /// element, which older servers use for the same purpose.
    pub fn publication_channel(&self) -> Option<&str> {
        self.channel.as_deref().or_else(|| {
            self.source
                .as_ref()
                .and_then(|s| s.first())
                .map(String::as_str)
        })
    }
}

/// Publication as delivered to a subscriber
///
/// Only the fields meant for subscribers are exposed; correlation id, `ok`
/// and `target` stay internal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    pub timestamp: Option<String>,
    pub source: Option<Vec<String>>,
    pub signal: Option<String>,
    pub payload: Option<Vec<Value>>,
}

impl From<&Envelope> for Publication {
    fn from(env: &Envelope) -> Self {
        Self {
            timestamp: env.timestamp.clone(),
            source: env.source.clone(),
            signal: env.signal.clone(),
            payload: env.payload.clone(),
        }
    }
}
