//! Error types for tiip
//!
//! A single `Error` enum covers every failure a caller can observe, from a
//! malformed URL at construction time to a request the server denied.
//!
//! # Error Categories
//!
//! - **Connection errors**: InvalidUrl, WebSocket, ConnectionClosed
//! - **Protocol errors**: NotProtocol, Serialization
//! - **Correlation errors**: Timeout, Rejected, IdSpaceExhausted
//! - **Authentication errors**: NoCachedCredentials, NotAuthenticated, Storage
//!
//! Conditions that have no waiting caller (an unmatched reply, a publication
//! nobody subscribed to) are not errors; they are reported to the
//! application's receive hook as diagnostics.
//!
//! # Examples
//!
//! ```rust
//! use tiip_core::Error;
//!
//! let error = Error::Rejected("Wrong password".into());
//! assert!(error.is_rejected());
//! assert_eq!(error.to_string(), "Request error, or denied. Wrong password");
//! ```

use thiserror::Error;

/// Result type for tiip operations
pub type Result<T> = std::result::Result<T, Error>;

/// Application-level error type for tiip operations
///
/// The enum is `Clone` so one failure can be delivered to several waiters,
/// for example every queued send when the connection is aborted.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The URL does not use the `ws://` or `wss://` scheme
    #[error("Invalid url provided: {0}")]
    InvalidUrl(String),

    /// WebSocket transport layer error
    ///
    /// Raised when the physical socket cannot be opened or a frame cannot be
    /// written to it.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Connection was closed for good
    ///
    /// Returned by `send` once reconnection has been aborted, and to requests
    /// that were still pending when the client was killed.
    #[error("Socket connection has been closed")]
    ConnectionClosed,

    /// Inbound text is not a protocol envelope
    ///
    /// Decode failures are not fatal; the raw text is forwarded to the
    /// receive hook instead.
    #[error("Not a protocol message: {0}")]
    NotProtocol(String),

    /// Serialization or deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A correlated request received no reply before its deadline
    #[error("Timeout")]
    Timeout,

    /// The server replied with `ok: false`
    ///
    /// Holds the first payload element of the reply, which is where the
    /// server puts its reason.
    #[error("Request error, or denied. {0}")]
    Rejected(String),

    /// Every correlation id is currently awaiting a reply
    #[error("No free correlation id (limit={0})")]
    IdSpaceExhausted(u32),

    /// No persisted credentials were found
    ///
    /// Expected on first run; the application should ask for a login.
    #[error("No cached credentials")]
    NoCachedCredentials,

    /// The session has no authenticated user
    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),

    /// The credential store failed to read, write or remove a record
    #[error("Credential storage error: {0}")]
    Storage(String),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for request timeouts
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    /// True when the server denied the request
    pub fn is_rejected(&self) -> bool {
        matches!(self, Error::Rejected(_))
    }

    /// Short, stable label used for metrics attributes
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidUrl(_) => "invalid_url",
            Error::WebSocket(_) => "websocket",
            Error::ConnectionClosed => "connection_closed",
            Error::NotProtocol(_) => "not_protocol",
            Error::Serialization(_) => "serialization",
            Error::Timeout => "timeout",
            Error::Rejected(_) => "rejected",
            Error::IdSpaceExhausted(_) => "id_space_exhausted",
            Error::NoCachedCredentials => "no_cached_credentials",
            Error::NotAuthenticated(_) => "not_authenticated",
            Error::Storage(_) => "storage",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_from_serde() {
        let serde_error =
            serde_json::from_str::<serde_json::Value>(r#"{"invalid": json"#).unwrap_err();
        let error: Error = serde_error.into();

        match error {
            Error::Serialization(msg) => assert!(!msg.is_empty()),
            _ => panic!("Expected Serialization error"),
        }
    }

    #[test]
    fn test_rejected_display() {
        let error = Error::Rejected("Unknown user".to_string());
        assert_eq!(error.to_string(), "Request error, or denied. Unknown user");
        assert!(error.is_rejected());
        assert!(!error.is_timeout());
    }

    #[test]
    fn test_timeout_error() {
        let error = Error::Timeout;
        assert!(error.is_timeout());
        assert_eq!(error.to_string(), "Timeout");
    }

    #[test]
    fn test_connection_closed_display() {
        assert_eq!(
            Error::ConnectionClosed.to_string(),
            "Socket connection has been closed"
        );
    }

    #[test]
    fn test_kinds_are_distinct() {
        let errors = vec![
            Error::InvalidUrl("x".into()),
            Error::WebSocket("x".into()),
            Error::ConnectionClosed,
            Error::NotProtocol("x".into()),
            Error::Serialization("x".into()),
            Error::Timeout,
            Error::Rejected("x".into()),
            Error::IdSpaceExhausted(1),
            Error::NoCachedCredentials,
            Error::NotAuthenticated("x".into()),
            Error::Storage("x".into()),
            Error::Internal("x".into()),
        ];
        let mut kinds: Vec<&str> = errors.iter().map(Error::kind).collect();
        kinds.sort();
        kinds.dedup();
        assert_eq!(kinds.len(), errors.len());
    }
}
