//! Application hooks
//!
//! Hooks are the side channel for everything that has no waiting caller:
//! frames that were sent or failed to send, inbound traffic with its
//! diagnostic, the outcome of an automatic relogin and updates to the user
//! object. They are plain synchronous callbacks invoked from the client's
//! event flow, so they must return quickly and must not block.
//!
//! # Examples
//!
//! ```rust
//! use tiip_client::{Hooks, Received};
//!
//! let hooks = Hooks::new()
//!     .on_receive(|received| {
//!         if let Received::Envelope { diagnostic: Some(d), .. } = received {
//!             eprintln!("unexpected frame: {d}");
//!         }
//!     })
//!     .on_relogin_failure(|error| eprintln!("relogin failed: {error}"));
//! ```

use std::fmt;
use std::sync::Arc;
use tiip_core::{Envelope, Error, MessageType, Publication};

/// Why an inbound envelope could not be handled normally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    /// A `rep` whose correlation id has no pending request
    NoMatchingRequest,
    /// A `rep` with `ok: false`
    RequestDenied,
    /// A `pub` no subscription matches
    NoSubscription,
    /// Any other message type
    UnknownType,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Diagnostic::NoMatchingRequest => "No request matched server reply",
            Diagnostic::RequestDenied => "Request error, or denied",
            Diagnostic::NoSubscription => "No subscription for publication from server",
            Diagnostic::UnknownType => "Unknown message type",
        })
    }
}

/// Inbound frame as reported to the receive hook
#[derive(Debug, Clone)]
pub enum Received {
    /// A protocol envelope, with a diagnostic if it was not handled normally
    Envelope {
        envelope: Envelope,
        diagnostic: Option<Diagnostic>,
        kind: MessageType,
    },
    /// Text the codec did not recognize
    Raw(String),
}

type TextFn = Arc<dyn Fn(&str) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(&Error) + Send + Sync>;
type ReceiveFn = Arc<dyn Fn(&Received) + Send + Sync>;
type EnvelopeFn = Arc<dyn Fn(&Envelope) + Send + Sync>;
type PublicationFn = Arc<dyn Fn(&Publication) + Send + Sync>;

/// Optional application callbacks
#[derive(Clone, Default)]
pub struct Hooks {
    send: Option<TextFn>,
    send_fail: Option<ErrorFn>,
    receive: Option<ReceiveFn>,
    relogin_success: Option<EnvelopeFn>,
    relogin_failure: Option<ErrorFn>,
    user_update: Option<PublicationFn>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with every frame handed to the socket
    pub fn on_send(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.send = Some(Arc::new(f));
        self
    }

    /// Called when a frame could not be sent
    pub fn on_send_fail(mut self, f: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.send_fail = Some(Arc::new(f));
        self
    }

    /// Called with every inbound frame
    pub fn on_receive(mut self, f: impl Fn(&Received) + Send + Sync + 'static) -> Self {
        self.receive = Some(Arc::new(f));
        self
    }

    /// Called with the reply of a successful automatic relogin
    pub fn on_relogin_success(mut self, f: impl Fn(&Envelope) + Send + Sync + 'static) -> Self {
        self.relogin_success = Some(Arc::new(f));
        self
    }

    /// Called when an automatic relogin fails
    pub fn on_relogin_failure(mut self, f: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.relogin_failure = Some(Arc::new(f));
        self
    }

    /// Called when the server publishes a new user object
    pub fn on_user_update(mut self, f: impl Fn(&Publication) + Send + Sync + 'static) -> Self {
        self.user_update = Some(Arc::new(f));
        self
    }

    pub(crate) fn sent(&self, text: &str) {
        if let Some(f) = &self.send {
            f(text);
        }
    }

    pub(crate) fn send_failed(&self, error: &Error) {
        if let Some(f) = &self.send_fail {
            f(error);
        }
    }

    pub(crate) fn received(&self, received: &Received) {
        if let Some(f) = &self.receive {
            f(received);
        }
    }

    pub(crate) fn relogin_succeeded(&self, reply: &Envelope) {
        if let Some(f) = &self.relogin_success {
            f(reply);
        }
    }

    pub(crate) fn relogin_failed(&self, error: &Error) {
        if let Some(f) = &self.relogin_failure {
            f(error);
        }
    }

    pub(crate) fn user_updated(&self, publication: &Publication) {
        if let Some(f) = &self.user_update {
            f(publication);
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_send", &self.send.is_some())
            .field("on_send_fail", &self.send_fail.is_some())
            .field("on_receive", &self.receive.is_some())
            .field("on_relogin_success", &self.relogin_success.is_some())
            .field("on_relogin_failure", &self.relogin_failure.is_some())
            .field("on_user_update", &self.user_update.is_some())
            .finish()
    }
}
