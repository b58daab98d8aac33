//! TIIP socket: correlated requests and publish/subscribe over one connection
//!
//! `TiipSocket` ties the layers together. It owns a `Connection`, a
//! `Correlator` and a `Router`, and installs the single message listener
//! that every inbound frame goes through:
//!
//! - text the codec rejects is forwarded raw to the receive hook
//! - `rep` resolves the matching pending request
//! - `pub` is routed to the matching subscription
//! - anything else is reported as an unknown type
//!
//! Every decoded envelope is then passed to the receive hook together with
//! the diagnostic, if any, that dispatch produced.
//!
//! # Cloning
//!
//! `TiipSocket` is cheaply cloneable; clones share the connection, pending
//! requests and subscriptions.
//!
//! # Subscriber Callbacks
//!
//! Subscriber callbacks run on the dispatch task, one at a time. Awaiting a
//! request from inside a callback stalls dispatch until that request times
//! out, because its reply is queued behind the callback. Spawn a task
//! instead.

use crate::connection::{Connection, ReadyState};
use crate::hooks::{Diagnostic, Hooks, Received};
use crate::metrics::ClientMetrics;
use crate::request::{Correlator, PendingReply};
use crate::subscription::{subscriber, Router, SubscriberFn, SubscriptionKey};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tiip_core::{Codec, Envelope, MessageType, Publication, Result};
use tokio::sync::Mutex;

/// Default `target` of `init` requests
pub const DEFAULT_INIT_TARGET: &str = "TiipController";

/// Subscription waiting for its `sub` reply
enum PendingSubscription {
    Single {
        key: SubscriptionKey,
        handler: SubscriberFn,
    },
    Batch {
        keys: Vec<SubscriptionKey>,
        handler: SubscriberFn,
    },
}

struct Inner {
    connection: Connection,
    correlator: Correlator,
    router: Router,
    codec: Arc<dyn Codec>,
    hooks: Hooks,
    init_target: String,
    metrics: Option<Arc<ClientMetrics>>,
    /// Keyed by the correlation id of the `sub` request
    pending_subscriptions: Mutex<HashMap<String, PendingSubscription>>,
}

/// Optional fields of a publication
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub sub_channel: Option<String>,
    pub signal: Option<String>,
    pub source: Option<Vec<String>>,
    pub tenant: Option<String>,
    pub extra_args: Map<String, Value>,
}

impl PublishOptions {
    pub fn with_sub_channel(mut self, sub_channel: impl Into<String>) -> Self {
        self.sub_channel = Some(sub_channel.into());
        self
    }

    pub fn with_signal(mut self, signal: impl Into<String>) -> Self {
        self.signal = Some(signal.into());
        self
    }

    pub fn with_source(mut self, source: Vec<String>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra_args.insert(key.into(), value);
        self
    }
}

/// Request/reply and publish/subscribe client
#[derive(Clone)]
pub struct TiipSocket {
    inner: Arc<Inner>,
}

impl TiipSocket {
    pub(crate) fn new(
        connection: Connection,
        correlator: Correlator,
        codec: Arc<dyn Codec>,
        hooks: Hooks,
        init_target: String,
        metrics: Option<Arc<ClientMetrics>>,
    ) -> Self {
        let inner = Arc::new(Inner {
            connection,
            correlator,
            router: Router::new(),
            codec,
            hooks,
            init_target,
            metrics,
            pending_subscriptions: Mutex::new(HashMap::new()),
        });

        let dispatcher: Weak<Inner> = Arc::downgrade(&inner);
        inner.connection.on_message(move |text| {
            let dispatcher = dispatcher.clone();
            async move {
                if let Some(inner) = dispatcher.upgrade() {
                    inner.dispatch(text).await;
                }
            }
        });

        Self { inner }
    }

    /// Open the connection; sends issued before it opens are queued
    pub async fn connect(&self) -> Result<()> {
        self.inner.connection.connect().await
    }

    /// Point the connection at a new URL and connect
    pub async fn connect_with(&self, url: impl Into<String>, protocols: Vec<String>) -> Result<()> {
        self.inner.connection.connect_with(url, protocols).await
    }

    pub async fn is_open(&self) -> bool {
        self.inner.connection.is_open().await
    }

    pub async fn ready_state(&self) -> ReadyState {
        self.inner.connection.ready_state().await
    }

    /// The underlying connection, for registering lifecycle listeners
    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    /// Number of requests awaiting a reply
    pub async fn pending_count(&self) -> usize {
        self.inner.correlator.pending_count().await
    }

    /// Channel handles of the active subscriptions
    pub async fn subscriptions(&self) -> Vec<String> {
        self.inner.router.handles().await
    }

    /// Send an envelope as a correlated request and wait for its reply
    ///
    /// Any correlation id already on the envelope is replaced. Fails with
    /// `Error::Rejected` on `ok: false` and `Error::Timeout` when no reply
    /// arrives within the configured deadline, counted from the moment the
    /// frame is handed to the socket.
    #[tracing::instrument(skip(self, envelope), fields(kind = %envelope.kind))]
    pub async fn request(&self, envelope: Envelope) -> Result<Envelope> {
        self.correlated(envelope, None).await
    }

    /// Send an envelope without correlation
    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        let text = self.inner.codec.encode(envelope)?;
        self.send_text(text).await
    }

    /// Build the `init` envelope for a user
    ///
    /// `id` and `password` override the same keys in `arguments`.
    pub fn init_envelope(
        &self,
        user_id: &str,
        password_hash: &str,
        mut arguments: Map<String, Value>,
    ) -> Envelope {
        arguments.insert("id".into(), json!(user_id));
        arguments.insert("password".into(), json!(password_hash));
        Envelope::new(MessageType::Init)
            .with_target(self.inner.init_target.clone())
            .with_arguments(arguments)
    }

    /// Authenticate with an already hashed password
    #[tracing::instrument(skip(self, password_hash, arguments))]
    pub async fn init(
        &self,
        user_id: &str,
        password_hash: &str,
        tenant: Option<&str>,
        arguments: Map<String, Value>,
    ) -> Result<Envelope> {
        let mut envelope = self.init_envelope(user_id, password_hash, arguments);
        if let Some(tenant) = tenant {
            envelope = envelope.with_tenant(tenant);
        }
        self.request(envelope).await
    }

    /// Generic `req`
    #[tracing::instrument(skip(self, arguments))]
    pub async fn req(
        &self,
        target: &str,
        signal: &str,
        arguments: Option<Map<String, Value>>,
        tenant: Option<&str>,
    ) -> Result<Envelope> {
        let mut envelope = Envelope::new(MessageType::Req)
            .with_target(target)
            .with_signal(signal);
        if let Some(arguments) = arguments {
            envelope = envelope.with_arguments(arguments);
        }
        if let Some(tenant) = tenant {
            envelope = envelope.with_tenant(tenant);
        }
        self.request(envelope).await
    }

    /// Subscribe to a channel
    ///
    /// Sends `sub` with `arguments` plus `subChannel`. On success the
    /// callback is registered under the channel handle from the reply. The
    /// reply is returned either way; one without a handle registers nothing.
    pub async fn subscribe<F, Fut>(
        &self,
        key: SubscriptionKey,
        arguments: Map<String, Value>,
        callback: F,
    ) -> Result<Envelope>
    where
        F: Fn(Publication) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe_with(key, arguments, subscriber(callback))
            .await
    }

    /// `subscribe` with an already wrapped callback
    #[tracing::instrument(skip(self, arguments, handler), fields(channel = %key.channel))]
    pub async fn subscribe_with(
        &self,
        key: SubscriptionKey,
        mut arguments: Map<String, Value>,
        handler: SubscriberFn,
    ) -> Result<Envelope> {
        if let Some(sub_channel) = &key.sub_channel {
            arguments.insert("subChannel".into(), json!(sub_channel));
        }

        let mut envelope = Envelope::new(MessageType::Sub)
            .with_channel(key.channel.clone())
            .with_arguments(arguments);
        if let Some(target) = &key.target {
            envelope = envelope.with_target(target.clone());
        }
        if let Some(tenant) = &key.tenant {
            envelope = envelope.with_tenant(tenant.clone());
        }

        self.correlated(envelope, Some(PendingSubscription::Single { key, handler }))
            .await
    }

    /// Subscribe to several resources in one `sub`
    ///
    /// Each entry is a resource id with an optional sub-channel. The reply
    /// payload lists `{channel, rid}` objects; each is registered under the
    /// key `(rid, subChannel, target, tenant)` with the shared callback.
    #[tracing::instrument(skip(self, entries, arguments, callback))]
    pub async fn subscribe_many<F, Fut>(
        &self,
        entries: &[(String, Option<String>)],
        target: Option<&str>,
        tenant: Option<&str>,
        mut arguments: Map<String, Value>,
        callback: F,
    ) -> Result<Envelope>
    where
        F: Fn(Publication) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut keys = Vec::with_capacity(entries.len());
        let mut requested = Vec::with_capacity(entries.len());
        for (rid, sub_channel) in entries {
            let mut key = SubscriptionKey::new(rid.clone());
            let mut entry = Map::new();
            entry.insert("rid".into(), json!(rid));
            if let Some(sub_channel) = sub_channel {
                entry.insert("subChannel".into(), json!(sub_channel));
                key = key.with_sub_channel(sub_channel.clone());
            }
            if let Some(target) = target {
                key = key.with_target(target);
            }
            if let Some(tenant) = tenant {
                key = key.with_tenant(tenant);
            }
            requested.push(Value::Object(entry));
            keys.push(key);
        }
        arguments.insert("subscriptions".into(), Value::Array(requested));

        let mut envelope = Envelope::new(MessageType::Sub).with_arguments(arguments);
        if let Some(target) = target {
            envelope = envelope.with_target(target);
        }
        if let Some(tenant) = tenant {
            envelope = envelope.with_tenant(tenant);
        }

        let handler = subscriber(callback);
        self.correlated(envelope, Some(PendingSubscription::Batch { keys, handler }))
            .await
    }

    /// Unsubscribe the subscription registered for `key`
    ///
    /// Returns `Ok(None)` without sending anything when no subscription
    /// matches, so repeated calls are harmless.
    #[tracing::instrument(skip(self, arguments), fields(channel = %key.channel))]
    pub async fn unsubscribe(
        &self,
        key: SubscriptionKey,
        arguments: Map<String, Value>,
    ) -> Result<Option<Envelope>> {
        let Some(handle) = self.inner.router.remove(&key).await else {
            tracing::debug!("No subscription for key, nothing to do");
            return Ok(None);
        };

        let mut envelope = Envelope::new(MessageType::Unsub).with_channel(handle);
        if !arguments.is_empty() {
            envelope = envelope.with_arguments(arguments);
        }
        self.request(envelope).await.map(Some)
    }

    /// Publish on a channel; not correlated
    ///
    /// `subChannel` overrides the same key in the extra arguments.
    #[tracing::instrument(skip(self, payload, options))]
    pub async fn publish(
        &self,
        channel: &str,
        payload: Vec<Value>,
        options: PublishOptions,
    ) -> Result<()> {
        let PublishOptions {
            sub_channel,
            signal,
            source,
            tenant,
            mut extra_args,
        } = options;
        if let Some(sub_channel) = sub_channel {
            extra_args.insert("subChannel".into(), json!(sub_channel));
        }

        let mut envelope = Envelope::new(MessageType::Pub)
            .with_channel(channel)
            .with_payload(payload);
        if !extra_args.is_empty() {
            envelope = envelope.with_arguments(extra_args);
        }
        if let Some(signal) = signal {
            envelope = envelope.with_signal(signal);
        }
        if let Some(source) = source {
            envelope = envelope.with_source(source);
        }
        if let Some(tenant) = tenant {
            envelope = envelope.with_tenant(tenant);
        }
        self.send_envelope(&envelope).await
    }

    /// Tear the socket down
    ///
    /// Cancels every request deadline and closes the connection. With
    /// `force` pending requests are dropped and their callers see
    /// `Error::ConnectionClosed`; the close also suppresses reconnection.
    /// Callers are rejected rather than left waiting on a reply that can no
    /// longer arrive. Without `force` they stay pending with no deadline.
    #[tracing::instrument(skip(self))]
    pub async fn kill(&self, force: bool) {
        self.inner.correlator.kill(force).await;
        self.inner.connection.close(force).await;
    }

    /// Register and send a correlated request without waiting for the reply
    pub(crate) async fn start_request(&self, envelope: Envelope) -> Result<PendingReply> {
        self.send_correlated(envelope, None).await
    }

    async fn correlated(
        &self,
        envelope: Envelope,
        subscription: Option<PendingSubscription>,
    ) -> Result<Envelope> {
        let start = Instant::now();
        let kind = envelope.kind;

        let result = match self.send_correlated(envelope, subscription).await {
            Ok(pending) => {
                let id = pending.id().to_string();
                let result = pending.wait().await;
                // Left behind when the reply never came
                self.inner.pending_subscriptions.lock().await.remove(&id);
                result
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            tracing::debug!(kind = %kind, error = %e, "Request failed");
        }
        if let Some(m) = &self.inner.metrics {
            let status = match &result {
                Ok(_) => "ok",
                Err(e) => e.kind(),
            };
            m.record_request(kind.as_str(), status, start.elapsed().as_secs_f64());
            if let Err(e) = &result {
                m.record_error(e.kind());
            }
        }

        result
    }

    async fn send_correlated(
        &self,
        envelope: Envelope,
        subscription: Option<PendingSubscription>,
    ) -> Result<PendingReply> {
        let pending = self.inner.correlator.register().await?;
        let id = pending.id().to_string();
        if let Some(subscription) = subscription {
            self.inner
                .pending_subscriptions
                .lock()
                .await
                .insert(id.clone(), subscription);
        }

        let envelope = envelope.with_correlation_id(id.clone());
        let sent = match self.inner.codec.encode(&envelope) {
            Ok(text) => self.send_text(text).await,
            Err(e) => Err(e),
        };

        match sent {
            Ok(()) => {
                self.inner.correlator.arm(&id).await;
                Ok(pending)
            }
            Err(e) => {
                self.inner.correlator.cancel(&id).await;
                self.inner.pending_subscriptions.lock().await.remove(&id);
                Err(e)
            }
        }
    }

    async fn send_text(&self, text: String) -> Result<()> {
        tracing::debug!(frame = %text, "Sending");
        match self.inner.connection.send(text.clone()).await {
            Ok(()) => {
                self.inner.hooks.sent(&text);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Send failed");
                self.inner.hooks.send_failed(&e);
                Err(e)
            }
        }
    }
}

impl Inner {
    async fn dispatch(&self, text: String) {
        let envelope = match self.codec.decode(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(error = %e, "Non-protocol message received");
                self.hooks.received(&Received::Raw(text));
                return;
            }
        };

        tracing::debug!(kind = %envelope.kind, "Message received");
        let kind = envelope.kind;
        let diagnostic = match kind {
            MessageType::Rep => self.complete(&envelope).await,
            MessageType::Pub => {
                let routed = self.router.route(&envelope).await;
                if let Some(m) = &self.metrics {
                    m.record_publication(routed);
                }
                if routed {
                    None
                } else {
                    tracing::warn!(
                        channel = envelope.publication_channel().unwrap_or_default(),
                        "No subscription for publication from server"
                    );
                    Some(Diagnostic::NoSubscription)
                }
            }
            other => {
                tracing::warn!(kind = %other, "Unknown message type");
                Some(Diagnostic::UnknownType)
            }
        };

        self.hooks.received(&Received::Envelope {
            envelope,
            diagnostic,
            kind,
        });
    }

    /// Resolve a reply, registering its subscription first if it answers a
    /// successful `sub`
    async fn complete(&self, reply: &Envelope) -> Option<Diagnostic> {
        let Some(completion) = self.correlator.take(reply).await else {
            return Some(Diagnostic::NoMatchingRequest);
        };

        let subscription = match reply.correlation_id.as_deref() {
            Some(id) => self.pending_subscriptions.lock().await.remove(id),
            None => None,
        };
        if let (Some(subscription), true) = (subscription, reply.is_ok()) {
            self.register_subscription(subscription, reply).await;
        }

        completion.resolve(reply)
    }

    async fn register_subscription(&self, subscription: PendingSubscription, reply: &Envelope) {
        match subscription {
            PendingSubscription::Single { key, handler } => match &reply.channel {
                Some(handle) => self.router.register(handle.clone(), key, handler).await,
                None => {
                    tracing::warn!(channel = %key.channel, "Subscribe reply carried no channel")
                }
            },
            PendingSubscription::Batch { keys, handler } => {
                for entry in reply.payload.iter().flatten() {
                    let handle = entry.get("channel").and_then(Value::as_str);
                    let rid = entry.get("rid").map(|rid| match rid {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    });
                    let (Some(handle), Some(rid)) = (handle, rid) else {
                        tracing::warn!(entry = %entry, "Malformed subscription entry");
                        continue;
                    };
                    match keys.iter().find(|key| key.channel == rid) {
                        Some(key) => {
                            self.router
                                .register(handle.to_string(), key.clone(), Arc::clone(&handler))
                                .await
                        }
                        None => tracing::warn!(rid = %rid, "Subscription entry for unknown rid"),
                    }
                }
            }
        }
    }
}
