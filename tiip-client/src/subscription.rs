//! Publication routing
//!
//! Subscriptions are registered under the channel handle the server
//! returned on a successful `sub` reply, and remembered by the caller's
//! logical address, the `SubscriptionKey`, so they can be found again for
//! `unsub` without knowing the handle.
//!
//! # Matching
//!
//! A publication is delivered to the subscription whose handle is a prefix
//! of the publication's channel, which lets a subscription to `"#17"`
//! receive publications on `"#17:0"`. When several handles are prefixes of
//! the same channel the longest one wins.
//!
//! Subscribers receive a `Publication`, not the full envelope.
//!
//! # Examples
//!
//! ```rust,no_run
//! use tiip_client::{SubscriptionKey, TiipSocket};
//! use serde_json::Map;
//!
//! # async fn example(socket: &TiipSocket) -> tiip_core::Result<()> {
//! let key = SubscriptionKey::new("#17").with_sub_channel("0");
//! socket
//!     .subscribe(key.clone(), Map::new(), |publication| async move {
//!         println!("{:?}", publication.payload);
//!     })
//!     .await?;
//!
//! socket.unsubscribe(key, Map::new()).await?;
//! # Ok(())
//! # }
//! ```

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tiip_core::{Envelope, Publication};
use tokio::sync::Mutex;

/// Type for subscriber callbacks
pub type SubscriberFn = Arc<dyn Fn(Publication) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a `SubscriberFn`
pub fn subscriber<F, Fut>(f: F) -> SubscriberFn
where
    F: Fn(Publication) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |publication| Box::pin(f(publication)))
}

/// Caller-side address of a subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub channel: String,
    pub sub_channel: Option<String>,
    pub target: Option<String>,
    pub tenant: Option<String>,
}

impl SubscriptionKey {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            sub_channel: None,
            target: None,
            tenant: None,
        }
    }

    pub fn with_sub_channel(mut self, sub_channel: impl Into<String>) -> Self {
        self.sub_channel = Some(sub_channel.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }
}

struct Subscription {
    key: SubscriptionKey,
    handler: SubscriberFn,
}

/// Registry of active subscriptions
#[derive(Clone, Default)]
pub struct Router {
    subscriptions: Arc<Mutex<HashMap<String, Subscription>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription under its channel handle
    ///
    /// An existing subscription with the same key, or under the same
    /// handle, is replaced.
    pub async fn register(&self, handle: String, key: SubscriptionKey, handler: SubscriberFn) {
        let mut subscriptions = self.subscriptions.lock().await;
        subscriptions.retain(|existing, sub| existing == &handle || sub.key != key);

        tracing::debug!(handle = %handle, channel = %key.channel, "Subscription registered");
        subscriptions.insert(handle, Subscription { key, handler });
    }

    /// Remove the subscription registered for `key` and return its handle
    pub async fn remove(&self, key: &SubscriptionKey) -> Option<String> {
        let mut subscriptions = self.subscriptions.lock().await;
        let handle = subscriptions
            .iter()
            .find(|(_, sub)| &sub.key == key)
            .map(|(handle, _)| handle.clone())?;

        subscriptions.remove(&handle);
        tracing::debug!(handle = %handle, "Subscription removed");
        Some(handle)
    }

    /// Deliver a publication; returns false if no subscription matched
    pub async fn route(&self, envelope: &Envelope) -> bool {
        let Some(channel) = envelope.publication_channel() else {
            return false;
        };

        let handler = {
            let subscriptions = self.subscriptions.lock().await;
            subscriptions
                .iter()
                .filter(|(handle, _)| channel.starts_with(handle.as_str()))
                .max_by_key(|(handle, _)| handle.len())
                .map(|(_, sub)| Arc::clone(&sub.handler))
        };

        match handler {
            Some(handler) => {
                handler(Publication::from(envelope)).await;
                true
            }
            None => false,
        }
    }

    /// Channel handles of all active subscriptions
    pub async fn handles(&self) -> Vec<String> {
        let mut handles: Vec<String> = self.subscriptions.lock().await.keys().cloned().collect();
        handles.sort();
        handles
    }

    pub async fn len(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.subscriptions.lock().await.is_empty()
    }
}
