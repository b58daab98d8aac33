//! Authentication session
//!
//! A `Session` wraps a `TiipSocket` and owns the login state:
//!
//! ```text
//! Anonymous ──authenticate/bootstrap──► Authenticating ──ok──► Authenticated
//!     ▲                                       │                    │
//!     └──────────── rejected ─────────────────┘                    │
//!     └──────────── logout / failed relogin ───────────────────────┘
//! ```
//!
//! After a successful login the credentials are cached as an `AuthContext`
//! holding the SHA-256 hex digest of the password, never the password
//! itself. When the connection reopens after having been closed, the
//! session replays the login from that context and reports the outcome
//! through the relogin hooks.
//!
//! With a credential store configured the context is persisted under
//! `AUTH_STORAGE_KEY`, and `bootstrap` can log in again after a restart.
//!
//! # Examples
//!
//! ```rust,no_run
//! use tiip_client::{ClientBuilder, LoginOptions};
//!
//! # async fn example() -> tiip_core::Result<()> {
//! let session = ClientBuilder::new("wss://example.com/wsh").build_session()?;
//! session.connect().await?;
//!
//! session
//!     .authenticate("alice", "secret", LoginOptions::default().with_tenant("acme"))
//!     .await?;
//! println!("rid: {:?}", session.auth_context().and_then(|a| a.rid));
//! # Ok(())
//! # }
//! ```

use crate::client::TiipSocket;
use crate::connection::CloseEvent;
use crate::hooks::Hooks;
use crate::metrics::ClientMetrics;
use crate::storage::{CredentialStore, AUTH_STORAGE_KEY};
use crate::subscription::SubscriptionKey;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tiip_core::{Envelope, Error, Publication, Result};

/// Authentication state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    Authenticating,
    Authenticated,
}

/// Cached login material
///
/// Serialized in camelCase; this is the record kept in the credential
/// store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthContext {
    pub user_id: String,
    /// SHA-256 hex digest of the password
    pub password_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Vec<String>>,
    #[serde(default)]
    pub extra_args: Map<String, Value>,
    /// Resource id the server assigned to the user
    #[serde(default)]
    pub rid: Option<String>,
}

impl AuthContext {
    fn init_envelope(&self, socket: &TiipSocket) -> Envelope {
        let mut envelope =
            socket.init_envelope(&self.user_id, &self.password_hash, self.extra_args.clone());
        if let Some(target) = &self.target {
            envelope = envelope.with_target(target.clone());
        }
        if let Some(signal) = &self.signal {
            envelope = envelope.with_signal(signal.clone());
        }
        if let Some(tenant) = &self.tenant {
            envelope = envelope.with_tenant(tenant.clone());
        }
        if let Some(source) = &self.source {
            envelope = envelope.with_source(source.clone());
        }
        envelope
    }
}

/// Optional fields of a login
#[derive(Debug, Clone, Default)]
pub struct LoginOptions {
    pub tenant: Option<String>,
    /// Overrides the builder's init target
    pub target: Option<String>,
    pub signal: Option<String>,
    pub source: Option<Vec<String>>,
    pub extra_args: Map<String, Value>,
}

impl LoginOptions {
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
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

    pub fn with_arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra_args.insert(key.into(), value);
        self
    }
}

/// Where the user object is read from and updated on
#[derive(Debug, Clone)]
pub struct UserSettings {
    /// `target` of the read request
    pub conf_api: String,
    pub read_user_signal: String,
    /// Channel the server publishes user updates on
    pub conf_update_signal: String,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            conf_api: "xiconf".to_string(),
            read_user_signal: "readUsers".to_string(),
            conf_update_signal: "confUpdate".to_string(),
        }
    }
}

/// SHA-256 hex digest of a password
pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Resource id from the first payload element of an `init` reply
fn rid_from(reply: &Envelope) -> Option<String> {
    match reply.first_payload()? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

struct Data {
    state: SessionState,
    auth: Option<AuthContext>,
    has_been_connected: bool,
    user: Option<Value>,
}

struct Inner {
    socket: TiipSocket,
    store: Option<Arc<dyn CredentialStore>>,
    hooks: Hooks,
    user_settings: UserSettings,
    metrics: Option<Arc<ClientMetrics>>,
    data: Mutex<Data>,
}

/// Authenticated client session with automatic relogin
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    pub(crate) fn new(
        socket: TiipSocket,
        store: Option<Arc<dyn CredentialStore>>,
        hooks: Hooks,
        user_settings: UserSettings,
        metrics: Option<Arc<ClientMetrics>>,
    ) -> Self {
        let inner = Arc::new(Inner {
            socket,
            store,
            hooks,
            user_settings,
            metrics,
            data: Mutex::new(Data {
                state: SessionState::Anonymous,
                auth: None,
                has_been_connected: false,
                user: None,
            }),
        });

        let on_close = Arc::downgrade(&inner);
        let on_open = Arc::downgrade(&inner);
        inner
            .socket
            .connection()
            .on_close(move |_: CloseEvent| {
                let session = on_close.clone();
                async move {
                    if let Some(inner) = session.upgrade() {
                        inner.data().has_been_connected = true;
                    }
                }
            })
            .on_open(move || {
                let session = on_open.clone();
                async move {
                    if let Some(inner) = session.upgrade() {
                        Inner::relogin(inner).await;
                    }
                }
            });

        Self { inner }
    }

    /// The socket this session drives
    pub fn socket(&self) -> &TiipSocket {
        &self.inner.socket
    }

    pub async fn connect(&self) -> Result<()> {
        self.inner.socket.connect().await
    }

    /// True when the connection is open and the session authenticated
    pub async fn is_open(&self) -> bool {
        self.state() == SessionState::Authenticated && self.inner.socket.is_open().await
    }

    pub fn state(&self) -> SessionState {
        self.inner.data().state
    }

    pub fn auth_context(&self) -> Option<AuthContext> {
        self.inner.data().auth.clone()
    }

    /// Last user object read by `load_user` or pushed by the server
    pub fn user(&self) -> Option<Value> {
        self.inner.data().user.clone()
    }

    /// Log in with a plain password
    ///
    /// Only the digest of `password` is sent and cached.
    #[tracing::instrument(skip(self, password, options))]
    pub async fn authenticate(
        &self,
        user_id: &str,
        password: &str,
        options: LoginOptions,
    ) -> Result<Envelope> {
        let context = AuthContext {
            user_id: user_id.to_string(),
            password_hash: hash_password(password),
            tenant: options.tenant,
            target: options.target,
            signal: options.signal,
            source: options.source,
            extra_args: options.extra_args,
            rid: None,
        };
        self.login(context).await
    }

    /// Log in again from the persisted context
    ///
    /// Fails with `Error::NoCachedCredentials` when nothing is stored.
    #[tracing::instrument(skip(self))]
    pub async fn bootstrap(&self) -> Result<Envelope> {
        let store = self
            .inner
            .store
            .as_ref()
            .ok_or(Error::NoCachedCredentials)?;
        let record = store
            .get(AUTH_STORAGE_KEY)?
            .ok_or(Error::NoCachedCredentials)?;
        let context: AuthContext = serde_json::from_str(&record)?;

        tracing::info!(user_id = %context.user_id, "Restoring persisted session");
        self.login(context).await
    }

    /// Forget the credentials and force-close the socket
    #[tracing::instrument(skip(self))]
    pub async fn logout(&self) -> Result<()> {
        {
            let mut data = self.inner.data();
            data.auth = None;
            data.user = None;
            data.state = SessionState::Anonymous;
        }

        let removed = match &self.inner.store {
            Some(store) => store.remove(AUTH_STORAGE_KEY),
            None => Ok(()),
        };
        self.inner.socket.kill(true).await;

        tracing::info!("Logged out");
        removed
    }

    /// Read the user object and follow its updates
    ///
    /// Requires a login whose reply carried a resource id.
    #[tracing::instrument(skip(self))]
    pub async fn load_user(&self) -> Result<Envelope> {
        let rid = self
            .auth_context()
            .and_then(|auth| auth.rid)
            .ok_or_else(|| Error::NotAuthenticated("No rid for user object".into()))?;
        let settings = &self.inner.user_settings;

        let mut arguments = Map::new();
        arguments.insert("rids".into(), json!([rid]));
        let reply = self
            .inner
            .socket
            .req(
                &settings.conf_api,
                &settings.read_user_signal,
                Some(arguments),
                None,
            )
            .await?;
        self.inner.data().user = reply.first_payload().cloned();

        let session = Arc::downgrade(&self.inner);
        let key = SubscriptionKey::new(settings.conf_update_signal.clone()).with_sub_channel(rid);
        self.inner
            .socket
            .subscribe(key, Map::new(), move |publication| {
                let session = session.clone();
                async move {
                    if let Some(inner) = session.upgrade() {
                        inner.user_updated(publication);
                    }
                }
            })
            .await?;

        Ok(reply)
    }

    async fn login(&self, mut context: AuthContext) -> Result<Envelope> {
        self.inner.data().state = SessionState::Authenticating;

        let envelope = context.init_envelope(&self.inner.socket);
        let reply = match self.inner.socket.request(envelope).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(user_id = %context.user_id, error = %e, "Login failed");
                self.inner.data().state = SessionState::Anonymous;
                return Err(e);
            }
        };

        context.rid = rid_from(&reply);
        {
            let mut data = self.inner.data();
            data.auth = Some(context.clone());
            data.state = SessionState::Authenticated;
        }
        tracing::info!(user_id = %context.user_id, rid = ?context.rid, "Logged in");

        self.inner.persist(&context);
        Ok(reply)
    }
}

impl Inner {
    fn data(&self) -> MutexGuard<'_, Data> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist a context; storage failures are logged, not fatal
    fn persist(&self, context: &AuthContext) {
        let Some(store) = &self.store else {
            return;
        };
        let stored = serde_json::to_string(context)
            .map_err(Error::from)
            .and_then(|record| store.set(AUTH_STORAGE_KEY, &record));
        if let Err(e) = stored {
            tracing::warn!(error = %e, "Failed to persist credentials");
        }
    }

    /// Replay the cached login after a reconnect
    async fn relogin(inner: Arc<Inner>) {
        let context = {
            let mut data = inner.data();
            if !data.has_been_connected {
                return;
            }
            let Some(context) = data.auth.clone() else {
                return;
            };
            data.state = SessionState::Authenticating;
            context
        };

        tracing::info!(user_id = %context.user_id, "Reconnected, logging in again");
        let envelope = context.init_envelope(&inner.socket);

        // Only the send happens here; the reply is read by this same task
        let started = inner.socket.start_request(envelope).await;
        match started {
            Ok(pending) => {
                tokio::spawn(async move {
                    let result = pending.wait().await;
                    inner.finish_relogin(result);
                });
            }
            Err(e) => inner.finish_relogin(Err(e)),
        }
    }

    fn finish_relogin(&self, result: Result<Envelope>) {
        let outcome = {
            let mut data = self.data();
            if data.auth.is_none() {
                // Logged out meanwhile
                return;
            }
            match &result {
                Ok(reply) => {
                    if let (Some(auth), Some(rid)) = (data.auth.as_mut(), rid_from(reply)) {
                        auth.rid = Some(rid);
                    }
                    data.state = SessionState::Authenticated;
                    data.auth.clone()
                }
                Err(_) => {
                    data.state = SessionState::Anonymous;
                    None
                }
            }
        };

        if let Some(m) = &self.metrics {
            m.record_relogin(result.is_ok());
        }

        match result {
            Ok(reply) => {
                tracing::info!("Re-login attempt was successful");
                if let Some(context) = outcome {
                    self.persist(&context);
                }
                self.hooks.relogin_succeeded(&reply);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Re-login attempt failed");
                self.hooks.relogin_failed(&e);
            }
        }
    }

    fn user_updated(&self, publication: Publication) {
        let user = match publication.payload.as_ref().and_then(|p| p.first()) {
            Some(user @ Value::Object(_)) => user.clone(),
            _ => return,
        };
        self.data().user = Some(user);
        self.hooks.user_updated(&publication);
    }
}
