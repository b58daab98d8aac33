//! Client builder
//!
//! `ClientBuilder` collects every option of a client before anything is
//! created: target URL and protocols, the transport and codec, reconnect
//! policy, request deadline and id space, hooks, credential storage and
//! observability. It then produces either a bare `TiipSocket` or a
//! `Session` on top of one.
//!
//! # Defaults
//!
//! | Option | Default |
//! |---|---|
//! | transport | `WsTransport` |
//! | codec | `JsonCodec` |
//! | reconnect | `ExponentialBackoff::default()`, unbounded |
//! | reconnect on non-1000 close | enabled |
//! | request timeout | 30 s |
//! | correlation id space | 10 000 |
//! | init target | `"TiipController"` |
//!
//! # Examples
//!
//! ```rust,no_run
//! use tiip_client::{ClientBuilder, Hooks, MemoryCredentialStore};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> tiip_core::Result<()> {
//! let session = ClientBuilder::new("wss://example.com/wsh")
//!     .with_timeout(Duration::from_secs(10))
//!     .with_max_reconnect_attempts(20)
//!     .with_credential_store(Arc::new(MemoryCredentialStore::new()))
//!     .with_hooks(Hooks::new().on_relogin_failure(|e| eprintln!("relogin failed: {e}")))
//!     .build_session()?;
//!
//! session.connect().await?;
//! # Ok(())
//! # }
//! ```

use crate::client::{TiipSocket, DEFAULT_INIT_TARGET};
use crate::connection::{Connection, ConnectionConfig};
use crate::hooks::Hooks;
use crate::metrics::ClientMetrics;
use crate::reconnect::{ExponentialBackoff, ReconnectionStrategy};
use crate::request::{Correlator, DEFAULT_MID_MAX, DEFAULT_TIMEOUT};
use crate::session::{Session, UserSettings};
use crate::storage::CredentialStore;
use crate::transport::{Transport, WsTransport};
use std::sync::Arc;
use std::time::Duration;
use tiip_core::{Codec, Error, JsonCodec, ObservabilityConfig, Result};

/// Builder for `TiipSocket` and `Session`
pub struct ClientBuilder {
    url: String,
    protocols: Vec<String>,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    connection: ConnectionConfig,
    timeout: Duration,
    mid_max: u32,
    init_target: String,
    store: Option<Arc<dyn CredentialStore>>,
    hooks: Hooks,
    user_settings: UserSettings,
    metrics: Option<Arc<ClientMetrics>>,
    observability_config: Option<ObservabilityConfig>,
}

impl ClientBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            protocols: Vec::new(),
            transport: Arc::new(WsTransport),
            codec: Arc::new(JsonCodec),
            connection: ConnectionConfig::default(),
            timeout: DEFAULT_TIMEOUT,
            mid_max: DEFAULT_MID_MAX,
            init_target: DEFAULT_INIT_TARGET.to_string(),
            store: None,
            hooks: Hooks::default(),
            user_settings: UserSettings::default(),
            metrics: None,
            observability_config: None,
        }
    }

    /// Sub-protocols offered when opening the socket
    pub fn with_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the socket factory
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Replace the reconnection strategy
    pub fn with_reconnect(mut self, strategy: Box<dyn ReconnectionStrategy>) -> Self {
        self.connection = self.connection.with_reconnect(strategy);
        self
    }

    /// Default backoff, giving up after `max_attempts` reconnects in a row
    pub fn with_max_reconnect_attempts(self, max_attempts: u32) -> Self {
        self.with_reconnect(Box::new(
            ExponentialBackoff::default().with_max_attempts(max_attempts),
        ))
    }

    /// Reconnect after any close other than a normal 1000 close
    pub fn reconnect_if_not_normal_close(mut self, enabled: bool) -> Self {
        self.connection = self.connection.reconnect_if_not_normal_close(enabled);
        self
    }

    /// Deadline for correlated requests
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Largest correlation id before the counter restarts at 0
    pub fn with_mid_max(mut self, mid_max: u32) -> Self {
        self.mid_max = mid_max;
        self
    }

    /// Default `target` of `init` requests
    pub fn with_init_target(mut self, target: impl Into<String>) -> Self {
        self.init_target = target.into();
        self
    }

    /// Persist the session's credentials in `store`
    pub fn with_credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_user_settings(mut self, settings: UserSettings) -> Self {
        self.user_settings = settings;
        self
    }

    /// Record client metrics on the given instruments
    pub fn with_metrics(mut self, metrics: Arc<ClientMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Initialize observability on build and record metrics under its
    /// service name
    pub fn with_observability(mut self, config: ObservabilityConfig) -> Self {
        self.observability_config = Some(config);
        self
    }

    /// Build a socket without connecting it
    pub fn build(self) -> Result<TiipSocket> {
        let (socket, _) = self.build_socket()?;
        Ok(socket)
    }

    /// Build and connect a socket
    pub async fn connect(self) -> Result<TiipSocket> {
        let socket = self.build()?;
        socket.connect().await?;
        Ok(socket)
    }

    /// Build a session without connecting it
    pub fn build_session(self) -> Result<Session> {
        let store = self.store.clone();
        let hooks = self.hooks.clone();
        let user_settings = self.user_settings.clone();

        let (socket, metrics) = self.build_socket()?;
        Ok(Session::new(socket, store, hooks, user_settings, metrics))
    }

    fn build_socket(self) -> Result<(TiipSocket, Option<Arc<ClientMetrics>>)> {
        let metrics = match self.observability_config {
            Some(config) => {
                let service_name = config.service_name.clone();
                tiip_core::init_observability(config).map_err(|e| {
                    Error::Internal(format!("Failed to initialize observability: {}", e))
                })?;
                Some(
                    self.metrics
                        .unwrap_or_else(|| Arc::new(ClientMetrics::new(service_name))),
                )
            }
            None => self.metrics,
        };

        let mut connection_config = self.connection;
        if let Some(m) = &metrics {
            connection_config = connection_config.with_metrics(Arc::clone(m));
        }

        let connection = Connection::new(
            self.url,
            self.protocols,
            connection_config,
            self.transport,
        )?;
        let correlator = Correlator::new(self.timeout, self.mid_max);

        let socket = TiipSocket::new(
            connection,
            correlator,
            self.codec,
            self.hooks,
            self.init_target,
            metrics.clone(),
        );
        Ok((socket, metrics))
    }
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("url", &self.url)
            .field("protocols", &self.protocols)
            .field("connection", &self.connection)
            .field("timeout", &self.timeout)
            .field("mid_max", &self.mid_max)
            .field("init_target", &self.init_target)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}
