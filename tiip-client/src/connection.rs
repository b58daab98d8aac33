//! Connection lifecycle and reconnection
//!
//! A `Connection` masks any number of physical sockets behind one stable
//! handle. It owns the current socket, the outbound queue used while the
//! socket is not open, and the backoff timer that brings it back after an
//! unexpected close.
//!
//! # Ready States
//!
//! ```text
//!            connect()
//! Closed ─────────────► Connecting ──► Open
//!   ▲                        ▲          │
//!   │      backoff timer     │          │ close event
//!   └────────────────────────┴──────────┤
//!                                       ▼
//!                              ReconnectAborted
//! ```
//!
//! # Reconnect Policy
//!
//! When the socket closes without `close()` having been called:
//!
//! - close code 4000 always reconnects
//! - any other code except 1000 reconnects when
//!   `reconnect_if_not_normal_close` is enabled
//! - otherwise a 1000 close settles in `Closed`, anything else in
//!   `ReconnectAborted`
//!
//! The delay comes from the configured `ReconnectionStrategy`. A strategy
//! that gives up also moves the connection to `ReconnectAborted`, after
//! which every `send` fails immediately with `Error::ConnectionClosed`.
//!
//! # Events
//!
//! Listeners for open, close, error and message events run one at a time,
//! in registration order, on the task that reads the socket. A listener
//! that awaits a reply to one of its own requests would block that task;
//! spawn instead.
//!
//! Frames leave in call order. A frame sent from an open listener, or by
//! anyone while the open listeners run, goes out after the frames queued
//! before the socket opened.

use crate::metrics::ClientMetrics;
use crate::reconnect::{ExponentialBackoff, ReconnectionStrategy};
use crate::transport::{
    validate_url, SocketEvent, SocketSink, Transport, CLOSE_ABNORMAL, CLOSE_NORMAL,
    CLOSE_RECONNECT,
};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tiip_core::{Error, Result};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

/// Ready state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// A socket is being opened
    Connecting,
    /// The socket is open
    Open,
    /// `close()` is in progress
    Closing,
    /// No socket; a reconnect may be scheduled
    Closed,
    /// Closed for good; sends fail fast
    ReconnectAborted,
}

impl ReadyState {
    /// Numeric code used by the connection state gauge
    pub fn as_code(&self) -> i64 {
        match self {
            ReadyState::Closed => 0,
            ReadyState::Connecting => 1,
            ReadyState::Open => 2,
            ReadyState::Closing => 3,
            ReadyState::ReconnectAborted => 4,
        }
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReadyState::Connecting => "CONNECTING",
            ReadyState::Open => "OPEN",
            ReadyState::Closing => "CLOSING",
            ReadyState::Closed => "CLOSED",
            ReadyState::ReconnectAborted => "RECONNECT_ABORTED",
        })
    }
}

/// Details of a close, passed to close listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub code: u16,
    pub reason: String,
    /// True when the close came from `close(true)`
    pub manual: bool,
}

/// Connection options
pub struct ConnectionConfig {
    reconnect_if_not_normal_close: bool,
    strategy: Box<dyn ReconnectionStrategy>,
    metrics: Option<Arc<ClientMetrics>>,
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconnect after any close other than a normal 1000 close
    pub fn reconnect_if_not_normal_close(mut self, enabled: bool) -> Self {
        self.reconnect_if_not_normal_close = enabled;
        self
    }

    /// Replace the reconnection strategy
    pub fn with_reconnect(mut self, strategy: Box<dyn ReconnectionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ClientMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_if_not_normal_close: true,
            strategy: Box::new(ExponentialBackoff::default()),
            metrics: None,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field(
                "reconnect_if_not_normal_close",
                &self.reconnect_if_not_normal_close,
            )
            .field("metrics", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}

type OpenFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;
type EventFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct Listeners {
    open: Vec<OpenFn>,
    close: Vec<EventFn<CloseEvent>>,
    error: Vec<EventFn<String>>,
    message: Vec<EventFn<String>>,
}

struct QueuedSend {
    text: String,
    done: oneshot::Sender<Result<()>>,
}

struct State {
    url: String,
    protocols: Vec<String>,
    ready_state: ReadyState,
    sink: Option<SocketSink>,
    /// Dropping this stops the reader of the current socket
    shutdown: Option<oneshot::Sender<()>>,
    queue: VecDeque<QueuedSend>,
    attempts: u32,
    strategy: Box<dyn ReconnectionStrategy>,
    /// Bumped for every socket attempt and every `close()`; events carrying
    /// an older generation are ignored
    generation: u64,
    reconnect_timer: Option<JoinHandle<()>>,
}

impl State {
    /// Hand queued frames to the socket in FIFO order
    async fn fire_queue(&mut self) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        while let Some(queued) = self.queue.pop_front() {
            let result = sink.send(queued.text).await;
            let _ = queued.done.send(result);
        }
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    reconnect_if_not_normal_close: bool,
    metrics: Option<Arc<ClientMetrics>>,
    state: Mutex<State>,
    listeners: StdMutex<Listeners>,
}

/// One logical duplex connection
///
/// Cheap to clone; all clones share the same socket and state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create a connection without opening it
    ///
    /// Fails with `Error::InvalidUrl` unless `url` is `ws://` or `wss://`.
    pub fn new(
        url: impl Into<String>,
        protocols: Vec<String>,
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let url = url.into();
        validate_url(&url)?;

        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                reconnect_if_not_normal_close: config.reconnect_if_not_normal_close,
                metrics: config.metrics,
                state: Mutex::new(State {
                    url,
                    protocols,
                    ready_state: ReadyState::Closed,
                    sink: None,
                    shutdown: None,
                    queue: VecDeque::new(),
                    attempts: 0,
                    strategy: config.strategy,
                    generation: 0,
                    reconnect_timer: None,
                }),
                listeners: StdMutex::new(Listeners::default()),
            }),
        })
    }

    /// Open a socket unless one is already open or opening
    ///
    /// Returns as soon as the attempt is started. Sends issued before the
    /// socket opens are queued and flushed once it does.
    #[tracing::instrument(skip(self))]
    pub async fn connect(&self) -> Result<()> {
        let generation = {
            let mut state = self.inner.state.lock().await;
            if matches!(
                state.ready_state,
                ReadyState::Open | ReadyState::Connecting
            ) {
                tracing::debug!(state = %state.ready_state, "Connect ignored");
                return Ok(());
            }
            if let Some(timer) = state.reconnect_timer.take() {
                timer.abort();
            }
            state.generation += 1;
            self.inner.set_ready_state(&mut state, ReadyState::Connecting);
            tracing::info!(url = %state.url, "Connecting");
            state.generation
        };

        tokio::spawn(Arc::clone(&self.inner).run_socket(generation));
        Ok(())
    }

    /// Point the connection at a new URL and connect
    ///
    /// An already open socket is kept; the new target is used from the next
    /// socket on.
    pub async fn connect_with(&self, url: impl Into<String>, protocols: Vec<String>) -> Result<()> {
        let url = url.into();
        validate_url(&url)?;
        {
            let mut state = self.inner.state.lock().await;
            state.url = url;
            state.protocols = protocols;
        }
        self.connect().await
    }

    /// Send a text frame
    ///
    /// Resolves once the frame is handed to the socket. While the socket is
    /// not open the frame waits in a FIFO queue and the call resolves when
    /// the queue is flushed after the next open.
    pub async fn send(&self, text: String) -> Result<()> {
        let done = {
            let mut state = self.inner.state.lock().await;
            if state.ready_state == ReadyState::ReconnectAborted {
                return Err(Error::ConnectionClosed);
            }

            // Every frame goes through the queue so that one sent while the
            // open listeners run still lands behind the earlier backlog
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(QueuedSend { text, done: tx });
            if state.ready_state == ReadyState::Open {
                state.fire_queue().await;
            } else {
                tracing::debug!(queued = state.queue.len(), "Socket not open, message queued");
            }
            rx
        };

        done.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Close the socket and cancel any scheduled reconnect
    ///
    /// A closed connection stays closed until `connect()` is called again.
    #[tracing::instrument(skip(self))]
    pub async fn close(&self, manual: bool) {
        let (sink, was_open) = {
            let mut state = self.inner.state.lock().await;
            if let Some(timer) = state.reconnect_timer.take() {
                timer.abort();
            }
            state.generation += 1;
            state.shutdown = None;
            let was_open = state.ready_state == ReadyState::Open;
            self.inner.set_ready_state(&mut state, ReadyState::Closing);
            (state.sink.take(), was_open)
        };

        if let Some(mut sink) = sink {
            if let Err(e) = sink.close().await {
                tracing::debug!(error = %e, "Error while closing socket");
            }
        }

        {
            let mut state = self.inner.state.lock().await;
            if state.ready_state == ReadyState::Closing {
                self.inner.set_ready_state(&mut state, ReadyState::Closed);
            }
        }

        tracing::info!(manual, "Connection closed by client");
        if was_open {
            self.inner
                .emit_close(CloseEvent {
                    code: CLOSE_NORMAL,
                    reason: String::new(),
                    manual,
                })
                .await;
        }
    }

    pub async fn is_open(&self) -> bool {
        self.ready_state().await == ReadyState::Open
    }

    pub async fn ready_state(&self) -> ReadyState {
        self.inner.state.lock().await.ready_state
    }

    pub async fn url(&self) -> String {
        self.inner.state.lock().await.url.clone()
    }

    /// Number of frames waiting for the socket to open
    pub async fn queued_count(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    pub fn on_open<F, Fut>(&self, f: F) -> &Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener: OpenFn = Arc::new(move || Box::pin(f()));
        self.inner.listeners().open.push(listener);
        self
    }

    pub fn on_close<F, Fut>(&self, f: F) -> &Self
    where
        F: Fn(CloseEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener: EventFn<CloseEvent> = Arc::new(move |event| Box::pin(f(event)));
        self.inner.listeners().close.push(listener);
        self
    }

    /// Transport errors; they do not close the connection by themselves
    pub fn on_error<F, Fut>(&self, f: F) -> &Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener: EventFn<String> = Arc::new(move |error| Box::pin(f(error)));
        self.inner.listeners().error.push(listener);
        self
    }

    pub fn on_message<F, Fut>(&self, f: F) -> &Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener: EventFn<String> = Arc::new(move |text| Box::pin(f(text)));
        self.inner.listeners().message.push(listener);
        self
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Inner {
    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_ready_state(&self, state: &mut State, ready_state: ReadyState) {
        state.ready_state = ready_state;
        if let Some(m) = &self.metrics {
            m.update_connection_state(ready_state.as_code());
        }
    }

    /// Open one socket and read it until it closes
    fn run_socket(self: Arc<Self>, generation: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let (url, protocols) = {
                let state = self.state.lock().await;
                if state.generation != generation {
                    return;
                }
                (state.url.clone(), state.protocols.clone())
            };

            let (sink, mut stream) = match self.transport.connect(&url, &protocols).await {
                Ok(socket) => socket,
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "Failed to open socket");
                    if let Some(m) = &self.metrics {
                        m.record_error(e.kind());
                    }
                    self.emit_error(e.to_string()).await;
                    self.handle_close(generation, CLOSE_ABNORMAL, e.to_string())
                        .await;
                    return;
                }
            };

            let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
            let reconnected = {
                let mut state = self.state.lock().await;
                if state.generation != generation {
                    drop(state);
                    let mut sink = sink;
                    let _ = sink.close().await;
                    return;
                }
                state.sink = Some(sink);
                state.shutdown = Some(shutdown_tx);
                let reconnected = state.attempts > 0;
                state.attempts = 0;
                state.strategy.reset();
                self.set_ready_state(&mut state, ReadyState::Open);
                reconnected
            };

            tracing::info!(url = %url, reconnected, "Connection open");
            if reconnected {
                if let Some(m) = &self.metrics {
                    m.record_reconnection_success();
                }
            }

            self.emit_open().await;
            self.flush_queue(generation).await;

            loop {
                let event = tokio::select! {
                    _ = &mut shutdown_rx => return,
                    event = stream.next() => event,
                };

                match event {
                    Some(SocketEvent::Message(text)) => self.emit_message(text).await,
                    Some(SocketEvent::Error(error)) => {
                        tracing::warn!(error = %error, "Socket error");
                        self.emit_error(error).await;
                    }
                    Some(SocketEvent::Closed { code, reason }) => {
                        self.handle_close(generation, code, reason).await;
                        return;
                    }
                    None => {
                        self.handle_close(generation, CLOSE_ABNORMAL, String::new())
                            .await;
                        return;
                    }
                }
            }
        })
    }

    async fn flush_queue(&self, generation: u64) {
        let mut state = self.state.lock().await;
        if state.generation != generation || state.queue.is_empty() {
            return;
        }

        tracing::debug!(count = state.queue.len(), "Flushing queued messages");
        state.fire_queue().await;
    }

    async fn handle_close(self: &Arc<Self>, generation: u64, code: u16, reason: String) {
        {
            let mut state = self.state.lock().await;
            if state.generation != generation {
                return;
            }
            state.sink = None;
            state.shutdown = None;
            self.set_ready_state(&mut state, ReadyState::Closed);
        }

        tracing::info!(code, reason = %reason, "Socket closed");
        self.emit_close(CloseEvent {
            code,
            reason,
            manual: false,
        })
        .await;

        let reconnect = (self.reconnect_if_not_normal_close && code != CLOSE_NORMAL)
            || code == CLOSE_RECONNECT;

        let mut state = self.state.lock().await;
        // A close listener may already have reconnected or closed
        if state.generation != generation {
            return;
        }

        if !reconnect {
            if code != CLOSE_NORMAL {
                tracing::error!(code, "Abnormal close, not reconnecting");
                self.abort(&mut state);
            }
            return;
        }

        state.attempts += 1;
        let attempt = state.attempts;
        match state.strategy.next_delay(attempt) {
            Some(delay) => {
                tracing::info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnect"
                );
                if let Some(m) = &self.metrics {
                    m.record_reconnection_attempt();
                }

                state.generation += 1;
                let next = state.generation;
                let inner = Arc::clone(self);
                state.reconnect_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    {
                        let mut state = inner.state.lock().await;
                        if state.generation != next {
                            return;
                        }
                        state.reconnect_timer = None;
                        inner.set_ready_state(&mut state, ReadyState::Connecting);
                    }
                    inner.run_socket(next).await;
                }));
            }
            None => {
                tracing::error!(attempt, "Reconnection attempts exhausted");
                self.abort(&mut state);
            }
        }
    }

    fn abort(&self, state: &mut State) {
        self.set_ready_state(state, ReadyState::ReconnectAborted);
        for queued in state.queue.drain(..) {
            let _ = queued.done.send(Err(Error::ConnectionClosed));
        }
    }

    async fn emit_open(&self) {
        let listeners = self.listeners().open.clone();
        for listener in listeners {
            listener().await;
        }
    }

    async fn emit_close(&self, event: CloseEvent) {
        let listeners = self.listeners().close.clone();
        for listener in listeners {
            listener(event.clone()).await;
        }
    }

    async fn emit_error(&self, error: String) {
        let listeners = self.listeners().error.clone();
        for listener in listeners {
            listener(error.clone()).await;
        }
    }

    async fn emit_message(&self, text: String) {
        let listeners = self.listeners().message.clone();
        for listener in listeners {
            listener(text.clone()).await;
        }
    }
}
