//! Request correlation
//!
//! Every `init`, `req`, `sub` and `unsub` carries a correlation id (`mid`)
//! that the server echoes on its `rep`. The `Correlator` hands out those
//! ids and keeps one `PendingRequest` per id until the reply arrives or the
//! deadline passes.
//!
//! # Request Lifecycle
//!
//! 1. **Register**: allocate an id and a oneshot channel for the reply
//! 2. **Send**: the caller sends the envelope through the connection
//! 3. **Arm**: once the frame is handed to the socket the deadline starts
//! 4. **Complete**: the matching `rep` resolves the channel, or the deadline
//!    fires and resolves it with `Error::Timeout`
//!
//! Whichever of reply and deadline comes first removes the entry; the other
//! finds nothing and does nothing.
//!
//! # Correlation Ids
//!
//! Ids are decimal strings from a bounded space. The counter yields
//! `1..=max` and then restarts at `0`; ids that are still pending are
//! skipped.

use crate::hooks::Diagnostic;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tiip_core::{Envelope, Error, Result};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

/// Default request deadline
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default size of the correlation id space
pub const DEFAULT_MID_MAX: u32 = 10_000;

/// One in-flight request awaiting its reply
struct PendingRequest {
    tx: oneshot::Sender<Result<Envelope>>,
    created: Instant,
    deadline: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Table {
    pending: HashMap<String, PendingRequest>,
    counter: u32,
}

struct Inner {
    table: Mutex<Table>,
    mid_max: u32,
    timeout: Duration,
}

/// Receiver side of a registered request
pub struct PendingReply {
    id: String,
    rx: oneshot::Receiver<Result<Envelope>>,
}

impl PendingReply {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the reply, the deadline or teardown
    pub async fn wait(self) -> Result<Envelope> {
        self.rx.await.map_err(|_| Error::ConnectionClosed)?
    }
}

/// A matched request, removed from the table but not yet resolved
pub struct Completion {
    id: String,
    pending: PendingRequest,
}

impl Completion {
    /// Hand the reply to the waiting caller
    pub fn resolve(self, reply: &Envelope) -> Option<Diagnostic> {
        tracing::debug!(
            mid = %self.id,
            elapsed_ms = self.pending.created.elapsed().as_millis() as u64,
            ok = reply.is_ok(),
            "Reply matched"
        );

        if reply.is_ok() {
            let _ = self.pending.tx.send(Ok(reply.clone()));
            None
        } else {
            let _ = self.pending.tx.send(Err(Error::Rejected(reply.reason())));
            Some(Diagnostic::RequestDenied)
        }
    }
}

/// Tracks pending requests and matches replies to them
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<Inner>,
}

impl Correlator {
    pub fn new(timeout: Duration, mid_max: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(Table::default()),
                mid_max,
                timeout,
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Allocate a correlation id and start tracking it
    ///
    /// The deadline does not run until `arm` is called.
    pub async fn register(&self) -> Result<PendingReply> {
        let mut table = self.inner.table.lock().await;
        let max = self.inner.mid_max;

        let mut id = None;
        for _ in 0..=max {
            table.counter = if table.counter >= max {
                0
            } else {
                table.counter + 1
            };
            let candidate = table.counter.to_string();
            if !table.pending.contains_key(&candidate) {
                id = Some(candidate);
                break;
            }
        }
        let id = id.ok_or(Error::IdSpaceExhausted(max))?;

        let (tx, rx) = oneshot::channel();
        table.pending.insert(
            id.clone(),
            PendingRequest {
                tx,
                created: Instant::now(),
                deadline: None,
            },
        );

        Ok(PendingReply { id, rx })
    }

    /// Start the deadline of a registered request
    pub async fn arm(&self, id: &str) {
        let mut table = self.inner.table.lock().await;
        let Some(pending) = table.pending.get_mut(id) else {
            // Already answered
            return;
        };

        let inner = Arc::clone(&self.inner);
        let key = id.to_string();
        pending.deadline = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.timeout).await;
            let expired = inner.table.lock().await.pending.remove(&key);
            if let Some(pending) = expired {
                tracing::warn!(
                    mid = %key,
                    elapsed_ms = pending.created.elapsed().as_millis() as u64,
                    "Request timed out"
                );
                let _ = pending.tx.send(Err(Error::Timeout));
            }
        }));
    }

    /// Stop tracking a request whose envelope was never sent
    pub async fn cancel(&self, id: &str) {
        if let Some(pending) = self.inner.table.lock().await.pending.remove(id) {
            if let Some(deadline) = pending.deadline {
                deadline.abort();
            }
        }
    }

    /// Resolve the request a `rep` answers
    ///
    /// Returns the diagnostic to report for the reply: `NoMatchingRequest`
    /// when nothing is pending under its id (including replies that arrive
    /// after the deadline), `RequestDenied` for `ok: false`.
    pub async fn complete(&self, reply: &Envelope) -> Option<Diagnostic> {
        match self.take(reply).await {
            Some(completion) => completion.resolve(reply),
            None => Some(Diagnostic::NoMatchingRequest),
        }
    }

    /// Remove the request a `rep` answers without resolving it yet
    ///
    /// Once taken, the deadline can no longer fire for it.
    pub async fn take(&self, reply: &Envelope) -> Option<Completion> {
        let id = reply.correlation_id.as_deref()?;

        let pending = self.inner.table.lock().await.pending.remove(id);
        let Some(pending) = pending else {
            tracing::warn!(mid = %id, "No request matched server reply");
            return None;
        };

        if let Some(deadline) = &pending.deadline {
            deadline.abort();
        }
        Some(Completion {
            id: id.to_string(),
            pending,
        })
    }

    /// Cancel every deadline
    ///
    /// With `force` the pending entries are dropped as well, so their callers
    /// see `Error::ConnectionClosed`.
    pub async fn kill(&self, force: bool) {
        let mut table = self.inner.table.lock().await;
        for pending in table.pending.values_mut() {
            if let Some(deadline) = pending.deadline.take() {
                deadline.abort();
            }
        }
        if force {
            let dropped = table.pending.len();
            table.pending.clear();
            if dropped > 0 {
                tracing::debug!(dropped, "Dropped pending requests");
            }
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.table.lock().await.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_ids_are_unique_strings() {
        let correlator = Correlator::new(DEFAULT_TIMEOUT, DEFAULT_MID_MAX);

        let first = correlator.register().await.unwrap();
        let second = correlator.register().await.unwrap();

        assert_eq!(first.id(), "1");
        assert_eq!(second.id(), "2");
        assert_eq!(correlator.pending_count().await, 2);
    }

    #[tokio::test]
    async fn test_id_wraps_and_skips_pending() {
        let correlator = Correlator::new(DEFAULT_TIMEOUT, 3);

        let ids: Vec<String> = {
            let mut ids = Vec::new();
            for _ in 0..3 {
                let reply = correlator.register().await.unwrap();
                ids.push(reply.id().to_string());
                correlator.cancel(reply.id()).await;
            }
            ids
        };
        assert_eq!(ids, vec!["1", "2", "3"]);

        // Wraps to 0 once the maximum has been handed out
        let zero = correlator.register().await.unwrap();
        assert_eq!(zero.id(), "0");

        // "1" is free again, "0" is still pending
        let one = correlator.register().await.unwrap();
        assert_eq!(one.id(), "1");
    }

    #[tokio::test]
    async fn test_id_space_exhausted() {
        let correlator = Correlator::new(DEFAULT_TIMEOUT, 1);

        let _a = correlator.register().await.unwrap();
        let _b = correlator.register().await.unwrap();

        let result = correlator.register().await;
        assert!(matches!(result, Err(Error::IdSpaceExhausted(1))));
    }

    #[tokio::test]
    async fn test_complete_ok() {
        let correlator = Correlator::new(DEFAULT_TIMEOUT, DEFAULT_MID_MAX);
        let reply = correlator.register().await.unwrap();
        correlator.arm(reply.id()).await;

        let rep = Envelope::reply(reply.id(), true).with_payload(vec![json!("rid42")]);
        assert_eq!(correlator.complete(&rep).await, None);
        assert_eq!(correlator.pending_count().await, 0);

        let envelope = reply.wait().await.unwrap();
        assert_eq!(envelope.first_payload(), Some(&json!("rid42")));
    }

    #[tokio::test]
    async fn test_complete_rejected() {
        let correlator = Correlator::new(DEFAULT_TIMEOUT, DEFAULT_MID_MAX);
        let reply = correlator.register().await.unwrap();

        let rep = Envelope::reply(reply.id(), false).with_payload(vec![json!("Wrong password")]);
        assert_eq!(
            correlator.complete(&rep).await,
            Some(Diagnostic::RequestDenied)
        );

        match reply.wait().await {
            Err(Error::Rejected(reason)) => assert_eq!(reason, "Wrong password"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unmatched_reply() {
        let correlator = Correlator::new(DEFAULT_TIMEOUT, DEFAULT_MID_MAX);
        let rep = Envelope::reply("999", true);

        assert_eq!(
            correlator.complete(&rep).await,
            Some(Diagnostic::NoMatchingRequest)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_deadline() {
        let correlator = Correlator::new(Duration::from_secs(30), DEFAULT_MID_MAX);
        let reply = correlator.register().await.unwrap();
        let id = reply.id().to_string();
        correlator.arm(&id).await;

        let waiter = tokio::spawn(reply.wait());

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(correlator.pending_count().await, 1);
        assert!(!waiter.is_finished());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(waiter.await.unwrap(), Err(Error::Timeout)));
        assert_eq!(correlator.pending_count().await, 0);

        // A late reply is dropped
        let late = Envelope::reply(id, true);
        assert_eq!(
            correlator.complete(&late).await,
            Some(Diagnostic::NoMatchingRequest)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_waits_for_arm() {
        let correlator = Correlator::new(Duration::from_secs(1), DEFAULT_MID_MAX);
        let reply = correlator.register().await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(correlator.pending_count().await, 1);

        correlator.cancel(reply.id()).await;
        assert!(matches!(reply.wait().await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_forced_kill_drops_pending() {
        let correlator = Correlator::new(DEFAULT_TIMEOUT, DEFAULT_MID_MAX);
        let first = correlator.register().await.unwrap();
        let second = correlator.register().await.unwrap();
        correlator.arm(first.id()).await;

        correlator.kill(true).await;

        assert_eq!(correlator.pending_count().await, 0);
        assert!(matches!(first.wait().await, Err(Error::ConnectionClosed)));
        assert!(matches!(second.wait().await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_kill_keeps_pending() {
        let correlator = Correlator::new(Duration::from_secs(1), DEFAULT_MID_MAX);
        let reply = correlator.register().await.unwrap();
        correlator.arm(reply.id()).await;

        correlator.kill(false).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        // Deadline cancelled, entry still answerable
        assert_eq!(correlator.pending_count().await, 1);
        let rep = Envelope::reply(reply.id(), true);
        assert_eq!(correlator.complete(&rep).await, None);
        assert!(reply.wait().await.is_ok());
    }
}
