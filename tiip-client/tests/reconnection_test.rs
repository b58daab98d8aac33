//! Reconnection integration tests

mod common;

use common::{eventually, MockTiipServer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tiip_client::{ClientBuilder, CloseEvent, ExponentialBackoff, ReadyState};
use tiip_core::Error;

#[tokio::test]
async fn test_reconnects_after_dropped_connection() {
    let mut server = MockTiipServer::new().await;

    let socket = ClientBuilder::new(server.url())
        .with_reconnect(Box::new(ExponentialBackoff::new(
            Duration::from_millis(10),
            Duration::from_millis(50),
        )))
        .build()
        .unwrap();

    let opens = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));
    {
        let opens = Arc::clone(&opens);
        let closes = Arc::clone(&closes);
        socket
            .connection()
            .on_open(move || {
                let opens = Arc::clone(&opens);
                async move {
                    opens.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_close(move |event: CloseEvent| {
                let closes = Arc::clone(&closes);
                async move {
                    if !event.manual {
                        closes.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });
    }

    socket.connect().await.unwrap();
    socket.req("A", "before", None, None).await.unwrap();
    assert_eq!(server.next_frame().await["signal"], "before");

    server.drop_connections();
    eventually(|| {
        let opens = Arc::clone(&opens);
        async move { opens.load(Ordering::SeqCst) == 2 }
    })
    .await;

    socket.req("A", "after", None, None).await.unwrap();
    assert_eq!(server.next_frame().await["signal"], "after");
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(server.accepted(), 2);
    assert!(socket.is_open().await);

    socket.kill(true).await;
}

#[tokio::test]
async fn test_gives_up_and_rejects_queued_requests() {
    // Nothing listens on port 1
    let socket = ClientBuilder::new("ws://127.0.0.1:1")
        .with_reconnect(Box::new(
            ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(5))
                .with_max_attempts(2),
        ))
        .build()
        .unwrap();

    let errors = Arc::new(AtomicUsize::new(0));
    {
        let errors = Arc::clone(&errors);
        socket.connection().on_error(move |_| {
            let errors = Arc::clone(&errors);
            async move {
                errors.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    let pending = {
        let socket = socket.clone();
        tokio::spawn(async move { socket.req("A", "queued", None, None).await })
    };
    socket.connect().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(Error::ConnectionClosed)));
    assert_eq!(socket.ready_state().await, ReadyState::ReconnectAborted);
    assert!(errors.load(Ordering::SeqCst) >= 3);

    // Fails fast from now on
    assert!(matches!(
        socket.req("A", "late", None, None).await,
        Err(Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_connect_after_abort_starts_over() {
    let server = MockTiipServer::new().await;

    let socket = ClientBuilder::new("ws://127.0.0.1:1")
        .with_max_reconnect_attempts(0)
        .build()
        .unwrap();
    socket.connect().await.unwrap();
    eventually(|| {
        let socket = socket.clone();
        async move { socket.ready_state().await == ReadyState::ReconnectAborted }
    })
    .await;

    socket.connect_with(server.url(), Vec::new()).await.unwrap();
    socket.req("A", "ping", None, None).await.unwrap();
    assert!(socket.is_open().await);

    socket.kill(true).await;
}
