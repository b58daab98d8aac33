//! Session integration tests
//!
//! Login, relogin after a dropped connection, credential persistence and
//! the user object.

mod common;

use common::{publication, reply, MockTiipServer};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tiip_client::{
    hash_password, ClientBuilder, CredentialStore, ExponentialBackoff, Hooks, LoginOptions,
    MemoryCredentialStore, ReadyState, SessionState, AUTH_STORAGE_KEY,
};
use tiip_core::Error;
use tokio::sync::mpsc;

fn fast_backoff() -> Box<ExponentialBackoff> {
    Box::new(ExponentialBackoff::new(
        Duration::from_millis(10),
        Duration::from_millis(50),
    ))
}

/// Accepts every login with resource id `rid42`
fn login_responder(frame: &Value) -> Vec<Value> {
    match frame["type"].as_str() {
        Some("init") => vec![reply(frame, true, json!(["rid42"]))],
        Some("sub") => {
            let mut rep = reply(frame, true, json!([]));
            rep["channel"] = json!("cu:rid42");
            vec![rep]
        }
        Some("req") if frame["signal"] == "readUsers" => {
            vec![reply(frame, true, json!([{"name": "alice"}]))]
        }
        Some(_) if frame.get("mid").is_some() => vec![reply(frame, true, json!([]))],
        _ => Vec::new(),
    }
}

#[tokio::test]
async fn test_authenticate_and_relogin_after_drop() {
    let mut server = MockTiipServer::with_responder(login_responder).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let hooks = Hooks::new().on_relogin_success(move |rep| {
        let _ = tx.send(rep.clone());
    });
    let session = ClientBuilder::new(server.url())
        .with_reconnect(fast_backoff())
        .with_hooks(hooks)
        .build_session()
        .unwrap();
    session.connect().await.unwrap();

    session
        .authenticate("u", "p", LoginOptions::default().with_tenant("t"))
        .await
        .unwrap();

    assert_eq!(session.state(), SessionState::Authenticated);
    assert!(session.is_open().await);
    let context = session.auth_context().unwrap();
    assert_eq!(context.rid.as_deref(), Some("rid42"));
    assert_eq!(context.password_hash, hash_password("p"));

    let login = server.next_frame_of("init").await;
    assert_eq!(login["target"], "TiipController");
    assert_eq!(login["tenant"], "t");
    assert_eq!(login["arguments"]["id"], "u");
    assert_eq!(login["arguments"]["password"], hash_password("p"));

    server.drop_connections();

    let relogin = server.next_frame_of("init").await;
    assert_eq!(relogin["arguments"]["id"], "u");
    assert_eq!(relogin["arguments"]["password"], hash_password("p"));
    assert_ne!(relogin["arguments"]["password"], "p");
    assert_eq!(relogin["tenant"], "t");

    let rep = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rep.first_payload(), Some(&json!("rid42")));
    assert_eq!(server.accepted(), 2);
    assert_eq!(session.state(), SessionState::Authenticated);

    session.logout().await.unwrap();
}

#[tokio::test]
async fn test_failed_relogin_keeps_credentials() {
    let logins = Arc::new(AtomicUsize::new(0));
    let server = {
        let logins = Arc::clone(&logins);
        MockTiipServer::with_responder(move |frame| {
            if frame["type"] == "init" && logins.fetch_add(1, Ordering::SeqCst) > 0 {
                vec![reply(frame, false, json!(["Session expired"]))]
            } else {
                login_responder(frame)
            }
        })
        .await
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let hooks = Hooks::new().on_relogin_failure(move |e| {
        let _ = tx.send(e.to_string());
    });
    let session = ClientBuilder::new(server.url())
        .with_reconnect(fast_backoff())
        .with_hooks(hooks)
        .build_session()
        .unwrap();
    session.connect().await.unwrap();
    session
        .authenticate("u", "p", LoginOptions::default())
        .await
        .unwrap();

    server.drop_connections();

    let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(message.contains("Session expired"));
    assert_eq!(session.state(), SessionState::Anonymous);
    assert!(!session.is_open().await);
    assert_eq!(session.auth_context().unwrap().user_id, "u");

    session.logout().await.unwrap();
}

#[tokio::test]
async fn test_failed_login_leaves_session_anonymous() {
    let server =
        MockTiipServer::with_responder(|frame| vec![reply(frame, false, json!(["Wrong password"]))])
            .await;
    let session = ClientBuilder::new(server.url()).build_session().unwrap();
    session.connect().await.unwrap();

    let result = session.authenticate("u", "bad", LoginOptions::default()).await;

    assert!(matches!(result, Err(Error::Rejected(_))));
    assert_eq!(session.state(), SessionState::Anonymous);
    assert!(session.auth_context().is_none());

    session.logout().await.unwrap();
}

#[tokio::test]
async fn test_bootstrap_without_credentials() {
    let server = MockTiipServer::with_responder(login_responder).await;

    let session = ClientBuilder::new(server.url()).build_session().unwrap();
    assert!(matches!(
        session.bootstrap().await,
        Err(Error::NoCachedCredentials)
    ));

    let session = ClientBuilder::new(server.url())
        .with_credential_store(Arc::new(MemoryCredentialStore::new()))
        .build_session()
        .unwrap();
    assert!(matches!(
        session.bootstrap().await,
        Err(Error::NoCachedCredentials)
    ));
    assert_eq!(session.state(), SessionState::Anonymous);
}

#[tokio::test]
async fn test_bootstrap_from_persisted_credentials() {
    let mut server = MockTiipServer::with_responder(login_responder).await;
    let store = Arc::new(MemoryCredentialStore::new());

    let first = ClientBuilder::new(server.url())
        .with_credential_store(store.clone())
        .build_session()
        .unwrap();
    first.connect().await.unwrap();
    first
        .authenticate("u", "p", LoginOptions::default().with_arg("client", json!("web")))
        .await
        .unwrap();
    let _ = server.next_frame_of("init").await;
    first.socket().kill(true).await;

    let record = store.get(AUTH_STORAGE_KEY).unwrap().unwrap();
    assert!(record.contains(&hash_password("p")));
    assert!(!record.contains("\"p\""));

    let second = ClientBuilder::new(server.url())
        .with_credential_store(store.clone())
        .build_session()
        .unwrap();
    second.connect().await.unwrap();
    second.bootstrap().await.unwrap();

    let login = server.next_frame_of("init").await;
    assert_eq!(login["arguments"]["id"], "u");
    assert_eq!(login["arguments"]["password"], hash_password("p"));
    assert_eq!(login["arguments"]["client"], "web");
    assert_eq!(second.state(), SessionState::Authenticated);
    assert_eq!(second.auth_context().unwrap().rid.as_deref(), Some("rid42"));

    second.logout().await.unwrap();
}

#[tokio::test]
async fn test_logout() {
    let server = MockTiipServer::with_responder(login_responder).await;
    let store = Arc::new(MemoryCredentialStore::new());

    let session = ClientBuilder::new(server.url())
        .with_reconnect(fast_backoff())
        .with_credential_store(store.clone())
        .build_session()
        .unwrap();
    session.connect().await.unwrap();
    session
        .authenticate("u", "p", LoginOptions::default())
        .await
        .unwrap();
    assert!(store.get(AUTH_STORAGE_KEY).unwrap().is_some());

    session.logout().await.unwrap();

    assert_eq!(session.state(), SessionState::Anonymous);
    assert!(session.auth_context().is_none());
    assert!(store.get(AUTH_STORAGE_KEY).unwrap().is_none());
    assert_eq!(session.socket().ready_state().await, ReadyState::Closed);

    // A manual close never reconnects
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.accepted(), 1);
    assert_eq!(session.socket().ready_state().await, ReadyState::Closed);
}

#[tokio::test]
async fn test_load_user_and_updates() {
    let mut server = MockTiipServer::with_responder(login_responder).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let hooks = Hooks::new().on_user_update(move |publication| {
        let _ = tx.send(publication.clone());
    });
    let session = ClientBuilder::new(server.url())
        .with_hooks(hooks)
        .build_session()
        .unwrap();
    session.connect().await.unwrap();

    assert!(matches!(
        session.load_user().await,
        Err(Error::NotAuthenticated(_))
    ));

    session
        .authenticate("u", "p", LoginOptions::default())
        .await
        .unwrap();
    session.load_user().await.unwrap();
    assert_eq!(session.user(), Some(json!({"name": "alice"})));

    let read = server.next_frame_of("req").await;
    assert_eq!(read["target"], "xiconf");
    assert_eq!(read["signal"], "readUsers");
    assert_eq!(read["arguments"]["rids"], json!(["rid42"]));

    let sub = server.next_frame_of("sub").await;
    assert_eq!(sub["channel"], "confUpdate");
    assert_eq!(sub["arguments"]["subChannel"], "rid42");

    // Non-object payloads are ignored
    server.push_json(publication("cu:rid42", json!(["noise"])));
    server.push_json(publication("cu:rid42", json!([{"name": "bob"}])));

    let update = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.payload, Some(vec![json!({"name": "bob"})]));
    assert_eq!(session.user(), Some(json!({"name": "bob"})));

    session.logout().await.unwrap();
}
