//! End-to-end session management tests.
//!
//! These tests run the session directory against the reference responder
//! and verify authentication variants, session and tree reuse, recovery
//! after connection loss or server restart, signing and teardown.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cifs::protocol::{
    Capabilities, CapabilityFlags, Command, Frame, Header, HeaderFlags, OplockBreak, Status,
    NOTIFICATION_TAG,
};
use cifs::server::{Responder, ResponderHandle, ServerConfig, ServerStats};
use cifs::{
    AuthState, CifsError, ConnectionConfig, ConnectionStatus, Credentials, Notification,
    SessionDirectory,
};
use tokio_test::assert_ok;

fn server() -> ServerConfig {
    ServerConfig::default()
        .with_user("alice", "CORP", "wonderland")
        .with_user("bob", "CORP", "builder")
        .with_share("public")
}

async fn start(config: ServerConfig) -> ResponderHandle {
    Responder::bind(config.with_port(0)).await.unwrap().spawn()
}

fn client() -> ConnectionConfig {
    ConnectionConfig::new("127.0.0.1").with_timeouts(
        Duration::from_secs(1),
        Duration::from_secs(5),
        Duration::from_millis(50),
    )
}

fn alice() -> Credentials {
    Credentials::new("alice", "CORP", "wonderland")
}

fn bob() -> Credentials {
    Credentials::new("bob", "CORP", "builder")
}

fn count(counter: &std::sync::atomic::AtomicUsize) -> usize {
    ServerStats::get(counter)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Test blob authentication with the keyed response
#[tokio::test]
async fn test_keyed_blob_authentication() {
    let responder = start(server()).await;
    let directory = SessionDirectory::new(client());

    let session = directory
        .find_or_create_session(&responder.endpoint(), &alice())
        .await
        .unwrap();

    assert_eq!(session.status(), ConnectionStatus::Good);
    assert_eq!(session.auth_state(), AuthState::Authenticated);
    assert_ne!(session.session_id(), 0);
    assert!(session.negotiated().unwrap().keyed_response());
    assert!(!session.signing_key().unwrap().is_empty());
    assert!(!session.is_signing());

    let state = responder.state();
    assert_eq!(count(&state.stats.negotiates), 1);
    assert_eq!(count(&state.stats.session_setups), 2);
    assert_eq!(state.established_count().await, 1);

    directory.shutdown().await;
}

/// Test blob authentication falls back to the plain response without the keyed capability
#[tokio::test]
async fn test_plain_blob_authentication() {
    let caps = Capabilities::default()
        .with_flags(CapabilityFlags::new().with(CapabilityFlags::EXTENDED_SECURITY));
    let responder = start(server().with_capabilities(caps)).await;
    let directory = SessionDirectory::new(client());

    let session = directory
        .find_or_create_session(&responder.endpoint(), &alice())
        .await
        .unwrap();
    let negotiated = session.negotiated().unwrap();
    assert!(negotiated.extended_security());
    assert!(!negotiated.keyed_response());
    assert_eq!(session.auth_state(), AuthState::Authenticated);

    directory.shutdown().await;
}

/// Test the single-leg legacy logon
#[tokio::test]
async fn test_legacy_authentication() {
    let responder = start(server().without_extended_security()).await;
    let directory = SessionDirectory::new(client());

    let session = directory
        .find_or_create_session(&responder.endpoint(), &alice())
        .await
        .unwrap();
    assert!(!session.negotiated().unwrap().extended_security());
    assert_eq!(session.auth_state(), AuthState::Authenticated);
    assert_eq!(count(&responder.state().stats.session_setups), 1);

    directory.shutdown().await;
}

/// Test rejected credentials leave nothing behind in the directory
#[tokio::test]
async fn test_rejected_credentials() {
    let responder = start(server()).await;
    let directory = SessionDirectory::new(client());
    let wrong = Credentials::new("alice", "CORP", "looking-glass");

    let err = directory
        .find_or_create_session(&responder.endpoint(), &wrong)
        .await
        .unwrap_err();
    assert!(matches!(err, CifsError::Authentication { .. }));
    assert_eq!(err.wire_status(), Some(Status::LogonFailure));
    assert!(!err.is_retryable());

    assert!(!directory.contains_session(&responder.endpoint(), &wrong).await);
    assert_eq!(directory.session_count().await, 0);
    assert_eq!(responder.state().established_count().await, 0);

    // The right password still works afterwards
    assert_ok!(
        directory
            .find_or_create_session(&responder.endpoint(), &alice())
            .await
    );
    directory.shutdown().await;
}

/// Test an unknown account is rejected by the legacy logon too
#[tokio::test]
async fn test_legacy_unknown_user() {
    let responder = start(server().without_extended_security()).await;
    let directory = SessionDirectory::new(client());
    let stranger = Credentials::new("mallory", "CORP", "x");

    let err = directory
        .find_or_create_session(&responder.endpoint(), &stranger)
        .await
        .unwrap_err();
    assert!(matches!(err, CifsError::Authentication { .. }));
    assert_eq!(directory.session_count().await, 0);

    directory.shutdown().await;
}

/// Test negotiation fails when no dialect is shared
#[tokio::test]
async fn test_no_common_dialect() {
    let caps = Capabilities::default().with_dialects(vec![0x0400]);
    let responder = start(server().with_capabilities(caps)).await;
    let directory = SessionDirectory::new(client());

    let err = directory
        .find_or_create_session(&responder.endpoint(), &alice())
        .await
        .unwrap_err();
    assert!(matches!(err, CifsError::Authentication { .. }));
    assert_eq!(err.wire_status(), Some(Status::NotSupported));

    directory.shutdown().await;
}

/// Test the same identity on the same server shares one session
#[tokio::test]
async fn test_session_reuse() {
    let responder = start(server()).await;
    let directory = SessionDirectory::new(client());
    let endpoint = responder.endpoint();

    let first = directory.find_or_create_session(&endpoint, &alice()).await.unwrap();
    let second = directory.find_or_create_session(&endpoint, &alice()).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.ref_count(), 2);
    assert_eq!(count(&responder.state().stats.session_setups), 2);

    // Another identity gets its own session over the same transport
    let other = directory.find_or_create_session(&endpoint, &bob()).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &other));
    assert!(Arc::ptr_eq(first.transport(), other.transport()));
    assert_eq!(directory.session_count().await, 2);
    assert_eq!(directory.transport_count().await, 1);
    assert_eq!(count(&responder.state().stats.negotiates), 1);

    directory.shutdown().await;
}

/// Test concurrent lookups for a new session run one authentication
#[tokio::test]
async fn test_concurrent_session_creation() {
    let responder = start(server()).await;
    let directory = Arc::new(SessionDirectory::new(client()));
    let endpoint = responder.endpoint();

    let (cred_a, cred_b) = (alice(), alice());
    let (a, b) = tokio::join!(
        directory.find_or_create_session(&endpoint, &cred_a),
        directory.find_or_create_session(&endpoint, &cred_b),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.ref_count(), 2);
    assert_eq!(count(&responder.state().stats.session_setups), 2);

    directory.shutdown().await;
}

/// Test concurrent tree connects for the same share issue one request
#[tokio::test]
async fn test_concurrent_tree_connect() {
    let responder = start(server()).await;
    let directory = SessionDirectory::new(client());

    let session = directory
        .find_or_create_session(&responder.endpoint(), &alice())
        .await
        .unwrap();
    let (a, b) = tokio::join!(
        directory.find_or_create_tree_connection(&session, "public"),
        directory.find_or_create_tree_connection(&session, "PUBLIC"),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.ref_count(), 2);
    assert_eq!(a.status(), ConnectionStatus::Good);
    assert_ne!(a.tree_id(), 0);
    assert_eq!(a.share_type(), 1);
    assert_eq!(count(&responder.state().stats.tree_connects), 1);
    assert_eq!(directory.tree_count().await, 1);
    // One reference from the caller, one held by the tree
    assert_eq!(session.ref_count(), 2);

    directory.shutdown().await;
}

/// Test a tree connect to an unknown share fails and is not kept
#[tokio::test]
async fn test_unknown_share() {
    let responder = start(server()).await;
    let directory = SessionDirectory::new(client());

    let session = directory
        .find_or_create_session(&responder.endpoint(), &alice())
        .await
        .unwrap();
    let err = directory
        .find_or_create_tree_connection(&session, "secret")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CifsError::Remote {
            command: Command::TreeConnect,
            status: Status::BadNetworkName,
        }
    ));
    assert_eq!(directory.tree_count().await, 0);
    assert_eq!(session.ref_count(), 1);
    assert_eq!(session.status(), ConnectionStatus::Good);

    directory.shutdown().await;
}

/// Test a dropped connection is recovered and everything re-established on next use
#[tokio::test]
async fn test_reconnect_reauthenticates() {
    let responder = start(server()).await;
    let directory = SessionDirectory::new(client());

    let session = directory
        .find_or_create_session(&responder.endpoint(), &alice())
        .await
        .unwrap();
    let tree = directory
        .find_or_create_tree_connection(&session, "public")
        .await
        .unwrap();
    let transport = Arc::clone(session.transport());
    let first_session_id = session.session_id();

    responder.state().drop_connections();
    eventually(|| transport.generation() == 2 && transport.status() == ConnectionStatus::Good)
        .await;
    assert_eq!(session.status(), ConnectionStatus::NeedsReconnect);
    assert_eq!(tree.status(), ConnectionStatus::NeedsReconnect);

    let reply = tree
        .send_request(Command::Request, Bytes::from_static(b"hello again"))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"hello again"));

    assert_eq!(session.status(), ConnectionStatus::Good);
    assert_ne!(session.session_id(), first_session_id);
    assert_eq!(transport.recovery_count(), 1);
    let stats = &responder.state().stats;
    assert_eq!(count(&stats.negotiates), 2);
    assert_eq!(count(&stats.tree_connects), 2);
    assert_eq!(count(&stats.connections), 2);

    directory.shutdown().await;
}

/// Test a server that forgot the session causes a retryable error and a fresh logon
#[tokio::test]
async fn test_server_restart_expires_session() {
    let responder = start(server()).await;
    let directory = SessionDirectory::new(client());

    let session = directory
        .find_or_create_session(&responder.endpoint(), &alice())
        .await
        .unwrap();
    let tree = directory
        .find_or_create_tree_connection(&session, "public")
        .await
        .unwrap();

    responder.state().forget_sessions().await;

    let err = tree
        .send_request(Command::Request, Bytes::from_static(b"anyone?"))
        .await
        .unwrap_err();
    assert!(matches!(err, CifsError::NeedsReconnect));
    assert!(err.is_retryable());
    assert_eq!(session.status(), ConnectionStatus::NeedsReconnect);

    let reply = tree
        .send_request(Command::Request, Bytes::from_static(b"retry"))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"retry"));

    let stats = &responder.state().stats;
    assert_eq!(count(&stats.negotiates), 1);
    assert_eq!(count(&stats.tree_connects), 2);
    assert_eq!(session.transport().recovery_count(), 0);

    directory.shutdown().await;
}

/// Test signed sessions when the server requires signing
#[tokio::test]
async fn test_signing_required_by_server() {
    let responder = start(server().with_signing_required()).await;
    let directory = SessionDirectory::new(client());

    let session = directory
        .find_or_create_session(&responder.endpoint(), &alice())
        .await
        .unwrap();
    assert!(session.is_signing());

    let tree = directory
        .find_or_create_tree_connection(&session, "public")
        .await
        .unwrap();
    for i in 0..3u8 {
        let payload = Bytes::from(vec![i; 16]);
        let reply = tree.send_request(Command::Request, payload.clone()).await.unwrap();
        assert_eq!(reply, payload);
    }

    directory.release_tree_connection(&tree).await;
    directory.release_session(&session).await;
    assert_eq!(count(&responder.state().stats.logoffs), 1);
}

/// Test signing with the legacy logon
#[tokio::test]
async fn test_signing_with_legacy_logon() {
    let responder = start(server().without_extended_security()).await;
    let directory = SessionDirectory::new(client().with_signing(true));

    let session = directory
        .find_or_create_session(&responder.endpoint(), &alice())
        .await
        .unwrap();
    assert!(session.is_signing());
    let tree = directory
        .find_or_create_tree_connection(&session, "public")
        .await
        .unwrap();
    assert_ok!(tree.send_request(Command::Request, Bytes::from_static(b"x")).await);

    directory.shutdown().await;
}

/// Test interim responses from the server are waited through
#[tokio::test]
async fn test_interim_responses() {
    let responder = start(server().with_interim_responses()).await;
    let directory = SessionDirectory::new(client());

    let session = directory
        .find_or_create_session(&responder.endpoint(), &alice())
        .await
        .unwrap();
    let tree = directory
        .find_or_create_tree_connection(&session, "public")
        .await
        .unwrap();
    let reply = tree
        .send_request(Command::Request, Bytes::from_static(b"patience"))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"patience"));

    directory.shutdown().await;
}

/// Test releasing the last references logs off and shuts the transport down
#[tokio::test]
async fn test_release_tears_down() {
    let responder = start(server()).await;
    let directory = SessionDirectory::new(client());
    let endpoint = responder.endpoint();

    let session = directory.find_or_create_session(&endpoint, &alice()).await.unwrap();
    let again = directory.find_or_create_session(&endpoint, &alice()).await.unwrap();
    let tree = directory
        .find_or_create_tree_connection(&session, "public")
        .await
        .unwrap();
    let transport = Arc::clone(session.transport());

    directory.release_session(&again).await;
    directory.release_tree_connection(&tree).await;
    assert_eq!(tree.status(), ConnectionStatus::Exiting);
    assert_eq!(directory.tree_count().await, 0);
    assert_eq!(session.ref_count(), 1);
    assert_eq!(session.status(), ConnectionStatus::Good);

    directory.release_session(&session).await;
    assert_eq!(session.status(), ConnectionStatus::Exiting);
    assert_eq!(transport.status(), ConnectionStatus::Exiting);
    assert_eq!(directory.session_count().await, 0);
    assert_eq!(directory.transport_count().await, 0);
    assert_eq!(count(&responder.state().stats.logoffs), 1);
    assert_eq!(responder.state().established_count().await, 0);
    eventually(|| transport.reader_count() == 0).await;

    let err = session
        .send_request(Command::Request, Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CifsError::Exiting));
}

/// Test server-pushed oplock breaks reach subscribers
#[tokio::test]
async fn test_pushed_notification() {
    let responder = start(server()).await;
    let directory = SessionDirectory::new(client());

    let session = directory
        .find_or_create_session(&responder.endpoint(), &alice())
        .await
        .unwrap();
    let mut notifications = session.transport().subscribe_notifications();

    let mut header = Header::request(Command::OplockBreak);
    header.flags.set(HeaderFlags::RESPONSE);
    header.tag = NOTIFICATION_TAG;
    header.session_id = session.session_id();
    let brk = OplockBreak {
        file_id: 9,
        new_level: 0,
    };
    assert_eq!(responder.state().push(Frame::new(header, brk.encode())), 1);

    let received = tokio::time::timeout(Duration::from_secs(1), notifications.recv())
        .await
        .unwrap()
        .unwrap();
    let Notification::OplockBreak { session_id, brk, .. } = received;
    assert_eq!(session_id, session.session_id());
    assert_eq!(brk.file_id, 9);

    directory.shutdown().await;
}

/// Test the transport-level echo round trip
#[tokio::test]
async fn test_echo() {
    let responder = start(server()).await;
    let directory = SessionDirectory::new(client());

    let session = directory
        .find_or_create_session(&responder.endpoint(), &alice())
        .await
        .unwrap();
    let rtt = session.transport().echo().await.unwrap();
    assert!(rtt < Duration::from_secs(5));

    directory.shutdown().await;
}
