//! Connection lifecycle scenarios against the scripted peer

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hematite_amqp::connection::{ConnectionEvent, Error, OpenError};
use hematite_amqp::types::definitions::{self, AmqpError};
use hematite_amqp::{Client, Connection};

use common::duplex_pair;

/// Close is idempotent: every call completes with the same terminal
/// outcome as the first.
#[tokio::test]
async fn close_is_idempotent() {
    let (client_io, mut peer) = duplex_pair();

    let peer_task = tokio::spawn(async move {
        peer.handshake(None).await;
        let _close = peer.expect_close().await;
        peer.send_close(None).await;
    });

    let mut connection = Connection::builder()
        .container_id("idempotent-close")
        .open_with_stream(client_io)
        .await
        .unwrap();

    connection.close().await.unwrap();
    connection.close().await.unwrap();
    connection.close().await.unwrap();

    peer_task.await.unwrap();
}

/// A remote Close carrying an error moves the connection to failed; every
/// close observes the failure cause.
#[tokio::test]
async fn remote_close_with_error_is_the_terminal_outcome() {
    let (client_io, mut peer) = duplex_pair();

    let peer_task = tokio::spawn(async move {
        peer.handshake(None).await;
        peer.send_close(Some(definitions::Error::new(
            AmqpError::InternalError,
            Some("broker going down".to_string()),
            None,
        )))
        .await;
        // The client replies with its own Close
        let _close = peer.expect_close().await;
    });

    let mut connection = Connection::builder()
        .container_id("remote-close")
        .open_with_stream(client_io)
        .await
        .unwrap();

    // Give the engine a moment to consume the remote Close
    tokio::time::sleep(Duration::from_millis(20)).await;

    let first = connection.close().await;
    assert!(matches!(first, Err(Error::RemoteClosedWithError(_))));

    let second = connection.close().await;
    assert!(matches!(second, Err(Error::RemoteClosedWithError(_))));

    peer_task.await.unwrap();
}

/// The open timeout fires when the peer never answers the Open
#[tokio::test]
async fn open_times_out_without_a_remote_open() {
    let (client_io, mut peer) = duplex_pair();

    let peer_task = tokio::spawn(async move {
        peer.exchange_amqp_header().await;
        let _open = peer.expect_open().await;
        // Never answer; keep the transport alive until the client gives up
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let result = Connection::builder()
        .container_id("open-timeout")
        .open_timeout(Duration::from_millis(50))
        .open_with_stream(client_io)
        .await;
    assert!(matches!(result, Err(OpenError::OperationTimedOut)));

    peer_task.abort();
}

/// The connected handler fires on the dispatch task once the Open frames
/// are exchanged
#[tokio::test]
async fn connected_handler_fires_on_open() {
    let (client_io, mut peer) = duplex_pair();

    let peer_task = tokio::spawn(async move {
        peer.handshake(Some(vec!["ANONYMOUS-RELAY"])).await;
    });

    let connected = Arc::new(AtomicBool::new(false));
    let connected_flag = connected.clone();

    let connection = Connection::builder()
        .container_id("connected-event")
        .on_connected(move |event| {
            if let ConnectionEvent::Connected(capabilities) = event {
                assert!(capabilities.anonymous_relay);
                connected_flag.store(true, Ordering::SeqCst);
            }
        })
        .open_with_stream(client_io)
        .await
        .unwrap();

    let capabilities = connection.capabilities().await.unwrap();
    assert!(capabilities.anonymous_relay);

    // The dispatch task runs separately from the engine loop
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(connected.load(Ordering::SeqCst));

    peer_task.await.unwrap();
}

/// A client closes every connection it opened
#[tokio::test]
async fn client_close_closes_owned_connections() {
    let (client_io, mut peer) = duplex_pair();

    let peer_task = tokio::spawn(async move {
        peer.handshake(None).await;
        let _close = peer.expect_close().await;
        peer.send_close(None).await;
    });

    let client = Client::new("closing-client");
    let mut connection = client.connect_with_stream(client_io).await.unwrap();

    client.close().await;

    // The engine observed the Close control from the client
    let outcome = connection.close().await;
    assert!(outcome.is_ok());

    peer_task.await.unwrap();
}
