//! Sender flow-control and settlement scenarios against the scripted peer

mod common;

use std::time::Duration;

use hematite_amqp::link::error::SendError;
use hematite_amqp::types::messaging::{DeliveryState, Outcome};
use hematite_amqp::{Connection, SenderOptions, Session};

use common::duplex_pair;

/// A send on a link that is never granted credit fails with a send
/// timeout; a try_send returns absent with no error.
#[tokio::test]
async fn send_times_out_without_credit() {
    let (client_io, mut peer) = duplex_pair();

    let peer_task = tokio::spawn(async move {
        peer.handshake(None).await;
        peer.accept_session().await;

        let (channel, attach) = peer.expect_attach().await;
        peer.send_attach_echo(channel, &attach).await;
        // No Flow is ever sent: the link stays at zero credit
    });

    let mut connection = Connection::builder()
        .container_id("send-timeout")
        .open_with_stream(client_io)
        .await
        .unwrap();
    let mut session = Session::begin(&mut connection).await.unwrap();

    let options = SenderOptions::new().send_timeout(Duration::from_millis(1));
    let mut sender = session
        .open_sender_with(options, Some("q1".to_string()))
        .await
        .unwrap();

    let result = sender.send("Hello World").await;
    assert!(matches!(result, Err(SendError::SendTimedOut)));

    let result = sender.try_send("Hello World").await;
    assert!(matches!(result, Ok(None)));

    peer_task.await.unwrap();
}

/// A blocked send completes once the peer grants credit; exactly one
/// Transfer with a non-empty payload is emitted and credit drops to zero.
#[tokio::test]
async fn send_completes_when_credit_arrives_later() {
    let (client_io, mut peer) = duplex_pair();

    let peer_task = tokio::spawn(async move {
        peer.handshake(None).await;
        peer.accept_session().await;

        let (channel, attach) = peer.expect_attach().await;
        peer.send_attach_echo(channel, &attach).await;

        // Grant a single credit a little later, while the send blocks
        tokio::time::sleep(Duration::from_millis(30)).await;
        peer.send_flow(channel, attach.handle.0, 1).await;

        let (transfer, payload) = peer.expect_transfer().await;
        assert_eq!(transfer.delivery_id, Some(0));
        assert_eq!(
            transfer.delivery_tag.as_ref().map(|tag| &tag[..]),
            Some(&[0u8][..])
        );
        assert!(!payload.is_empty());
    });

    let mut connection = Connection::builder()
        .container_id("credit-later")
        .open_with_stream(client_io)
        .await
        .unwrap();
    let mut session = Session::begin(&mut connection).await.unwrap();

    let options = SenderOptions::new().send_timeout(Duration::from_millis(200));
    let mut sender = session
        .open_sender_with(options, Some("q1".to_string()))
        .await
        .unwrap();

    let tracker = sender.send("Hello World").await.unwrap();
    assert_eq!(&tracker.delivery_tag()[..], &[0u8]);
    assert_eq!(sender.credit(), 0);

    peer_task.await.unwrap();
}

/// With default options the tracker resolves when the peer settles with
/// Accepted: the settlement future completes, the remote state is
/// Accepted, and the delivery is settled locally.
#[tokio::test]
async fn auto_settle_on_remote_accept() {
    let (client_io, mut peer) = duplex_pair();

    let peer_task = tokio::spawn(async move {
        peer.handshake(None).await;
        peer.accept_session().await;

        let (channel, attach) = peer.expect_attach().await;
        peer.send_attach_echo(channel, &attach).await;
        peer.send_flow(channel, attach.handle.0, 10).await;

        let (transfer, _payload) = peer.expect_transfer().await;
        peer.send_accepted(channel, transfer.delivery_id.unwrap())
            .await;
    });

    let mut connection = Connection::builder()
        .container_id("auto-settle")
        .open_with_stream(client_io)
        .await
        .unwrap();
    let mut session = Session::begin(&mut connection).await.unwrap();
    let mut sender = session.open_sender("q1").await.unwrap();

    let mut tracker = sender.send("Hello World").await.unwrap();
    let outcome = tracker
        .await_settlement_with_timeout(Duration::from_secs(5))
        .await
        .unwrap();

    assert!(matches!(outcome, Outcome::Accepted(_)));
    assert!(matches!(
        tracker.remote_state(),
        Some(DeliveryState::Accepted(_))
    ));
    assert!(tracker.remote_settled());
    assert!(tracker.settled());

    peer_task.await.unwrap();
}

/// Dropping the transport while a send is blocked for credit fails the
/// send with connection-remotely-closed; so does a subsequent try_send.
#[tokio::test]
async fn connection_drop_fails_a_blocked_send() {
    let (client_io, mut peer) = duplex_pair();

    let peer_task = tokio::spawn(async move {
        peer.handshake(None).await;
        peer.accept_session().await;

        let (channel, attach) = peer.expect_attach().await;
        peer.send_attach_echo(channel, &attach).await;

        // Drop the transport while the send is blocked
        tokio::time::sleep(Duration::from_millis(25)).await;
        drop(peer);
    });

    let mut connection = Connection::builder()
        .container_id("drop-mid-send")
        .open_with_stream(client_io)
        .await
        .unwrap();
    let mut session = Session::begin(&mut connection).await.unwrap();

    let options = SenderOptions::new().send_timeout(Duration::from_secs(5));
    let mut sender = session
        .open_sender_with(options, Some("q1".to_string()))
        .await
        .unwrap();

    let result = sender.send("Hello World").await;
    assert!(matches!(
        result,
        Err(SendError::ConnectionRemotelyClosed)
    ));

    let result = sender.try_send("Hello World").await;
    assert!(matches!(
        result,
        Err(SendError::ConnectionRemotelyClosed)
    ));

    peer_task.await.unwrap();
}

/// A sender opened with at-most-once delivery pre-settles its transfers;
/// the tracker resolves immediately without a remote disposition.
#[tokio::test]
async fn at_most_once_sends_are_pre_settled() {
    let (client_io, mut peer) = duplex_pair();

    let peer_task = tokio::spawn(async move {
        peer.handshake(None).await;
        peer.accept_session().await;

        let (channel, attach) = peer.expect_attach().await;
        peer.send_attach_echo(channel, &attach).await;
        peer.send_flow(channel, attach.handle.0, 1).await;

        let (transfer, _payload) = peer.expect_transfer().await;
        assert_eq!(transfer.settled, Some(true));
    });

    let mut connection = Connection::builder()
        .container_id("pre-settled")
        .open_with_stream(client_io)
        .await
        .unwrap();
    let mut session = Session::begin(&mut connection).await.unwrap();

    let options = SenderOptions::new().delivery_mode(hematite_amqp::DeliveryMode::AtMostOnce);
    let mut sender = session
        .open_sender_with(options, Some("q1".to_string()))
        .await
        .unwrap();

    let mut tracker = sender.send("fire and forget").await.unwrap();
    assert!(tracker.settled());
    let outcome = tracker.await_settlement().await.unwrap();
    assert!(matches!(outcome, Outcome::Accepted(_)));

    peer_task.await.unwrap();
}
