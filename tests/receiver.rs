//! Receiver scenarios against the scripted peer

mod common;

use std::time::Duration;

use hematite_amqp::types::definitions::Role;
use hematite_amqp::types::messaging::{Body, DeliveryState};
use hematite_amqp::types::primitives::Value;
use hematite_amqp::{Connection, ReceiverOptions, Session};

use common::duplex_pair;

fn encoded(text: &str) -> bytes::Bytes {
    use hematite_amqp::types::messaging::{message::__private::Serializable, Message};
    let message = Message::builder().value(text.to_string()).build();
    bytes::Bytes::from(serde_amqp::to_vec(&Serializable(message)).unwrap())
}

/// Receives a delivery; with default options the receiver accepts and
/// settles it and then tops the credit window back up.
#[tokio::test]
async fn receive_with_auto_accept() {
    let (client_io, mut peer) = duplex_pair();

    let peer_task = tokio::spawn(async move {
        peer.handshake(None).await;
        peer.accept_session().await;

        let (channel, attach) = peer.expect_attach().await;
        assert!(matches!(attach.role, Role::Receiver));
        peer.send_attach_echo(channel, &attach).await;

        // The initial credit window opens with a Flow
        let flow = peer.expect_flow().await;
        assert_eq!(flow.link_credit, Some(10));

        peer.send_transfer(channel, attach.handle.0, 0, encoded("hello AMQP"))
            .await;

        // Auto-accept: a settled Accepted disposition, then the window
        // top-up
        let disposition = peer.expect_disposition().await;
        assert!(matches!(disposition.role, Role::Receiver));
        assert_eq!(disposition.first, 0);
        assert!(disposition.settled);
        assert!(matches!(
            disposition.state,
            Some(DeliveryState::Accepted(_))
        ));

        let flow = peer.expect_flow().await;
        assert_eq!(flow.link_credit, Some(10));
    });

    let mut connection = Connection::builder()
        .container_id("receive-auto-accept")
        .open_with_stream(client_io)
        .await
        .unwrap();
    let mut session = Session::begin(&mut connection).await.unwrap();
    let mut receiver = session.open_receiver("q1").await.unwrap();

    let mut delivery = receiver.recv().await.unwrap();
    assert_eq!(delivery.delivery_id(), 0);
    let message = delivery.message().unwrap();
    match &message.body {
        Body::Value(value) => assert_eq!(value.0, Value::from("hello AMQP")),
        other => panic!("expecting an AmqpValue body, found {:?}", other),
    }

    peer_task.await.unwrap();
}

/// With auto-accept off nothing is disposed until the application calls
/// accept; a credit window of zero suppresses replenishment.
#[tokio::test]
async fn manual_accept_with_zero_credit_window() {
    let (client_io, mut peer) = duplex_pair();

    let peer_task = tokio::spawn(async move {
        peer.handshake(None).await;
        peer.accept_session().await;

        let (channel, attach) = peer.expect_attach().await;
        peer.send_attach_echo(channel, &attach).await;

        // Explicit credit only
        let flow = peer.expect_flow().await;
        assert_eq!(flow.link_credit, Some(1));

        peer.send_transfer(channel, attach.handle.0, 0, encoded("manual"))
            .await;

        // The disposition arrives only after the application accepts
        let disposition = peer.expect_disposition().await;
        assert_eq!(disposition.first, 0);
        assert!(disposition.settled);
    });

    let mut connection = Connection::builder()
        .container_id("manual-accept")
        .open_with_stream(client_io)
        .await
        .unwrap();
    let mut session = Session::begin(&mut connection).await.unwrap();

    let options = ReceiverOptions::new().credit_window(0).auto_accept(false);
    let mut receiver = session
        .open_receiver_with(options, Some("q1".to_string()))
        .await
        .unwrap();

    receiver.add_credit(1).await.unwrap();
    let delivery = receiver.recv().await.unwrap();

    // Nothing was queued yet
    assert!(matches!(receiver.try_recv().await, Ok(None)));

    receiver.accept(&delivery).await.unwrap();

    peer_task.await.unwrap();
}

/// recv_with_timeout returns absent when no delivery arrives in time
#[tokio::test]
async fn receive_with_timeout_returns_absent() {
    let (client_io, mut peer) = duplex_pair();

    let peer_task = tokio::spawn(async move {
        peer.handshake(None).await;
        peer.accept_session().await;

        let (channel, attach) = peer.expect_attach().await;
        peer.send_attach_echo(channel, &attach).await;
        let _flow = peer.expect_flow().await;
    });

    let mut connection = Connection::builder()
        .container_id("receive-timeout")
        .open_with_stream(client_io)
        .await
        .unwrap();
    let mut session = Session::begin(&mut connection).await.unwrap();
    let mut receiver = session.open_receiver("q1").await.unwrap();

    let result = receiver
        .recv_with_timeout(Duration::from_millis(10))
        .await
        .unwrap();
    assert!(result.is_none());

    peer_task.await.unwrap();
}
