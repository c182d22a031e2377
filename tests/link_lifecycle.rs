//! Link lifecycle scenarios against the scripted peer

mod common;

use std::time::Duration;

use hematite_amqp::link::error::AttachError;
use hematite_amqp::types::definitions::Role;
use hematite_amqp::{Connection, Session};

use common::duplex_pair;

/// Open a connection, a session, and a sender, then close everything.
/// The wire sequence is Open/Open, Begin/Begin, Attach/Attach,
/// Detach(closed)/Detach, End/End, Close/Close.
#[tokio::test]
async fn create_sender_and_close() {
    let (client_io, mut peer) = duplex_pair();

    let peer_task = tokio::spawn(async move {
        peer.handshake(None).await;
        peer.accept_session().await;

        let (channel, attach) = peer.expect_attach().await;
        assert!(matches!(attach.role, Role::Sender));
        let target = attach.target.clone().expect("sender must carry a target");
        match *target {
            hematite_amqp::types::messaging::TargetArchetype::Target(ref target) => {
                assert_eq!(target.address.as_deref(), Some("test-queue"));
            }
            _ => panic!("expecting a plain target"),
        }
        peer.send_attach_echo(channel, &attach).await;

        let detach = peer.expect_detach().await;
        assert!(detach.closed);
        peer.send_detach(channel, attach.handle.0, true, None).await;

        let _end = peer.expect_end().await;
        peer.send_end(0, None).await;

        let _close = peer.expect_close().await;
        peer.send_close(None).await;
    });

    let mut connection = Connection::builder()
        .container_id("lifecycle-test")
        .open_with_stream(client_io)
        .await
        .unwrap();
    let mut session = Session::begin(&mut connection).await.unwrap();

    let sender = session.open_sender("test-queue").await.unwrap();
    assert!(sender.name().starts_with("sender-"));

    sender.close().await.unwrap();
    session.end().await.unwrap();
    connection.close().await.unwrap();

    peer_task.await.unwrap();
}

/// The peer omits ANONYMOUS-RELAY from its offered capabilities; opening
/// an anonymous sender must fail with an unsupported-operation error.
#[tokio::test]
async fn anonymous_sender_requires_the_relay_capability() {
    let (client_io, mut peer) = duplex_pair();

    let peer_task = tokio::spawn(async move {
        peer.handshake(None).await;
        peer.accept_session().await;
    });

    let mut connection = Connection::builder()
        .container_id("anonymous-unsupported")
        .open_with_stream(client_io)
        .await
        .unwrap();
    let mut session = Session::begin(&mut connection).await.unwrap();

    let result = session.open_anonymous_sender().await;
    assert!(matches!(
        result,
        Err(AttachError::AnonymousRelayNotSupported)
    ));

    peer_task.await.unwrap();
}

/// An anonymous sender requested before the remote Open is received is
/// held until the capabilities are known; once the peer offers
/// ANONYMOUS-RELAY the attach goes out with a null target and the open
/// completes.
#[tokio::test]
async fn anonymous_sender_open_is_held_until_capabilities_are_known() {
    let (client_io, mut peer) = duplex_pair();

    let peer_task = tokio::spawn(async move {
        peer.exchange_amqp_header().await;

        // The client pipelines Open and Begin before the peer answers
        peer.expect_open().await;
        let (client_channel, _begin) = peer.expect_begin().await;

        // Delay the Open so the attach must be held back
        tokio::time::sleep(Duration::from_millis(50)).await;
        peer.send_open(Some(vec!["ANONYMOUS-RELAY"])).await;
        peer.send_begin(0, client_channel).await;

        let (channel, attach) = peer.expect_attach().await;
        assert!(
            attach.target.is_none(),
            "anonymous attach carries a null target"
        );
        peer.send_attach_echo(channel, &attach).await;
    });

    let mut connection = Connection::builder()
        .container_id("anonymous-held")
        .open_pipelined_with_stream(client_io)
        .await
        .unwrap();
    let mut session = Session::begin(&mut connection).await.unwrap();

    let sender = session.open_anonymous_sender().await.unwrap();
    assert!(sender.target().is_none());

    peer_task.await.unwrap();
}

/// A dynamic receiver gets its address from the peer's attach echo
#[tokio::test]
async fn dynamic_receiver_takes_the_peer_assigned_address() {
    let (client_io, mut peer) = duplex_pair();

    let peer_task = tokio::spawn(async move {
        peer.handshake(None).await;
        peer.accept_session().await;

        let (channel, mut attach) = peer.expect_attach().await;
        assert!(matches!(attach.role, Role::Receiver));
        let mut source = attach.source.clone().expect("receiver must carry a source");
        assert!(source.dynamic);
        source.address = Some("dynamic-node-17".to_string().into());
        attach.source = Some(source);
        peer.send_attach_echo(channel, &attach).await;

        // Initial credit window
        let _flow = peer.expect_flow().await;
    });

    let mut connection = Connection::builder()
        .container_id("dynamic-receiver")
        .open_with_stream(client_io)
        .await
        .unwrap();
    let mut session = Session::begin(&mut connection).await.unwrap();

    let receiver = session.open_dynamic_receiver().await.unwrap();
    assert_eq!(receiver.source_address(), Some("dynamic-node-17"));

    peer_task.await.unwrap();
}
