//! Transaction controller scenarios against the scripted peer

mod common;

use hematite_amqp::transaction::TransactionError;
use hematite_amqp::types::definitions::{AmqpError, Role};
use hematite_amqp::types::messaging::message::__private::Deserializable;
use hematite_amqp::types::messaging::{Accepted, AmqpValue, DeliveryState, Message, Outcome};
use hematite_amqp::types::transaction::{Declare, Declared, Discharge, TransactionalState};
use serde_amqp::Value;
use hematite_amqp::{Connection, Session};

use common::{duplex_pair, ScriptedPeer};

fn decode_declare(payload: &[u8]) -> Declare {
    let Deserializable(message): Deserializable<Message<AmqpValue<Value>>> =
        serde_amqp::from_slice(payload).unwrap();
    serde_amqp::from_value(message.body.0).unwrap()
}

fn decode_discharge(payload: &[u8]) -> Discharge {
    let Deserializable(message): Deserializable<Message<AmqpValue<Value>>> =
        serde_amqp::from_slice(payload).unwrap();
    serde_amqp::from_value(message.body.0).unwrap()
}

/// Handles the coordinator attach and grants it credit
async fn accept_coordinator(peer: &mut ScriptedPeer) -> (u16, u32) {
    let (channel, attach) = peer.expect_attach().await;
    assert!(matches!(attach.role, Role::Sender));
    assert!(matches!(
        attach.target.as_deref(),
        Some(hematite_amqp::types::messaging::TargetArchetype::Coordinator(_))
    ));
    peer.send_attach_echo(channel, &attach).await;
    peer.send_flow(channel, attach.handle.0, 8).await;
    (channel, attach.handle.0)
}

/// A full commit round-trip: Declare is answered with a txn-id, the
/// Discharge carries that txn-id with fail=false, and a second commit
/// without an intervening begin fails with transaction-not-active.
#[tokio::test]
async fn transaction_commit_round_trip() {
    let (client_io, mut peer) = duplex_pair();

    let peer_task = tokio::spawn(async move {
        peer.handshake(None).await;
        peer.accept_session().await;
        let (channel, _handle) = accept_coordinator(&mut peer).await;

        // Declare
        let (transfer, payload) = peer.expect_transfer().await;
        assert_eq!(transfer.settled, Some(false));
        let _declare = decode_declare(&payload);
        peer.send_disposition(
            channel,
            transfer.delivery_id.unwrap(),
            true,
            Some(DeliveryState::Declared(Declared {
                txn_id: serde_bytes::ByteBuf::from(vec![0, 1, 2, 3]),
            })),
        )
        .await;

        // Discharge(fail = false)
        let (transfer, payload) = peer.expect_transfer().await;
        let discharge = decode_discharge(&payload);
        assert_eq!(&discharge.txn_id[..], &[0, 1, 2, 3]);
        assert_eq!(discharge.fail, Some(false));
        peer.send_accepted(channel, transfer.delivery_id.unwrap())
            .await;
    });

    let mut connection = Connection::builder()
        .container_id("txn-commit")
        .open_with_stream(client_io)
        .await
        .unwrap();
    let mut session = Session::begin(&mut connection).await.unwrap();

    session.begin_transaction().await.unwrap();
    session.commit_transaction().await.unwrap();

    let result = session.commit_transaction().await;
    assert!(matches!(result, Err(TransactionError::NotActive)));

    peer_task.await.unwrap();
}

/// The peer refuses the coordinator attach with amqp:not-implemented;
/// begin_transaction fails with a declaration error carrying the peer's
/// description.
#[tokio::test]
async fn coordinator_link_refused() {
    let (client_io, mut peer) = duplex_pair();

    let peer_task = tokio::spawn(async move {
        peer.handshake(None).await;
        peer.accept_session().await;

        let (channel, mut attach) = peer.expect_attach().await;
        // Refusal: attach back with a null terminus, then a closing
        // detach carrying the reason
        let handle = attach.handle.0;
        attach.source = None;
        attach.target = None;
        peer.send_attach_echo(channel, &attach).await;
        peer.send_detach(
            channel,
            handle,
            true,
            Some(hematite_amqp::types::definitions::Error::new(
                AmqpError::NotImplemented,
                Some("transactions are not implemented here".to_string()),
                None,
            )),
        )
        .await;

        // The client answers with its closing detach
        let detach = peer.expect_detach().await;
        assert!(detach.closed);
    });

    let mut connection = Connection::builder()
        .container_id("txn-refused")
        .open_with_stream(client_io)
        .await
        .unwrap();
    let mut session = Session::begin(&mut connection).await.unwrap();

    let result = session.begin_transaction().await;
    match result {
        Err(TransactionError::DeclarationFailed(Some(error))) => {
            assert_eq!(
                error.description.as_deref(),
                Some("transactions are not implemented here")
            );
        }
        other => panic!("expecting DeclarationFailed with a condition, found {:?}", other),
    }

    peer_task.await.unwrap();
}

/// While a transaction is active every transfer is stamped with a
/// transactional state bearing the active txn-id; the remote settles with
/// a transactional state whose provisional outcome is Accepted.
#[tokio::test]
async fn transfer_inside_a_transaction_is_stamped() {
    let (client_io, mut peer) = duplex_pair();

    let peer_task = tokio::spawn(async move {
        peer.handshake(None).await;
        peer.accept_session().await;

        // The sender link attaches first
        let (channel, sender_attach) = peer.expect_attach().await;
        peer.send_attach_echo(channel, &sender_attach).await;
        peer.send_flow(channel, sender_attach.handle.0, 10).await;

        // Then the coordinator
        let (_, _) = accept_coordinator(&mut peer).await;

        // Declare
        let (transfer, _payload) = peer.expect_transfer().await;
        peer.send_disposition(
            channel,
            transfer.delivery_id.unwrap(),
            true,
            Some(DeliveryState::Declared(Declared {
                txn_id: serde_bytes::ByteBuf::from(vec![0, 1, 2, 3]),
            })),
        )
        .await;

        // The application transfer must be transactional
        let (transfer, _payload) = peer.expect_transfer().await;
        match &transfer.state {
            Some(DeliveryState::TransactionalState(state)) => {
                assert_eq!(&state.txn_id[..], &[0, 1, 2, 3]);
                assert!(state.outcome.is_none());
            }
            other => panic!("expecting a transactional state, found {:?}", other),
        }

        // Settle it with a transactional accepted state
        peer.send_disposition(
            channel,
            transfer.delivery_id.unwrap(),
            true,
            Some(DeliveryState::TransactionalState(TransactionalState {
                txn_id: serde_bytes::ByteBuf::from(vec![0, 1, 2, 3]),
                outcome: Some(Outcome::Accepted(Accepted {})),
            })),
        )
        .await;
    });

    let mut connection = Connection::builder()
        .container_id("txn-transfer")
        .open_with_stream(client_io)
        .await
        .unwrap();
    let mut session = Session::begin(&mut connection).await.unwrap();
    let mut sender = session.open_sender("q1").await.unwrap();

    session.begin_transaction().await.unwrap();

    let mut tracker = sender.send("inside txn").await.unwrap();
    let outcome = tracker.await_settlement().await.unwrap();
    assert!(matches!(outcome, Outcome::Accepted(_)));
    assert!(matches!(
        tracker.remote_state(),
        Some(DeliveryState::TransactionalState(_))
    ));
    assert!(tracker.settled());

    peer_task.await.unwrap();
}
