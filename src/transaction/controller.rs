//! The transaction controller: a coordinator link plus the
//! Declare/Discharge state machine.

use bytes::{BufMut, BytesMut};
use fe2o3_amqp_types::{
    definitions::SenderSettleMode,
    messaging::{message::__private::Serializable, DeliveryState, Message, MESSAGE_FORMAT},
    primitives::Array,
    transaction::{Coordinator, Declare, Discharge, TransactionId, TxnCapability},
};
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::{
    link::{
        error::{AttachError, SendError},
        sender::{attach_sender_link, SenderInner, SenderLinkSpec, Sent},
        SettlementOutcome,
    },
    session::Session,
    Payload,
};

use super::{CurrentTransaction, TransactionError};

#[derive(Debug)]
enum ControllerState {
    /// No transaction is live
    Idle,

    /// A Declare has been accepted and the transaction is live
    Active { txn_id: TransactionId },
}

/// The per-session transaction controller.
///
/// Owns the coordinator link (a sender-role link whose target is a
/// [`Coordinator`]) and serializes the Declare/Discharge exchanges. At
/// most one non-terminal transaction exists per session.
#[derive(Debug)]
pub(crate) struct TxnController {
    link: SenderInner,
    state: ControllerState,

    /// Set once the coordinator link is lost; a later begin attaches a
    /// fresh coordinator
    detached: bool,
}

impl TxnController {
    /// Attaches the coordinator link on the session
    pub(crate) async fn attach(session: &mut Session) -> Result<TxnController, TransactionError> {
        let coordinator = Coordinator {
            capabilities: Some(Array(vec![TxnCapability::LocalTransactions])),
        };
        let spec = SenderLinkSpec {
            name: session.next_link_name("txn-controller"),
            target: Some(coordinator.into()),
            snd_settle_mode: SenderSettleMode::Unsettled,
            auto_settle: true,
            properties: None,
            offered_capabilities: None,
            desired_capabilities: None,
            request_timeout: session.timeouts.request,
            send_timeout: session.timeouts.send,
        };

        let link = attach_sender_link(session, spec)
            .await
            .map_err(|err| match err {
                AttachError::RefusedByRemote(condition) => {
                    TransactionError::DeclarationFailed(condition)
                }
                AttachError::OperationTimedOut => TransactionError::OperationTimedOut,
                AttachError::SessionRemotelyClosed(condition) => {
                    TransactionError::DeclarationFailed(condition)
                }
                _ => TransactionError::DeclarationFailed(None),
            })?;

        Ok(TxnController {
            link,
            state: ControllerState::Idle,
            detached: false,
        })
    }

    /// Whether the coordinator link has been lost
    pub(crate) fn is_detached(&self) -> bool {
        self.detached
    }

    /// Declares a new transaction; on acceptance the txn-id is published
    /// into the session's current-txn slot.
    pub(crate) async fn begin(
        &mut self,
        current: &CurrentTransaction,
    ) -> Result<(), TransactionError> {
        if matches!(self.state, ControllerState::Active { .. }) {
            return Err(TransactionError::IllegalState);
        }

        let payload = encode_control_message(Declare { global_id: None })?;
        let outcome = self.exchange(payload).await?;

        match outcome {
            Some(DeliveryState::Declared(declared)) => {
                debug!(txn_id = ?declared.txn_id, "Transaction declared");
                *current.lock() = Some(declared.txn_id.clone());
                self.state = ControllerState::Active {
                    txn_id: declared.txn_id,
                };
                Ok(())
            }
            Some(DeliveryState::Rejected(rejected)) => {
                Err(TransactionError::DeclarationFailed(rejected.error))
            }
            _ => Err(TransactionError::DeclarationFailed(None)),
        }
    }

    /// Discharges the live transaction: commit when `fail` is false,
    /// rollback when true. Returns the controller to idle either way.
    pub(crate) async fn discharge(
        &mut self,
        current: &CurrentTransaction,
        fail: bool,
    ) -> Result<(), TransactionError> {
        let txn_id = match &self.state {
            ControllerState::Active { txn_id } => txn_id.clone(),
            ControllerState::Idle => return Err(TransactionError::NotActive),
        };

        // Whatever the coordinator answers, the transaction is over for
        // the stamping of new work
        *current.lock() = None;
        self.state = ControllerState::Idle;

        let payload = encode_control_message(Discharge {
            txn_id,
            fail: Some(fail),
        })?;
        let outcome = self.exchange(payload).await?;

        match outcome {
            Some(DeliveryState::Accepted(_)) => Ok(()),
            Some(DeliveryState::Rejected(rejected)) => {
                Err(TransactionError::RolledBack(rejected.error))
            }
            _ => Err(TransactionError::RolledBack(None)),
        }
    }

    /// Sends one control message unsettled and waits for its disposition
    async fn exchange(
        &mut self,
        payload: Payload,
    ) -> Result<Option<DeliveryState>, TransactionError> {
        let deadline = Instant::now() + self.link.request_timeout;
        let sent = self
            .link
            .send_payload(payload, MESSAGE_FORMAT, Some(false), None, Some(deadline))
            .await
            .map_err(|err| self.control_send_error(err))?;

        let outcome_rx = match sent {
            Sent::Unsettled { outcome_rx, .. } => outcome_rx,
            // The coordinator link never negotiates a settled mode
            Sent::Settled { .. } => return Err(TransactionError::IllegalState),
        };

        let outcome = match tokio::time::timeout(self.link.request_timeout, outcome_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_recv_error)) => {
                self.detached = true;
                return Err(TransactionError::DeclarationFailed(None));
            }
            Err(_elapsed) => {
                // A late answer is honoured by the engine but the
                // client-side transaction is treated as never begun
                return Err(TransactionError::OperationTimedOut);
            }
        };

        match outcome {
            SettlementOutcome::Disposition { state, .. } => Ok(state),
            SettlementOutcome::LinkClosed(condition) => {
                self.detached = true;
                Err(TransactionError::DeclarationFailed(condition))
            }
            SettlementOutcome::SessionClosed(condition) => {
                self.detached = true;
                Err(TransactionError::DeclarationFailed(condition))
            }
            SettlementOutcome::ConnectionClosed => {
                self.detached = true;
                Err(TransactionError::DeclarationFailed(None))
            }
        }
    }

    fn control_send_error(&mut self, err: SendError) -> TransactionError {
        match err {
            SendError::SendTimedOut | SendError::OperationTimedOut => {
                TransactionError::OperationTimedOut
            }
            SendError::LinkRemotelyClosed(condition)
            | SendError::SessionRemotelyClosed(condition) => {
                self.detached = true;
                TransactionError::DeclarationFailed(condition)
            }
            SendError::ConnectionRemotelyClosed => {
                self.detached = true;
                TransactionError::DeclarationFailed(None)
            }
            SendError::MessageEncode(err) => TransactionError::MessageEncode(err),
            _ => TransactionError::IllegalState,
        }
    }

    /// Detaches the coordinator link, best effort
    pub(crate) async fn close(mut self) {
        let _ = self.link.close_or_detach(true, None).await;
    }
}

fn encode_control_message<T: Serialize>(body: T) -> Result<Payload, serde_amqp::Error> {
    let message = Message::builder().value(body).build();
    let mut payload = BytesMut::new();
    let mut serializer = serde_amqp::ser::Serializer::from((&mut payload).writer());
    Serializable(message).serialize(&mut serializer)?;
    Ok(payload.freeze())
}

#[cfg(test)]
mod tests {
    use bytes::Buf;
    use fe2o3_amqp_types::transaction::Declare;

    use super::encode_control_message;

    #[test]
    fn declare_message_is_encodable() {
        let payload = encode_control_message(Declare { global_id: None }).unwrap();
        assert!(!payload.is_empty());
        // AmqpValue section descriptor leads the body
        assert_eq!(payload.clone().get_u8(), 0x00);
    }
}
