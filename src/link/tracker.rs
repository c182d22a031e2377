//! The sender-side handle of one outgoing delivery

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fe2o3_amqp_types::{
    definitions::{self, DeliveryNumber, DeliveryTag, MessageFormat, Role},
    messaging::{Accepted, DeliveryState, Outcome},
    performatives::Disposition,
    transaction::TransactionalState,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::{control::SessionControl, transaction::CurrentTransaction};

use super::error::SendError;

pub(crate) type ArcSenderUnsettledMap = Arc<Mutex<HashMap<DeliveryTag, UnsettledMessage>>>;

/// How one outgoing delivery left the unsettled map
#[derive(Debug)]
pub(crate) enum SettlementOutcome {
    /// The remote reached a (usually terminal) delivery state
    Disposition {
        state: Option<DeliveryState>,
        remote_settled: bool,
    },

    /// The link was remotely detached before the delivery settled
    LinkClosed(Option<definitions::Error>),

    /// The session ended before the delivery settled
    SessionClosed(Option<definitions::Error>),

    /// The connection closed before the delivery settled
    ConnectionClosed,
}

/// An entry of the sender's unsettled map.
///
/// The session engine writes the delivery id back into the entry when the
/// transfer goes on the wire; incoming dispositions resolve the entry and
/// complete the tracker exactly once.
#[derive(Debug)]
pub(crate) struct UnsettledMessage {
    pub delivery_id: Option<DeliveryNumber>,
    pub state: Option<DeliveryState>,
    sender: Option<oneshot::Sender<SettlementOutcome>>,
}

impl UnsettledMessage {
    pub fn new(sender: oneshot::Sender<SettlementOutcome>) -> Self {
        Self {
            delivery_id: None,
            state: None,
            sender: Some(sender),
        }
    }

    /// Completes the tracker. Later calls are no-ops, which keeps the
    /// settle-exactly-once invariant even when a disposition is followed
    /// by a link teardown.
    pub fn resolve(&mut self, outcome: SettlementOutcome) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(outcome);
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.sender.is_none()
    }
}

#[derive(Debug)]
enum TrackerState {
    /// Settled at send time; no remote disposition is expected
    PreSettled,

    /// Waiting for the remote disposition
    Pending(oneshot::Receiver<SettlementOutcome>),

    /// The settlement future has completed
    Resolved {
        state: Option<DeliveryState>,
        remote_settled: bool,
    },

    /// The settlement future completed with a failure
    Failed(SendError),
}

/// Tracks the settlement of one sent message.
///
/// The settlement future completes exactly once; after completion the
/// remote state and the settled flags are stable.
#[derive(Debug)]
pub struct Tracker {
    pub(crate) delivery_tag: DeliveryTag,
    pub(crate) message_format: MessageFormat,
    pub(crate) local_state: Option<DeliveryState>,
    pub(crate) locally_settled: bool,

    state: TrackerState,

    pub(crate) unsettled: ArcSenderUnsettledMap,
    pub(crate) session_control: mpsc::Sender<SessionControl>,
    pub(crate) current_txn: CurrentTransaction,
}

impl Tracker {
    pub(crate) fn pre_settled(
        delivery_tag: DeliveryTag,
        message_format: MessageFormat,
        local_state: Option<DeliveryState>,
        unsettled: ArcSenderUnsettledMap,
        session_control: mpsc::Sender<SessionControl>,
        current_txn: CurrentTransaction,
    ) -> Self {
        Self {
            delivery_tag,
            message_format,
            local_state,
            locally_settled: true,
            state: TrackerState::PreSettled,
            unsettled,
            session_control,
            current_txn,
        }
    }

    pub(crate) fn unsettled(
        delivery_tag: DeliveryTag,
        message_format: MessageFormat,
        local_state: Option<DeliveryState>,
        receiver: oneshot::Receiver<SettlementOutcome>,
        unsettled: ArcSenderUnsettledMap,
        session_control: mpsc::Sender<SessionControl>,
        current_txn: CurrentTransaction,
    ) -> Self {
        Self {
            delivery_tag,
            message_format,
            local_state,
            locally_settled: false,
            state: TrackerState::Pending(receiver),
            unsettled,
            session_control,
            current_txn,
        }
    }

    /// The delivery tag of the tracked message
    pub fn delivery_tag(&self) -> &DeliveryTag {
        &self.delivery_tag
    }

    /// The message format of the tracked message
    pub fn message_format(&self) -> MessageFormat {
        self.message_format
    }

    /// The local delivery state stamped onto the transfer
    pub fn state(&self) -> &Option<DeliveryState> {
        &self.local_state
    }

    /// Whether the delivery is settled locally
    pub fn settled(&mut self) -> bool {
        self.poll_resolution();
        self.locally_settled
    }

    /// Whether the remote peer has settled the delivery
    pub fn remote_settled(&mut self) -> bool {
        self.poll_resolution();
        match &self.state {
            TrackerState::Resolved { remote_settled, .. } => *remote_settled,
            _ => false,
        }
    }

    /// The delivery state asserted by the remote peer, if already known
    pub fn remote_state(&mut self) -> Option<DeliveryState> {
        self.poll_resolution();
        match &self.state {
            TrackerState::Resolved { state, .. } => state.clone(),
            _ => None,
        }
    }

    /// Opportunistically observes an already-delivered settlement without
    /// blocking
    fn poll_resolution(&mut self) {
        if let TrackerState::Pending(receiver) = &mut self.state {
            if let Ok(outcome) = receiver.try_recv() {
                self.apply_outcome(outcome);
            }
        }
    }

    fn apply_outcome(&mut self, outcome: SettlementOutcome) {
        match outcome {
            SettlementOutcome::Disposition {
                state,
                remote_settled,
            } => {
                if remote_settled {
                    // Auto-settle took effect on the engine side
                    self.locally_settled = true;
                }
                self.state = TrackerState::Resolved {
                    state,
                    remote_settled,
                };
            }
            SettlementOutcome::LinkClosed(condition) => {
                self.state = TrackerState::Failed(SendError::LinkRemotelyClosed(condition));
            }
            SettlementOutcome::SessionClosed(condition) => {
                self.state = TrackerState::Failed(SendError::SessionRemotelyClosed(condition));
            }
            SettlementOutcome::ConnectionClosed => {
                self.state = TrackerState::Failed(SendError::ConnectionRemotelyClosed);
            }
        }
    }

    /// Waits until the remote peer reaches a terminal delivery state and
    /// returns the outcome.
    ///
    /// A pre-settled delivery resolves immediately with `Accepted`.
    /// Completion happens exactly once; repeated calls return the cached
    /// outcome.
    pub async fn await_settlement(&mut self) -> Result<Outcome, SendError> {
        if let TrackerState::Pending(receiver) = &mut self.state {
            let outcome = (&mut *receiver)
                .await
                .unwrap_or(SettlementOutcome::ConnectionClosed);
            self.apply_outcome(outcome);
        }

        match &self.state {
            TrackerState::PreSettled => Ok(Outcome::Accepted(Accepted {})),
            _ => self.resolved_outcome(),
        }
    }

    /// Like [`await_settlement`](Self::await_settlement) bounded by a
    /// deadline
    pub async fn await_settlement_with_timeout(
        &mut self,
        duration: Duration,
    ) -> Result<Outcome, SendError> {
        tokio::time::timeout(duration, self.await_settlement())
            .await
            .map_err(|_elapsed| SendError::OperationTimedOut)?
    }

    fn resolved_outcome(&mut self) -> Result<Outcome, SendError> {
        match &self.state {
            TrackerState::Resolved { state, .. } => match state {
                Some(state) => outcome_of_state(state.clone()),
                None => Err(SendError::IllegalDeliveryState),
            },
            TrackerState::Failed(error) => Err(duplicate_send_error(error)),
            _ => Err(SendError::IllegalState),
        }
    }

    /// Settles the delivery locally, informing the remote peer with a
    /// settled disposition when the delivery id is known.
    ///
    /// This is only needed when the sender was opened with auto-settle
    /// disabled.
    pub async fn settle(&mut self) -> Result<(), SendError> {
        self.poll_resolution();
        if self.locally_settled {
            return Ok(());
        }

        let state = match &self.state {
            TrackerState::Resolved { state, .. } => state.clone(),
            _ => self.local_state.clone(),
        };
        self.send_disposition(state, true).await?;
        self.locally_settled = true;
        Ok(())
    }

    /// Emits a disposition with the given state.
    ///
    /// The state is wrapped in a transactional state when a transaction is
    /// active on the owning session.
    pub async fn disposition(
        &mut self,
        state: Option<DeliveryState>,
        settled: bool,
    ) -> Result<(), SendError> {
        self.send_disposition(state, settled).await?;
        if settled {
            self.locally_settled = true;
        }
        Ok(())
    }

    async fn send_disposition(
        &mut self,
        state: Option<DeliveryState>,
        settled: bool,
    ) -> Result<(), SendError> {
        let delivery_id = {
            let mut guard = self.unsettled.lock();
            match guard.get(&self.delivery_tag).and_then(|msg| msg.delivery_id) {
                Some(id) => {
                    if settled {
                        guard.remove(&self.delivery_tag);
                    }
                    id
                }
                // Nothing on the wire to dispose of
                None => return Ok(()),
            }
        };

        let state = wrap_in_current_txn(&self.current_txn, state);
        let disposition = Disposition {
            role: Role::Sender,
            first: delivery_id,
            last: None,
            settled,
            state,
            batchable: false,
        };
        self.session_control
            .send(SessionControl::Disposition(disposition))
            .await
            .map_err(|_| SendError::IllegalState)?;
        Ok(())
    }
}

/// Wraps a delivery state in the session's active transaction, when one is
/// active
pub(crate) fn wrap_in_current_txn(
    current_txn: &CurrentTransaction,
    state: Option<DeliveryState>,
) -> Option<DeliveryState> {
    let guard = current_txn.lock();
    match &*guard {
        Some(txn_id) => {
            let outcome = state.and_then(|state| match state {
                DeliveryState::Accepted(v) => Some(Outcome::Accepted(v)),
                DeliveryState::Rejected(v) => Some(Outcome::Rejected(v)),
                DeliveryState::Released(v) => Some(Outcome::Released(v)),
                DeliveryState::Modified(v) => Some(Outcome::Modified(v)),
                _ => None,
            });
            Some(DeliveryState::TransactionalState(TransactionalState {
                txn_id: txn_id.clone(),
                outcome,
            }))
        }
        None => state,
    }
}

fn outcome_of_state(state: DeliveryState) -> Result<Outcome, SendError> {
    match state {
        DeliveryState::Accepted(accepted) => Ok(Outcome::Accepted(accepted)),
        DeliveryState::Rejected(rejected) => Ok(Outcome::Rejected(rejected)),
        DeliveryState::Released(released) => Ok(Outcome::Released(released)),
        DeliveryState::Modified(modified) => Ok(Outcome::Modified(modified)),
        // The provisional outcome of a transactional transfer is carried
        // inside the transactional state
        DeliveryState::TransactionalState(txn_state) => match txn_state.outcome {
            Some(outcome) => Ok(outcome),
            None => Err(SendError::IllegalDeliveryState),
        },
        DeliveryState::Received(_) | DeliveryState::Declared(_) => {
            Err(SendError::IllegalDeliveryState)
        }
    }
}

fn duplicate_send_error(error: &SendError) -> SendError {
    match error {
        SendError::LinkRemotelyClosed(condition) => {
            SendError::LinkRemotelyClosed(condition.clone())
        }
        SendError::SessionRemotelyClosed(condition) => {
            SendError::SessionRemotelyClosed(condition.clone())
        }
        SendError::ConnectionRemotelyClosed => SendError::ConnectionRemotelyClosed,
        SendError::SendTimedOut => SendError::SendTimedOut,
        SendError::OperationTimedOut => SendError::OperationTimedOut,
        SendError::IllegalDeliveryState => SendError::IllegalDeliveryState,
        _ => SendError::IllegalState,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use fe2o3_amqp_types::messaging::{Accepted, DeliveryState, Outcome};
    use parking_lot::Mutex;
    use serde_bytes::ByteBuf;
    use tokio::sync::{mpsc, oneshot};

    use super::{SettlementOutcome, Tracker, UnsettledMessage};

    fn tracker_pair() -> (Tracker, oneshot::Sender<SettlementOutcome>) {
        let (tx, rx) = oneshot::channel();
        let (control_tx, _control_rx) = mpsc::channel(1);
        let tracker = Tracker::unsettled(
            ByteBuf::from(vec![0u8]),
            0,
            None,
            rx,
            Arc::new(Mutex::new(HashMap::new())),
            control_tx,
            Arc::new(Mutex::new(None)),
        );
        (tracker, tx)
    }

    #[tokio::test]
    async fn settlement_completes_once_and_is_cached() {
        let (mut tracker, tx) = tracker_pair();
        tx.send(SettlementOutcome::Disposition {
            state: Some(DeliveryState::Accepted(Accepted {})),
            remote_settled: true,
        })
        .unwrap();

        let outcome = tracker.await_settlement().await.unwrap();
        assert!(matches!(outcome, Outcome::Accepted(_)));
        assert!(tracker.remote_settled());
        assert!(tracker.settled());

        // Cached thereafter
        let outcome = tracker.await_settlement().await.unwrap();
        assert!(matches!(outcome, Outcome::Accepted(_)));
    }

    #[tokio::test]
    async fn unresolved_entry_resolves_only_once() {
        let (tx, mut rx) = oneshot::channel();
        let mut entry = UnsettledMessage::new(tx);
        entry.resolve(SettlementOutcome::Disposition {
            state: None,
            remote_settled: true,
        });
        assert!(entry.is_resolved());
        entry.resolve(SettlementOutcome::ConnectionClosed);

        let outcome = rx.try_recv().unwrap();
        assert!(matches!(
            outcome,
            SettlementOutcome::Disposition {
                remote_settled: true,
                ..
            }
        ));
    }
}
