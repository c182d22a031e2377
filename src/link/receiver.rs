//! Implementation of the AMQP 1.0 receiver link

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use fe2o3_amqp_types::{
    definitions::{self, DeliveryNumber, DeliveryTag, MessageFormat, ReceiverSettleMode, Role},
    messaging::{Accepted, DeliveryState, Modified, Rejected, Released, Source, Target, TargetArchetype},
    performatives::{Disposition, Transfer},
    primitives::Symbol,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

use crate::{control::SessionControl, session::Session, transaction::CurrentTransaction, Payload};

use super::{
    allocate_link,
    delivery::Delivery,
    error::{AttachError, DetachError, DispositionError, RecvError},
    exchange_attach,
    frame::LinkFrame,
    options::{default_outcome, default_outcomes, ReceiverOptions},
    sender::ClosedCause,
    state::{LinkFlowState, LinkFlowStateInner, LinkState},
    tracker::wrap_in_current_txn,
    ArcReceiverUnsettledMap, LinkCore, LinkRelay, DEFAULT_LINK_BUFFER_SIZE,
};

impl ClosedCause {
    fn as_recv_error(&self) -> RecvError {
        match self {
            Self::Link(condition) => RecvError::LinkRemotelyClosed(condition.clone()),
            Self::Session(condition) => RecvError::SessionRemotelyClosed(condition.clone()),
            Self::Connection => RecvError::ConnectionRemotelyClosed,
        }
    }
}

/// A delivery that spans multiple transfer frames and is still being
/// accumulated
#[derive(Debug)]
struct IncompleteDelivery {
    delivery_id: DeliveryNumber,
    delivery_tag: DeliveryTag,
    message_format: Option<MessageFormat>,
    settled: bool,
    buffer: BytesMut,
}

/// A received delivery whose post-receive policy (auto-accept, credit
/// top-up) has not been handed to the application yet.
///
/// `recv` futures are droppable at any await point (`recv_with_timeout`
/// wraps one in a timeout); keeping the delivery here lets a retried
/// `recv` resume it instead of losing the message.
#[derive(Debug)]
struct PendingReceive {
    delivery: Delivery,
    disposed: bool,
}

/// An AMQP 1.0 receiver link.
///
/// ```rust,ignore
/// let mut receiver = session.open_receiver("q1").await?;
/// let delivery = receiver.recv().await?;
/// // auto-accept is on by default; with it off:
/// // receiver.accept(&delivery).await?;
/// receiver.close().await?;
/// ```
#[derive(Debug)]
pub struct Receiver {
    pub(crate) inner: ReceiverInner,
}

#[derive(Debug)]
pub(crate) struct ReceiverInner {
    pub core: LinkCore,
    pub unsettled: ArcReceiverUnsettledMap,

    pub outgoing: mpsc::Sender<LinkFrame>,
    pub incoming: mpsc::Receiver<LinkFrame>,
    pub session_control: mpsc::Sender<SessionControl>,
    pub current_txn: CurrentTransaction,

    pub credit_window: u32,
    pub auto_accept: bool,
    pub auto_settle: bool,
    pub request_timeout: Duration,

    incomplete: Option<IncompleteDelivery>,
    pending: Option<PendingReceive>,
    closed_cause: Option<ClosedCause>,
}

impl Drop for ReceiverInner {
    fn drop(&mut self) {
        if let Some(handle) = self.core.local_handle.take() {
            let detach = fe2o3_amqp_types::performatives::Detach {
                handle: handle.into(),
                closed: true,
                error: None,
            };
            let _ = self.outgoing.try_send(LinkFrame::Detach(detach));
            let _ = self
                .session_control
                .try_send(SessionControl::DeallocateLink(self.core.name.clone()));
        }
    }
}

impl Receiver {
    pub(crate) async fn attach(
        session: &mut Session,
        options: ReceiverOptions,
        address: Option<String>,
    ) -> Result<Receiver, AttachError> {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| session.next_link_name("receiver"));

        let flow_state = Arc::new(LinkFlowState::receiver(LinkFlowStateInner {
            initial_delivery_count: 0,
            delivery_count: 0,
            link_credit: 0,
            available: 0,
            drain: false,
            properties: options.properties.clone(),
        }));
        let unsettled: ArcReceiverUnsettledMap = Arc::new(Mutex::new(Default::default()));

        let (incoming_tx, mut incoming_rx) = mpsc::channel(DEFAULT_LINK_BUFFER_SIZE);
        let relay = LinkRelay::Receiver {
            tx: incoming_tx,
            local_handle: None,
            flow_state: flow_state.clone(),
            unsettled: unsettled.clone(),
            receiver_settle_mode: ReceiverSettleMode::First,
            more: false,
        };

        let local_handle = allocate_link(&session.control, name.clone(), relay).await?;

        let mut source_builder = Source::builder()
            .durable(options.durability.clone())
            .expiry_policy(options.expiry_policy.clone())
            .outcomes(default_outcomes())
            .default_outcome(default_outcome());
        match (&address, options.dynamic) {
            (_, true) => source_builder = source_builder.dynamic(true),
            (Some(address), false) => source_builder = source_builder.address(address.clone()),
            (None, false) => {}
        }
        if let Some(capabilities) = options.source_capabilities.clone() {
            source_builder = source_builder.capabilities(capabilities);
        }

        let mut core = LinkCore {
            local_state: LinkState::Unattached,
            name: name.clone(),
            local_handle: Some(local_handle),
            remote_handle: None,
            snd_settle_mode: Default::default(),
            rcv_settle_mode: ReceiverSettleMode::First,
            source: Some(source_builder.build()),
            target: Some(TargetArchetype::Target(Target::builder().build())),
            max_message_size: 0,
            offered_capabilities: options.offered_capabilities.clone(),
            desired_capabilities: options.desired_capabilities.clone(),
            properties: options.properties.clone(),
            flow_state,
        };

        let request_timeout = options.request_timeout.unwrap_or(session.timeouts.request);
        let attach_result = tokio::time::timeout(
            request_timeout,
            exchange_attach(
                &mut core,
                Role::Receiver,
                &session.outgoing,
                &mut incoming_rx,
            ),
        )
        .await;

        match attach_result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = session
                    .control
                    .send(SessionControl::DeallocateLink(name))
                    .await;
                return Err(err);
            }
            Err(_elapsed) => {
                let _ = session
                    .control
                    .send(SessionControl::DeallocateLink(name))
                    .await;
                return Err(AttachError::OperationTimedOut);
            }
        }

        let mut receiver = Receiver {
            inner: ReceiverInner {
                core,
                unsettled,
                outgoing: session.outgoing.clone(),
                incoming: incoming_rx,
                session_control: session.control.clone(),
                current_txn: session.current_txn.clone(),
                credit_window: options.credit_window,
                auto_accept: options.auto_accept,
                auto_settle: options.auto_settle,
                request_timeout,
                incomplete: None,
                pending: None,
                closed_cause: None,
            },
        };

        // Open the initial credit window
        if receiver.inner.credit_window > 0 {
            let window = receiver.inner.credit_window;
            receiver.inner.send_flow(window, false).await.map_err(|_| {
                AttachError::IllegalSessionState
            })?;
        }

        Ok(receiver)
    }

    /// The name of the link
    pub fn name(&self) -> &str {
        &self.inner.core.name
    }

    /// The link's source, as returned by the remote peer.
    ///
    /// A dynamic receiver finds the peer-assigned address here.
    pub fn source(&self) -> Option<&Source> {
        self.inner.core.source.as_ref()
    }

    /// The address of the source terminus, when one is known
    pub fn source_address(&self) -> Option<&str> {
        self.inner
            .core
            .source
            .as_ref()
            .and_then(|source| source.address.as_deref())
    }

    /// The link properties
    pub fn properties(&self) -> Option<&definitions::Fields> {
        self.inner.core.properties.as_ref()
    }

    /// Capabilities offered on the attach
    pub fn offered_capabilities(&self) -> Option<&Vec<Symbol>> {
        self.inner.core.offered_capabilities.as_ref()
    }

    /// Capabilities desired on the attach
    pub fn desired_capabilities(&self) -> Option<&Vec<Symbol>> {
        self.inner.core.desired_capabilities.as_ref()
    }

    /// Receives the next delivery, blocking until one arrives or the link,
    /// session, or connection terminates.
    ///
    /// When auto-accept is on, the delivery is accepted (and settled per
    /// auto-settle) before it is returned, and the credit window is topped
    /// up.
    pub async fn recv(&mut self) -> Result<Delivery, RecvError> {
        loop {
            // A delivery left behind by a cancelled recv is handed over
            // first, even when the link has been torn down since
            if let Some(delivery) = self.inner.finish_pending_receive().await {
                return Ok(delivery);
            }
            if let Some(cause) = &self.inner.closed_cause {
                return Err(cause.as_recv_error());
            }

            let frame = self.inner.incoming.recv().await;
            if let Some(delivery) = self.inner.apply_frame(frame)? {
                self.inner.pending = Some(PendingReceive {
                    delivery,
                    disposed: false,
                });
            }
        }
    }

    /// Like [`recv`](Self::recv) bounded by a timeout; returns `Ok(None)`
    /// when the timeout fires first.
    pub async fn recv_with_timeout(
        &mut self,
        duration: Duration,
    ) -> Result<Option<Delivery>, RecvError> {
        match tokio::time::timeout(duration, self.recv()).await {
            Ok(result) => result.map(Some),
            Err(_elapsed) => Ok(None),
        }
    }

    /// Returns the next delivery when one is already queued; never blocks
    /// for new deliveries.
    pub async fn try_recv(&mut self) -> Result<Option<Delivery>, RecvError> {
        loop {
            if let Some(delivery) = self.inner.finish_pending_receive().await {
                return Ok(Some(delivery));
            }
            if let Some(cause) = &self.inner.closed_cause {
                return Err(cause.as_recv_error());
            }

            let frame = match self.inner.incoming.try_recv() {
                Ok(frame) => Some(frame),
                Err(mpsc::error::TryRecvError::Empty) => return Ok(None),
                Err(mpsc::error::TryRecvError::Disconnected) => None,
            };
            if let Some(delivery) = self.inner.apply_frame(frame)? {
                self.inner.pending = Some(PendingReceive {
                    delivery,
                    disposed: false,
                });
            }
        }
    }

    /// Grants `credit` additional message credits to the sender
    pub async fn add_credit(&mut self, credit: u32) -> Result<(), DispositionError> {
        let current = self.inner.core.flow_state.link_credit();
        self.inner.send_flow(current + credit, false).await
    }

    /// Asks the sender to drain the currently granted credit
    pub async fn drain(&mut self) -> Result<(), DispositionError> {
        let current = self.inner.core.flow_state.link_credit();
        self.inner.send_flow(current, true).await
    }

    /// Accepts the delivery.
    ///
    /// Settlement follows the receiver's auto-settle option.
    pub async fn accept(&mut self, delivery: &Delivery) -> Result<(), DispositionError> {
        let settled = self.inner.auto_settle;
        self.inner
            .dispose(delivery, DeliveryState::Accepted(Accepted {}), settled)
            .await
    }

    /// Rejects the delivery with an optional error condition
    pub async fn reject(
        &mut self,
        delivery: &Delivery,
        error: impl Into<Option<definitions::Error>>,
    ) -> Result<(), DispositionError> {
        let settled = self.inner.auto_settle;
        self.inner
            .dispose(
                delivery,
                DeliveryState::Rejected(Rejected {
                    error: error.into(),
                }),
                settled,
            )
            .await
    }

    /// Releases the delivery back to the sender
    pub async fn release(&mut self, delivery: &Delivery) -> Result<(), DispositionError> {
        let settled = self.inner.auto_settle;
        self.inner
            .dispose(delivery, DeliveryState::Released(Released {}), settled)
            .await
    }

    /// Modifies the delivery
    pub async fn modify(
        &mut self,
        delivery: &Delivery,
        modified: Modified,
    ) -> Result<(), DispositionError> {
        let settled = self.inner.auto_settle;
        self.inner
            .dispose(delivery, DeliveryState::Modified(modified), settled)
            .await
    }

    /// Emits a disposition with an explicit state and settlement.
    ///
    /// The state is wrapped in a transactional state while a transaction
    /// is active on the session.
    pub async fn dispose(
        &mut self,
        delivery: &Delivery,
        state: DeliveryState,
        settled: bool,
    ) -> Result<(), DispositionError> {
        self.inner.dispose(delivery, state, settled).await
    }

    /// Closes the link with a closing Detach
    pub async fn close(mut self) -> Result<(), DetachError> {
        self.inner.close_or_detach(true, None).await
    }

    /// Closes the link with an error condition
    pub async fn close_with_error(
        mut self,
        error: impl Into<definitions::Error>,
    ) -> Result<(), DetachError> {
        self.inner.close_or_detach(true, Some(error.into())).await
    }

    /// Detaches the link without closing it
    pub async fn detach(mut self) -> Result<(), DetachError> {
        self.inner.close_or_detach(false, None).await
    }
}

impl ReceiverInner {
    /// Applies one frame from the session engine; returns a delivery when
    /// one became complete
    fn apply_frame(&mut self, frame: Option<LinkFrame>) -> Result<Option<Delivery>, RecvError> {
        let cause = match frame {
            Some(LinkFrame::Transfer {
                performative,
                payload,
                ..
            }) => return self.on_incoming_transfer(performative, payload),
            None | Some(LinkFrame::ConnectionClosed) => ClosedCause::Connection,
            Some(LinkFrame::SessionClosed(error)) => ClosedCause::Session(error),
            Some(LinkFrame::Detach(detach)) => {
                let error = detach.error.clone();
                let _ = self.core.on_incoming_detach(&detach);
                if matches!(self.core.local_state, LinkState::CloseReceived) {
                    if let Ok(reply) = self.core.make_detach(true, None) {
                        let _ = self.outgoing.try_send(LinkFrame::Detach(reply));
                    }
                }
                ClosedCause::Link(error)
            }
            Some(_) => return Ok(None),
        };

        let error = cause.as_recv_error();
        self.closed_cause = Some(cause);
        Err(error)
    }

    fn on_incoming_transfer(
        &mut self,
        transfer: Transfer,
        payload: Payload,
    ) -> Result<Option<Delivery>, RecvError> {
        trace!(frame = ?transfer, "RECV");

        if transfer.aborted {
            self.incomplete = None;
            return Ok(None);
        }

        let more = transfer.more;
        let (delivery_id, delivery_tag, message_format, settled, payload) =
            match self.incomplete.take() {
                // Continuation of a multi-transfer delivery
                Some(mut incomplete) => {
                    incomplete.buffer.put(payload);
                    if more {
                        self.incomplete = Some(incomplete);
                        return Ok(None);
                    }
                    (
                        incomplete.delivery_id,
                        incomplete.delivery_tag,
                        incomplete.message_format,
                        incomplete.settled,
                        incomplete.buffer.freeze(),
                    )
                }
                None => {
                    let delivery_id =
                        transfer.delivery_id.ok_or(RecvError::MalformedTransfer)?;
                    let delivery_tag = transfer
                        .delivery_tag
                        .clone()
                        .ok_or(RecvError::MalformedTransfer)?;
                    let settled = transfer.settled.unwrap_or(false);

                    if more {
                        let mut buffer = BytesMut::new();
                        buffer.put(payload);
                        self.incomplete = Some(IncompleteDelivery {
                            delivery_id,
                            delivery_tag,
                            message_format: transfer.message_format,
                            settled,
                            buffer,
                        });
                        return Ok(None);
                    }
                    (
                        delivery_id,
                        delivery_tag,
                        transfer.message_format,
                        settled,
                        payload,
                    )
                }
            };

        if !settled {
            self.unsettled.lock().insert(delivery_tag.clone(), None);
        }

        Ok(Some(Delivery {
            delivery_id,
            delivery_tag,
            message_format,
            remote_settled: settled,
            payload,
            message: None,
        }))
    }

    /// Runs the post-receive policy (auto-accept, credit-window top-up)
    /// for the pending delivery, then hands it over.
    ///
    /// Every step is resumable: the disposition is marked sent only once
    /// its channel send has completed, so a recv cancelled part-way never
    /// drops the delivery and never queues the disposition twice. Channel
    /// failures are not surfaced here; the teardown they imply fails the
    /// next receive with its cause.
    async fn finish_pending_receive(&mut self) -> Option<Delivery> {
        let (delivery_id, delivery_tag, remote_settled, disposed) = match &self.pending {
            Some(pending) => (
                pending.delivery.delivery_id,
                pending.delivery.delivery_tag.clone(),
                pending.delivery.remote_settled,
                pending.disposed,
            ),
            None => return None,
        };

        if self.auto_accept && !remote_settled && !disposed {
            let settled = self.auto_settle;
            let sent = self
                .dispose_parts(
                    delivery_id,
                    &delivery_tag,
                    DeliveryState::Accepted(Accepted {}),
                    settled,
                )
                .await
                .is_ok();
            if sent {
                if let Some(pending) = self.pending.as_mut() {
                    pending.disposed = true;
                }
            }
        }

        if self.credit_window > 0 {
            let window = self.credit_window;
            let _ = self.send_flow(window, false).await;
        }

        self.pending.take().map(|pending| pending.delivery)
    }

    async fn send_flow(&mut self, link_credit: u32, drain: bool) -> Result<(), DispositionError> {
        let local_handle = self
            .core
            .local_handle
            .ok_or(DispositionError::IllegalSessionState)?;
        let flow = self
            .core
            .flow_state
            .set_credit(link_credit, drain, local_handle);
        self.outgoing
            .send(LinkFrame::Flow(flow))
            .await
            .map_err(|_| DispositionError::IllegalSessionState)
    }

    async fn dispose(
        &mut self,
        delivery: &Delivery,
        state: DeliveryState,
        settled: bool,
    ) -> Result<(), DispositionError> {
        self.dispose_parts(delivery.delivery_id, &delivery.delivery_tag, state, settled)
            .await
    }

    async fn dispose_parts(
        &mut self,
        delivery_id: DeliveryNumber,
        delivery_tag: &DeliveryTag,
        state: DeliveryState,
        settled: bool,
    ) -> Result<(), DispositionError> {
        let state = wrap_in_current_txn(&self.current_txn, Some(state));
        let disposition = Disposition {
            role: Role::Receiver,
            first: delivery_id,
            last: None,
            settled,
            state,
            batchable: false,
        };
        // Same FIFO as the flow frames, so a following credit top-up can
        // never overtake the disposition on the wire
        self.outgoing
            .send(LinkFrame::Disposition(disposition))
            .await
            .map_err(|_| DispositionError::IllegalSessionState)?;

        if settled {
            self.unsettled.lock().remove(delivery_tag);
        }
        Ok(())
    }

    async fn close_or_detach(
        &mut self,
        closed: bool,
        error: Option<definitions::Error>,
    ) -> Result<(), DetachError> {
        if self.closed_cause.is_some() {
            self.core.local_handle = None;
            return Ok(());
        }

        let detach = self
            .core
            .make_detach(closed, error)
            .map_err(|_| DetachError::IllegalState)?;
        self.outgoing
            .send(LinkFrame::Detach(detach))
            .await
            .map_err(|_| DetachError::IllegalSessionState)?;

        let deadline = Instant::now() + self.request_timeout;
        let result = loop {
            let frame = tokio::select! {
                frame = self.incoming.recv() => frame,
                _ = tokio::time::sleep_until(deadline) => break Err(DetachError::OperationTimedOut),
            };

            match frame {
                Some(LinkFrame::Detach(remote_detach)) => {
                    let remote_error = remote_detach.error.clone();
                    let remote_closed = remote_detach.closed;
                    let _ = self.core.on_incoming_detach(&remote_detach);

                    break match (remote_error, remote_closed, closed) {
                        (Some(err), _, _) => Err(DetachError::RemoteDetachedWithError(err)),
                        (None, true, false) => Err(DetachError::ClosedByRemote),
                        _ => Ok(()),
                    };
                }
                Some(LinkFrame::SessionClosed(_)) | Some(LinkFrame::ConnectionClosed) | None => {
                    break Err(DetachError::ConnectionRemotelyClosed)
                }
                // Deliveries still in flight during the detach are dropped
                Some(_) => continue,
            }
        };

        self.core.local_handle = None;
        let _ = self
            .session_control
            .send(SessionControl::DeallocateLink(self.core.name.clone()))
            .await;
        result
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use fe2o3_amqp_types::performatives::Transfer;

    use super::*;

    fn receiver_inner() -> ReceiverInner {
        let (outgoing, _outgoing_rx) = mpsc::channel(8);
        let (_incoming_tx, incoming) = mpsc::channel(8);
        let (session_control, _control_rx) = mpsc::channel(8);
        ReceiverInner {
            core: LinkCore {
                local_state: LinkState::Attached,
                name: "recv-test".to_string(),
                local_handle: Some(super::super::LocalHandle(0)),
                remote_handle: Some(0),
                snd_settle_mode: Default::default(),
                rcv_settle_mode: ReceiverSettleMode::First,
                source: None,
                target: None,
                max_message_size: 0,
                offered_capabilities: None,
                desired_capabilities: None,
                properties: None,
                flow_state: Arc::new(LinkFlowState::receiver(LinkFlowStateInner {
                    initial_delivery_count: 0,
                    delivery_count: 0,
                    link_credit: 10,
                    available: 0,
                    drain: false,
                    properties: None,
                })),
            },
            unsettled: Arc::new(Mutex::new(Default::default())),
            outgoing,
            incoming,
            session_control,
            current_txn: Arc::new(Mutex::new(None)),
            credit_window: 10,
            auto_accept: true,
            auto_settle: true,
            request_timeout: Duration::from_secs(1),
            incomplete: None,
            pending: None,
            closed_cause: None,
        }
    }

    fn transfer(delivery_id: u32, more: bool) -> Transfer {
        Transfer {
            handle: 0.into(),
            delivery_id: Some(delivery_id),
            delivery_tag: Some(serde_bytes::ByteBuf::from(vec![delivery_id as u8])),
            message_format: Some(0),
            settled: Some(false),
            more,
            rcv_settle_mode: None,
            state: None,
            resume: false,
            aborted: false,
            batchable: false,
        }
    }

    #[test]
    fn single_frame_transfer_becomes_a_delivery() {
        let mut inner = receiver_inner();
        let delivery = inner
            .on_incoming_transfer(transfer(0, false), Bytes::from_static(b"abc"))
            .unwrap()
            .unwrap();
        assert_eq!(delivery.delivery_id(), 0);
        assert_eq!(&delivery.raw_payload()[..], b"abc");
    }

    #[test]
    fn multi_frame_transfer_is_accumulated() {
        let mut inner = receiver_inner();
        assert!(inner
            .on_incoming_transfer(transfer(1, true), Bytes::from_static(b"abc"))
            .unwrap()
            .is_none());

        let mut continuation = transfer(1, false);
        continuation.delivery_id = None;
        continuation.delivery_tag = None;
        let delivery = inner
            .on_incoming_transfer(continuation, Bytes::from_static(b"def"))
            .unwrap()
            .unwrap();
        assert_eq!(&delivery.raw_payload()[..], b"abcdef");
    }

    #[tokio::test]
    async fn pending_receive_is_resumed_not_lost() {
        let (outgoing, mut outgoing_rx) = mpsc::channel(8);
        let mut inner = receiver_inner();
        inner.outgoing = outgoing;

        let delivery = inner
            .on_incoming_transfer(transfer(0, false), Bytes::from_static(b"abc"))
            .unwrap()
            .unwrap();
        inner.pending = Some(PendingReceive {
            delivery,
            disposed: false,
        });

        // The hand-off runs the post-receive policy exactly once
        let delivery = inner.finish_pending_receive().await.unwrap();
        assert_eq!(delivery.delivery_id(), 0);
        assert!(inner.pending.is_none());
        assert!(matches!(
            outgoing_rx.recv().await,
            Some(LinkFrame::Disposition(_))
        ));
        assert!(matches!(outgoing_rx.recv().await, Some(LinkFrame::Flow(_))));

        // Nothing pending any more
        assert!(inner.finish_pending_receive().await.is_none());
    }

    #[tokio::test]
    async fn resumed_receive_does_not_dispose_twice() {
        let (outgoing, mut outgoing_rx) = mpsc::channel(8);
        let mut inner = receiver_inner();
        inner.outgoing = outgoing;
        inner.credit_window = 0;

        let delivery = inner
            .on_incoming_transfer(transfer(0, false), Bytes::from_static(b"abc"))
            .unwrap()
            .unwrap();
        // As if a cancelled recv already got the disposition out
        inner.pending = Some(PendingReceive {
            delivery,
            disposed: true,
        });

        let _delivery = inner.finish_pending_receive().await.unwrap();
        assert!(matches!(
            outgoing_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn aborted_transfer_is_discarded() {
        let mut inner = receiver_inner();
        assert!(inner
            .on_incoming_transfer(transfer(2, true), Bytes::from_static(b"abc"))
            .unwrap()
            .is_none());

        let mut aborted = transfer(2, false);
        aborted.aborted = true;
        assert!(inner
            .on_incoming_transfer(aborted, Bytes::new())
            .unwrap()
            .is_none());
        assert!(inner.incomplete.is_none());
    }
}
