//! Implementation of the AMQP 1.0 sender link

use std::sync::Arc;
use std::time::Duration;

use fe2o3_amqp_types::{
    definitions::{self, DeliveryTag, MessageFormat, ReceiverSettleMode, Role, SenderSettleMode},
    messaging::{DeliveryState, Source, Target, TargetArchetype},
    performatives::Transfer,
    primitives::Symbol,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::trace;

use crate::{
    control::SessionControl,
    session::Session,
    transaction::CurrentTransaction,
    Payload,
};

use super::{
    allocate_link,
    delivery::Sendable,
    error::{AttachError, DetachError, SendError},
    exchange_attach,
    frame::LinkFrame,
    options::{default_outcome, default_outcomes, SenderOptions},
    state::{LinkFlowState, LinkFlowStateInner, LinkState},
    tracker::{ArcSenderUnsettledMap, SettlementOutcome, Tracker, UnsettledMessage},
    LinkCore, LinkRelay, DEFAULT_LINK_BUFFER_SIZE,
};

/// Which layer terminated a link that can no longer be used
#[derive(Debug, Clone)]
pub(crate) enum ClosedCause {
    Link(Option<definitions::Error>),
    Session(Option<definitions::Error>),
    Connection,
}

impl ClosedCause {
    pub(crate) fn as_send_error(&self) -> SendError {
        match self {
            Self::Link(condition) => SendError::LinkRemotelyClosed(condition.clone()),
            Self::Session(condition) => SendError::SessionRemotelyClosed(condition.clone()),
            Self::Connection => SendError::ConnectionRemotelyClosed,
        }
    }
}

/// Outcome of putting one transfer on the wire
#[derive(Debug)]
pub(crate) enum Sent {
    Settled {
        delivery_tag: DeliveryTag,
        message_format: MessageFormat,
        state: Option<DeliveryState>,
    },
    Unsettled {
        delivery_tag: DeliveryTag,
        message_format: MessageFormat,
        state: Option<DeliveryState>,
        outcome_rx: oneshot::Receiver<SettlementOutcome>,
    },
}

/// An AMQP 1.0 sender link.
///
/// ```rust,ignore
/// let mut sender = session.open_sender("q1").await?;
/// let mut tracker = sender.send("hello AMQP").await?;
/// let outcome = tracker.await_settlement().await?;
/// sender.close().await?;
/// ```
#[derive(Debug)]
pub struct Sender {
    pub(crate) inner: SenderInner,
}

#[derive(Debug)]
pub(crate) struct SenderInner {
    pub core: LinkCore,
    pub unsettled: ArcSenderUnsettledMap,

    pub outgoing: mpsc::Sender<LinkFrame>,
    pub incoming: mpsc::Receiver<LinkFrame>,
    pub session_control: mpsc::Sender<SessionControl>,
    pub current_txn: CurrentTransaction,

    pub send_timeout: Duration,
    pub request_timeout: Duration,

    /// Source of the strictly monotonic per-link delivery tags
    pub tag_counter: u64,

    pub closed_cause: Option<ClosedCause>,
}

impl Drop for SenderInner {
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

impl Sender {
    /// Attaches a sender link on the session.
    ///
    /// An anonymous sender (one with a null target) requires the peer to
    /// offer `ANONYMOUS-RELAY`; the attach is held until the remote Open
    /// resolves the capabilities.
    pub(crate) async fn attach(
        session: &mut Session,
        options: SenderOptions,
        address: Option<String>,
    ) -> Result<Sender, AttachError> {
        let anonymous = address.is_none() && !options.dynamic;
        if anonymous {
            let capabilities = crate::connection::wait_for_capabilities(
                &session.conn_control,
                options
                    .request_timeout
                    .unwrap_or(session.timeouts.request),
            )
            .await
            .map_err(|err| match err {
                crate::connection::Error::OperationTimedOut => AttachError::OperationTimedOut,
                _ => AttachError::ConnectionRemotelyClosed,
            })?;
            if !capabilities.anonymous_relay {
                return Err(AttachError::AnonymousRelayNotSupported);
            }
        }

        let target = match (&address, options.dynamic) {
            (_, true) => {
                let mut builder = Target::builder().dynamic(true);
                if let Some(capabilities) = options.target_capabilities.clone() {
                    builder = builder.capabilities(capabilities);
                }
                Some(TargetArchetype::Target(builder.build()))
            }
            (Some(address), false) => {
                let mut builder = Target::builder().address(address.clone());
                if let Some(capabilities) = options.target_capabilities.clone() {
                    builder = builder.capabilities(capabilities);
                }
                Some(TargetArchetype::Target(builder.build()))
            }
            (None, false) => None,
        };

        let spec = SenderLinkSpec {
            name: options
                .name
                .clone()
                .unwrap_or_else(|| session.next_link_name("sender")),
            target,
            snd_settle_mode: options.delivery_mode.into(),
            auto_settle: options.auto_settle,
            properties: options.properties.clone(),
            offered_capabilities: options.offered_capabilities.clone(),
            desired_capabilities: options.desired_capabilities.clone(),
            request_timeout: options.request_timeout.unwrap_or(session.timeouts.request),
            send_timeout: options.send_timeout.unwrap_or(session.timeouts.send),
        };
        let inner = attach_sender_link(session, spec).await?;

        Ok(Sender { inner })
    }

    /// The name of the link
    pub fn name(&self) -> &str {
        &self.inner.core.name
    }

    /// The link's target, as echoed by the remote peer
    pub fn target(&self) -> Option<&TargetArchetype> {
        self.inner.core.target.as_ref()
    }

    /// The link's source
    pub fn source(&self) -> Option<&Source> {
        self.inner.core.source.as_ref()
    }

    /// The link properties
    pub fn properties(&self) -> Option<&fe2o3_amqp_types::definitions::Fields> {
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

    /// The credit currently granted by the remote peer
    pub fn credit(&self) -> u32 {
        self.inner.core.flow_state.link_credit()
    }

    /// Sends a message, blocking while the link has no credit, bounded by
    /// the send timeout.
    ///
    /// On success exactly one Transfer is emitted, the link credit is
    /// decremented by one, and the returned [`Tracker`] resolves on remote
    /// settlement. While a transaction is active on the session the
    /// transfer is stamped with its txn-id.
    pub async fn send(&mut self, sendable: impl Into<Sendable>) -> Result<Tracker, SendError> {
        let sendable = sendable.into();
        let deadline = Instant::now() + self.inner.send_timeout;
        let payload = sendable.encode()?;
        let sent = self
            .inner
            .send_payload(
                payload,
                sendable.message_format,
                sendable.settled,
                None,
                Some(deadline),
            )
            .await?;
        Ok(self.inner.tracker_of(sent))
    }

    /// Sends a message if credit is immediately available.
    ///
    /// Returns `Ok(None)` without blocking when the link has no credit. A
    /// link that has already been terminated fails with the kind of the
    /// layer that went away, never with an absent result.
    pub async fn try_send(
        &mut self,
        sendable: impl Into<Sendable>,
    ) -> Result<Option<Tracker>, SendError> {
        let sendable = sendable.into();

        if let Some(cause) = &self.inner.closed_cause {
            return Err(cause.as_send_error());
        }

        self.inner.process_pending_frames()?;
        if self.inner.core.flow_state.link_credit() == 0 {
            return Ok(None);
        }

        let payload = sendable.encode()?;
        match self
            .inner
            .send_payload(payload, sendable.message_format, sendable.settled, None, None)
            .await
        {
            Ok(sent) => Ok(Some(self.inner.tracker_of(sent))),
            // Lost the race for the last credit; still not an error
            Err(SendError::SendTimedOut) => Ok(None),
            Err(err) => Err(err),
        }
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

    /// Detaches the link with an error condition
    pub async fn detach_with_error(
        mut self,
        error: impl Into<definitions::Error>,
    ) -> Result<(), DetachError> {
        self.inner.close_or_detach(false, Some(error.into())).await
    }
}

impl SenderInner {
    fn next_delivery_tag(&mut self) -> DeliveryTag {
        let n = self.tag_counter;
        self.tag_counter += 1;
        // Single bytes 0..=255, big-endian bytes beyond; strictly
        // monotonic across the lifetime of the link
        if n < 256 {
            DeliveryTag::from(vec![n as u8])
        } else {
            DeliveryTag::from(n.to_be_bytes().to_vec())
        }
    }

    pub(crate) fn tracker_of(&self, sent: Sent) -> Tracker {
        match sent {
            Sent::Settled {
                delivery_tag,
                message_format,
                state,
            } => Tracker::pre_settled(
                delivery_tag,
                message_format,
                state,
                self.unsettled.clone(),
                self.session_control.clone(),
                self.current_txn.clone(),
            ),
            Sent::Unsettled {
                delivery_tag,
                message_format,
                state,
                outcome_rx,
            } => Tracker::unsettled(
                delivery_tag,
                message_format,
                state,
                outcome_rx,
                self.unsettled.clone(),
                self.session_control.clone(),
                self.current_txn.clone(),
            ),
        }
    }

    /// Puts one transfer on the wire, waiting for link credit when a
    /// deadline is given and failing immediately otherwise.
    pub(crate) async fn send_payload(
        &mut self,
        payload: Payload,
        message_format: MessageFormat,
        settled_hint: Option<bool>,
        state_override: Option<DeliveryState>,
        credit_deadline: Option<Instant>,
    ) -> Result<Sent, SendError> {
        if let Some(cause) = &self.closed_cause {
            return Err(cause.as_send_error());
        }
        if !matches!(self.core.local_state, LinkState::Attached) {
            return Err(SendError::IllegalState);
        }

        self.process_pending_frames()?;

        // Wait for credit. The select only decides what woke the task;
        // frames are applied after its borrows are released.
        enum CreditWait {
            Granted,
            Frame(Option<LinkFrame>),
            TimedOut,
        }

        let flow_state = self.core.flow_state.clone();
        loop {
            if flow_state.try_consume_credit().is_some() {
                break;
            }
            let deadline = match credit_deadline {
                Some(deadline) => deadline,
                None => return Err(SendError::SendTimedOut),
            };

            let notified = flow_state.notify().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if flow_state.try_consume_credit().is_some() {
                break;
            }

            let wait = tokio::select! {
                _ = notified.as_mut() => CreditWait::Granted,
                frame = self.incoming.recv() => CreditWait::Frame(frame),
                _ = tokio::time::sleep_until(deadline) => CreditWait::TimedOut,
            };
            match wait {
                CreditWait::Granted => {}
                CreditWait::Frame(frame) => self.handle_incoming_frame(frame)?,
                CreditWait::TimedOut => return Err(SendError::SendTimedOut),
            }
        }

        let delivery_tag = self.next_delivery_tag();
        let settled = match self.core.snd_settle_mode {
            SenderSettleMode::Settled => true,
            SenderSettleMode::Unsettled => false,
            SenderSettleMode::Mixed => settled_hint.unwrap_or(false),
        };
        let state = match state_override {
            Some(state) => Some(state),
            None => super::tracker::wrap_in_current_txn(&self.current_txn, None),
        };

        let handle = self
            .core
            .local_handle
            .ok_or(SendError::IllegalState)?
            .into();
        let remote_handle = self.core.remote_handle.ok_or(SendError::IllegalState)?;
        let transfer = Transfer {
            handle,
            delivery_id: None,
            delivery_tag: Some(delivery_tag.clone()),
            message_format: Some(message_format),
            settled: Some(settled),
            more: false,
            rcv_settle_mode: None,
            state: state.clone(),
            resume: false,
            aborted: false,
            batchable: false,
        };

        let outcome_rx = match settled {
            true => None,
            false => {
                let (tx, rx) = oneshot::channel();
                let mut entry = UnsettledMessage::new(tx);
                entry.state = state.clone();
                self.unsettled.lock().insert(delivery_tag.clone(), entry);
                Some(rx)
            }
        };

        trace!(frame = ?transfer, "SEND");
        let send_result = self
            .outgoing
            .send(LinkFrame::Transfer {
                remote_handle,
                performative: transfer,
                payload,
            })
            .await;
        if send_result.is_err() {
            self.unsettled.lock().remove(&delivery_tag);
            return Err(SendError::SessionRemotelyClosed(None));
        }

        Ok(match outcome_rx {
            None => Sent::Settled {
                delivery_tag,
                message_format,
                state,
            },
            Some(outcome_rx) => Sent::Unsettled {
                delivery_tag,
                message_format,
                state,
                outcome_rx,
            },
        })
    }

    /// Applies any frames the session engine has already queued without
    /// blocking
    pub(crate) fn process_pending_frames(&mut self) -> Result<(), SendError> {
        loop {
            match self.incoming.try_recv() {
                Ok(frame) => self.apply_frame(Some(frame))?,
                Err(mpsc::error::TryRecvError::Empty) => return Ok(()),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return self.apply_frame(None).map(|_| ())
                }
            }
        }
    }

    fn handle_incoming_frame(&mut self, frame: Option<LinkFrame>) -> Result<(), SendError> {
        self.apply_frame(frame)
    }

    fn apply_frame(&mut self, frame: Option<LinkFrame>) -> Result<(), SendError> {
        let cause = match frame {
            None | Some(LinkFrame::ConnectionClosed) => ClosedCause::Connection,
            Some(LinkFrame::SessionClosed(error)) => ClosedCause::Session(error),
            Some(LinkFrame::Detach(detach)) => {
                let error = detach.error.clone();
                let _ = self.core.on_incoming_detach(&detach);
                // Answer a closing detach so the exchange completes
                if matches!(self.core.local_state, LinkState::CloseReceived) {
                    if let Ok(reply) = self.core.make_detach(true, None) {
                        let _ = self.outgoing.try_send(LinkFrame::Detach(reply));
                    }
                }
                ClosedCause::Link(error)
            }
            // Attach echoes and flows are handled elsewhere
            Some(_) => return Ok(()),
        };

        self.fail_unsettled(&cause);
        let error = cause.as_send_error();
        self.closed_cause = Some(cause);
        Err(error)
    }

    fn fail_unsettled(&mut self, cause: &ClosedCause) {
        let mut guard = self.unsettled.lock();
        for (_, entry) in guard.iter_mut() {
            let outcome = match cause {
                ClosedCause::Link(error) => SettlementOutcome::LinkClosed(error.clone()),
                ClosedCause::Session(error) => SettlementOutcome::SessionClosed(error.clone()),
                ClosedCause::Connection => SettlementOutcome::ConnectionClosed,
            };
            entry.resolve(outcome);
        }
    }

    pub(crate) async fn close_or_detach(
        &mut self,
        closed: bool,
        error: Option<definitions::Error>,
    ) -> Result<(), DetachError> {
        if self.closed_cause.is_some() {
            // The link is already gone; nothing left to exchange
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

/// Everything needed to attach a sender-role link; also used by the
/// transaction controller for its coordinator link
#[derive(Debug)]
pub(crate) struct SenderLinkSpec {
    pub name: String,
    pub target: Option<TargetArchetype>,
    pub snd_settle_mode: SenderSettleMode,
    pub auto_settle: bool,
    pub properties: Option<fe2o3_amqp_types::definitions::Fields>,
    pub offered_capabilities: Option<Vec<Symbol>>,
    pub desired_capabilities: Option<Vec<Symbol>>,
    pub request_timeout: Duration,
    pub send_timeout: Duration,
}

/// Allocates, attaches, and wires up a sender-role link on the session
pub(crate) async fn attach_sender_link(
    session: &mut Session,
    spec: SenderLinkSpec,
) -> Result<SenderInner, AttachError> {
    let flow_state = Arc::new(LinkFlowState::sender(LinkFlowStateInner {
        initial_delivery_count: 0,
        delivery_count: 0,
        link_credit: 0,
        available: 0,
        drain: false,
        properties: spec.properties.clone(),
    }));
    let unsettled: ArcSenderUnsettledMap = Arc::new(Mutex::new(Default::default()));

    let (incoming_tx, mut incoming_rx) = mpsc::channel(DEFAULT_LINK_BUFFER_SIZE);
    let relay = LinkRelay::Sender {
        tx: incoming_tx,
        local_handle: None,
        flow_state: flow_state.clone(),
        unsettled: unsettled.clone(),
        receiver_settle_mode: ReceiverSettleMode::First,
        auto_settle: spec.auto_settle,
    };

    let local_handle = allocate_link(&session.control, spec.name.clone(), relay).await?;

    let source = Source::builder()
        .outcomes(default_outcomes())
        .default_outcome(default_outcome())
        .build();

    let mut core = LinkCore {
        local_state: LinkState::Unattached,
        name: spec.name.clone(),
        local_handle: Some(local_handle),
        remote_handle: None,
        snd_settle_mode: spec.snd_settle_mode,
        rcv_settle_mode: ReceiverSettleMode::First,
        source: Some(source),
        target: spec.target,
        max_message_size: 0,
        offered_capabilities: spec.offered_capabilities,
        desired_capabilities: spec.desired_capabilities,
        properties: spec.properties,
        flow_state,
    };

    let attach_result = tokio::time::timeout(
        spec.request_timeout,
        exchange_attach(&mut core, Role::Sender, &session.outgoing, &mut incoming_rx),
    )
    .await;

    match attach_result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            let _ = session
                .control
                .send(SessionControl::DeallocateLink(spec.name))
                .await;
            return Err(err);
        }
        Err(_elapsed) => {
            let _ = session
                .control
                .send(SessionControl::DeallocateLink(spec.name))
                .await;
            return Err(AttachError::OperationTimedOut);
        }
    }

    Ok(SenderInner {
        core,
        unsettled,
        outgoing: session.outgoing.clone(),
        incoming: incoming_rx,
        session_control: session.control.clone(),
        current_txn: session.current_txn.clone(),
        send_timeout: spec.send_timeout,
        request_timeout: spec.request_timeout,
        tag_counter: 0,
        closed_cause: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inner_for_tag_tests() -> SenderInner {
        let (outgoing, _outgoing_rx) = mpsc::channel(1);
        let (_incoming_tx, incoming) = mpsc::channel(1);
        let (session_control, _control_rx) = mpsc::channel(1);
        SenderInner {
            core: LinkCore {
                local_state: LinkState::Attached,
                name: "tag-test".to_string(),
                local_handle: Some(super::super::LocalHandle(0)),
                remote_handle: Some(0),
                snd_settle_mode: SenderSettleMode::Unsettled,
                rcv_settle_mode: ReceiverSettleMode::First,
                source: None,
                target: None,
                max_message_size: 0,
                offered_capabilities: None,
                desired_capabilities: None,
                properties: None,
                flow_state: Arc::new(LinkFlowState::sender(LinkFlowStateInner {
                    initial_delivery_count: 0,
                    delivery_count: 0,
                    link_credit: 0,
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
            send_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(1),
            tag_counter: 0,
            closed_cause: None,
        }
    }

    #[tokio::test]
    async fn delivery_tags_are_single_bytes_for_the_first_256() {
        let mut inner = inner_for_tag_tests();
        for expected in 0u16..=255 {
            let tag = inner.next_delivery_tag();
            assert_eq!(&tag[..], &[expected as u8]);
        }
        // Monotonic beyond the single-byte range
        let tag = inner.next_delivery_tag();
        assert_eq!(&tag[..], &256u64.to_be_bytes()[..]);
    }
}
