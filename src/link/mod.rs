//! Implementation of AMQP 1.0 links

use std::collections::HashMap;
use std::sync::Arc;

use fe2o3_amqp_types::{
    definitions::{
        self, DeliveryNumber, DeliveryTag, Fields, Handle, ReceiverSettleMode, Role,
        SenderSettleMode,
    },
    messaging::{DeliveryState, Source, TargetArchetype},
    performatives::{Attach, Detach, Transfer},
    primitives::Symbol,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::{
    control::SessionControl,
    session::error::AllocLinkError,
    Payload,
};

pub mod delivery;
pub mod error;
pub(crate) mod frame;
mod options;
pub(crate) mod state;
pub mod tracker;

pub mod receiver;
pub mod sender;

pub use options::{DeliveryMode, ReceiverOptions, SenderOptions};
pub use receiver::Receiver;
pub use sender::Sender;
pub use state::LinkState;

pub(crate) use frame::{LinkFlow, LinkFrame};
pub(crate) use state::{LinkFlowState, LinkFlowStateInner};
pub(crate) use tracker::{ArcSenderUnsettledMap, SettlementOutcome, UnsettledMessage};

use self::error::AttachError;

/// Buffer capacity of a link's incoming frame channel
pub(crate) const DEFAULT_LINK_BUFFER_SIZE: usize = u16::MAX as usize;

pub(crate) type ArcReceiverUnsettledMap =
    Arc<Mutex<HashMap<DeliveryTag, Option<DeliveryState>>>>;

/// The handle this endpoint assigned to a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct LocalHandle(pub u32);

impl From<LocalHandle> for Handle {
    fn from(value: LocalHandle) -> Self {
        Handle(value.0)
    }
}

impl From<Handle> for LocalHandle {
    fn from(value: Handle) -> Self {
        LocalHandle(value.0)
    }
}

/// The protocol state every link shares regardless of role.
///
/// Owned by the link handle; the flow state and unsettled map are shared
/// with the session engine through the link's relay.
#[derive(Debug)]
pub(crate) struct LinkCore {
    pub local_state: LinkState,
    pub name: String,

    pub local_handle: Option<LocalHandle>,
    pub remote_handle: Option<u32>,

    pub snd_settle_mode: SenderSettleMode,
    pub rcv_settle_mode: ReceiverSettleMode,

    pub source: Option<Source>,
    pub target: Option<TargetArchetype>,

    /// Zero means no maximum is imposed
    pub max_message_size: u64,

    pub offered_capabilities: Option<Vec<Symbol>>,
    pub desired_capabilities: Option<Vec<Symbol>>,
    pub properties: Option<Fields>,

    pub flow_state: Arc<LinkFlowState>,
}

impl LinkCore {
    /// Builds the local Attach frame and records the state transition
    pub(crate) fn make_attach(&mut self, role: Role) -> Result<Attach, AttachError> {
        let handle = self.local_handle.ok_or(AttachError::IllegalState)?;

        match self.local_state {
            LinkState::Unattached | LinkState::Detached => {
                self.local_state = LinkState::AttachSent
            }
            LinkState::AttachReceived => self.local_state = LinkState::Attached,
            _ => return Err(AttachError::IllegalState),
        }

        let initial_delivery_count = match role {
            // Must not be null when the role is sender
            Role::Sender => Some(self.flow_state.initial_delivery_count()),
            Role::Receiver => None,
        };
        let max_message_size = match self.max_message_size {
            0 => None,
            val => Some(val),
        };

        Ok(Attach {
            name: self.name.clone(),
            handle: handle.into(),
            role,
            snd_settle_mode: self.snd_settle_mode.clone(),
            rcv_settle_mode: self.rcv_settle_mode.clone(),
            source: self.source.clone().map(Box::new),
            target: self.target.clone().map(Box::new),
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count,
            max_message_size,
            offered_capabilities: self.offered_capabilities.clone().map(Into::into),
            desired_capabilities: self.desired_capabilities.clone().map(Into::into),
            properties: self.properties.clone(),
        })
    }

    /// Whether the remote attach denies the link a terminus.
    ///
    /// A peer that refuses a link responds with a null terminus and
    /// detaches immediately. An absent target is legitimate on an
    /// anonymous sender (the local target was null to begin with).
    pub(crate) fn remote_attach_is_refusal(&self, remote_attach: &Attach, role: Role) -> bool {
        match role {
            Role::Sender => {
                remote_attach.source.is_none()
                    || (self.target.is_some() && remote_attach.target.is_none())
            }
            Role::Receiver => remote_attach.source.is_none(),
        }
    }

    /// Applies the remote Attach
    pub(crate) fn on_incoming_attach(
        &mut self,
        remote_attach: Attach,
        role: Role,
    ) -> Result<(), AttachError> {
        match self.local_state {
            LinkState::AttachSent => self.local_state = LinkState::Attached,
            LinkState::Unattached => self.local_state = LinkState::AttachReceived,
            _ => return Err(AttachError::IllegalState),
        }

        self.remote_handle = Some(remote_attach.handle.0);

        match role {
            Role::Sender => {
                // The receiver holds the authoritative target (it may have
                // filled in a dynamic address); the sender respects the
                // receiver's desired settle mode
                self.target = remote_attach.target.map(|boxed| *boxed);
                self.rcv_settle_mode = remote_attach.rcv_settle_mode;
            }
            Role::Receiver => {
                // The sender holds the authoritative source
                self.source = remote_attach.source.map(|boxed| *boxed);
                self.snd_settle_mode = remote_attach.snd_settle_mode;
            }
        }

        self.max_message_size =
            agreed_max_message_size(self.max_message_size, remote_attach.max_message_size);

        Ok(())
    }

    /// Applies a remote Detach; returns whether the detach closes the link
    pub(crate) fn on_incoming_detach(
        &mut self,
        detach: &Detach,
    ) -> Result<bool, AttachError> {
        match detach.closed {
            true => match self.local_state {
                LinkState::Attached
                | LinkState::AttachSent
                | LinkState::AttachReceived
                | LinkState::DetachSent
                | LinkState::DetachReceived => self.local_state = LinkState::CloseReceived,
                LinkState::CloseSent => {
                    self.local_state = LinkState::Closed;
                    self.local_handle = None;
                }
                _ => return Err(AttachError::IllegalState),
            },
            false => match self.local_state {
                LinkState::Attached => self.local_state = LinkState::DetachReceived,
                LinkState::DetachSent => {
                    self.local_state = LinkState::Detached;
                    self.local_handle = None;
                }
                _ => return Err(AttachError::IllegalState),
            },
        }
        Ok(detach.closed)
    }

    /// Builds the local Detach frame and records the state transition
    pub(crate) fn make_detach(
        &mut self,
        closed: bool,
        error: Option<definitions::Error>,
    ) -> Result<Detach, AttachError> {
        let handle = self.local_handle.ok_or(AttachError::IllegalState)?;

        match self.local_state {
            LinkState::Attached => {
                self.local_state = match closed {
                    true => LinkState::CloseSent,
                    false => LinkState::DetachSent,
                }
            }
            LinkState::DetachReceived | LinkState::CloseReceived => {
                self.local_state = match closed {
                    true => LinkState::Closed,
                    false => LinkState::Detached,
                };
                self.local_handle = None;
            }
            _ => return Err(AttachError::IllegalState),
        }

        Ok(Detach {
            handle: handle.into(),
            closed,
            error,
        })
    }
}

fn agreed_max_message_size(local: u64, remote: Option<u64>) -> u64 {
    let remote = remote.unwrap_or(0);
    match (local, remote) {
        (0, val) | (val, 0) => val,
        (local, remote) => u64::min(local, remote),
    }
}

/// Error raised when a frame is routed to a relay that cannot take it
#[derive(Debug, thiserror::Error)]
pub(crate) enum LinkRelayError {
    #[error("A frame referenced a handle that is not attached")]
    UnattachedHandle,

    #[error("Found a Transfer frame sent to a sender link")]
    TransferFrameToSender,
}

/// The session engine's view of one link.
///
/// The relay forwards incoming frames to the link handle and resolves
/// incoming dispositions against the shared unsettled map, so the engine
/// never blocks on application code.
#[derive(Debug)]
pub(crate) enum LinkRelay {
    Sender {
        tx: mpsc::Sender<LinkFrame>,
        local_handle: Option<LocalHandle>,
        flow_state: Arc<LinkFlowState>,
        unsettled: ArcSenderUnsettledMap,
        receiver_settle_mode: ReceiverSettleMode,
        auto_settle: bool,
    },
    Receiver {
        tx: mpsc::Sender<LinkFrame>,
        local_handle: Option<LocalHandle>,
        flow_state: Arc<LinkFlowState>,
        unsettled: ArcReceiverUnsettledMap,
        receiver_settle_mode: ReceiverSettleMode,
        /// Whether a multi-transfer delivery is in flight
        more: bool,
    },
}

impl LinkRelay {
    pub fn set_local_handle(&mut self, handle: LocalHandle) {
        match self {
            Self::Sender { local_handle, .. } | Self::Receiver { local_handle, .. } => {
                *local_handle = Some(handle)
            }
        }
    }

    pub fn local_handle(&self) -> Option<LocalHandle> {
        match self {
            Self::Sender { local_handle, .. } | Self::Receiver { local_handle, .. } => {
                *local_handle
            }
        }
    }

    pub fn unsettled_sender_map(&self) -> Option<&ArcSenderUnsettledMap> {
        match self {
            Self::Sender { unsettled, .. } => Some(unsettled),
            Self::Receiver { .. } => None,
        }
    }

    pub async fn on_incoming_attach(
        &mut self,
        attach: Attach,
    ) -> Result<(), LinkRelayError> {
        self.forward(LinkFrame::Attach(attach)).await
    }

    /// Applies a link Flow; returns an echo Flow when one is due
    pub fn on_incoming_flow(&mut self, flow: LinkFlow) -> Option<LinkFlow> {
        let local_handle = self.local_handle()?;
        match self {
            Self::Sender { flow_state, .. } | Self::Receiver { flow_state, .. } => {
                flow_state.on_incoming_flow(flow, local_handle)
            }
        }
    }

    /// Forwards an incoming transfer to the receiver handle.
    ///
    /// Returns the `(delivery_id, delivery_tag)` pair the session must
    /// remember for later dispositions of an unsettled delivery.
    pub async fn on_incoming_transfer(
        &mut self,
        transfer: Transfer,
        payload: Payload,
    ) -> Result<Option<(DeliveryNumber, DeliveryTag)>, LinkRelayError> {
        match self {
            Self::Sender { .. } => Err(LinkRelayError::TransferFrameToSender),
            Self::Receiver {
                tx,
                flow_state,
                more,
                ..
            } => {
                let settled = transfer.settled.unwrap_or(false);
                let first_frame = !*more;
                let id_and_tag = match (first_frame, settled) {
                    (true, false) => transfer
                        .delivery_id
                        .zip(transfer.delivery_tag.clone()),
                    _ => None,
                };

                if first_frame {
                    flow_state.on_incoming_transfer();
                }
                *more = transfer.more;

                tx.send(LinkFrame::Transfer {
                    remote_handle: transfer.handle.0,
                    performative: transfer,
                    payload,
                })
                .await
                .map_err(|_| LinkRelayError::UnattachedHandle)?;

                Ok(id_and_tag)
            }
        }
    }

    /// Applies an incoming disposition to one tracked delivery.
    ///
    /// Returns whether a settled echo disposition is owed to the peer.
    pub fn on_incoming_disposition(
        &mut self,
        settled: bool,
        state: Option<DeliveryState>,
        delivery_tag: DeliveryTag,
    ) -> bool {
        match self {
            Self::Sender {
                unsettled,
                receiver_settle_mode,
                auto_settle,
                ..
            } => {
                let is_terminal = state.as_ref().map(|s| s.is_terminal()).unwrap_or(false);
                let mut guard = unsettled.lock();

                if settled {
                    if let Some(mut entry) = guard.remove(&delivery_tag) {
                        entry.resolve(SettlementOutcome::Disposition {
                            state,
                            remote_settled: true,
                        });
                    }
                    return false;
                }

                if !is_terminal {
                    // A provisional state (e.g. Received); keep waiting
                    if let Some(entry) = guard.get_mut(&delivery_tag) {
                        entry.state = state;
                    }
                    return false;
                }

                match *auto_settle {
                    true => {
                        // Settle locally and (in mode Second) echo the
                        // settlement back to the peer
                        if let Some(mut entry) = guard.remove(&delivery_tag) {
                            entry.resolve(SettlementOutcome::Disposition {
                                state,
                                remote_settled: true,
                            });
                        }
                        matches!(receiver_settle_mode, ReceiverSettleMode::Second)
                    }
                    false => {
                        // Complete the tracker; the application settles
                        // explicitly later
                        if let Some(entry) = guard.get_mut(&delivery_tag) {
                            entry.state = state.clone();
                            entry.resolve(SettlementOutcome::Disposition {
                                state,
                                remote_settled: false,
                            });
                        }
                        false
                    }
                }
            }
            Self::Receiver { unsettled, .. } => {
                let mut guard = unsettled.lock();
                if settled {
                    guard.remove(&delivery_tag);
                } else if let Some(entry) = guard.get_mut(&delivery_tag) {
                    *entry = state;
                }
                false
            }
        }
    }

    pub async fn on_incoming_detach(&mut self, detach: Detach) -> Result<(), LinkRelayError> {
        self.forward(LinkFrame::Detach(detach)).await
    }

    async fn forward(&mut self, frame: LinkFrame) -> Result<(), LinkRelayError> {
        match self {
            Self::Sender { tx, .. } | Self::Receiver { tx, .. } => tx
                .send(frame)
                .await
                .map_err(|_| LinkRelayError::UnattachedHandle),
        }
    }

    /// Fails every pending delivery and tells the link handle which layer
    /// went away. Used when the session or connection terminates while the
    /// link is still up.
    pub fn terminate(&mut self, cause: TerminationCause) {
        if let Self::Sender { unsettled, .. } = self {
            let mut guard = unsettled.lock();
            for (_, entry) in guard.iter_mut() {
                entry.resolve(cause.settlement_outcome());
            }
        }

        let frame = match &cause {
            TerminationCause::SessionEnded(error) => LinkFrame::SessionClosed(error.clone()),
            TerminationCause::ConnectionClosed => LinkFrame::ConnectionClosed,
        };
        match self {
            Self::Sender { tx, .. } | Self::Receiver { tx, .. } => {
                let _ = tx.try_send(frame);
            }
        }
    }
}

/// Which layer terminated underneath an attached link
#[derive(Debug, Clone)]
pub(crate) enum TerminationCause {
    SessionEnded(Option<definitions::Error>),
    ConnectionClosed,
}

impl TerminationCause {
    fn settlement_outcome(&self) -> SettlementOutcome {
        match self {
            Self::SessionEnded(error) => SettlementOutcome::SessionClosed(error.clone()),
            Self::ConnectionClosed => SettlementOutcome::ConnectionClosed,
        }
    }
}

/// Allocates an output handle for a new link on the session
pub(crate) async fn allocate_link(
    session_control: &mpsc::Sender<SessionControl>,
    link_name: String,
    relay: LinkRelay,
) -> Result<LocalHandle, AttachError> {
    let (responder, resp_rx) = oneshot::channel();
    session_control
        .send(SessionControl::AllocateLink {
            link_name,
            relay,
            responder,
        })
        .await
        .map_err(|_| AttachError::IllegalSessionState)?;
    resp_rx
        .await
        .map_err(|_| AttachError::IllegalSessionState)?
        .map_err(|err| match err {
            AllocLinkError::IllegalSessionState => AttachError::IllegalSessionState,
            AllocLinkError::DuplicatedLinkName => AttachError::DuplicatedLinkName,
        })
}

/// Runs the attach exchange for a link: emits the local Attach, waits for
/// the remote Attach, and handles refusal by detach.
pub(crate) async fn exchange_attach(
    core: &mut LinkCore,
    role: Role,
    outgoing: &mpsc::Sender<LinkFrame>,
    incoming: &mut mpsc::Receiver<LinkFrame>,
) -> Result<(), AttachError> {
    let attach = core.make_attach(role.clone())?;
    trace!(frame = ?attach, "SEND");
    outgoing
        .send(LinkFrame::Attach(attach))
        .await
        .map_err(|_| AttachError::IllegalSessionState)?;

    loop {
        let frame = incoming
            .recv()
            .await
            .ok_or(AttachError::IllegalSessionState)?;

        match frame {
            LinkFrame::Attach(remote_attach) => {
                trace!(frame = ?remote_attach, "RECV");
                if core.remote_attach_is_refusal(&remote_attach, role.clone()) {
                    // The peer attached with a null terminus; a closing
                    // detach carrying its reason follows
                    core.remote_handle = Some(remote_attach.handle.0);
                    let error = expect_remote_detach(incoming).await?;
                    core.local_state = LinkState::CloseReceived;
                    if let Ok(detach) = core.make_detach(true, None) {
                        let _ = outgoing.send(LinkFrame::Detach(detach)).await;
                    }
                    core.local_state = LinkState::Closed;
                    return Err(AttachError::RefusedByRemote(error));
                }

                core.on_incoming_attach(remote_attach, role)?;
                return Ok(());
            }
            LinkFrame::Detach(detach) => {
                // Refusal without an attach echo
                let error = detach.error;
                if detach.closed {
                    core.local_state = LinkState::CloseReceived;
                    if let Ok(detach) = core.make_detach(true, None) {
                        let _ = outgoing.send(LinkFrame::Detach(detach)).await;
                    }
                }
                core.local_state = LinkState::Closed;
                return Err(AttachError::RefusedByRemote(error));
            }
            LinkFrame::SessionClosed(error) => {
                return Err(AttachError::SessionRemotelyClosed(error))
            }
            LinkFrame::ConnectionClosed => return Err(AttachError::ConnectionRemotelyClosed),
            _ => {
                // Nothing else is expected before the attach completes
                continue;
            }
        }
    }
}

async fn expect_remote_detach(
    incoming: &mut mpsc::Receiver<LinkFrame>,
) -> Result<Option<definitions::Error>, AttachError> {
    loop {
        match incoming
            .recv()
            .await
            .ok_or(AttachError::IllegalSessionState)?
        {
            LinkFrame::Detach(detach) => return Ok(detach.error),
            LinkFrame::SessionClosed(error) => {
                return Err(AttachError::SessionRemotelyClosed(error))
            }
            LinkFrame::ConnectionClosed => return Err(AttachError::ConnectionRemotelyClosed),
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::agreed_max_message_size;

    #[test]
    fn max_message_size_agreement() {
        assert_eq!(agreed_max_message_size(0, None), 0);
        assert_eq!(agreed_max_message_size(0, Some(512)), 512);
        assert_eq!(agreed_max_message_size(1024, Some(0)), 1024);
        assert_eq!(agreed_max_message_size(1024, Some(512)), 512);
    }
}
