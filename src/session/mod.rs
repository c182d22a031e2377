//! Implementation of the AMQP 1.0 session

use std::collections::HashMap;

use fe2o3_amqp_types::{
    definitions::{self, DeliveryNumber, DeliveryTag, Fields, Handle, Role, SequenceNo,
        TransferNumber},
    performatives::{Attach, Begin, Detach, Disposition, End, Flow, Transfer},
    primitives::Symbol,
};
use slab::Slab;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{instrument, trace};

use crate::{
    connection::{builder::Timeouts, Connection},
    control::{ConnectionControl, SessionControl},
    link::{
        error::AttachError, LinkFlow, LinkRelay, LocalHandle, Receiver, ReceiverOptions, Sender,
        SenderOptions, TerminationCause,
    },
    transaction::{CurrentTransaction, TransactionError, TxnController},
    util::Constant,
    Payload,
};

pub(crate) mod engine;
pub(crate) mod frame;

pub mod error;
pub use error::{BeginError, Error};
pub(crate) use error::AllocLinkError;

mod builder;
pub use builder::Builder;

use self::frame::{SessionFrame, SessionFrameBody};

/// Default incoming_window and outgoing_window
pub const DEFAULT_WINDOW: u32 = 2048;

/// Session states as defined in the AMQP 1.0 specification Part 2.5.5
#[derive(Debug, Clone)]
pub enum SessionState {
    /// No Begin frames have been exchanged
    Unmapped,

    /// A Begin has been sent but none received
    BeginSent,

    /// Begin frames have been exchanged
    Mapped,

    /// An End has been sent but none received
    EndSent,

    /// An End has been received but none sent
    EndReceived,

    /// An End triggered by an error has been sent; incoming frames are
    /// discarded until the remote End arrives
    Discarding,
}

/// A handle to an AMQP 1.0 session.
///
/// The handle communicates with the session's event-loop task; dropping
/// the handle ends the session.
pub struct Session {
    pub(crate) control: mpsc::Sender<SessionControl>,
    pub(crate) outgoing: mpsc::Sender<crate::link::LinkFrame>,
    pub(crate) conn_control: mpsc::Sender<ConnectionControl>,
    engine_handle: Option<JoinHandle<Result<(), Error>>>,
    terminal: Option<Result<(), Error>>,

    pub(crate) timeouts: Timeouts,
    pub(crate) outgoing_channel: u16,
    link_name_counter: u32,

    /// The transaction currently active on this session, shared with
    /// every link so that transfers and dispositions are stamped with it
    pub(crate) current_txn: CurrentTransaction,
    txn_controller: Option<TxnController>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("outgoing_channel", &self.outgoing_channel)
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.control.try_send(SessionControl::End(None));
    }
}

impl Session {
    /// Creates a builder for [`Session`]
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Begins a new session on the connection with the default
    /// configuration.
    ///
    /// The Begin frame is pipelined; the remote Begin is consumed by the
    /// session's event loop.
    pub async fn begin(connection: &mut Connection) -> Result<Session, BeginError> {
        Session::builder().begin(connection).await
    }

    /// Checks whether the underlying event loop has stopped
    pub fn is_ended(&self) -> bool {
        self.control.is_closed()
    }

    pub(crate) fn next_link_name(&mut self, role: &str) -> String {
        let counter = self.link_name_counter;
        self.link_name_counter += 1;
        format!("{}-{}:{}", role, self.outgoing_channel, counter)
    }

    /// Opens a sender link to the given address
    pub async fn open_sender(&mut self, address: impl Into<String>) -> Result<Sender, AttachError> {
        self.open_sender_with(SenderOptions::default(), Some(address.into()))
            .await
    }

    /// Opens a sender link with explicit options
    pub async fn open_sender_with(
        &mut self,
        options: SenderOptions,
        address: Option<String>,
    ) -> Result<Sender, AttachError> {
        Sender::attach(self, options, address).await
    }

    /// Opens an anonymous sender (a sender with a null target).
    ///
    /// Requires the peer to offer the `ANONYMOUS-RELAY` capability. When
    /// the remote Open has not arrived yet, the attach is held until the
    /// capabilities are known and then either completed or failed with
    /// [`AttachError::AnonymousRelayNotSupported`].
    pub async fn open_anonymous_sender(&mut self) -> Result<Sender, AttachError> {
        self.open_anonymous_sender_with(SenderOptions::default())
            .await
    }

    /// Opens an anonymous sender with explicit options
    pub async fn open_anonymous_sender_with(
        &mut self,
        options: SenderOptions,
    ) -> Result<Sender, AttachError> {
        Sender::attach(self, options, None).await
    }

    /// Opens a receiver link on the given address
    pub async fn open_receiver(
        &mut self,
        address: impl Into<String>,
    ) -> Result<Receiver, AttachError> {
        self.open_receiver_with(ReceiverOptions::default(), Some(address.into()))
            .await
    }

    /// Opens a receiver link with explicit options
    pub async fn open_receiver_with(
        &mut self,
        options: ReceiverOptions,
        address: Option<String>,
    ) -> Result<Receiver, AttachError> {
        Receiver::attach(self, options, address).await
    }

    /// Opens a receiver with a dynamic source; the peer assigns the
    /// address, found in [`Receiver::source_address`] afterwards
    pub async fn open_dynamic_receiver(&mut self) -> Result<Receiver, AttachError> {
        let options = ReceiverOptions::default().dynamic(true);
        Receiver::attach(self, options, None).await
    }

    /// Declares a new transaction on this session.
    ///
    /// The coordinator link is attached lazily on the first call. Fails
    /// with [`TransactionError::IllegalState`] while a transaction is
    /// already active.
    pub async fn begin_transaction(&mut self) -> Result<(), TransactionError> {
        if self.txn_controller.is_none() {
            let controller = TxnController::attach(self).await?;
            self.txn_controller = Some(controller);
        }

        let mut controller = self.txn_controller.take().unwrap();
        let result = controller.begin(&self.current_txn).await;
        match controller.is_detached() {
            // Coordinator link loss drops the controller so a later begin
            // attaches a fresh one
            true => self.txn_controller = None,
            false => self.txn_controller = Some(controller),
        }
        result
    }

    /// Commits the active transaction.
    ///
    /// Fails with [`TransactionError::NotActive`] when no transaction is
    /// active.
    pub async fn commit_transaction(&mut self) -> Result<(), TransactionError> {
        self.discharge_transaction(false).await
    }

    /// Rolls back the active transaction.
    ///
    /// Fails with [`TransactionError::NotActive`] when no transaction is
    /// active.
    pub async fn rollback_transaction(&mut self) -> Result<(), TransactionError> {
        self.discharge_transaction(true).await
    }

    async fn discharge_transaction(&mut self, fail: bool) -> Result<(), TransactionError> {
        let mut controller = match self.txn_controller.take() {
            Some(controller) => controller,
            None => return Err(TransactionError::NotActive),
        };
        let result = controller.discharge(&self.current_txn, fail).await;
        match controller.is_detached() {
            true => self.txn_controller = None,
            false => self.txn_controller = Some(controller),
        }
        result
    }

    /// Ends the session.
    ///
    /// End is idempotent: every call after the first completes with the
    /// same terminal outcome as the first.
    pub async fn end(&mut self) -> Result<(), Error> {
        self.end_inner(None).await
    }

    /// Ends the session with an error condition
    pub async fn end_with_error(
        &mut self,
        error: impl Into<definitions::Error>,
    ) -> Result<(), Error> {
        self.end_inner(Some(error.into())).await
    }

    async fn end_inner(&mut self, error: Option<definitions::Error>) -> Result<(), Error> {
        if let Some(terminal) = &self.terminal {
            return terminal.as_ref().map(|_| ()).map_err(Error::duplicate);
        }

        // Detach the coordinator ahead of the End
        if let Some(controller) = self.txn_controller.take() {
            controller.close().await;
        }

        let _ = self.control.send(SessionControl::End(error)).await;
        let outcome = match self.engine_handle.take() {
            Some(handle) => match handle.await {
                Ok(res) => res,
                Err(join_error) => Err(Error::JoinError(join_error)),
            },
            None => Err(Error::IllegalState),
        };
        let replayed = outcome.as_ref().map(|_| ()).map_err(Error::duplicate);
        self.terminal = Some(outcome);
        replayed
    }
}

/// The protocol-side state of a session. Owned and mutated exclusively by
/// the [`engine::SessionEngine`] event loop.
#[derive(Debug)]
pub(crate) struct SessionInner {
    pub outgoing_channel: u16,

    // Local state
    pub local_state: SessionState,
    pub initial_outgoing_id: Constant<TransferNumber>,
    pub next_outgoing_id: TransferNumber,
    pub incoming_window: u32,
    pub outgoing_window: u32,
    pub handle_max: Handle,

    // Remote state
    pub incoming_channel: Option<u16>,
    pub next_incoming_id: TransferNumber,
    pub remote_incoming_window: SequenceNo,
    pub remote_outgoing_window: SequenceNo,

    pub offered_capabilities: Option<Vec<Symbol>>,
    pub desired_capabilities: Option<Vec<Symbol>>,
    pub properties: Option<Fields>,

    // Link registry
    pub link_name_by_local_handle: Slab<String>,
    pub relay_by_name: HashMap<String, Option<LinkRelay>>,
    pub relay_by_remote_handle: HashMap<u32, LinkRelay>,

    /// Maps a delivery id to the link (by remote handle) and tag it
    /// belongs to. The role is the role of the peer that will refer to
    /// the delivery in a disposition.
    pub delivery_tag_by_id: HashMap<(Role, DeliveryNumber), (u32, DeliveryTag)>,
}

impl SessionInner {
    pub fn allocate_link(
        &mut self,
        link_name: String,
        mut relay: LinkRelay,
    ) -> Result<LocalHandle, AllocLinkError> {
        match &self.local_state {
            SessionState::BeginSent | SessionState::Mapped => {}
            _ => return Err(AllocLinkError::IllegalSessionState),
        };

        if self.relay_by_name.contains_key(&link_name) {
            return Err(AllocLinkError::DuplicatedLinkName);
        }

        let entry = self.link_name_by_local_handle.vacant_entry();
        let handle = LocalHandle(entry.key() as u32);
        entry.insert(link_name.clone());

        relay.set_local_handle(handle);
        self.relay_by_name.insert(link_name, Some(relay));
        Ok(handle)
    }

    pub fn deallocate_link(&mut self, link_name: &str) {
        self.relay_by_name.remove(link_name);
        let handle = self
            .link_name_by_local_handle
            .iter()
            .find_map(|(key, name)| (name == link_name).then_some(key));
        if let Some(handle) = handle {
            self.link_name_by_local_handle.remove(handle);
        }
    }

    pub fn on_incoming_begin(&mut self, channel: u16, begin: Begin) -> Result<(), Error> {
        trace!(channel, frame = ?begin);
        match self.local_state {
            SessionState::BeginSent => self.local_state = SessionState::Mapped,
            _ => return Err(Error::IllegalState),
        }

        self.incoming_channel = Some(channel);
        self.next_incoming_id = begin.next_outgoing_id;
        self.remote_incoming_window = begin.incoming_window;
        self.remote_outgoing_window = begin.outgoing_window;

        Ok(())
    }

    pub async fn on_incoming_attach(&mut self, attach: Attach) -> Result<(), Error> {
        trace!(frame = ?attach);
        match self.relay_by_name.get_mut(&attach.name) {
            Some(slot) => match slot.take() {
                Some(mut relay) => {
                    let remote_handle = attach.handle.0;
                    if self.relay_by_remote_handle.contains_key(&remote_handle) {
                        return Err(Error::HandleInUse);
                    }
                    relay.on_incoming_attach(attach).await?;
                    self.relay_by_remote_handle.insert(remote_handle, relay);
                    Ok(())
                }
                // The link name is known but its relay is already mapped
                None => Err(Error::HandleInUse),
            },
            None => Err(Error::RemoteAttachingLinkNameNotFound),
        }
    }

    pub fn on_incoming_flow(&mut self, flow: Flow) -> Result<Option<SessionFrame>, Error> {
        // Session flow control: the peer's view of our window
        self.next_incoming_id = flow.next_outgoing_id;
        self.remote_outgoing_window = flow.outgoing_window;

        match flow.next_incoming_id {
            Some(flow_next_incoming_id) => {
                // remote-incoming-window = next-incoming-id(flow)
                //     + incoming-window(flow) - next-outgoing-id(local)
                self.remote_incoming_window = flow_next_incoming_id
                    .wrapping_add(flow.incoming_window)
                    .wrapping_sub(self.next_outgoing_id);
            }
            None => {
                self.remote_incoming_window = self
                    .initial_outgoing_id
                    .value()
                    .wrapping_add(flow.incoming_window)
                    .wrapping_sub(self.next_outgoing_id);
            }
        }

        // Link flow control
        if let Ok(link_flow) = LinkFlow::try_from(flow) {
            let remote_handle = link_flow.handle.0;
            match self.relay_by_remote_handle.get_mut(&remote_handle) {
                Some(relay) => {
                    if let Some(echo) = relay.on_incoming_flow(link_flow) {
                        return Ok(Some(self.on_outgoing_flow(echo)));
                    }
                }
                None => return Err(Error::UnattachedHandle),
            }
        }

        Ok(None)
    }

    pub async fn on_incoming_transfer(
        &mut self,
        transfer: Transfer,
        payload: Payload,
    ) -> Result<(), Error> {
        self.next_incoming_id = self.next_incoming_id.wrapping_add(1);
        self.remote_outgoing_window = self.remote_outgoing_window.saturating_sub(1);

        let remote_handle = transfer.handle.0;
        match self.relay_by_remote_handle.get_mut(&remote_handle) {
            Some(relay) => {
                if let Some((delivery_id, delivery_tag)) =
                    relay.on_incoming_transfer(transfer, payload).await?
                {
                    self.delivery_tag_by_id
                        .insert((Role::Sender, delivery_id), (remote_handle, delivery_tag));
                }
                Ok(())
            }
            None => Err(Error::UnattachedHandle),
        }
    }

    /// Applies an incoming disposition and returns the settled echo
    /// dispositions owed to the peer
    #[instrument(skip_all)]
    pub fn on_incoming_disposition(
        &mut self,
        disposition: Disposition,
    ) -> Result<Vec<Disposition>, Error> {
        trace!(frame = ?disposition);
        let first = disposition.first;
        let last = disposition.last.unwrap_or(first);

        let mut echo_ids = Vec::new();
        for delivery_id in first..=last {
            let key = (disposition.role.clone(), delivery_id);
            let entry = match disposition.settled {
                true => self.delivery_tag_by_id.remove(&key),
                false => self.delivery_tag_by_id.get(&key).cloned(),
            };

            if let Some((remote_handle, delivery_tag)) = entry {
                if let Some(relay) = self.relay_by_remote_handle.get_mut(&remote_handle) {
                    let echo = relay.on_incoming_disposition(
                        disposition.settled,
                        disposition.state.clone(),
                        delivery_tag,
                    );
                    if echo {
                        echo_ids.push(delivery_id);
                        self.delivery_tag_by_id.remove(&key);
                    }
                }
            }
        }

        let echoes = consecutive_runs(&echo_ids)
            .into_iter()
            .map(|(first, last)| Disposition {
                role: Role::Sender,
                first,
                last: (last != first).then_some(last),
                settled: true,
                state: disposition.state.clone(),
                batchable: false,
            })
            .collect();
        Ok(echoes)
    }

    pub async fn on_incoming_detach(&mut self, detach: Detach) -> Result<(), Error> {
        trace!(frame = ?detach);
        match self.relay_by_remote_handle.remove(&detach.handle.0) {
            Some(mut relay) => relay
                .on_incoming_detach(detach)
                .await
                .map_err(Into::into),
            None => Err(Error::UnattachedHandle),
        }
    }

    /// Applies a remote End; returns the remote error when one was carried
    pub fn on_incoming_end(
        &mut self,
        _channel: u16,
        end: End,
    ) -> Result<Option<definitions::Error>, Error> {
        trace!(frame = ?end);
        match self.local_state {
            SessionState::BeginSent | SessionState::Mapped => {
                self.local_state = SessionState::EndReceived;
                Ok(end.error)
            }
            SessionState::EndSent | SessionState::Discarding => {
                self.local_state = SessionState::Unmapped;
                Ok(end.error)
            }
            _ => Err(Error::IllegalState),
        }
    }

    pub async fn send_begin(
        &mut self,
        writer: &mpsc::Sender<SessionFrame>,
    ) -> Result<(), BeginError> {
        let begin = Begin {
            remote_channel: self.incoming_channel,
            next_outgoing_id: self.next_outgoing_id,
            incoming_window: self.incoming_window,
            outgoing_window: self.outgoing_window,
            handle_max: self.handle_max.clone(),
            offered_capabilities: self.offered_capabilities.clone().map(Into::into),
            desired_capabilities: self.desired_capabilities.clone().map(Into::into),
            properties: self.properties.clone(),
        };
        let frame = SessionFrame::new(self.outgoing_channel, SessionFrameBody::Begin(begin));

        match &self.local_state {
            SessionState::Unmapped => {
                writer
                    .send(frame)
                    .await
                    .map_err(|_| BeginError::IllegalConnectionState)?;
                self.local_state = SessionState::BeginSent;
            }
            _ => return Err(BeginError::IllegalState),
        }

        Ok(())
    }

    pub async fn send_end(
        &mut self,
        writer: &mpsc::Sender<SessionFrame>,
        error: Option<definitions::Error>,
    ) -> Result<(), Error> {
        match self.local_state {
            SessionState::BeginSent | SessionState::Mapped => match error.is_some() {
                true => self.local_state = SessionState::Discarding,
                false => self.local_state = SessionState::EndSent,
            },
            SessionState::EndReceived => self.local_state = SessionState::Unmapped,
            // End has already been sent or exchanged; keep end idempotent
            SessionState::EndSent | SessionState::Discarding | SessionState::Unmapped => {
                return Ok(())
            }
        }

        let frame = SessionFrame::new(self.outgoing_channel, SessionFrameBody::End(End { error }));
        writer
            .send(frame)
            .await
            .map_err(|_| Error::IllegalConnectionState)?;
        Ok(())
    }

    pub fn on_outgoing_attach(&mut self, attach: Attach) -> SessionFrame {
        SessionFrame::new(self.outgoing_channel, SessionFrameBody::Attach(attach))
    }

    pub fn on_outgoing_flow(&mut self, link_flow: LinkFlow) -> SessionFrame {
        let flow = Flow {
            next_incoming_id: Some(self.next_incoming_id),
            incoming_window: self.incoming_window,
            next_outgoing_id: self.next_outgoing_id,
            outgoing_window: self.outgoing_window,
            handle: Some(link_flow.handle),
            delivery_count: link_flow.delivery_count,
            link_credit: link_flow.link_credit,
            available: link_flow.available,
            drain: link_flow.drain,
            echo: link_flow.echo,
            properties: link_flow.properties,
        };
        SessionFrame::new(self.outgoing_channel, SessionFrameBody::Flow(flow))
    }

    pub fn on_outgoing_transfer(
        &mut self,
        remote_handle: u32,
        mut transfer: Transfer,
        payload: Payload,
    ) -> SessionFrame {
        let delivery_id = self.next_outgoing_id;
        transfer.delivery_id = Some(delivery_id);
        self.next_outgoing_id = self.next_outgoing_id.wrapping_add(1);
        self.remote_incoming_window = self.remote_incoming_window.saturating_sub(1);

        let settled = transfer.settled.unwrap_or(false);
        if !settled {
            if let Some(delivery_tag) = &transfer.delivery_tag {
                self.delivery_tag_by_id.insert(
                    (Role::Receiver, delivery_id),
                    (remote_handle, delivery_tag.clone()),
                );

                // Let the tracker know its delivery id for later
                // dispositions
                if let Some(unsettled) = self
                    .relay_by_remote_handle
                    .get(&remote_handle)
                    .and_then(|relay| relay.unsettled_sender_map())
                {
                    if let Some(entry) = unsettled.lock().get_mut(delivery_tag) {
                        entry.delivery_id = Some(delivery_id);
                    }
                }
            }
        }

        SessionFrame::new(
            self.outgoing_channel,
            SessionFrameBody::Transfer {
                performative: transfer,
                payload,
            },
        )
    }

    pub fn on_outgoing_disposition(&mut self, disposition: Disposition) -> SessionFrame {
        SessionFrame::new(
            self.outgoing_channel,
            SessionFrameBody::Disposition(disposition),
        )
    }

    pub fn on_outgoing_detach(&mut self, detach: Detach) -> SessionFrame {
        let handle = detach.handle.0 as usize;
        if self.link_name_by_local_handle.contains(handle) {
            self.link_name_by_local_handle.remove(handle);
        }
        SessionFrame::new(self.outgoing_channel, SessionFrameBody::Detach(detach))
    }

    /// Notifies every link that the session (or the connection under it)
    /// has terminated, failing their pending deliveries
    pub fn terminate_links(&mut self, cause: TerminationCause) {
        for relay in self.relay_by_name.values_mut().flatten() {
            relay.terminate(cause.clone());
        }
        for relay in self.relay_by_remote_handle.values_mut() {
            relay.terminate(cause.clone());
        }
    }
}

/// Collapses a sorted id list into inclusive consecutive runs
fn consecutive_runs(ids: &[DeliveryNumber]) -> Vec<(DeliveryNumber, DeliveryNumber)> {
    let mut runs: Vec<(DeliveryNumber, DeliveryNumber)> = Vec::new();
    for &id in ids {
        match runs.last_mut() {
            Some((_, last)) if id == last.wrapping_add(1) => *last = id,
            _ => runs.push((id, id)),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::consecutive_runs;

    #[test]
    fn consecutive_ids_collapse_into_runs() {
        assert!(consecutive_runs(&[]).is_empty());
        assert_eq!(consecutive_runs(&[1]), vec![(1, 1)]);
        assert_eq!(consecutive_runs(&[1, 2, 3]), vec![(1, 3)]);
        assert_eq!(consecutive_runs(&[1, 2, 5, 7, 8]), vec![(1, 2), (5, 5), (7, 8)]);
    }
}
