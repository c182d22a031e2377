//! Implementation of the AMQP 1.0 connection

use std::{cmp::min, collections::BTreeMap, io, time::Duration};

use fe2o3_amqp_types::{
    definitions::{self, AmqpError},
    performatives::{Begin, Close, End, Open},
    primitives::Symbol,
};
use futures_util::{Sink, SinkExt};
use slab::Slab;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{instrument, trace};

use crate::{
    control::ConnectionControl,
    frames::amqp::{Frame, FrameBody},
    link::{delivery::Sendable, error::AttachError, tracker::Tracker, Sender},
    session::{error::BeginError, frame::{SessionFrame, SessionFrameBody}, Session},
};

use self::engine::SessionId;

pub mod builder;
pub mod engine;
mod error;
pub mod heartbeat;
pub use builder::Builder;
pub(crate) use error::AllocSessionError;
pub use error::{Error, OpenError};

/// Connection states as defined in the AMQP 1.0 specification Part 2.4.6.
///
/// Only the states reachable by a client endpoint are represented.
#[derive(Debug, Clone)]
pub enum ConnectionState {
    /// A transport exists but nothing has been sent or received
    Start,

    /// The connection header has been sent but none has been received
    HeaderSent,

    /// Connection headers have been exchanged
    HeaderExchange,

    /// Both the header and the Open frame have been sent, nothing received
    OpenPipe,

    /// Headers exchanged, Open sent, no Open received yet
    OpenSent,

    /// Open sent and the Close frame pipelined after it
    ClosePipe,

    /// Both the header and the Open frame have been sent and received
    Opened,

    /// A Close frame has been received but not yet sent
    CloseReceived,

    /// A Close frame has been sent; incoming frames may still arrive
    CloseSent,

    /// A Close triggered by an error has been sent; incoming frames are
    /// silently discarded until the peer's Close arrives
    Discarding,

    /// Neither endpoint may write anything more onto the connection
    End,
}

pub(crate) const ANONYMOUS_RELAY: &str = "ANONYMOUS-RELAY";

/// Capabilities derived from the remote peer's Open frame
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    /// Whether the peer offered the `ANONYMOUS-RELAY` capability
    pub anonymous_relay: bool,

    /// The peer's offered capabilities as received
    pub offered: Vec<Symbol>,
}

impl From<&Open> for Capabilities {
    fn from(open: &Open) -> Self {
        let offered: Vec<Symbol> = open
            .offered_capabilities
            .as_ref()
            .map(|array| array.0.clone())
            .unwrap_or_default();
        let anonymous_relay = offered.iter().any(|cap| cap.as_str() == ANONYMOUS_RELAY);
        Self {
            anonymous_relay,
            offered,
        }
    }
}

/// Lifecycle events dispatched to the application's connection handlers.
///
/// Handlers never run on the engine loop; a dedicated dispatch task invokes
/// them in order.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The Open frames have been exchanged
    Connected(Capabilities),

    /// The connection failed, carrying the remote condition when the peer
    /// supplied one
    Failed(Option<definitions::Error>),
}

/// Handler invoked on connection lifecycle events
pub type ConnectionEventHandler = Box<dyn Fn(ConnectionEvent) + Send + 'static>;

/// A handle to an open AMQP 1.0 connection.
///
/// The handle communicates with the connection's event-loop task; dropping
/// the handle closes the connection.
pub struct Connection {
    pub(crate) control: mpsc::Sender<ConnectionControl>,
    pub(crate) outgoing: mpsc::Sender<SessionFrame>,
    engine_handle: Option<JoinHandle<Result<(), Error>>>,
    terminal: Option<Result<(), Error>>,

    pub(crate) timeouts: builder::Timeouts,
    pub(crate) session_buffer_size: usize,

    // Lazily created connection-level resources
    default_session: Option<Session>,
    anonymous_sender: Option<Sender>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("terminal", &self.terminal)
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.control.try_send(ConnectionControl::Close(None));
    }
}

impl Connection {
    /// Creates a builder for [`Connection`]
    pub fn builder() -> builder::Builder {
        builder::Builder::new()
    }

    /// Opens a connection to the given url with the default configuration.
    ///
    /// PLAIN SASL credentials are taken from the url when present.
    pub async fn open(
        container_id: impl Into<String>,
        url: impl TryInto<url::Url, Error = url::ParseError>,
    ) -> Result<Connection, OpenError> {
        Connection::builder()
            .container_id(container_id)
            .open(url)
            .await
    }

    /// Checks whether the underlying event loop has stopped
    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }

    /// Waits until the remote Open frame has been received and returns the
    /// capabilities it carried.
    ///
    /// Bounded by the configured `request_timeout`.
    pub async fn capabilities(&self) -> Result<Capabilities, Error> {
        let request_timeout = self.timeouts.request;
        wait_for_capabilities(&self.control, request_timeout).await
    }

    /// Begins a new session on this connection
    pub async fn open_session(&mut self) -> Result<Session, BeginError> {
        Session::begin(self).await
    }

    /// Returns the connection's default session, beginning it on first use
    pub async fn default_session(&mut self) -> Result<&mut Session, BeginError> {
        if self.default_session.is_none() {
            let session = Session::begin(self).await?;
            self.default_session = Some(session);
        }
        Ok(self.default_session.as_mut().unwrap())
    }

    /// Opens a sender on the default session
    pub async fn open_sender(&mut self, address: impl Into<String>) -> Result<Sender, AttachError> {
        let address = address.into();
        let session = self.default_session().await?;
        session.open_sender(address).await
    }

    /// Opens a receiver on the default session
    pub async fn open_receiver(
        &mut self,
        address: impl Into<String>,
    ) -> Result<crate::link::Receiver, AttachError> {
        let address = address.into();
        let session = self.default_session().await?;
        session.open_receiver(address).await
    }

    /// Opens an anonymous sender on the default session.
    ///
    /// Requires the peer to offer the `ANONYMOUS-RELAY` capability; the
    /// attach is held until the remote Open is known.
    pub async fn open_anonymous_sender(&mut self) -> Result<Sender, AttachError> {
        let session = self.default_session().await?;
        session.open_anonymous_sender().await
    }

    /// Sends a message through the connection's anonymous sender, creating
    /// the sender on first use.
    ///
    /// The message must carry its routing address in `properties.to`.
    pub async fn send(
        &mut self,
        sendable: impl Into<Sendable>,
    ) -> Result<Tracker, crate::link::error::SendError> {
        if self.anonymous_sender.is_none() {
            let sender = self
                .open_anonymous_sender()
                .await
                .map_err(crate::link::error::SendError::from_attach_error)?;
            self.anonymous_sender = Some(sender);
        }
        self.anonymous_sender.as_mut().unwrap().send(sendable).await
    }

    /// Closes the connection.
    ///
    /// Close is idempotent: every call after the first completes with the
    /// same terminal outcome as the first.
    pub async fn close(&mut self) -> Result<(), Error> {
        self.close_inner(None).await
    }

    /// Closes the connection with an error condition
    pub async fn close_with_error(
        &mut self,
        error: impl Into<definitions::Error>,
    ) -> Result<(), Error> {
        self.close_inner(Some(error.into())).await
    }

    async fn close_inner(&mut self, error: Option<definitions::Error>) -> Result<(), Error> {
        if let Some(terminal) = &self.terminal {
            return replay_terminal(terminal);
        }

        // Tear down the lazy connection-level resources first so their
        // Detach/End frames go out ahead of the Close.
        self.anonymous_sender = None;
        if let Some(mut session) = self.default_session.take() {
            let _ = session.end().await;
        }

        // A send error means the engine has already stopped; the join below
        // will surface its outcome.
        let _ = self.control.send(ConnectionControl::Close(error)).await;

        let outcome = match self.engine_handle.take() {
            Some(handle) => match handle.await {
                Ok(res) => res,
                Err(join_error) => Err(Error::JoinError(join_error)),
            },
            None => Err(Error::IllegalState),
        };
        let replayed = replay_terminal(&outcome);
        self.terminal = Some(outcome);
        replayed
    }

    pub(crate) async fn allocate_session(
        &mut self,
        tx: mpsc::Sender<SessionFrame>,
    ) -> Result<(u16, SessionId), BeginError> {
        let (responder, resp_rx) = oneshot::channel();
        self.control
            .send(ConnectionControl::AllocateSession { tx, responder })
            .await
            .map_err(|_| BeginError::IllegalConnectionState)?;
        resp_rx
            .await
            .map_err(|_| BeginError::IllegalConnectionState)?
            .map_err(Into::into)
    }
}

fn replay_terminal(terminal: &Result<(), Error>) -> Result<(), Error> {
    match terminal {
        Ok(()) => Ok(()),
        Err(err) => Err(err.duplicate()),
    }
}

/// Waits on the engine until the remote Open is known
pub(crate) async fn wait_for_capabilities(
    control: &mpsc::Sender<ConnectionControl>,
    timeout: Duration,
) -> Result<Capabilities, Error> {
    let (responder, resp_rx) = oneshot::channel();
    control
        .send(ConnectionControl::WaitForCapabilities { responder })
        .await
        .map_err(|_| Error::IllegalState)?;

    match tokio::time::timeout(timeout, resp_rx).await {
        Ok(Ok(capabilities)) => Ok(capabilities),
        // The engine stopped before the remote Open arrived
        Ok(Err(_)) => Err(Error::RemoteClosed),
        Err(_elapsed) => Err(Error::OperationTimedOut),
    }
}

pub(crate) async fn deallocate_session(
    control: &mpsc::Sender<ConnectionControl>,
    session_id: SessionId,
) {
    let _ = control
        .send(ConnectionControl::DeallocateSession(session_id))
        .await;
}

/// The protocol-side state of a connection. Owned and mutated exclusively
/// by the [`engine::ConnectionEngine`] event loop.
#[derive(Debug)]
pub(crate) struct ConnectionInner {
    local_state: ConnectionState,
    local_open: Open,

    local_sessions: Slab<mpsc::Sender<SessionFrame>>,
    session_by_incoming_channel: BTreeMap<u16, SessionId>,
    session_by_outgoing_channel: BTreeMap<u16, SessionId>,

    remote_open: Option<Open>,
    agreed_channel_max: u16,
}

impl ConnectionInner {
    pub(crate) fn new(local_state: ConnectionState, local_open: Open) -> Self {
        let agreed_channel_max = local_open.channel_max.0;
        Self {
            local_state,
            local_open,
            local_sessions: Slab::new(),
            session_by_incoming_channel: BTreeMap::new(),
            session_by_outgoing_channel: BTreeMap::new(),
            remote_open: None,
            agreed_channel_max,
        }
    }

    pub(crate) fn local_state(&self) -> &ConnectionState {
        &self.local_state
    }

    pub(crate) fn local_open(&self) -> &Open {
        &self.local_open
    }

    pub(crate) fn allocate_session(
        &mut self,
        tx: mpsc::Sender<SessionFrame>,
    ) -> Result<(u16, SessionId), AllocSessionError> {
        match &self.local_state {
            ConnectionState::Start
            | ConnectionState::HeaderSent
            | ConnectionState::HeaderExchange
            | ConnectionState::ClosePipe
            | ConnectionState::CloseSent
            | ConnectionState::CloseReceived
            | ConnectionState::Discarding
            | ConnectionState::End => return Err(AllocSessionError::IllegalState),
            // Pipelined Begin frames are allowed once the local Open is on
            // the wire
            ConnectionState::OpenPipe | ConnectionState::OpenSent | ConnectionState::Opened => {}
        };

        let entry = self.local_sessions.vacant_entry();
        let session_id = entry.key();

        if session_id > self.agreed_channel_max as usize {
            return Err(AllocSessionError::ChannelMaxReached);
        }
        entry.insert(tx);
        let channel = session_id as u16;
        self.session_by_outgoing_channel.insert(channel, session_id);
        Ok((channel, session_id))
    }

    pub(crate) fn deallocate_session(&mut self, session_id: SessionId) {
        if self.local_sessions.try_remove(session_id).is_some() {
            self.session_by_outgoing_channel
                .retain(|_, id| *id != session_id);
            self.session_by_incoming_channel
                .retain(|_, id| *id != session_id);
        }
    }

    /// Reacting to the remote Open frame.
    ///
    /// Returns the capabilities the peer announced.
    #[instrument(name = "RECV", skip_all)]
    pub(crate) fn on_incoming_open(
        &mut self,
        channel: u16,
        open: Open,
    ) -> Result<Capabilities, Error> {
        trace!(channel, frame = ?open);
        match &self.local_state {
            ConnectionState::OpenSent => self.local_state = ConnectionState::Opened,
            ConnectionState::OpenPipe => self.local_state = ConnectionState::OpenSent,
            ConnectionState::ClosePipe => self.local_state = ConnectionState::CloseSent,
            _ => return Err(amqp_error(AmqpError::IllegalState, None)),
        }

        self.agreed_channel_max = min(self.local_open.channel_max.0, open.channel_max.0);
        let capabilities = Capabilities::from(&open);
        self.remote_open = Some(open);

        Ok(capabilities)
    }

    /// Reacting to a remote Begin frame
    #[instrument(name = "RECV", skip_all)]
    pub(crate) async fn on_incoming_begin(
        &mut self,
        channel: u16,
        begin: Begin,
    ) -> Result<(), Error> {
        trace!(channel, frame = ?begin);
        match &self.local_state {
            ConnectionState::Opened => {}
            _ => return Err(amqp_error(AmqpError::IllegalState, None)),
        }

        match begin.remote_channel {
            Some(outgoing_channel) => {
                let session_id = *self
                    .session_by_outgoing_channel
                    .get(&outgoing_channel)
                    .ok_or_else(|| amqp_error(AmqpError::NotFound, None))?;

                if self.session_by_incoming_channel.contains_key(&channel) {
                    return Err(amqp_error(AmqpError::NotAllowed, None));
                }
                self.session_by_incoming_channel.insert(channel, session_id);

                let tx = self
                    .local_sessions
                    .get_mut(session_id)
                    .ok_or_else(|| amqp_error(AmqpError::NotFound, None))?;
                let sframe = SessionFrame::new(channel, SessionFrameBody::Begin(begin));
                tx.send(sframe)
                    .await
                    .map_err(|_| amqp_error(AmqpError::NotFound, None))?;
            }
            None => {
                // A locally initiated session must carry the local channel
                // in remote-channel of the peer's Begin
                return Err(amqp_error(
                    AmqpError::NotImplemented,
                    Some("Remotely initiated session is not supported".to_string()),
                ));
            }
        }

        Ok(())
    }

    /// Reacting to a remote End frame
    #[instrument(name = "RECV", skip_all)]
    pub(crate) async fn on_incoming_end(&mut self, channel: u16, end: End) -> Result<(), Error> {
        trace!(channel, frame = ?end);
        match &self.local_state {
            ConnectionState::Opened => {}
            _ => return Err(amqp_error(AmqpError::IllegalState, None)),
        }

        let session_id = self
            .session_by_incoming_channel
            .remove(&channel)
            .ok_or_else(|| amqp_error(AmqpError::NotFound, None))?;
        let sframe = SessionFrame::new(channel, SessionFrameBody::End(end));
        // An error here only means the session engine already stopped,
        // which the deallocation control will clean up
        if let Some(tx) = self.local_sessions.get_mut(session_id) {
            let _ = tx.send(sframe).await;
        }

        Ok(())
    }

    /// Reacting to a remote Close frame.
    ///
    /// Returns the remote error condition when the peer carried one.
    #[instrument(name = "RECV", skip_all)]
    pub(crate) fn on_incoming_close(
        &mut self,
        channel: u16,
        close: Close,
    ) -> Result<Option<definitions::Error>, Error> {
        trace!(channel, frame = ?close);
        match &self.local_state {
            ConnectionState::Opened => self.local_state = ConnectionState::CloseReceived,
            ConnectionState::CloseSent | ConnectionState::Discarding => {
                self.local_state = ConnectionState::End
            }
            _ => return Err(amqp_error(AmqpError::IllegalState, None)),
        };

        Ok(close.error)
    }

    #[instrument(name = "SEND", skip_all)]
    pub(crate) async fn send_open<W>(&mut self, writer: &mut W) -> Result<(), Error>
    where
        W: Sink<Frame> + Send + Unpin,
        W::Error: Into<Error>,
    {
        let body = FrameBody::Open(self.local_open.clone());
        let frame = Frame::new(0u16, body);
        trace!(channel = 0, frame = ?frame.body);
        writer.send(frame).await.map_err(Into::into)?;

        match &self.local_state {
            ConnectionState::HeaderExchange => self.local_state = ConnectionState::OpenSent,
            ConnectionState::HeaderSent => self.local_state = ConnectionState::OpenPipe,
            _ => return Err(amqp_error(AmqpError::IllegalState, None)),
        }

        Ok(())
    }

    #[instrument(name = "SEND", skip_all)]
    pub(crate) async fn send_close<W>(
        &mut self,
        writer: &mut W,
        error: Option<definitions::Error>,
    ) -> Result<(), Error>
    where
        W: Sink<Frame> + Send + Unpin,
        W::Error: Into<Error>,
    {
        match &self.local_state {
            // Close has already been sent or exchanged; sending another is
            // not an error so that close stays idempotent
            ConnectionState::CloseSent | ConnectionState::Discarding | ConnectionState::End => {
                return Ok(())
            }
            _ => {}
        }

        let discarding = error.is_some();
        let frame = Frame::new(0u16, FrameBody::Close(Close { error }));
        trace!(channel = 0, frame = ?frame.body);
        writer.send(frame).await.map_err(Into::into)?;

        match &self.local_state {
            ConnectionState::Opened => match discarding {
                true => self.local_state = ConnectionState::Discarding,
                false => self.local_state = ConnectionState::CloseSent,
            },
            ConnectionState::CloseReceived => self.local_state = ConnectionState::End,
            ConnectionState::OpenSent => self.local_state = ConnectionState::ClosePipe,
            ConnectionState::OpenPipe => self.local_state = ConnectionState::ClosePipe,
            _ => return Err(amqp_error(AmqpError::IllegalState, None)),
        }
        Ok(())
    }

    pub(crate) fn on_outgoing_begin(&mut self, channel: u16, begin: Begin) -> Frame {
        Frame::new(channel, FrameBody::Begin(begin))
    }

    pub(crate) fn on_outgoing_end(&mut self, channel: u16, end: End) -> Result<Frame, Error> {
        self.session_by_outgoing_channel
            .remove(&channel)
            .ok_or_else(|| amqp_error(AmqpError::NotFound, None))?;
        Ok(Frame::new(channel, FrameBody::End(end)))
    }

    pub(crate) fn session_tx_by_incoming_channel(
        &mut self,
        channel: u16,
    ) -> Option<&mut mpsc::Sender<SessionFrame>> {
        let session_id = self.session_by_incoming_channel.get(&channel)?;
        self.local_sessions.get_mut(*session_id)
    }
}

fn amqp_error(condition: AmqpError, description: Option<String>) -> Error {
    Error::TransportError(crate::transport::Error::AmqpError {
        condition,
        description,
    })
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::TransportError(crate::transport::Error::Io(err))
    }
}

#[cfg(test)]
mod tests {
    use fe2o3_amqp_types::{performatives::Open, primitives::Symbol};

    use super::{Capabilities, ANONYMOUS_RELAY};

    fn open_with_capabilities(capabilities: Option<Vec<Symbol>>) -> Open {
        Open {
            container_id: "peer".into(),
            hostname: None,
            max_frame_size: Default::default(),
            channel_max: Default::default(),
            idle_time_out: None,
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: capabilities.map(Into::into),
            desired_capabilities: None,
            properties: None,
        }
    }

    #[test]
    fn anonymous_relay_is_detected() {
        let open = open_with_capabilities(Some(vec![Symbol::from(ANONYMOUS_RELAY)]));
        let capabilities = Capabilities::from(&open);
        assert!(capabilities.anonymous_relay);
    }

    #[test]
    fn missing_capabilities_mean_no_relay() {
        let open = open_with_capabilities(None);
        let capabilities = Capabilities::from(&open);
        assert!(!capabilities.anonymous_relay);
        assert!(capabilities.offered.is_empty());
    }
}
