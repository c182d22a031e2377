//! The per-connection event loop.
//!
//! Every mutation of protocol state, every timer, and every frame in or
//! out of the transport happens on this single task. Application-facing
//! handles only ever submit control messages and await responders.

use std::io;
use std::time::Duration;

use fe2o3_amqp_types::definitions::{self, AmqpError};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, trace};

use crate::control::ConnectionControl;
use crate::frames::amqp::{Frame, FrameBody};
use crate::session::frame::{SessionFrame, SessionFrameBody};
use crate::transport::Transport;
use crate::util::{OneshotDeadline, Running};

use super::heartbeat::HeartBeat;
use super::{Capabilities, ConnectionEvent, ConnectionInner, ConnectionState, Error, OpenError};

pub(crate) type SessionId = usize;

pub(crate) struct ConnectionEngine<Io> {
    transport: Transport<Io, Frame>,
    connection: ConnectionInner,
    control: mpsc::Receiver<ConnectionControl>,
    outgoing_session_frames: mpsc::Receiver<SessionFrame>,
    heartbeat: HeartBeat,

    open_deadline: OneshotDeadline,
    close_deadline: OneshotDeadline,
    close_timeout: Duration,

    capabilities: Option<Capabilities>,
    capability_waiters: Vec<oneshot::Sender<Capabilities>>,

    events: Option<mpsc::UnboundedSender<ConnectionEvent>>,

    /// Failure-cause slot; written at most once by the first error
    failure: Option<Error>,
}

impl<Io> std::fmt::Debug for ConnectionEngine<Io> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEngine")
            .field("local_state", self.connection.local_state())
            .finish()
    }
}

impl<Io> ConnectionEngine<Io>
where
    Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Sends the local Open and returns the engine without waiting for the
    /// remote Open; the open deadline is armed and enforced in the loop.
    pub(crate) async fn open_pipelined(
        transport: Transport<Io, Frame>,
        connection: ConnectionInner,
        control: mpsc::Receiver<ConnectionControl>,
        outgoing_session_frames: mpsc::Receiver<SessionFrame>,
        open_timeout: Duration,
        close_timeout: Duration,
        events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    ) -> Result<Self, OpenError> {
        let mut engine = Self {
            transport,
            connection,
            control,
            outgoing_session_frames,
            heartbeat: HeartBeat::never(),
            open_deadline: OneshotDeadline::after(open_timeout),
            close_deadline: OneshotDeadline::never(),
            close_timeout,
            capabilities: None,
            capability_waiters: Vec::new(),
            events,
            failure: None,
        };

        engine
            .connection
            .send_open(&mut engine.transport)
            .await
            .map_err(|error| match error {
                Error::TransportError(err) => OpenError::TransportError(err),
                _ => OpenError::IllegalState,
            })?;

        Ok(engine)
    }

    pub(crate) fn spawn(self) -> JoinHandle<Result<(), Error>> {
        tokio::spawn(self.event_loop())
    }

    fn emit_event(&mut self, event: ConnectionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn resolve_capabilities(&mut self, capabilities: Capabilities) {
        for waiter in self.capability_waiters.drain(..) {
            let _ = waiter.send(capabilities.clone());
        }
        self.capabilities = Some(capabilities);
    }

    async fn forward_to_session(&mut self, channel: u16, frame: SessionFrame) -> Result<(), Error> {
        match self.connection.local_state() {
            ConnectionState::Opened => {}
            _ => return Err(AmqpError::IllegalState.into()),
        };

        match self.connection.session_tx_by_incoming_channel(channel) {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| AmqpError::NotFound.into()),
            None => Err(AmqpError::NotFound.into()),
        }
    }

    async fn on_incoming(&mut self, incoming: Result<Frame, Error>) -> Result<Running, Error> {
        let Frame { channel, body } = incoming?;

        match body {
            FrameBody::Open(open) => {
                let remote_max_frame_size = open.max_frame_size.0;
                let remote_idle_timeout = open.idle_time_out;
                let capabilities = self.connection.on_incoming_open(channel, open)?;

                // Outgoing frames must now respect the smaller of the two
                // announced maxima
                let max_frame_size = std::cmp::min(
                    self.connection.local_open().max_frame_size.0,
                    remote_max_frame_size,
                );
                self.transport
                    .set_encoder_max_frame_size(max_frame_size as usize);

                self.heartbeat = match remote_idle_timeout {
                    Some(millis) if millis > 0 => {
                        // Tick twice per remote idle period to stay well
                        // within the deadline
                        let period = Duration::from_millis((millis / 2).max(1) as u64);
                        HeartBeat::new(period)
                    }
                    _ => HeartBeat::never(),
                };

                self.open_deadline.disarm();
                self.resolve_capabilities(capabilities.clone());
                self.emit_event(ConnectionEvent::Connected(capabilities));
            }
            FrameBody::Begin(begin) => {
                self.connection.on_incoming_begin(channel, begin).await?;
            }
            FrameBody::Attach(attach) => {
                let sframe = SessionFrame::new(channel, SessionFrameBody::Attach(attach));
                self.forward_to_session(channel, sframe).await?;
            }
            FrameBody::Flow(flow) => {
                let sframe = SessionFrame::new(channel, SessionFrameBody::Flow(flow));
                self.forward_to_session(channel, sframe).await?;
            }
            FrameBody::Transfer {
                performative,
                payload,
            } => {
                let sframe = SessionFrame::new(
                    channel,
                    SessionFrameBody::Transfer {
                        performative,
                        payload,
                    },
                );
                self.forward_to_session(channel, sframe).await?;
            }
            FrameBody::Disposition(disposition) => {
                let sframe = SessionFrame::new(channel, SessionFrameBody::Disposition(disposition));
                self.forward_to_session(channel, sframe).await?;
            }
            FrameBody::Detach(detach) => {
                let sframe = SessionFrame::new(channel, SessionFrameBody::Detach(detach));
                self.forward_to_session(channel, sframe).await?;
            }
            FrameBody::End(end) => {
                self.connection.on_incoming_end(channel, end).await?;
            }
            FrameBody::Close(close) => {
                let remote_error = self.connection.on_incoming_close(channel, close)?;

                // A remotely initiated close still expects the local Close
                // reply
                if matches!(self.connection.local_state(), ConnectionState::CloseReceived) {
                    self.connection.send_close(&mut self.transport, None).await?;
                }

                if let Some(err) = remote_error {
                    return Err(Error::RemoteClosedWithError(err));
                }
            }
            FrameBody::Empty => {
                // Keepalive; the idle timer was reset by the transport
            }
        }

        match self.connection.local_state() {
            ConnectionState::End => Ok(Running::Stop),
            _ => Ok(Running::Continue),
        }
    }

    #[instrument(skip_all)]
    async fn on_control(&mut self, control: ConnectionControl) -> Result<Running, Error> {
        debug!(?control);
        match control {
            ConnectionControl::Close(error) => {
                self.connection.send_close(&mut self.transport, error).await?;
                if matches!(
                    self.connection.local_state(),
                    ConnectionState::CloseSent
                        | ConnectionState::Discarding
                        | ConnectionState::ClosePipe
                ) {
                    // Bound the wait for the remote Close; firing forcibly
                    // shuts the transport down
                    self.close_deadline = OneshotDeadline::after(self.close_timeout);
                }
            }
            ConnectionControl::AllocateSession { tx, responder } => {
                let result = self.connection.allocate_session(tx);
                responder.send(result).map_err(|_| {
                    Error::from(io::Error::new(
                        io::ErrorKind::Other,
                        "Connection handle is dropped",
                    ))
                })?;
            }
            ConnectionControl::DeallocateSession(session_id) => {
                self.connection.deallocate_session(session_id);
            }
            ConnectionControl::WaitForCapabilities { responder } => {
                match &self.capabilities {
                    Some(capabilities) => {
                        let _ = responder.send(capabilities.clone());
                    }
                    None => self.capability_waiters.push(responder),
                }
            }
        }

        match self.connection.local_state() {
            ConnectionState::End => Ok(Running::Stop),
            _ => Ok(Running::Continue),
        }
    }

    #[instrument(name = "SEND", skip_all)]
    async fn on_outgoing_session_frame(&mut self, frame: SessionFrame) -> Result<Running, Error> {
        match self.connection.local_state() {
            // Session traffic may be pipelined behind the local Open
            ConnectionState::Opened | ConnectionState::OpenSent | ConnectionState::OpenPipe => {}
            _ => return Err(AmqpError::IllegalState.into()),
        }

        let SessionFrame { channel, body } = frame;
        let frame = match body {
            SessionFrameBody::Begin(begin) => self.connection.on_outgoing_begin(channel, begin),
            SessionFrameBody::Attach(attach) => Frame::new(channel, FrameBody::Attach(attach)),
            SessionFrameBody::Flow(flow) => Frame::new(channel, FrameBody::Flow(flow)),
            SessionFrameBody::Transfer {
                performative,
                payload,
            } => Frame::new(
                channel,
                FrameBody::Transfer {
                    performative,
                    payload,
                },
            ),
            SessionFrameBody::Disposition(disposition) => {
                Frame::new(channel, FrameBody::Disposition(disposition))
            }
            SessionFrameBody::Detach(detach) => Frame::new(channel, FrameBody::Detach(detach)),
            SessionFrameBody::End(end) => self.connection.on_outgoing_end(channel, end)?,
        };

        trace!(channel = frame.channel, frame = ?frame.body);
        self.transport.send(frame).await?;
        Ok(Running::Continue)
    }

    async fn on_heartbeat(&mut self) -> Result<Running, Error> {
        match self.connection.local_state() {
            ConnectionState::Start | ConnectionState::HeaderSent => return Ok(Running::Continue),
            ConnectionState::CloseSent | ConnectionState::Discarding => {
                return Ok(Running::Continue)
            }
            ConnectionState::End => return Ok(Running::Stop),
            _ => {}
        }

        self.transport.send(Frame::empty()).await?;
        Ok(Running::Continue)
    }

    async fn on_open_deadline(&mut self) -> Result<Running, Error> {
        // The deadline is disarmed as soon as the remote Open arrives, so
        // firing always means the open has timed out
        Err(Error::OperationTimedOut)
    }

    async fn on_error(&mut self, error: &Error) -> Running {
        match error {
            Error::TransportError(crate::transport::Error::Io(_))
            | Error::TransportError(crate::transport::Error::IdleTimeoutElapsed) => Running::Stop,
            Error::TransportError(crate::transport::Error::AmqpError {
                condition,
                description,
            }) => {
                let err =
                    definitions::Error::new(condition.clone(), description.clone(), None);
                let _ = self
                    .connection
                    .send_close(&mut self.transport, Some(err))
                    .await;
                self.recv_remote_close_bounded().await;
                Running::Stop
            }
            Error::IllegalState => {
                let err = definitions::Error::new(AmqpError::IllegalState, None, None);
                let _ = self
                    .connection
                    .send_close(&mut self.transport, Some(err))
                    .await;
                self.recv_remote_close_bounded().await;
                Running::Stop
            }
            Error::OperationTimedOut => {
                let _ = self.connection.send_close(&mut self.transport, None).await;
                Running::Stop
            }
            Error::RemoteClosed | Error::RemoteClosedWithError(_) => Running::Stop,
            Error::JoinError(_) => Running::Stop,
        }
    }

    /// Discards incoming frames until the peer's Close arrives, bounded by
    /// the close timeout
    async fn recv_remote_close_bounded(&mut self) {
        let wait = tokio::time::timeout(self.close_timeout, async {
            loop {
                match self.transport.next().await {
                    Some(Ok(Frame { body, .. })) => {
                        if let FrameBody::Close(_) = body {
                            break;
                        }
                    }
                    Some(Err(_)) | None => break,
                }
            }
        });
        if wait.await.is_err() {
            debug!("Timed out waiting for the remote Close");
        }
    }

    #[instrument(name = "Connection::event_loop", skip(self), fields(container_id = %self.connection.local_open().container_id))]
    async fn event_loop(mut self) -> Result<(), Error> {
        loop {
            let result = tokio::select! {
                _ = self.heartbeat.next() => self.on_heartbeat().await,
                _ = self.open_deadline.fired() => self.on_open_deadline().await,
                _ = self.close_deadline.fired() => {
                    // The remote Close never arrived; shut the transport
                    debug!("Close timeout fired, dropping the transport");
                    Ok(Running::Stop)
                },
                incoming = self.transport.next() => {
                    match incoming {
                        Some(incoming) => self.on_incoming(incoming.map_err(Into::into)).await,
                        None => {
                            match self.connection.local_state() {
                                ConnectionState::ClosePipe
                                | ConnectionState::Discarding
                                | ConnectionState::End => Ok(Running::Stop),
                                _ => Err(Error::from(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "Transport closed before connection close",
                                ))),
                            }
                        },
                    }
                },
                control = self.control.recv() => {
                    match control {
                        Some(control) => self.on_control(control).await,
                        None => Ok(Running::Stop),
                    }
                },
                frame = self.outgoing_session_frames.recv() => {
                    match frame {
                        Some(frame) => self.on_outgoing_session_frame(frame).await,
                        None => Ok(Running::Stop),
                    }
                }
            };

            let running = match result {
                Ok(running) => running,
                Err(err) => {
                    error!(error = ?err);
                    let running = self.on_error(&err).await;
                    // First writer wins; later errors do not overwrite the
                    // recorded cause
                    if self.failure.is_none() {
                        self.failure = Some(err);
                    }
                    running
                }
            };

            match running {
                Running::Continue => {}
                Running::Stop => break,
            }
        }

        // Closing the channels prevents further control/frame submission;
        // parked capability waiters are dropped, which their callers
        // observe as a closed connection.
        self.control.close();
        self.outgoing_session_frames.close();
        self.capability_waiters.clear();

        let outcome = match self.failure.take() {
            Some(error) => {
                let remote_error = match &error {
                    Error::RemoteClosedWithError(err) => Some(err.clone()),
                    _ => None,
                };
                self.emit_event(ConnectionEvent::Failed(remote_error));
                Err(error)
            }
            None => Ok(()),
        };

        debug!("Stopped");
        outcome
    }
}

impl From<AmqpError> for Error {
    fn from(condition: AmqpError) -> Self {
        Error::TransportError(crate::transport::Error::AmqpError {
            condition,
            description: None,
        })
    }
}
