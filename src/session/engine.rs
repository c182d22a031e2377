//! The per-session event loop.
//!
//! Multiplexes link traffic onto the connection and routes incoming
//! frames to the link relays. Before the loop stops, for any reason, it
//! notifies every link with the terminating cause so blocked operations
//! observe the correct error kind.

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, instrument, trace};

use crate::{
    connection::{self, engine::SessionId},
    control::{ConnectionControl, SessionControl},
    link::{LinkFrame, TerminationCause},
    util::Running,
};

use super::{
    error::{BeginError, Error},
    frame::{SessionFrame, SessionFrameBody},
    SessionInner, SessionState,
};

pub(crate) struct SessionEngine {
    conn_control: mpsc::Sender<ConnectionControl>,
    session: SessionInner,
    session_id: SessionId,
    control: mpsc::Receiver<SessionControl>,
    incoming: mpsc::Receiver<SessionFrame>,
    outgoing: mpsc::Sender<SessionFrame>,
    outgoing_link_frames: mpsc::Receiver<LinkFrame>,

    /// Failure-cause slot; written at most once by the first error
    failure: Option<Error>,
}

impl SessionEngine {
    /// Sends the local Begin and returns the engine without waiting for
    /// the remote Begin.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn begin(
        conn_control: mpsc::Sender<ConnectionControl>,
        session: SessionInner,
        session_id: SessionId,
        control: mpsc::Receiver<SessionControl>,
        incoming: mpsc::Receiver<SessionFrame>,
        outgoing: mpsc::Sender<SessionFrame>,
        outgoing_link_frames: mpsc::Receiver<LinkFrame>,
    ) -> Result<Self, BeginError> {
        let mut engine = Self {
            conn_control,
            session,
            session_id,
            control,
            incoming,
            outgoing,
            outgoing_link_frames,
            failure: None,
        };
        engine.session.send_begin(&engine.outgoing).await?;
        Ok(engine)
    }

    pub(crate) fn spawn(self) -> JoinHandle<Result<(), Error>> {
        tokio::spawn(self.event_loop())
    }

    async fn on_incoming(&mut self, frame: SessionFrame) -> Result<Running, Error> {
        let SessionFrame { channel, body } = frame;

        match body {
            SessionFrameBody::Begin(begin) => {
                self.session.on_incoming_begin(channel, begin)?;
            }
            SessionFrameBody::Attach(attach) => {
                self.session.on_incoming_attach(attach).await?;
            }
            SessionFrameBody::Flow(flow) => {
                if let Some(echo) = self.session.on_incoming_flow(flow)? {
                    self.outgoing
                        .send(echo)
                        .await
                        .map_err(|_| Error::IllegalConnectionState)?;
                }
            }
            SessionFrameBody::Transfer {
                performative,
                payload,
            } => {
                self.session
                    .on_incoming_transfer(performative, payload)
                    .await?;
            }
            SessionFrameBody::Disposition(disposition) => {
                let echoes = self.session.on_incoming_disposition(disposition)?;
                for echo in echoes {
                    let frame = self.session.on_outgoing_disposition(echo);
                    self.outgoing
                        .send(frame)
                        .await
                        .map_err(|_| Error::IllegalConnectionState)?;
                }
            }
            SessionFrameBody::Detach(detach) => {
                self.session.on_incoming_detach(detach).await?;
            }
            SessionFrameBody::End(end) => {
                let remote_error = self.session.on_incoming_end(channel, end)?;

                if matches!(self.session.local_state, SessionState::EndReceived) {
                    // A remotely initiated End closes every attached link
                    // with the remote cause before the local End reply
                    self.session
                        .terminate_links(TerminationCause::SessionEnded(remote_error.clone()));
                    self.drain_outgoing_link_frames().await?;
                    self.session.send_end(&self.outgoing, None).await?;
                }

                match remote_error {
                    Some(err) => return Err(Error::RemoteEndedWithError(err)),
                    None => {
                        if matches!(self.session.local_state, SessionState::EndReceived) {
                            return Err(Error::RemoteEnded);
                        }
                    }
                }
            }
        }

        match self.session.local_state {
            SessionState::Unmapped => Ok(Running::Stop),
            _ => Ok(Running::Continue),
        }
    }

    #[instrument(skip_all)]
    async fn on_control(&mut self, control: SessionControl) -> Result<Running, Error> {
        debug!(?control);
        match control {
            SessionControl::End(error) => {
                // Finish sending buffered link frames before the End
                self.drain_outgoing_link_frames().await?;
                self.session.send_end(&self.outgoing, error).await?;
            }
            SessionControl::AllocateLink {
                link_name,
                relay,
                responder,
            } => {
                let result = self.session.allocate_link(link_name, relay);
                responder
                    .send(result)
                    .map_err(|_| Error::UnattachedHandle)?;
            }
            SessionControl::DeallocateLink(link_name) => {
                self.session.deallocate_link(&link_name);
            }
            SessionControl::Disposition(disposition) => {
                let frame = self.session.on_outgoing_disposition(disposition);
                self.outgoing
                    .send(frame)
                    .await
                    .map_err(|_| Error::IllegalConnectionState)?;
            }
        }

        match self.session.local_state {
            SessionState::Unmapped => Ok(Running::Stop),
            _ => Ok(Running::Continue),
        }
    }

    async fn on_outgoing_link_frame(&mut self, frame: LinkFrame) -> Result<Running, Error> {
        match self.session.local_state {
            // Link traffic may be pipelined behind the local Begin
            SessionState::BeginSent | SessionState::Mapped => {}
            _ => return Err(Error::IllegalState),
        }

        let frame = match frame {
            LinkFrame::Attach(attach) => self.session.on_outgoing_attach(attach),
            LinkFrame::Flow(link_flow) => self.session.on_outgoing_flow(link_flow),
            LinkFrame::Transfer {
                remote_handle,
                performative,
                payload,
            } => self
                .session
                .on_outgoing_transfer(remote_handle, performative, payload),
            LinkFrame::Detach(detach) => self.session.on_outgoing_detach(detach),
            LinkFrame::Disposition(disposition) => {
                self.session.on_outgoing_disposition(disposition)
            }
            LinkFrame::SessionClosed(_) | LinkFrame::ConnectionClosed => {
                // Engine-to-link notifications never travel this way
                return Ok(Running::Continue);
            }
        };

        trace!(channel = frame.channel, frame = ?frame.body);
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| Error::IllegalConnectionState)?;

        Ok(Running::Continue)
    }

    /// Closes the link-frame channel and forwards everything already
    /// buffered, so an End does not overtake in-flight transfers
    async fn drain_outgoing_link_frames(&mut self) -> Result<(), Error> {
        self.outgoing_link_frames.close();
        while let Some(frame) = self.outgoing_link_frames.recv().await {
            self.on_outgoing_link_frame(frame).await?;
        }
        Ok(())
    }

    async fn on_error(&mut self, error: &Error) -> Running {
        match error {
            Error::IllegalConnectionState => {
                self.session
                    .terminate_links(TerminationCause::ConnectionClosed);
                Running::Stop
            }
            Error::RemoteEnded => Running::Stop,
            Error::RemoteEndedWithError(_) => Running::Stop,
            _ => {
                // A protocol error ends the session with the condition
                let condition = definitions_error_of(error);
                self.session
                    .terminate_links(TerminationCause::SessionEnded(condition.clone()));
                let _ = self.session.send_end(&self.outgoing, condition).await;
                match self.session.local_state {
                    SessionState::Unmapped => Running::Stop,
                    // Keep running to consume the remote End
                    _ => Running::Continue,
                }
            }
        }
    }

    #[instrument(name = "Session::event_loop", skip(self), fields(outgoing_channel = %self.session.outgoing_channel))]
    async fn event_loop(mut self) -> Result<(), Error> {
        loop {
            let result = tokio::select! {
                incoming = self.incoming.recv() => {
                    match incoming {
                        Some(frame) => self.on_incoming(frame).await,
                        None => {
                            // The connection engine is gone
                            match self.session.local_state {
                                SessionState::Unmapped => Ok(Running::Stop),
                                _ => Err(Error::IllegalConnectionState),
                            }
                        }
                    }
                },
                control = self.control.recv() => {
                    match control {
                        Some(control) => self.on_control(control).await,
                        None => {
                            // The session handle and all links are gone;
                            // end the session cleanly
                            match self.session.local_state {
                                SessionState::Mapped | SessionState::BeginSent => {
                                    self.on_control(SessionControl::End(None)).await
                                }
                                SessionState::Unmapped => Ok(Running::Stop),
                                _ => Ok(Running::Continue),
                            }
                        }
                    }
                },
                frame = self.outgoing_link_frames.recv() => {
                    match frame {
                        Some(frame) => self.on_outgoing_link_frame(frame).await,
                        None => Ok(Running::Continue),
                    }
                }
            };

            let running = match result {
                Ok(running) => running,
                Err(err) => {
                    error!(error = ?err);
                    let running = self.on_error(&err).await;
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

        // Any link still alive learns that the session is gone
        self.session
            .terminate_links(TerminationCause::SessionEnded(None));
        self.control.close();
        self.outgoing_link_frames.close();

        connection::deallocate_session(&self.conn_control, self.session_id).await;

        debug!("Stopped");
        match self.failure.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn definitions_error_of(error: &Error) -> Option<fe2o3_amqp_types::definitions::Error> {
    use fe2o3_amqp_types::definitions::{self, AmqpError, SessionError};

    let condition = match error {
        Error::UnattachedHandle => {
            definitions::Error::new(SessionError::UnattachedHandle, None, None)
        }
        Error::HandleInUse => definitions::Error::new(SessionError::HandleInUse, None, None),
        Error::RemoteAttachingLinkNameNotFound => definitions::Error::new(
            AmqpError::InternalError,
            Some("Link name is not found".to_string()),
            None,
        ),
        Error::TransferFrameToSender => definitions::Error::new(
            AmqpError::NotAllowed,
            Some("Found a Transfer frame sent to a sender link".to_string()),
            None,
        ),
        _ => definitions::Error::new(AmqpError::IllegalState, None, None),
    };
    Some(condition)
}
