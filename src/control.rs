//! Control messages sent from the application-facing handles to the
//! connection and session engine loops

use fe2o3_amqp_types::{definitions, performatives::Disposition};
use tokio::sync::{mpsc, oneshot};

use crate::{
    connection::{engine::SessionId, AllocSessionError, Capabilities},
    link::{LinkRelay, LocalHandle},
    session::{error::AllocLinkError, frame::SessionFrame},
};

#[derive(Debug)]
pub(crate) enum ConnectionControl {
    /// Send a Close frame, optionally carrying an error condition
    Close(Option<definitions::Error>),

    /// Allocate an outgoing channel for a new session
    AllocateSession {
        tx: mpsc::Sender<SessionFrame>,
        responder: oneshot::Sender<Result<(u16, SessionId), AllocSessionError>>,
    },

    /// Drop a session that has fully ended
    DeallocateSession(SessionId),

    /// Resolve once the remote Open has been received.
    ///
    /// The responder fires immediately when the remote Open is already
    /// known; it is parked otherwise. Dropping the engine drops all parked
    /// responders, which the caller observes as a closed connection.
    WaitForCapabilities {
        responder: oneshot::Sender<Capabilities>,
    },
}

#[derive(Debug)]
pub(crate) enum SessionControl {
    /// Send an End frame, optionally carrying an error condition
    End(Option<definitions::Error>),

    /// Allocate an output handle for a new link
    AllocateLink {
        link_name: String,
        relay: LinkRelay,
        responder: oneshot::Sender<Result<LocalHandle, AllocLinkError>>,
    },

    /// Drop a link that has fully detached
    DeallocateLink(String),

    /// Emit a disposition on behalf of a receiver or a tracker
    Disposition(Disposition),
}
