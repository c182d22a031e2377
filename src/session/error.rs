//! Errors of the session layer

use fe2o3_amqp_types::definitions;
use tokio::task::JoinError;

use crate::{connection::AllocSessionError, link::LinkRelayError};

/// Error with beginning a session
#[derive(Debug, thiserror::Error)]
pub enum BeginError {
    /// Illegal local session state
    #[error("Illegal session state")]
    IllegalState,

    /// The connection has stopped
    #[error("Connection must have been closed")]
    IllegalConnectionState,

    /// All outgoing channels of the connection are in use
    #[error("Local channel-max reached")]
    LocalChannelMaxReached,

    /// The remote peer ended the session
    #[error("Remote session ended")]
    RemoteEnded,

    /// The remote peer ended the session with an error
    #[error("Remote session ended with error {:?}", .0)]
    RemoteEndedWithError(definitions::Error),
}

impl From<AllocSessionError> for BeginError {
    fn from(err: AllocSessionError) -> Self {
        match err {
            AllocSessionError::IllegalState => Self::IllegalState,
            AllocSessionError::ChannelMaxReached => Self::LocalChannelMaxReached,
        }
    }
}

/// Error with the session lifecycle
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A frame (other than attach) referenced a handle that is not
    /// attached
    #[error("A frame referenced a handle which is not currently attached")]
    UnattachedHandle,

    /// A remote attach referenced a link name that is not known locally
    #[error("Remote attach referenced an unknown link name")]
    RemoteAttachingLinkNameNotFound,

    /// An attach was received for a handle that is already in use
    #[error("An attach was received using a handle that is already in use")]
    HandleInUse,

    /// Illegal local session state
    #[error("Illegal session state")]
    IllegalState,

    /// The connection has stopped
    #[error("Connection must have been closed")]
    IllegalConnectionState,

    /// A transfer frame was routed to a sender link
    #[error("Found a Transfer frame sent to a sender link")]
    TransferFrameToSender,

    /// The remote peer ended the session
    #[error("Remote session ended")]
    RemoteEnded,

    /// The remote peer ended the session with an error
    #[error("Remote session ended with error {:?}", .0)]
    RemoteEndedWithError(definitions::Error),

    /// The engine task was cancelled or panicked
    #[error(transparent)]
    JoinError(#[from] JoinError),
}

impl Error {
    /// Re-derives a terminal end outcome so that repeated `end` calls
    /// observe the same result
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::UnattachedHandle => Self::UnattachedHandle,
            Self::RemoteAttachingLinkNameNotFound => Self::RemoteAttachingLinkNameNotFound,
            Self::HandleInUse => Self::HandleInUse,
            Self::IllegalState => Self::IllegalState,
            Self::IllegalConnectionState => Self::IllegalConnectionState,
            Self::TransferFrameToSender => Self::TransferFrameToSender,
            Self::RemoteEnded => Self::RemoteEnded,
            Self::RemoteEndedWithError(err) => Self::RemoteEndedWithError(err.clone()),
            Self::JoinError(_) => Self::IllegalState,
        }
    }
}

impl From<LinkRelayError> for Error {
    fn from(err: LinkRelayError) -> Self {
        match err {
            LinkRelayError::UnattachedHandle => Self::UnattachedHandle,
            LinkRelayError::TransferFrameToSender => Self::TransferFrameToSender,
        }
    }
}

/// Error with allocating a link on a session
#[derive(Debug, thiserror::Error)]
pub(crate) enum AllocLinkError {
    #[error("Illegal session state")]
    IllegalSessionState,

    #[error("Link name must be unique")]
    DuplicatedLinkName,
}
