//! Errors of the link layer.
//!
//! Each operation surfaces the layer that terminated it: a remotely
//! detached link, a remotely ended session, or a closed connection.

use fe2o3_amqp_types::definitions;

use crate::session::error::BeginError;

/// Error with attaching a sender or receiver link
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    /// Illegal local link state
    #[error("Illegal local state")]
    IllegalState,

    /// The session engine has stopped
    #[error("Session has stopped")]
    IllegalSessionState,

    /// The connection has stopped, or beginning the implicit session
    /// failed
    #[error("Connection has stopped")]
    IllegalConnectionState,

    /// Link name is already in use on the session
    #[error("Link name must be unique within a session")]
    DuplicatedLinkName,

    /// The attach exchange did not complete within the request timeout
    #[error("Operation timed out")]
    OperationTimedOut,

    /// The peer does not offer the `ANONYMOUS-RELAY` capability
    #[error("Anonymous relay is not supported by the peer")]
    AnonymousRelayNotSupported,

    /// The peer refused the attach, detaching with an optional error
    /// condition
    #[error("Remote peer refused the attach {:?}", .0)]
    RefusedByRemote(Option<definitions::Error>),

    /// The session was remotely ended while the attach was in flight
    #[error("Session remotely ended {:?}", .0)]
    SessionRemotelyClosed(Option<definitions::Error>),

    /// The connection was remotely closed or the transport dropped while
    /// the attach was in flight
    #[error("Connection remotely closed")]
    ConnectionRemotelyClosed,
}

impl From<BeginError> for AttachError {
    fn from(err: BeginError) -> Self {
        match err {
            BeginError::RemoteEnded => Self::SessionRemotelyClosed(None),
            BeginError::RemoteEndedWithError(err) => Self::SessionRemotelyClosed(Some(err)),
            _ => Self::IllegalConnectionState,
        }
    }
}

/// Error with sending a message or awaiting its settlement
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Error serializing the message
    #[error(transparent)]
    MessageEncode(#[from] serde_amqp::Error),

    /// Illegal local link state
    #[error("Illegal local state")]
    IllegalState,

    /// The remote settled with a non-terminal or absent delivery state
    #[error("Illegal delivery state")]
    IllegalDeliveryState,

    /// The send blocked on link credit past the send timeout
    #[error("Send timed out waiting for link credit")]
    SendTimedOut,

    /// A scheduled deadline fired before the settlement arrived
    #[error("Operation timed out")]
    OperationTimedOut,

    /// The peer detached the link, carrying its error condition when one
    /// was supplied
    #[error("Link remotely closed {:?}", .0)]
    LinkRemotelyClosed(Option<definitions::Error>),

    /// The peer ended the session while the operation was in flight
    #[error("Session remotely closed {:?}", .0)]
    SessionRemotelyClosed(Option<definitions::Error>),

    /// The connection closed or the transport dropped while the operation
    /// was in flight
    #[error("Connection remotely closed")]
    ConnectionRemotelyClosed,
}

impl SendError {
    pub(crate) fn from_attach_error(err: AttachError) -> Self {
        match err {
            AttachError::RefusedByRemote(condition) => Self::LinkRemotelyClosed(condition),
            AttachError::SessionRemotelyClosed(condition) => {
                Self::SessionRemotelyClosed(condition)
            }
            AttachError::ConnectionRemotelyClosed => Self::ConnectionRemotelyClosed,
            AttachError::OperationTimedOut => Self::SendTimedOut,
            _ => Self::IllegalState,
        }
    }
}

/// Error with receiving a delivery
#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    /// Illegal local link state
    #[error("Illegal local state")]
    IllegalState,

    /// The incoming transfer is missing its delivery id or tag
    #[error("Malformed transfer frame")]
    MalformedTransfer,

    /// The peer detached the link, carrying its error condition when one
    /// was supplied
    #[error("Link remotely closed {:?}", .0)]
    LinkRemotelyClosed(Option<definitions::Error>),

    /// The peer ended the session while the operation was in flight
    #[error("Session remotely closed {:?}", .0)]
    SessionRemotelyClosed(Option<definitions::Error>),

    /// The connection closed or the transport dropped while the operation
    /// was in flight
    #[error("Connection remotely closed")]
    ConnectionRemotelyClosed,
}

/// Error with emitting a disposition
#[derive(Debug, thiserror::Error)]
pub enum DispositionError {
    /// The delivery is not (or no longer) tracked by the link
    #[error("Delivery is not found in the unsettled map")]
    DeliveryNotFound,

    /// The session engine has stopped
    #[error("Session has stopped")]
    IllegalSessionState,
}

/// Error with detaching or closing a link
#[derive(Debug, thiserror::Error)]
pub enum DetachError {
    /// Illegal local link state
    #[error("Illegal local state")]
    IllegalState,

    /// The session engine has stopped
    #[error("Session has stopped")]
    IllegalSessionState,

    /// The detach exchange did not complete within the request timeout
    #[error("Operation timed out")]
    OperationTimedOut,

    /// The peer answered a non-closing detach with a closing one
    #[error("Link closed by remote peer")]
    ClosedByRemote,

    /// The peer detached with an error condition
    #[error("Remote detached with an error {:?}", .0)]
    RemoteDetachedWithError(definitions::Error),

    /// The connection closed or the session ended before the detach
    /// exchange completed
    #[error("Connection remotely closed")]
    ConnectionRemotelyClosed,
}
