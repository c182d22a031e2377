//! Errors associated with the connection

use std::io;

use bytes::Bytes;
use fe2o3_amqp_types::{definitions, primitives::Binary, sasl::SaslCode};
use tokio::task::JoinError;

use crate::transport::{self, error::NegotiationError};

/// Error with opening a connection
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    /// IO error
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    /// Error parsing the url
    #[error(transparent)]
    UrlError(#[from] url::ParseError),

    /// Scheme is invalid or not found
    #[error(r#"Invalid scheme. Only "amqp" and "amqps" are supported."#)]
    InvalidScheme,

    /// Domain is invalid or not found
    #[error("Invalid domain")]
    InvalidDomain,

    /// Missing TLS connector for an "amqps" address
    #[error("TLS connector is not found")]
    TlsConnectorNotFound,

    /// Protocol header negotiation failed
    #[error("Protocol header mismatch. Found {0:?}")]
    ProtocolHeaderMismatch(Bytes),

    /// SASL negotiation failed
    #[error("SASL error code {:?}, additional data: {:?}", .code, .additional_data)]
    SaslError {
        /// SASL outcome code
        code: SaslCode,

        /// Additional information for the failed negotiation
        additional_data: Option<Binary>,
    },

    /// Illegal local connection state
    #[error("Illegal local state")]
    IllegalState,

    /// Not implemented
    #[error("Not implemented: {0:?}")]
    NotImplemented(Option<String>),

    /// The open timeout fired before the remote Open was received
    #[error("Operation timed out")]
    OperationTimedOut,

    /// Transport error
    #[error(transparent)]
    TransportError(#[from] transport::Error),

    /// Remote peer closed the connection during the open sequence
    #[error("Remote peer closed")]
    RemoteClosed,

    /// Remote peer closed the connection with an error during the open
    /// sequence
    #[error("Remote peer closed connection with error {:?}", .0)]
    RemoteClosedWithError(definitions::Error),
}

impl From<NegotiationError> for OpenError {
    fn from(err: NegotiationError) -> Self {
        match err {
            NegotiationError::Io(err) => Self::Io(err),
            NegotiationError::ProtocolHeaderMismatch(buf) => Self::ProtocolHeaderMismatch(buf),
            NegotiationError::InvalidDomain => Self::InvalidDomain,
            NegotiationError::SaslError {
                code,
                additional_data,
            } => Self::SaslError {
                code,
                additional_data,
            },
            NegotiationError::DecodeError => Self::NotImplemented(Some("Decode error".to_string())),
            NegotiationError::NotImplemented(description) => Self::NotImplemented(description),
            NegotiationError::IllegalState => Self::IllegalState,
        }
    }
}

/// Error with the connection lifecycle
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport error
    #[error(transparent)]
    TransportError(#[from] transport::Error),

    /// Illegal local connection state
    #[error("Illegal local state")]
    IllegalState,

    /// A scheduled deadline fired before the protocol response arrived
    #[error("Operation timed out")]
    OperationTimedOut,

    /// Remote peer closed the connection
    #[error("Remote peer closed")]
    RemoteClosed,

    /// Remote peer closed the connection with an error
    #[error("Remote peer closed connection with error {:?}", .0)]
    RemoteClosedWithError(definitions::Error),

    /// The engine task was cancelled or panicked
    #[error(transparent)]
    JoinError(#[from] JoinError),
}

impl Error {
    /// Re-derives a terminal close outcome so that repeated `close` calls
    /// observe the same result. `io::Error` and `JoinError` do not
    /// implement `Clone`, hence the by-hand duplication.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::TransportError(transport::Error::Io(err)) => Self::TransportError(
                transport::Error::Io(io::Error::new(err.kind(), err.to_string())),
            ),
            Self::TransportError(transport::Error::IdleTimeoutElapsed) => {
                Self::TransportError(transport::Error::IdleTimeoutElapsed)
            }
            Self::TransportError(transport::Error::AmqpError {
                condition,
                description,
            }) => Self::TransportError(transport::Error::AmqpError {
                condition: condition.clone(),
                description: description.clone(),
            }),
            Self::IllegalState => Self::IllegalState,
            Self::OperationTimedOut => Self::OperationTimedOut,
            Self::RemoteClosed => Self::RemoteClosed,
            Self::RemoteClosedWithError(err) => Self::RemoteClosedWithError(err.clone()),
            Self::JoinError(_) => Self::IllegalState,
        }
    }
}

/// Error with allocating a new session channel
#[derive(Debug, thiserror::Error)]
pub(crate) enum AllocSessionError {
    #[error("Illegal local state")]
    IllegalState,

    #[error("Reached connection channel max")]
    ChannelMaxReached,
}
