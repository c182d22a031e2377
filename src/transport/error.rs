use std::io;

use bytes::Bytes;
use fe2o3_amqp_types::{definitions::AmqpError, primitives::Binary, sasl::SaslCode};

use crate::{frames, sasl_profile};

/// Transport error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    /// The remote peer went silent past its advertised idle timeout
    #[error("Idle timeout")]
    IdleTimeoutElapsed,

    /// AMQP error
    #[error("AMQP error {:?}, {:?}", .condition, .description)]
    AmqpError {
        /// Error condition
        condition: AmqpError,

        /// Error description
        description: Option<String>,
    },
}

impl From<serde_amqp::Error> for Error {
    fn from(err: serde_amqp::Error) -> Self {
        match err {
            serde_amqp::Error::Io(e) => Self::Io(e),
            e => Self::AmqpError {
                condition: AmqpError::DecodeError,
                description: Some(e.to_string()),
            },
        }
    }
}

impl From<AmqpError> for Error {
    fn from(condition: AmqpError) -> Self {
        Self::AmqpError {
            condition,
            description: None,
        }
    }
}

impl From<frames::Error> for Error {
    fn from(err: frames::Error) -> Self {
        match err {
            frames::Error::Io(io) => Self::Io(io),
            frames::Error::DecodeError => Self::AmqpError {
                condition: AmqpError::DecodeError,
                description: None,
            },
            frames::Error::NotImplemented => Self::AmqpError {
                condition: AmqpError::NotImplemented,
                description: None,
            },
        }
    }
}

/// Error with the pre-Open negotiation: protocol headers, TLS, and SASL
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    /// IO error
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    /// The incoming header does not match the locally sent one
    #[error("Protocol header mismatch {0:?}")]
    ProtocolHeaderMismatch(Bytes),

    /// TLS server name could not be resolved
    #[error("Invalid domain")]
    InvalidDomain,

    /// Decode error
    #[error("Decode error")]
    DecodeError,

    /// Not implemented
    #[error("Not implemented")]
    NotImplemented(Option<String>),

    /// Illegal connection state
    #[error("Illegal state")]
    IllegalState,

    /// SASL outcome was not Ok
    #[error("SASL error code {:?}, additional data: {:?}", .code, .additional_data)]
    SaslError {
        /// SASL outcome code
        code: SaslCode,

        /// Additional data carried by the outcome
        additional_data: Option<Binary>,
    },
}

impl From<frames::Error> for NegotiationError {
    fn from(err: frames::Error) -> Self {
        match err {
            frames::Error::Io(err) => Self::Io(err),
            frames::Error::DecodeError => Self::DecodeError,
            frames::Error::NotImplemented => Self::NotImplemented(None),
        }
    }
}

impl From<sasl_profile::Error> for NegotiationError {
    fn from(err: sasl_profile::Error) -> Self {
        match err {
            sasl_profile::Error::NotImplemented(msg) => Self::NotImplemented(msg),
        }
    }
}
