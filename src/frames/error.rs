use std::io;

/// Error with encoding or decoding a frame
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO Error
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    /// Decode error
    #[error("Decode Error")]
    DecodeError,

    /// The frame type byte or data offset is not supported
    #[error("Not implemented")]
    NotImplemented,
}

impl From<serde_amqp::Error> for Error {
    fn from(err: serde_amqp::Error) -> Self {
        match err {
            serde_amqp::Error::Io(e) => Self::Io(e),
            _ => Self::DecodeError,
        }
    }
}
