use std::io;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("ERR - Invalid request: {0}")]
    InvalidRequest(String),

    #[error("ERR - Endpoint: {0}")]
    Endpoint(String),

    #[error("ERR - Connection: {0}")]
    Connection(String),

    #[error("ERR - Io: {0}")]
    Io(#[from] io::Error),

    #[error("ERR - Http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ERR - Negotiation rejected: {0}")]
    NegotiationRejected(String),

    #[error("ERR - Protocol: {0}")]
    Protocol(String),

    #[error("ERR - Malformed pack: {0}")]
    MalformedPack(String),

    #[error("ERR - Truncated pack: expected {expected} objects but the stream ended after {read}")]
    TruncatedPack { expected: u32, read: u32 },

    #[error("ERR - Cancelled")]
    Cancelled,

    #[error("ERR - Pipe closed by reader")]
    PipeClosed,

    #[error("ERR - Other: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Cancellation is requested by the caller and is not a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Network level failures: refused connections, broken streams, HTTP errors.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Io(_) | Self::Http(_))
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedPack(msg.into())
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            err => io::Error::other(err),
        }
    }
}
