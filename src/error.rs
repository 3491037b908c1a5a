//! Error types for the remote cache client.

use crate::types::Location;
use thiserror::Error;

/// Result type alias for remote cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the remote cache client.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Transient remote I/O failure (network drop, server exception).
    #[error("remote io error: {0}")]
    RemoteIo(String),

    /// The remote side returned something that could not be decoded.
    ///
    /// Reads retry this kind exactly once.
    #[error("unmarshal error: {0}")]
    Unmarshal(String),

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Resolving or connecting to an endpoint failed.
    #[error("connect failed to {location}: {reason}")]
    Connect { location: Location, reason: String },

    /// The delivery queue refused an event.
    #[error("queue admission failed for region {region}: {reason}")]
    QueueAdmission { region: String, reason: String },

    /// Encoding or decoding a cache element failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An element without attributes cannot be sent to the server.
    #[error("element {key} has no attributes")]
    MissingAttributes { key: String },

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The component was already disposed.
    #[error("disposed: {0}")]
    Disposed(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is one of the remote I/O kinds callers see from the client.
    pub fn is_io(&self) -> bool {
        matches!(self, Error::RemoteIo(_) | Error::Unmarshal(_))
    }

    /// Whether this is a transient decode failure worth one retry.
    pub fn is_unmarshal(&self) -> bool {
        matches!(self, Error::Unmarshal(_))
    }

    /// Normalize into an I/O kind, keeping `RemoteIo` and `Unmarshal` as they are.
    pub fn into_io(self, context: &str) -> Error {
        if self.is_io() {
            self
        } else {
            Error::RemoteIo(format!("{}: {}", context, self))
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_io_keeps_io_kinds() {
        let unmarshal = Error::Unmarshal("bad frame".into()).into_io("get");
        assert!(unmarshal.is_unmarshal());

        let io = Error::RemoteIo("reset".into()).into_io("get");
        assert!(matches!(io, Error::RemoteIo(ref m) if m == "reset"));
    }

    #[test]
    fn test_into_io_wraps_other_kinds() {
        let err = Error::Timeout.into_io("get request");
        match err {
            Error::RemoteIo(msg) => assert_eq!(msg, "get request: operation timed out"),
            other => panic!("expected RemoteIo, got {:?}", other),
        }
    }
}
