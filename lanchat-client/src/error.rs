use std::io;

use lanchat_core::ErrorKind;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection refused")]
    Refused,
    #[error("host not found: {0}")]
    HostNotFound(String),
    #[error("connection timed out")]
    Timeout,
    #[error("connection closed by the server")]
    RemoteClosed,
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid server address: {0}")]
    InvalidAddress(String),
}

impl TransportError {
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => TransportError::Refused,
            io::ErrorKind::TimedOut => TransportError::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => TransportError::RemoteClosed,
            _ => TransportError::Network(err.to_string()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Transport
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        Self::from_io(&err)
    }
}
