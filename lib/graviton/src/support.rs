use std::fmt;
use std::io;
use std::net;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Two-level result plumbing used throughout the core. `Wait` means no
/// progress is possible right now and the operation should be retried on the
/// next readiness event; `Fatal` carries the error taxonomy and always ends
/// the descriptor (never the worker).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorType {
    Protocol,
    Crypto,
    Timeout,
    Resource,
    Config,
    InvalidState,
    EmptyPayload,
    PayloadTooLarge,
    VersionMismatch,
    UnknownCipher,
    UnknownChannel,
    FragmentMismatch,
    AddrParse,
    QueueClosed,
    DuplicateTransport,
    UnknownTransport,
    SessionNotFound,
    BackoffExhausted,
    Eof,
    /// Error code reported by the peer in a handshake error message.
    Remote(u32),
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorType::Remote(code) => write!(f, "unknown error {}", code),
            other => write!(f, "{:?}", other),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}
