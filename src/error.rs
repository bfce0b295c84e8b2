use serde_derive::{Deserialize, Serialize};

/// An arbor error. Only `ProtocolViolation` is fatal to the local process;
/// every other kind flows through result-returning handlers. `Obsolete` and
/// `BadRequest` mark messages that are discarded by rule, `ResourceExhausted`
/// marks a job that hit its compute budget.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// A request or offer that has been overtaken by a newer balancing epoch
    /// or a shrunk volume. Discarded silently.
    Obsolete(String),
    /// A malformed or unexpected message. Discarded with a warning.
    BadRequest(String),
    /// A violation of the wire protocol, e.g. a duplicate fragment or an
    /// unregistered tag. Aborts the local process.
    ProtocolViolation(String),
    /// A job exceeded its wallclock or CPU budget.
    ResourceExhausted(String),
    /// An I/O error, e.g. on the peer transport.
    IO(String),
    /// A payload failed to encode or decode.
    Serialization(String),
    /// An invalid configuration.
    Config(String),
}

/// An arbor result.
pub type Result<T> = std::result::Result<T, Error>;

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Obsolete(s) => write!(f, "obsolete: {s}"),
            Error::BadRequest(s) => write!(f, "bad request: {s}"),
            Error::ProtocolViolation(s) => write!(f, "protocol violation: {s}"),
            Error::ResourceExhausted(s) => write!(f, "resource exhausted: {s}"),
            Error::IO(s) => write!(f, "io error: {s}"),
            Error::Serialization(s) => write!(f, "serialization error: {s}"),
            Error::Config(s) => write!(f, "config error: {s}"),
        }
    }
}

impl Error {
    /// Whether the error must abort the local process (protocol errors only).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ProtocolViolation(_))
    }

    /// Whether the error marks a message that is dropped by rule rather than
    /// surfaced: obsolete requests, and malformed or truncated payloads.
    pub fn is_discard(&self) -> bool {
        matches!(self, Error::Obsolete(_) | Error::BadRequest(_) | Error::Serialization(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::Config(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(err: crossbeam::channel::SendError<T>) -> Self {
        Error::IO(err.to_string())
    }
}
