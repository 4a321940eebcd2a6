/// Crate-wide error type returned by every fallible operation in the proxy
/// and management plane.
use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// Malformed frame, unsupported version/command/atyp.
    ProtocolViolation(String),

    /// Username/password rejected during RFC 1929 sub-negotiation.
    AuthFailure,

    /// The requested domain name could not be resolved.
    ResolveFailure(String),

    /// A CONNECT attempt to the origin failed.
    ConnectFailure(ConnectFailureKind),

    /// The peer closed its side of the connection.
    PeerClosed,

    /// Transport-level I/O error.
    Io(std::io::Error),

    /// No free connection slot was available.
    CapacityFull,

    /// A management command carried a numeric argument out of range.
    ConfigInvalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailureKind {
    /// Every candidate address timed out.
    Timeout,
    /// The origin actively refused the connection.
    Refused,
    /// A socket could not even be created for a candidate address family.
    Socket,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ProtocolViolation(msg) => write!(f, "protocol violation: {msg}"),
            Error::AuthFailure => write!(f, "authentication failed"),
            Error::ResolveFailure(host) => write!(f, "could not resolve host: {host}"),
            Error::ConnectFailure(kind) => write!(f, "connect failed: {kind:?}"),
            Error::PeerClosed => write!(f, "peer closed the connection"),
            Error::Io(err) => write!(f, "i/o error: {err}"),
            Error::CapacityFull => write!(f, "no free connection slot"),
            Error::ConfigInvalid(msg) => write!(f, "invalid configuration value: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::ConfigInvalid(err.to_string())
    }
}
