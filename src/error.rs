use std::{error::Error as StdError, fmt};

use crate::marshal::Arg;

/// Errors surfaced by wire encoding and decoding. All of these are fatal to
/// the connection they occur on.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// a signature that does not parse into complete types
    BadSignature(String),
    /// input ended in the middle of a value
    Truncated,
    /// array payload larger than the 64 MiB the protocol allows
    OversizedArray(usize),
    /// frame larger than the 128 MiB the protocol allows
    OversizedMessage(usize),
    /// a boolean encoded as something other than 0 or 1
    BadBool(u32),
    /// string data that is not valid UTF-8
    Utf8,
    /// an object path violating the path grammar
    BadObjectPath(String),
    /// a unix fd index with no matching descriptor
    BadFdIndex(u32),
    /// a header field array violating the rules for its message type
    BadHeader(&'static str),
    /// otherwise uncovered protocol violation
    Malformed(&'static str),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadSignature(sig) => write!(f, "malformed signature {:?}", sig),
            Self::Truncated => write!(f, "message data ended unexpectedly"),
            Self::OversizedArray(len) => write!(f, "array of {} bytes exceeds the protocol limit", len),
            Self::OversizedMessage(len) => write!(f, "message of {} bytes exceeds the protocol limit", len),
            Self::BadBool(val) => write!(f, "boolean encoded as {}", val),
            Self::Utf8 => write!(f, "string is not valid utf-8"),
            Self::BadObjectPath(path) => write!(f, "invalid object path {:?}", path),
            Self::BadFdIndex(idx) => write!(f, "no file descriptor at index {}", idx),
            Self::BadHeader(what) => write!(f, "invalid message header: {}", what),
            Self::Malformed(what) => write!(f, "protocol violation: {}", what),
        }
    }
}

impl StdError for ProtocolError {}

/// Everything that can go wrong talking to the bus.
///
/// `Remote` and `Resolution` leave the connection usable; every other kind is
/// terminal for it.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// malformed data on the wire, fatal to the connection
    Protocol(ProtocolError),
    /// the authentication handshake was rejected
    Auth(String),
    /// an error reply from the peer, with its error name and optional text
    Remote { name: String, message: Option<String> },
    /// introspection could not resolve a member or property
    Resolution(String),
    /// the operation was cancelled by its caller
    Cancelled,
    /// the socket closed or failed; outstanding and future operations all
    /// report this
    Disconnect(Option<String>),
    /// a portal request completed with a non-zero response code
    Portal { code: u32, results: Vec<(String, Arg)> },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(err) => write!(f, "{}", err),
            Self::Auth(line) => write!(f, "authentication rejected: {}", line),
            Self::Remote { name, message: Some(text) } => write!(f, "{}: {}", name, text),
            Self::Remote { name, message: None } => write!(f, "{}", name),
            Self::Resolution(what) => write!(f, "{}", what),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Disconnect(Some(reason)) => write!(f, "disconnected from bus: {}", reason),
            Self::Disconnect(None) => write!(f, "disconnected from bus"),
            Self::Portal { code: 1, .. } => write!(f, "portal request cancelled by the user"),
            Self::Portal { code, .. } => write!(f, "portal request failed with response code {}", code),
        }
    }
}

impl StdError for Error {}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}
