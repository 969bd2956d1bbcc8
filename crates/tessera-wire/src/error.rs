//! Errors from the wire layer.
//!
//! Transport failures are classified into a handful of network classes
//! (`Closed`, `Eof`, `Timeout`, `Canceled`, `Unknown`) so callers can decide
//! whether to retry without inspecting raw I/O errors.

use tessera_types::{Address, IdentityId, ServerIdentity, TypesError};
use thiserror::Error;

/// Errors raised by connections, hosts and the router.
#[derive(Debug, Clone, Error)]
pub enum NetError {
    /// The connection was closed locally or reset by the peer.
    #[error("Connection closed")]
    Closed,

    /// The peer closed its side cleanly.
    #[error("End of stream")]
    Eof,

    /// A read or write did not complete before its deadline.
    #[error("Operation timed out")]
    Timeout,

    /// The operation was abandoned before completing.
    #[error("Operation canceled")]
    Canceled,

    /// A transport failure that fits no other class.
    #[error("Network error: {0}")]
    Unknown(String),

    /// No message type is registered for this value or id.
    #[error("Unregistered message type: {0}")]
    UnregisteredType(String),

    /// A frame body could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A message could not be encoded.
    #[error("Encode error: {0}")]
    Encode(String),

    /// A peer announced a frame above the configured limit.
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// No connection could be opened to this address.
    #[error("Peer unreachable at {0}")]
    Unreachable(Address),

    #[error("Invalid address: {0}")]
    InvalidAddress(#[from] TypesError),

    /// The address scheme does not match the host's transport.
    #[error("Address {0} does not belong to this transport")]
    WrongTransport(Address),

    #[error("TLS error: {0}")]
    Tls(String),

    /// The router was stopped and cannot be restarted.
    #[error("Router is closed")]
    RouterClosed,
}

impl NetError {
    /// Whether the error is a transport failure worth retrying on a fresh
    /// connection.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            NetError::Closed
                | NetError::Eof
                | NetError::Timeout
                | NetError::Canceled
                | NetError::Unknown(_)
        )
    }
}

/// Map an I/O error onto a network class.
pub fn classify_io(err: &std::io::Error) -> NetError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::UnexpectedEof => NetError::Eof,
        ErrorKind::TimedOut | ErrorKind::WouldBlock => NetError::Timeout,
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::NotConnected => NetError::Closed,
        ErrorKind::Interrupted => NetError::Canceled,
        _ => NetError::Unknown(err.to_string()),
    }
}

impl From<std::io::Error> for NetError {
    fn from(err: std::io::Error) -> Self {
        classify_io(&err)
    }
}

/// Why an identity handshake was rejected.
#[derive(Debug, Clone, Error)]
pub enum HandshakeError {
    /// The first frame on the connection was not a `ServerIdentity`.
    #[error("First message was {0}, expected a server identity")]
    WrongFirstMessage(String),

    /// The key bound to the TLS certificate is not the key the peer claims.
    #[error("Identity {claimed} does not match the certificate key {certified}")]
    IdentityMismatch {
        claimed: IdentityId,
        certified: String,
    },

    /// A TLS connection carried no peer certificate.
    #[error("Peer presented no certificate")]
    MissingCertificate,
}

/// Errors returned by a [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Nothing is registered to handle this message type.
    #[error("No processor for message type {0}")]
    NoProcessor(String),

    #[error("Processor failed: {0}")]
    Processor(String),
}

/// Failure report of [`Router::send`](crate::Router::send).
#[derive(Debug, Clone, Error)]
#[error("Send failed after {bytes_sent} bytes: {error}")]
pub struct SendError {
    /// Bytes written before the failure, retries included.
    pub bytes_sent: u64,
    pub error: NetError,
}

/// Failure report of [`Router::send_to_all`](crate::Router::send_to_all).
#[derive(Debug, Clone, Error)]
#[error("Send to {} peer(s) failed ({bytes_sent} bytes sent)", failures.len())]
pub struct SendToAllError {
    /// Bytes written to the peers that succeeded.
    pub bytes_sent: u64,
    pub failures: Vec<(ServerIdentity, NetError)>,
}

/// Alias for Result with NetError.
pub type NetResult<T> = Result<T, NetError>;
