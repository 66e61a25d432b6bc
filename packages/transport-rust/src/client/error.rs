use std::time::Duration;

/// Terminal failures reported to callers of the client engine.
///
/// Every admitted request resolves exactly once: with a completed
/// response, or with one of these errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Dial or handshake failed; the connection never opened.
    #[error("failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },
    /// No admission permit freed up in time; the connection was closed.
    #[error("no admission permit within {waited:?}, connection closed")]
    AdmissionTimeout { waited: Duration },
    /// The connection is draining or closed.
    #[error("connection is not open")]
    NotConnected,
    /// The connection died before the transaction completed.
    #[error("connection closed before the transaction completed")]
    ConnectionClosed,
    /// Writing this request's frame failed; the connection was closed.
    #[error("failed to write request: {0}")]
    Write(String),
    /// Another request with the same transaction id is still in flight.
    #[error("transaction id '{0}' is already in flight on this connection")]
    DuplicateTransaction(String),
}
