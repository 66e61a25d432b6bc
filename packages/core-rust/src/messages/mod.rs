//! STREST envelope types.
//!
//! Requests and responses are both specializations of the dynamic
//! [`Message`] tree. The `strest` sub-object carries the protocol envelope
//! (version, method, uri, params, transaction block); everything else is
//! application payload.

pub mod message;
pub mod request;
pub mod response;

pub use message::{Message, MessageError};
pub use request::{Request, TxnAccept};
pub use response::Response;

/// STREST protocol version stamped on every request and response.
pub const STREST_VERSION: f64 = 2.0;

/// Terminal transaction status: no further responses for this txn id.
pub const TXN_COMPLETED: &str = "completed";

/// Non-terminal transaction status used for streamed partial responses.
pub const TXN_CONTINUE: &str = "continue";
