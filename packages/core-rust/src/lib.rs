//! STREST core: dynamic message model plus request and response envelopes.

pub mod messages;
pub mod types;

pub use messages::{
    Message, MessageError, Request, Response, TxnAccept, STREST_VERSION, TXN_COMPLETED,
    TXN_CONTINUE,
};
pub use types::Value;
