//! STREST transport: pluggable wire protocols, a multiplexed client
//! connection engine, and a server that dispatches socket and HTTP requests
//! through one router.

pub mod client;
pub mod network;
pub mod protocol;
pub mod service;

pub use client::{ClientError, Connection, ConnectionConfig, ConnectionState, ResponseStream};
pub use network::{NetworkConfig, NetworkModule, ResponseSink, SinkError};
pub use protocol::{JsonProtocol, MsgpackProtocol, ProtocolKind, WireProtocol};
pub use service::{handler_fn, Controller, MethodController, Router, ServerConfig};
