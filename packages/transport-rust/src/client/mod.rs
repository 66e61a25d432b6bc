//! Client side: multiplexed connections to a STREST server.

pub mod config;
pub mod connection;
pub mod error;

pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionState, ResponseStream};
pub use error::ClientError;
