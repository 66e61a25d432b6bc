//! Server side: socket and HTTP listeners, sessions, sinks, and shutdown.

pub mod config;
pub mod connection;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod shutdown;
pub mod sink;
mod socket;

pub use config::{NetworkConfig, SessionConfig};
pub use connection::{OutboundFrame, SendError, SessionHandle, SessionId, SessionRegistry};
pub use handlers::AppState;
pub use module::{BoundAddrs, NetworkModule};
pub use shutdown::{HealthState, InFlightGuard, ShutdownController};
pub use sink::{HttpSink, ResponseSink, SinkError, SocketSink};
