//! HTTP handlers for the STREST server.
//!
//! Defines `AppState`, the shared state carried through axum extractors
//! and into every socket session.

pub mod dispatch;
pub mod health;

pub use dispatch::strest_http_handler;
pub use health::{health_handler, liveness_handler, readiness_handler};

use std::sync::Arc;
use std::time::Instant;

use super::{NetworkConfig, SessionRegistry, ShutdownController};
use crate::protocol::WireProtocol;
use crate::service::Router;

/// Shared server state. Every field is behind an `Arc`, so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Server name, reported by `/health`.
    pub name: Arc<str>,
    /// Live socket sessions.
    pub registry: Arc<SessionRegistry>,
    /// Health state and in-flight dispatch tracking.
    pub shutdown: Arc<ShutdownController>,
    /// Controllers shared by both listeners.
    pub router: Arc<Router>,
    /// Protocol spoken on the socket listener.
    pub protocol: Arc<dyn WireProtocol>,
    pub config: Arc<NetworkConfig>,
    /// Server start time, used for uptime.
    pub start_time: Instant,
}
