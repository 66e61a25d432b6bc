//! Network configuration types for the STREST server.

use std::time::Duration;

use crate::protocol::{ProtocolKind, DEFAULT_MAX_FRAME_LENGTH};

/// Top-level network configuration for the server.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bind address for both listeners.
    pub host: String,
    /// Port for the framed socket listener. 0 means OS-assigned.
    pub socket_port: u16,
    /// Port for the HTTP listener. `None` disables HTTP; 0 means OS-assigned.
    pub http_port: Option<u16>,
    /// Wire protocol spoken on the socket listener.
    pub protocol: ProtocolKind,
    /// Largest frame accepted from a socket client.
    pub max_frame_length: usize,
    /// Per-session settings for socket clients.
    pub session: SessionConfig,
    /// Allowed CORS origins for the HTTP listener.
    pub cors_origins: Vec<String>,
    /// Maximum time an HTTP request may take before a 408.
    pub request_timeout: Duration,
    /// How long shutdown waits for in-flight dispatches.
    pub drain_timeout: Duration,
}

impl NetworkConfig {
    /// Address of the socket listener.
    #[must_use]
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.socket_port)
    }

    /// Address of the HTTP listener, if enabled.
    #[must_use]
    pub fn http_addr(&self) -> Option<String> {
        self.http_port.map(|port| format!("{}:{port}", self.host))
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            socket_port: 8009,
            http_port: Some(8010),
            protocol: ProtocolKind::Json,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            session: SessionConfig::default(),
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-session configuration controlling backpressure and timeouts.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bounded mpsc channel capacity for outbound responses per session.
    pub outbound_channel_capacity: usize,
    /// Maximum time a controller waits to enqueue a response.
    pub send_timeout: Duration,
    /// Maximum time a new client has to complete the greeting.
    pub handshake_timeout: Duration,
    /// Maximum time to write one frame to the client.
    pub write_timeout: Duration,
    /// Requests from one session dispatched at the same time. Once reached,
    /// the session stops reading until a dispatch finishes.
    pub max_concurrent_dispatches: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: 256,
            send_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            max_concurrent_dispatches: 128,
        }
    }
}
