//! Client connection configuration.

use std::time::Duration;

/// Per-connection settings for the client engine.
///
/// Everything the engine needs is passed in here at construction; nothing
/// is read from global state.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Remote `host:port` to dial.
    pub address: String,
    /// Bound on dialing and on the protocol handshake, each.
    pub connect_timeout: Duration,
    /// Bound on writing a single request frame.
    pub write_timeout: Duration,
    /// Bound on waiting for a single response frame. `None` lets an idle
    /// connection wait indefinitely.
    pub read_timeout: Option<Duration>,
    /// Capacity of the admission permit pool: requests in flight at once.
    pub max_in_flight: usize,
    /// How long a caller waits for a permit before the peer is treated as
    /// stuck and the connection is closed.
    pub admission_grace: Duration,
    /// Capacity of the mailbox between callers and the write path.
    pub outbound_capacity: usize,
}

impl ConnectionConfig {
    /// Default settings targeting `address`.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8009".to_string(),
            connect_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(10),
            read_timeout: None,
            max_in_flight: 256,
            admission_grace: Duration::from_secs(1),
            outbound_capacity: 25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.address, "127.0.0.1:8009");
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
        assert_eq!(config.write_timeout, Duration::from_secs(10));
        assert!(config.read_timeout.is_none());
        assert_eq!(config.max_in_flight, 256);
        assert_eq!(config.admission_grace, Duration::from_secs(1));
        assert_eq!(config.outbound_capacity, 25);
    }

    #[test]
    fn new_overrides_only_address() {
        let config = ConnectionConfig::new("10.0.0.5:9000");
        assert_eq!(config.address, "10.0.0.5:9000");
        assert_eq!(config.max_in_flight, 256);
    }
}
