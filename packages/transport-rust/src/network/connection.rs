//! Server-side session tracking.
//!
//! Every accepted socket client gets a session: a bounded outbound mailbox
//! drained by the session's write loop, plus bookkeeping for health
//! reporting and shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use strest_core::Response;
use tokio::sync::mpsc;

use super::config::SessionConfig;

/// Unique identifier for a session, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Work item for a session's write loop.
#[derive(Debug)]
pub enum OutboundFrame {
    /// A response to encode and write.
    Response(Response),
    /// Stop writing and close the socket, with an optional reason for logs.
    Close(Option<String>),
}

/// Error returned when queuing a frame for a session fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The mailbox stayed full for the whole timeout.
    Timeout,
    /// The write loop has exited.
    Disconnected,
    /// The mailbox is full (non-blocking `try_send` only).
    Full,
}

/// Handle to one socket session.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: SessionId,
    /// Remote address, for logs.
    pub peer: String,
    /// Name of the wire protocol the session speaks.
    pub protocol: &'static str,
    pub connected_at: Instant,
    tx: mpsc::Sender<OutboundFrame>,
    requests: AtomicU64,
}

impl SessionHandle {
    /// Queues a frame without waiting. Returns `false` if the mailbox is
    /// full or the session is gone.
    #[must_use]
    pub fn try_send(&self, frame: OutboundFrame) -> bool {
        self.tx.try_send(frame).is_ok()
    }

    /// Queues a frame, waiting up to `timeout` for mailbox space.
    ///
    /// # Errors
    ///
    /// Returns `SendError::Timeout` if the mailbox stays full and
    /// `SendError::Disconnected` if the write loop has exited.
    pub async fn send_timeout(&self, frame: OutboundFrame, timeout: Duration) -> Result<(), SendError> {
        match tokio::time::timeout(timeout, self.tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Disconnected),
            Err(_) => Err(SendError::Timeout),
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Counts one request received on this session.
    pub fn record_request(&self) -> u64 {
        self.requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Requests received on this session so far.
    #[must_use]
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

/// Thread-safe registry of live socket sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    /// Creates an empty registry. Ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a session, returning its handle and the mailbox receiver
    /// for its write loop.
    pub fn register(
        &self,
        peer: impl Into<String>,
        protocol: &'static str,
        config: &SessionConfig,
    ) -> (Arc<SessionHandle>, mpsc::Receiver<OutboundFrame>) {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity.max(1));
        let handle = Arc::new(SessionHandle {
            id,
            peer: peer.into(),
            protocol,
            connected_at: Instant::now(),
            tx,
            requests: AtomicU64::new(0),
        });
        self.sessions.insert(id, Arc::clone(&handle));
        (handle, rx)
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.remove(&id).map(|(_, handle)| handle)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.get(&id).map(|r| Arc::clone(r.value()))
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Removes and returns every session. Used during shutdown.
    pub fn drain_all(&self) -> Vec<Arc<SessionHandle>> {
        let keys: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        keys.into_iter()
            .filter_map(|key| self.sessions.remove(&key).map(|(_, handle)| handle))
            .collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
