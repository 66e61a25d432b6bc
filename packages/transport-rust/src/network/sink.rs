//! Where controllers send their responses.
//!
//! A [`ResponseSink`] is bound to one request. Socket sessions hand out a
//! [`SocketSink`] that queues responses on the session's write mailbox;
//! the HTTP listener hands out an [`HttpSink`] that completes the single
//! HTTP response.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use strest_core::Response;
use tokio::sync::oneshot;

use super::connection::{OutboundFrame, SendError, SessionHandle};

/// Errors returned when a response cannot be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// The client is gone, or the sink takes no more responses.
    #[error("response sink is closed")]
    Closed,
    /// The client is not draining responses fast enough.
    #[error("timed out delivering response")]
    Timeout,
}

/// Delivers responses for one request back to its client.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    /// # Errors
    ///
    /// Returns [`SinkError`] if the response could not be queued.
    async fn deliver(&self, response: Response) -> Result<(), SinkError>;

    /// Transport name for logs, e.g. `"socket"` or `"http"`.
    fn transport(&self) -> &'static str;
}

/// Sink for a request that arrived on a socket session.
#[derive(Debug, Clone)]
pub struct SocketSink {
    session: Arc<SessionHandle>,
    send_timeout: Duration,
}

impl SocketSink {
    #[must_use]
    pub fn new(session: Arc<SessionHandle>, send_timeout: Duration) -> Self {
        Self {
            session,
            send_timeout,
        }
    }
}

#[async_trait]
impl ResponseSink for SocketSink {
    async fn deliver(&self, response: Response) -> Result<(), SinkError> {
        self.session
            .send_timeout(OutboundFrame::Response(response), self.send_timeout)
            .await
            .map_err(|e| match e {
                SendError::Timeout | SendError::Full => SinkError::Timeout,
                SendError::Disconnected => SinkError::Closed,
            })
    }

    fn transport(&self) -> &'static str {
        "socket"
    }
}

/// Sink for a one-shot HTTP exchange. Accepts the first response only.
#[derive(Debug)]
pub struct HttpSink {
    tx: Mutex<Option<oneshot::Sender<Response>>>,
}

impl HttpSink {
    /// Returns the sink and the receiver the HTTP handler awaits.
    #[must_use]
    pub fn new() -> (Self, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

#[async_trait]
impl ResponseSink for HttpSink {
    async fn deliver(&self, response: Response) -> Result<(), SinkError> {
        let tx = self.tx.lock().take().ok_or(SinkError::Closed)?;
        tx.send(response).map_err(|_| SinkError::Closed)
    }

    fn transport(&self) -> &'static str {
        "http"
    }
}

/// Sink that keeps every response, for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    responses: Mutex<Vec<Response>>,
}

#[cfg(test)]
impl RecordingSink {
    pub(crate) fn responses(&self) -> Vec<Response> {
        self.responses.lock().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl ResponseSink for RecordingSink {
    async fn deliver(&self, response: Response) -> Result<(), SinkError> {
        self.responses.lock().push(response);
        Ok(())
    }

    fn transport(&self) -> &'static str {
        "test"
    }
}
