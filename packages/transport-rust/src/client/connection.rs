//! Multiplexed client connection.
//!
//! One [`Connection`] owns one socket and lets many callers share it. Each
//! request carries a transaction id; responses come back in any order and
//! are routed to the caller that sent the matching request.
//!
//! Two background tasks serve the socket:
//!
//! - the read path decodes responses and routes them through the
//!   correlation table, removing an entry when its terminal response arrives;
//! - the control path owns the write half. It drains the bounded outbound
//!   mailbox, registers each request in the table, writes it, and performs
//!   teardown exactly once when the connection stops.
//!
//! Admission is a semaphore of `max_in_flight` permits. The permit lives
//! inside the table entry, so it is released exactly when the entry is
//! dropped, on whichever path resolves the request.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use strest_core::{Request, Response};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::ConnectionConfig;
use super::error::ClientError;
use crate::protocol::{BoxedWriter, MessageDecoder, ProtocolError, Transport, WireProtocol};

/// Lifecycle of a connection. Transitions only move forward.
///
/// `Dialing` and `Handshaking` happen inside [`Connection::connect`] and
/// [`Connection::open`], before any handle exists, and only show up in
/// logs. A [`Connection`] reports `Open`, `Draining`, or `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Dialing,
    Handshaking,
    Open,
    Draining,
    Closed,
}

type Outcome = Result<Response, ClientError>;

/// One admitted request: the request itself, where its outcomes go, and
/// the admission permit it holds.
struct PendingRequest {
    request: Request,
    results: mpsc::UnboundedSender<Outcome>,
    /// When the request entered the correlation table.
    since: Instant,
    _permit: OwnedSemaphorePermit,
}

impl PendingRequest {
    fn fail(self, err: ClientError) {
        // The caller may have dropped its stream; nobody is left to tell.
        let _ = self.results.send(Err(err));
    }
}

struct Shared {
    address: String,
    protocol_name: &'static str,
    state: watch::Sender<ConnectionState>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    admission_grace: Duration,
    table: Mutex<HashMap<String, PendingRequest>>,
    connected_at: Instant,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Moves an open connection to `Draining`. Returns false if some other
    /// path already started the close.
    fn begin_close(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Open {
                *state = ConnectionState::Draining;
                true
            } else {
                false
            }
        })
    }

    /// Routes a decoded response to the caller waiting on its transaction.
    fn route(&self, response: Response) {
        let txn_id = response.txn_id().to_string();
        if response.is_terminal() {
            let entry = self.table.lock().remove(&txn_id);
            match entry {
                Some(pending) => {
                    let _ = pending.results.send(Ok(response));
                }
                None => warn!(address = %self.address, txn_id = %txn_id, "dropping response for unknown transaction"),
            }
        } else {
            let results = self.table.lock().get(&txn_id).map(|p| p.results.clone());
            match results {
                Some(results) => {
                    let _ = results.send(Ok(response));
                }
                None => warn!(address = %self.address, txn_id = %txn_id, "dropping response for unknown transaction"),
            }
        }
    }

    /// True if some request has waited at least `limit` for a response.
    fn stalled(&self, limit: Duration) -> bool {
        self.table.lock().values().any(|p| p.since.elapsed() >= limit)
    }

    /// Registers `pending` and writes its request.
    ///
    /// A duplicate transaction id fails only that request. A write fault
    /// fails that request and is returned so the caller can tear down.
    async fn write_pending(
        &self,
        mut pending: PendingRequest,
        protocol: &dyn WireProtocol,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        write_timeout: Duration,
    ) -> Result<(), ClientError> {
        let txn_id = pending.request.txn_id().to_string();
        let request = pending.request.clone();
        let duplicate = {
            let mut table = self.table.lock();
            if table.contains_key(&txn_id) {
                Some(pending)
            } else {
                pending.since = Instant::now();
                table.insert(txn_id.clone(), pending);
                None
            }
        };
        if let Some(pending) = duplicate {
            warn!(address = %self.address, txn_id = %txn_id, "rejecting duplicate transaction id");
            pending.fail(ClientError::DuplicateTransaction(txn_id));
            return Ok(());
        }

        let err = match tokio::time::timeout(write_timeout, protocol.write_request(&request, writer)).await {
            Ok(Ok(bytes)) => {
                debug!(txn_id = %txn_id, method = %request.method(), uri = request.uri(), bytes, "request written");
                return Ok(());
            }
            Ok(Err(e)) => ClientError::Write(e.to_string()),
            Err(_) => ClientError::Write(format!("write timed out after {write_timeout:?}")),
        };
        let entry = self.table.lock().remove(&txn_id);
        if let Some(pending) = entry {
            pending.fail(err.clone());
        }
        Err(err)
    }
}

/// Handle to a multiplexed connection. Cheap to clone; all clones share
/// the same socket. Dropping every clone closes the connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<PendingRequest>,
}

impl Connection {
    /// Dials `config.address` over TCP and opens a connection on it.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connect`] if dialing or the handshake fails or
    /// exceeds `connect_timeout`.
    pub async fn connect(
        config: ConnectionConfig,
        protocol: Arc<dyn WireProtocol>,
    ) -> Result<Self, ClientError> {
        debug!(address = %config.address, protocol = protocol.name(), state = ?ConnectionState::Dialing, "dialing");
        let connect_error = |reason: String| ClientError::Connect {
            address: config.address.clone(),
            reason,
        };
        let stream = match tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect(&config.address),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(connect_error(e.to_string())),
            Err(_) => {
                return Err(connect_error(format!(
                    "timed out after {:?}",
                    config.connect_timeout
                )))
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(address = %config.address, error = %e, "failed to set TCP_NODELAY");
        }
        Self::open(stream, protocol, config).await
    }

    /// Runs the handshake over an already-established stream and starts the
    /// read and control tasks.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connect`] if the handshake fails or exceeds
    /// `connect_timeout`.
    pub async fn open<S>(
        mut stream: S,
        protocol: Arc<dyn WireProtocol>,
        config: ConnectionConfig,
    ) -> Result<Self, ClientError>
    where
        S: Transport + 'static,
    {
        debug!(address = %config.address, state = ?ConnectionState::Handshaking, "handshaking");
        let handshake =
            tokio::time::timeout(config.connect_timeout, protocol.write_handshake(&mut stream)).await;
        let reason = match handshake {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("handshake timed out after {:?}", config.connect_timeout)),
        };
        if let Some(reason) = reason {
            return Err(ClientError::Connect {
                address: config.address,
                reason,
            });
        }

        let (reader, writer) = tokio::io::split(stream);
        let max_in_flight = config.max_in_flight.max(1);
        let (state, _) = watch::channel(ConnectionState::Open);
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let shared = Arc::new(Shared {
            address: config.address.clone(),
            protocol_name: protocol.name(),
            state,
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            admission_grace: config.admission_grace,
            table: Mutex::new(HashMap::new()),
            connected_at: Instant::now(),
        });

        let decoder = protocol.new_decoder(Box::new(reader));
        let read_task = tokio::spawn(read_loop(
            Arc::clone(&shared),
            decoder,
            config.read_timeout,
        ));
        tokio::spawn(control_loop(
            Arc::clone(&shared),
            protocol,
            Box::new(writer),
            outbound_rx,
            read_task,
            config.write_timeout,
        ));

        info!(address = %shared.address, protocol = shared.protocol_name, max_in_flight, "connection open");
        Ok(Self { shared, outbound })
    }

    /// Sends a request and returns the stream its responses arrive on.
    ///
    /// Waits up to `admission_grace` for an admission permit. If none frees
    /// up, the peer is assumed stuck: the connection is closed and every
    /// request on it fails. An empty transaction id is replaced with a
    /// fresh UUID.
    ///
    /// # Errors
    ///
    /// - [`ClientError::NotConnected`] if the connection is not open;
    /// - [`ClientError::AdmissionTimeout`] if no permit freed up in time;
    /// - [`ClientError::ConnectionClosed`] if the connection closed while
    ///   the request was being queued.
    pub async fn send_request(&self, mut request: Request) -> Result<ResponseStream, ClientError> {
        if !self.is_open() {
            return Err(ClientError::NotConnected);
        }
        let acquire = Arc::clone(&self.shared.permits).acquire_owned();
        let permit = match tokio::time::timeout(self.shared.admission_grace, acquire).await {
            Ok(Ok(permit)) => permit,
            // Closed semaphore: teardown is under way.
            Ok(Err(_)) => return Err(ClientError::NotConnected),
            Err(_) => {
                warn!(
                    address = %self.shared.address,
                    max_in_flight = self.shared.max_in_flight,
                    grace = ?self.shared.admission_grace,
                    "no admission permit within grace period, closing connection"
                );
                self.close();
                return Err(ClientError::AdmissionTimeout {
                    waited: self.shared.admission_grace,
                });
            }
        };
        if !self.is_open() {
            return Err(ClientError::NotConnected);
        }

        if request.txn_id().is_empty() {
            request.set_txn_id(Uuid::new_v4().to_string());
        }
        let txn_id = request.txn_id().to_string();
        let (results, receiver) = mpsc::unbounded_channel();
        let pending = PendingRequest {
            request,
            results,
            since: Instant::now(),
            _permit: permit,
        };
        if self.outbound.send(pending).await.is_err() {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(ResponseStream {
            txn_id,
            receiver,
            finished: false,
        })
    }

    /// Sends a request and waits for its terminal response, skipping any
    /// `continue` responses before it.
    ///
    /// # Errors
    ///
    /// Any error from [`send_request`](Self::send_request), or the error the
    /// request resolved with.
    pub async fn call(&self, request: Request) -> Result<Response, ClientError> {
        self.send_request(request).await?.into_terminal().await
    }

    /// Starts closing the connection. Idempotent; returns immediately.
    ///
    /// Every request still queued or in flight fails with
    /// [`ClientError::ConnectionClosed`]. Use [`closed`](Self::closed) to
    /// wait for teardown to finish.
    pub fn close(&self) {
        if self.shared.begin_close() {
            debug!(address = %self.shared.address, "close requested");
        }
    }

    /// Resolves once teardown has finished and every pending request has
    /// been failed.
    pub async fn closed(&self) {
        let mut state = self.shared.state.subscribe();
        wait_until(&mut state, |s| s == ConnectionState::Closed).await;
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    #[must_use]
    pub fn protocol_name(&self) -> &'static str {
        self.shared.protocol_name
    }

    #[must_use]
    pub fn connected_at(&self) -> Instant {
        self.shared.connected_at
    }

    /// Requests currently registered in the correlation table.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.table.lock().len()
    }

    /// Admission permits not currently held.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.shared.permits.available_permits()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.shared.address)
            .field("protocol", &self.shared.protocol_name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Responses for one request, in arrival order.
///
/// Yields any number of `continue` responses, then exactly one terminal
/// outcome: the `completed` response or an error.
#[derive(Debug)]
pub struct ResponseStream {
    txn_id: String,
    receiver: mpsc::UnboundedReceiver<Outcome>,
    finished: bool,
}

impl ResponseStream {
    /// Transaction id the request was sent with.
    #[must_use]
    pub fn txn_id(&self) -> &str {
        &self.txn_id
    }

    /// Next response, or `None` once the terminal outcome has been returned.
    pub async fn next(&mut self) -> Option<Outcome> {
        if self.finished {
            return None;
        }
        let outcome = self
            .receiver
            .recv()
            .await
            .unwrap_or(Err(ClientError::ConnectionClosed));
        self.finished = !matches!(&outcome, Ok(response) if !response.is_terminal());
        Some(outcome)
    }

    /// Skips intermediate responses and returns the terminal outcome.
    ///
    /// # Errors
    ///
    /// The error the request resolved with.
    pub async fn into_terminal(mut self) -> Result<Response, ClientError> {
        loop {
            match self.next().await {
                Some(Ok(response)) if response.is_terminal() => return Ok(response),
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err),
                None => return Err(ClientError::ConnectionClosed),
            }
        }
    }
}

/// Resolves once the state satisfies `done`, or the sender is gone.
async fn wait_until(
    state: &mut watch::Receiver<ConnectionState>,
    done: impl Fn(ConnectionState) -> bool,
) {
    while !done(*state.borrow_and_update()) {
        if state.changed().await.is_err() {
            return;
        }
    }
}

/// Decodes the next response. With a `read_timeout`, a silent peer is a
/// fault only while some request has been waiting that long; an idle
/// connection never times out.
async fn next_response(
    shared: &Shared,
    decoder: &mut dyn MessageDecoder,
    read_timeout: Option<Duration>,
) -> Result<Option<Response>, ProtocolError> {
    let Some(limit) = read_timeout else {
        return decoder.decode_response().await;
    };
    loop {
        match tokio::time::timeout(limit, decoder.decode_response()).await {
            Ok(next) => return next,
            Err(_) if shared.stalled(limit) => {
                return Err(ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("no response within {limit:?}"),
                )))
            }
            Err(_) => {}
        }
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut decoder: Box<dyn MessageDecoder>,
    read_timeout: Option<Duration>,
) {
    let mut state = shared.state.subscribe();
    loop {
        let next = tokio::select! {
            () = wait_until(&mut state, |s| s != ConnectionState::Open) => break,
            next = next_response(&shared, decoder.as_mut(), read_timeout) => next,
        };
        match next {
            Ok(Some(response)) => shared.route(response),
            Ok(None) => {
                info!(address = %shared.address, "peer closed the connection");
                break;
            }
            Err(e) => {
                warn!(address = %shared.address, error = %e, "read failed, closing connection");
                break;
            }
        }
    }
    shared.begin_close();
}

async fn control_loop(
    shared: Arc<Shared>,
    protocol: Arc<dyn WireProtocol>,
    mut writer: BoxedWriter,
    mut outbound: mpsc::Receiver<PendingRequest>,
    read_task: JoinHandle<()>,
    write_timeout: Duration,
) {
    let mut state = shared.state.subscribe();
    loop {
        let pending = tokio::select! {
            biased;
            () = wait_until(&mut state, |s| s != ConnectionState::Open) => break,
            pending = outbound.recv() => match pending {
                Some(pending) => pending,
                // Every handle was dropped.
                None => break,
            },
        };
        if let Err(e) = shared
            .write_pending(pending, protocol.as_ref(), writer.as_mut(), write_timeout)
            .await
        {
            warn!(address = %shared.address, error = %e, "write failed, closing connection");
            break;
        }
    }
    teardown(&shared, writer, outbound, read_task, write_timeout).await;
}

/// Runs once, on the control task, after the loop exits.
async fn teardown(
    shared: &Shared,
    mut writer: BoxedWriter,
    mut outbound: mpsc::Receiver<PendingRequest>,
    read_task: JoinHandle<()>,
    write_timeout: Duration,
) {
    shared.begin_close();
    shared.permits.close();

    let _ = tokio::time::timeout(write_timeout, writer.shutdown()).await;
    drop(writer);
    if let Err(e) = read_task.await {
        warn!(address = %shared.address, error = %e, "read task ended abnormally");
    }

    outbound.close();
    let mut queued = 0usize;
    while let Ok(pending) = outbound.try_recv() {
        pending.fail(ClientError::ConnectionClosed);
        queued += 1;
    }

    let in_flight: Vec<PendingRequest> = shared.table.lock().drain().map(|(_, p)| p).collect();
    let in_flight_count = in_flight.len();
    for pending in in_flight {
        pending.fail(ClientError::ConnectionClosed);
    }

    shared.state.send_replace(ConnectionState::Closed);
    info!(
        address = %shared.address,
        queued,
        in_flight = in_flight_count,
        "connection closed"
    );
}
