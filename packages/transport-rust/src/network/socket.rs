//! Framed socket listener.
//!
//! Each accepted client greets with the configured protocol, then sends
//! request frames. Every request is dispatched on its own task, so slow
//! controllers do not hold up other transactions on the same session and
//! responses go out in completion order. A single write loop per session
//! owns the write half and drains the session mailbox.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use super::connection::{OutboundFrame, SessionId};
use super::handlers::AppState;
use super::sink::{ResponseSink, SocketSink};
use crate::protocol::{BoxedWriter, Transport, WireProtocol};

/// Accepts socket clients until shutdown is triggered.
pub(crate) async fn serve_sessions(listener: TcpListener, state: AppState) {
    loop {
        let accepted = tokio::select! {
            () = state.shutdown.wait_for_shutdown() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(%peer, error = %e, "failed to set TCP_NODELAY");
                }
                tokio::spawn(run_session(stream, peer.to_string(), state.clone()));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
    debug!("socket listener stopped accepting");
}

/// Serves one client from greeting to disconnect.
pub(crate) async fn run_session<S>(mut stream: S, peer: String, state: AppState)
where
    S: Transport + 'static,
{
    let session_config = &state.config.session;
    let handshake = tokio::time::timeout(
        session_config.handshake_timeout,
        state.protocol.read_handshake(&mut stream),
    )
    .await;
    match handshake {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(peer = %peer, error = %e, "rejecting client");
            return;
        }
        Err(_) => {
            warn!(peer = %peer, "client did not greet in time");
            return;
        }
    }

    if state.shutdown.is_shutting_down() {
        debug!(peer = %peer, "server draining, dropping new session");
        return;
    }

    let (reader, writer) = tokio::io::split(stream);
    let (session, mailbox) =
        state
            .registry
            .register(peer.as_str(), state.protocol.name(), session_config);
    info!(session = %session.id, peer = %peer, protocol = session.protocol, "session open");

    let mut writer_task = tokio::spawn(write_loop(
        Arc::clone(&state.protocol),
        Box::new(writer),
        mailbox,
        session_config.write_timeout,
        session.id,
    ));
    let mut decoder = state.protocol.new_decoder(Box::new(reader));
    let dispatches = Arc::new(Semaphore::new(session_config.max_concurrent_dispatches.max(1)));

    let mut writer_done = false;
    loop {
        let next = tokio::select! {
            () = state.shutdown.wait_for_shutdown() => break,
            _ = &mut writer_task => {
                debug!(session = %session.id, "write loop ended");
                writer_done = true;
                break;
            }
            next = decoder.decode_request() => next,
        };
        match next {
            Ok(Some(request)) => {
                session.record_request();
                let permit = tokio::select! {
                    () = state.shutdown.wait_for_shutdown() => break,
                    permit = Arc::clone(&dispatches).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let guard = state.shutdown.in_flight_guard();
                let router = Arc::clone(&state.router);
                let sink: Arc<dyn ResponseSink> = Arc::new(SocketSink::new(
                    Arc::clone(&session),
                    session_config.send_timeout,
                ));
                let id = session.id;
                tokio::spawn(async move {
                    let _permit = permit;
                    let _guard = guard;
                    let txn_id = request.txn_id().to_string();
                    if let Err(e) = router.dispatch(request, sink).await {
                        debug!(session = %id, txn_id = %txn_id, error = %e, "response not delivered");
                    }
                });
            }
            Ok(None) => {
                debug!(session = %session.id, "client closed the session");
                break;
            }
            Err(e) => {
                warn!(session = %session.id, error = %e, "bad frame, closing session");
                break;
            }
        }
    }

    let id = session.id;
    let requests = session.request_count();
    // The write loop ends once every handle is gone: ours, the registry's,
    // and those held by dispatches still running.
    drop(session);
    if state.shutdown.is_shutting_down() && !writer_done {
        // Stay registered so the drain can flush and close the session.
        let grace = state.config.drain_timeout + session_config.send_timeout + session_config.write_timeout;
        if tokio::time::timeout(grace, &mut writer_task).await.is_err() {
            warn!(session = %id, "session not released by drain, aborting write loop");
            writer_task.abort();
        }
    }
    state.registry.remove(id);
    info!(session = %id, requests, "session closed");
}

/// Writes queued responses until a `Close` frame, a write fault, or the
/// last sink for the session is dropped.
async fn write_loop(
    protocol: Arc<dyn WireProtocol>,
    mut writer: BoxedWriter,
    mut mailbox: mpsc::Receiver<OutboundFrame>,
    write_timeout: Duration,
    id: SessionId,
) {
    while let Some(frame) = mailbox.recv().await {
        match frame {
            OutboundFrame::Response(response) => {
                let written = tokio::time::timeout(
                    write_timeout,
                    protocol.write_response(&response, writer.as_mut()),
                )
                .await;
                match written {
                    Ok(Ok(bytes)) => debug!(session = %id, txn_id = response.txn_id(), bytes, "response written"),
                    Ok(Err(e)) => {
                        warn!(session = %id, error = %e, "write failed");
                        break;
                    }
                    Err(_) => {
                        warn!(session = %id, timeout = ?write_timeout, "write timed out");
                        break;
                    }
                }
            }
            OutboundFrame::Close(reason) => {
                debug!(session = %id, reason = reason.as_deref().unwrap_or(""), "closing session");
                break;
            }
        }
    }
    mailbox.close();
    let _ = tokio::time::timeout(write_timeout, writer.shutdown()).await;
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use strest_core::{Request, Response, TXN_CONTINUE};

    use super::*;
    use crate::network::{NetworkConfig, SessionConfig, SessionRegistry, ShutdownController};
    use crate::protocol::{JsonProtocol, MessageDecoder};
    use crate::service::{handler_fn, MethodController, Router};

    fn state_with(router: Router) -> AppState {
        state_with_session(router, SessionConfig::default())
    }

    fn state_with_session(router: Router, session: SessionConfig) -> AppState {
        AppState {
            name: Arc::from("test"),
            registry: Arc::new(SessionRegistry::new()),
            shutdown: Arc::new(ShutdownController::new()),
            router: Arc::new(router),
            protocol: Arc::new(JsonProtocol::default()),
            config: Arc::new(NetworkConfig {
                session,
                ..NetworkConfig::default()
            }),
            start_time: Instant::now(),
        }
    }

    fn router() -> Router {
        let mut router = Router::new();
        router
            .register(MethodController::all(
                "/ping",
                handler_fn(|request: Request, sink: Arc<dyn ResponseSink>| async move {
                    sink.deliver(Response::new(&request)).await
                }),
            ))
            .unwrap();
        router
            .register(MethodController::all(
                "/slow",
                handler_fn(|request: Request, sink: Arc<dyn ResponseSink>| async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    sink.deliver(Response::new(&request)).await
                }),
            ))
            .unwrap();
        router
            .register(MethodController::all(
                "/count",
                handler_fn(|request: Request, sink: Arc<dyn ResponseSink>| async move {
                    for n in 0..2 {
                        let mut part = Response::new(&request);
                        part.set_txn_status(TXN_CONTINUE);
                        part.put("data.n", n);
                        sink.deliver(part).await?;
                    }
                    sink.deliver(Response::new(&request)).await
                }),
            ))
            .unwrap();
        router
    }

    /// Client side of an in-memory session, after the greeting.
    async fn open_session(state: AppState) -> (Box<dyn MessageDecoder>, tokio::io::WriteHalf<tokio::io::DuplexStream>) {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(run_session(server, "in-memory".to_string(), state));
        let protocol = JsonProtocol::default();
        protocol.write_handshake(&mut client).await.unwrap();
        let (reader, writer) = tokio::io::split(client);
        (protocol.new_decoder(Box::new(reader)), writer)
    }

    #[tokio::test]
    async fn session_answers_requests_in_completion_order() {
        let state = state_with(router());
        let (mut responses, mut writer) = open_session(state.clone()).await;
        let protocol = JsonProtocol::default();

        protocol
            .write_request(&Request::new("GET", "/slow").with_txn_id("slow"), &mut writer)
            .await
            .unwrap();
        protocol
            .write_request(&Request::new("GET", "/ping").with_txn_id("fast"), &mut writer)
            .await
            .unwrap();

        let first = responses.decode_response().await.unwrap().unwrap();
        let second = responses.decode_response().await.unwrap().unwrap();
        assert_eq!(first.txn_id(), "fast");
        assert_eq!(second.txn_id(), "slow");
        assert_eq!(state.registry.count(), 1);
    }

    #[tokio::test]
    async fn dispatch_limit_holds_back_later_requests() {
        let session = SessionConfig {
            max_concurrent_dispatches: 1,
            ..SessionConfig::default()
        };
        let state = state_with_session(router(), session);
        let (mut responses, mut writer) = open_session(state).await;
        let protocol = JsonProtocol::default();

        protocol
            .write_request(&Request::new("GET", "/slow").with_txn_id("slow"), &mut writer)
            .await
            .unwrap();
        protocol
            .write_request(&Request::new("GET", "/ping").with_txn_id("fast"), &mut writer)
            .await
            .unwrap();

        let first = responses.decode_response().await.unwrap().unwrap();
        let second = responses.decode_response().await.unwrap().unwrap();
        assert_eq!(first.txn_id(), "slow");
        assert_eq!(second.txn_id(), "fast");
    }

    #[tokio::test]
    async fn session_streams_continue_responses() {
        let state = state_with(router());
        let (mut responses, mut writer) = open_session(state).await;
        JsonProtocol::default()
            .write_request(&Request::new("GET", "/count").with_txn_id("c"), &mut writer)
            .await
            .unwrap();

        let mut statuses = Vec::new();
        for _ in 0..3 {
            let response = responses.decode_response().await.unwrap().unwrap();
            assert_eq!(response.txn_id(), "c");
            statuses.push(response.txn_status().to_string());
        }
        assert_eq!(statuses, vec!["continue", "continue", "completed"]);
    }

    #[tokio::test]
    async fn unknown_route_gets_404_on_the_session() {
        let state = state_with(router());
        let (mut responses, mut writer) = open_session(state).await;
        JsonProtocol::default()
            .write_request(&Request::new("GET", "/missing").with_txn_id("m"), &mut writer)
            .await
            .unwrap();
        let response = responses.decode_response().await.unwrap().unwrap();
        assert_eq!(response.status_code(), 404);
        assert_eq!(response.txn_id(), "m");
    }

    #[tokio::test]
    async fn bad_frame_closes_session() {
        let state = state_with(router());
        let (mut responses, mut writer) = open_session(state.clone()).await;
        writer.write_all(b"{not json\n").await.unwrap();
        assert!(responses.decode_response().await.unwrap().is_none());
        assert_eq!(state.registry.count(), 0);
    }

    #[tokio::test]
    async fn wrong_greeting_is_rejected() {
        let state = state_with(router());
        let (mut client, server) = tokio::io::duplex(1024);
        let session = tokio::spawn(run_session(server, "in-memory".to_string(), state.clone()));
        let err = crate::protocol::MsgpackProtocol::default()
            .write_handshake(&mut client)
            .await;
        assert!(err.is_err());
        session.await.unwrap();
        assert_eq!(state.registry.count(), 0);
    }
}
