//! Network module with deferred startup.
//!
//! `new()` allocates shared state, `start()` binds the listeners, and
//! `serve()` runs them until shutdown. Binding before serving lets callers
//! learn OS-assigned ports first.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::get;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::config::NetworkConfig;
use super::connection::{OutboundFrame, SessionRegistry};
use super::handlers::{
    health_handler, liveness_handler, readiness_handler, strest_http_handler, AppState,
};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use super::socket::serve_sessions;
use crate::protocol::WireProtocol;
use crate::service::{Router, ServerConfig};

/// Addresses the listeners actually bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundAddrs {
    pub socket: SocketAddr,
    pub http: Option<SocketAddr>,
}

struct Listeners {
    socket: TcpListener,
    http: Option<TcpListener>,
}

/// Runs the socket and HTTP listeners over one shared [`Router`].
pub struct NetworkModule {
    name: Arc<str>,
    config: Arc<NetworkConfig>,
    router: Arc<Router>,
    protocol: Arc<dyn WireProtocol>,
    listeners: Option<Listeners>,
    registry: Arc<SessionRegistry>,
    shutdown: Arc<ShutdownController>,
    start_time: Instant,
}

impl NetworkModule {
    /// Creates the module without binding any port.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let (name, network, router) = config.into_parts();
        let protocol = network.protocol.with_max_frame_length(network.max_frame_length);
        Self {
            name: Arc::from(name),
            config: Arc::new(network),
            router,
            protocol,
            listeners: None,
            registry: Arc::new(SessionRegistry::new()),
            shutdown: Arc::new(ShutdownController::new()),
            start_time: Instant::now(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Other components use this to read health or trigger shutdown.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    fn app_state(&self) -> AppState {
        AppState {
            name: Arc::clone(&self.name),
            registry: Arc::clone(&self.registry),
            shutdown: Arc::clone(&self.shutdown),
            router: Arc::clone(&self.router),
            protocol: Arc::clone(&self.protocol),
            config: Arc::clone(&self.config),
            start_time: self.start_time,
        }
    }

    /// Assembles the HTTP router.
    ///
    /// - `GET /health`: health JSON
    /// - `GET /health/live`: liveness probe
    /// - `GET /health/ready`: readiness probe
    /// - anything else: dispatched through the STREST router
    pub fn build_http_router(&self) -> axum::Router {
        build_http_router(self.app_state())
    }

    /// Binds the socket listener and, if enabled, the HTTP listener.
    ///
    /// # Errors
    ///
    /// Returns an error if either address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<BoundAddrs> {
        let socket = TcpListener::bind(self.config.socket_addr()).await?;
        let http = match self.config.http_addr() {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        let bound = BoundAddrs {
            socket: socket.local_addr()?,
            http: http.as_ref().map(TcpListener::local_addr).transpose()?,
        };
        info!(
            socket = %bound.socket,
            http = ?bound.http,
            protocol = self.protocol.name(),
            "listeners bound"
        );
        self.listeners = Some(Listeners { socket, http });
        Ok(bound)
    }

    /// Serves until `shutdown` resolves or
    /// [`ShutdownController::trigger_shutdown`] is called, then drains.
    ///
    /// Draining stops accepting, waits up to `drain_timeout` for in-flight
    /// dispatches, and closes every remaining session.
    ///
    /// # Errors
    ///
    /// Returns an error if [`start`](Self::start) was not called or a
    /// listener fails fatally.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let Some(listeners) = self.listeners.take() else {
            anyhow::bail!("start() must be called before serve()");
        };
        let state = self.app_state();

        let trigger = Arc::clone(&self.shutdown);
        tokio::spawn(async move {
            shutdown.await;
            trigger.trigger_shutdown();
        });

        self.shutdown.set_ready();
        info!(name = %self.name, routes = self.router.len(), "serving");

        let sockets = tokio::spawn(serve_sessions(listeners.socket, state.clone()));
        if let Some(http) = listeners.http {
            let signal = Arc::clone(&self.shutdown);
            axum::serve(http, build_http_router(state))
                .with_graceful_shutdown(async move { signal.wait_for_shutdown().await })
                .await?;
        }
        sockets.await?;

        drain_sessions(&self.registry, &self.shutdown, &self.config).await;
        Ok(())
    }
}

fn build_http_router(state: AppState) -> axum::Router {
    let layers = build_http_layers(&state.config);
    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .fallback(strest_http_handler)
        .layer(layers)
        .with_state(state)
}

/// Waits for in-flight dispatches, then closes every session.
async fn drain_sessions(
    registry: &SessionRegistry,
    shutdown: &ShutdownController,
    config: &NetworkConfig,
) {
    shutdown.trigger_shutdown();

    if shutdown.wait_for_drain(config.drain_timeout).await {
        info!("in-flight dispatches drained");
    } else {
        warn!(
            in_flight = shutdown.in_flight_count(),
            "drain timeout expired with dispatches outstanding"
        );
    }

    let sessions = registry.drain_all();
    if !sessions.is_empty() {
        info!(sessions = sessions.len(), "closing sessions");
    }
    // A full mailbox delays the close frame rather than losing it. Dropping
    // the handles afterwards releases the write loops either way.
    let mut closing = JoinSet::new();
    for session in sessions {
        let send_timeout = config.session.send_timeout;
        closing.spawn(async move {
            let close = OutboundFrame::Close(Some("server shutting down".to_string()));
            if let Err(e) = session.send_timeout(close, send_timeout).await {
                debug!(session = %session.id, error = ?e, "close frame not queued");
            }
        });
    }
    while closing.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use strest_core::{Request, Response, TXN_CONTINUE};
    use tower::ServiceExt;

    use super::*;
    use crate::client::{ClientError, Connection, ConnectionConfig};
    use crate::network::config::SessionConfig;
    use crate::network::sink::ResponseSink;
    use crate::network::socket::run_session;
    use crate::protocol::{JsonProtocol, ProtocolKind};
    use crate::service::{handler_fn, MethodController};

    fn test_server(protocol: ProtocolKind) -> ServerConfig {
        let network = NetworkConfig {
            host: "127.0.0.1".to_string(),
            socket_port: 0,
            http_port: Some(0),
            protocol,
            drain_timeout: Duration::from_secs(2),
            ..NetworkConfig::default()
        };
        let mut config = ServerConfig::new("test", network);
        config
            .register(MethodController::all(
                "/echo",
                handler_fn(|request: Request, sink: Arc<dyn ResponseSink>| async move {
                    let mut response = Response::new(&request);
                    if let Some(params) = request.params() {
                        response.put("data.params", params.clone());
                    }
                    sink.deliver(response).await
                }),
            ))
            .unwrap();
        config
            .register(MethodController::new("/users/:id").on(
                &["GET"],
                handler_fn(|request: Request, sink: Arc<dyn ResponseSink>| async move {
                    let mut response = Response::new(&request);
                    response.put("data.id", request.param_str("id"));
                    sink.deliver(response).await
                }),
            ))
            .unwrap();
        config
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn drain_releases_session_behind_a_slow_reader() {
        let network = NetworkConfig {
            session: SessionConfig {
                outbound_channel_capacity: 1,
                ..SessionConfig::default()
            },
            drain_timeout: Duration::from_secs(2),
            ..NetworkConfig::default()
        };
        let mut config = ServerConfig::new("drain", network);
        config
            .register(MethodController::all(
                "/burst",
                handler_fn(|request: Request, sink: Arc<dyn ResponseSink>| async move {
                    for n in 0..7 {
                        let mut part = Response::new(&request);
                        part.set_txn_status(TXN_CONTINUE);
                        part.put("data.n", n);
                        sink.deliver(part).await?;
                    }
                    sink.deliver(Response::new(&request)).await
                }),
            ))
            .unwrap();
        let state = NetworkModule::new(config).app_state();

        let (mut client, server) = tokio::io::duplex(256);
        let session = tokio::spawn(run_session(server, "slow-reader".to_string(), state.clone()));
        let protocol = JsonProtocol::default();
        protocol.write_handshake(&mut client).await.unwrap();
        let (reader, mut writer) = tokio::io::split(client);
        protocol
            .write_request(&Request::new("GET", "/burst").with_txn_id("b"), &mut writer)
            .await
            .unwrap();

        // Unread socket: the write loop stalls and the mailbox fills.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let drain = {
            let state = state.clone();
            tokio::spawn(async move {
                drain_sessions(&state.registry, &state.shutdown, &state.config).await;
            })
        };

        let mut decoder = protocol.new_decoder(Box::new(reader));
        let mut read = 0;
        while let Some(response) = decoder.decode_response().await.unwrap() {
            assert_eq!(response.txn_id(), "b");
            read += 1;
        }
        assert_eq!(read, 8);

        drain.await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.registry.count(), 0);
    }

    #[test]
    fn new_does_not_bind() {
        let module = NetworkModule::new(test_server(ProtocolKind::Json));
        assert!(module.listeners.is_none());
        assert!(Arc::ptr_eq(&module.registry(), &module.registry()));
        assert!(Arc::ptr_eq(
            &module.shutdown_controller(),
            &module.shutdown_controller()
        ));
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let module = NetworkModule::new(test_server(ProtocolKind::Json));
        assert!(module.serve(std::future::pending()).await.is_err());
    }

    #[tokio::test]
    async fn http_dispatches_query_and_body_params() {
        let module = NetworkModule::new(test_server(ProtocolKind::Json));
        let response = module
            .build_http_router()
            .oneshot(
                HttpRequest::post("/echo?color=red")
                    .header("x-request-id", "req-1")
                    .body(Body::from(r#"{"size": 3}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-request-id"], "req-1");
        let json = body_json(response).await;
        assert_eq!(json["strest"]["txn"]["id"], "req-1");
        assert_eq!(json["data"]["params"]["color"], "red");
        assert_eq!(json["data"]["params"]["size"], 3);
    }

    #[tokio::test]
    async fn http_path_captures_and_status_codes() {
        let module = NetworkModule::new(test_server(ProtocolKind::Json));
        let router = module.build_http_router();

        let ok = router
            .clone()
            .oneshot(HttpRequest::get("/users/9").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(body_json(ok).await["data"]["id"], "9");

        let not_allowed = router
            .clone()
            .oneshot(HttpRequest::delete("/users/9").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(not_allowed.status(), StatusCode::METHOD_NOT_ALLOWED);

        let missing = router
            .clone()
            .oneshot(HttpRequest::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let bad_body = router
            .oneshot(HttpRequest::post("/echo").body(Body::from("[1,2]")).unwrap())
            .await
            .unwrap();
        assert_eq!(bad_body.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn http_health_endpoint() {
        let module = NetworkModule::new(test_server(ProtocolKind::Msgpack));
        let response = module
            .build_http_router()
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["name"], "test");
        assert_eq!(json["protocol"], "msgpack");
        assert_eq!(json["routes"], 2);
    }

    #[tokio::test]
    async fn http_rejects_requests_while_draining() {
        let module = NetworkModule::new(test_server(ProtocolKind::Json));
        module.shutdown_controller().trigger_shutdown();
        let response = module
            .build_http_router()
            .oneshot(HttpRequest::get("/echo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    async fn client_roundtrip(kind: ProtocolKind) {
        let mut module = NetworkModule::new(test_server(kind));
        let bound = module.start().await.unwrap();
        let shutdown = module.shutdown_controller();
        let server = tokio::spawn(module.serve(std::future::pending()));

        let conn = Connection::connect(
            ConnectionConfig::new(bound.socket.to_string()),
            kind.into_protocol(),
        )
        .await
        .unwrap();

        let mut calls = Vec::new();
        for i in 0..10 {
            let conn = conn.clone();
            calls.push(tokio::spawn(async move {
                conn.call(Request::new("GET", &format!("/users/{i}")).with_txn_id(format!("u{i}")))
                    .await
            }));
        }
        for (i, call) in calls.into_iter().enumerate() {
            let response = call.await.unwrap().unwrap();
            assert_eq!(response.txn_id(), format!("u{i}"));
            assert_eq!(response.get_str("data.id"), i.to_string());
        }

        shutdown.trigger_shutdown();
        server.await.unwrap().unwrap();
        conn.closed().await;
        assert_eq!(
            conn.call(Request::new("GET", "/echo")).await,
            Err(ClientError::NotConnected)
        );
        assert_eq!(shutdown.health_state(), crate::network::HealthState::Stopped);
    }

    #[tokio::test]
    async fn socket_roundtrip_json() {
        client_roundtrip(ProtocolKind::Json).await;
    }

    #[tokio::test]
    async fn socket_roundtrip_msgpack() {
        client_roundtrip(ProtocolKind::Msgpack).await;
    }
}
