//! Standalone STREST server with `/ping` and `/echo` controllers.

use std::sync::Arc;

use clap::Parser;
use strest_core::{Request, Response};
use strest_transport::network::NetworkConfig;
use strest_transport::{handler_fn, MethodController, NetworkModule, ProtocolKind, ResponseSink, ServerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "strest-server", version, about = "STREST socket and HTTP server")]
struct Args {
    /// Name reported by `/health`.
    #[arg(long, env = "STREST_NAME", default_value = "strest")]
    name: String,

    #[arg(long, env = "STREST_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port for the framed socket listener.
    #[arg(long, env = "STREST_SOCKET_PORT", default_value_t = 8009)]
    socket_port: u16,

    /// Port for the HTTP listener; 0 picks a free port.
    #[arg(long, env = "STREST_HTTP_PORT", default_value_t = 8010)]
    http_port: u16,

    /// Disable the HTTP listener.
    #[arg(long, env = "STREST_NO_HTTP")]
    no_http: bool,

    /// Socket wire protocol: `json` or `msgpack`.
    #[arg(long, env = "STREST_PROTOCOL", default_value = "json")]
    protocol: ProtocolKind,

    /// Emit logs as JSON lines.
    #[arg(long, env = "STREST_LOG_JSON")]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn server_config(args: &Args) -> anyhow::Result<ServerConfig> {
    let network = NetworkConfig {
        host: args.host.clone(),
        socket_port: args.socket_port,
        http_port: (!args.no_http).then_some(args.http_port),
        protocol: args.protocol,
        ..NetworkConfig::default()
    };
    let mut config = ServerConfig::new(args.name.clone(), network);
    config
        .register(MethodController::all(
            "/ping",
            handler_fn(|request: Request, sink: Arc<dyn ResponseSink>| async move {
                let mut response = Response::new(&request);
                response.put("data", "pong");
                sink.deliver(response).await
            }),
        ))?
        .register(MethodController::all(
            "/echo",
            handler_fn(|request: Request, sink: Arc<dyn ResponseSink>| async move {
                let mut response = Response::new(&request);
                response.put("data.method", request.method());
                response.put("data.uri", request.uri());
                if let Some(params) = request.params() {
                    response.put("data.params", params.clone());
                }
                sink.deliver(response).await
            }),
        ))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut module = NetworkModule::new(server_config(&args)?);
    let bound = module.start().await?;
    info!(socket = %bound.socket, http = ?bound.http, "strest-server started");

    module
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown signal received");
        })
        .await
}
