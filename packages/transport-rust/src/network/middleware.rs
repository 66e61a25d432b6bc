//! Tower middleware for the HTTP listener.
//!
//! The first layer listed is the outermost: it sees the request first and
//! the response last.

use axum::http::header::HeaderName;
use axum::http::StatusCode;
use tower::layer::util::{Identity, Stack};
use tower::ServiceBuilder;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::config::NetworkConfig;

/// Header carrying the request id. HTTP requests use it as their STREST
/// transaction id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

type Traced = TraceLayer<SharedClassifier<ServerErrorsAsFailures>>;

/// The composed layer, innermost last.
pub type HttpLayers = Stack<
    PropagateRequestIdLayer,
    Stack<TimeoutLayer, Stack<CorsLayer, Stack<Traced, Stack<SetRequestIdLayer<MakeRequestUuid>, Identity>>>>,
>;

/// Builds the HTTP middleware stack.
///
/// Outermost to innermost:
/// 1. `SetRequestId`: assigns a UUID `x-request-id` unless the client sent one
/// 2. `Trace`: request/response spans
/// 3. `Cors`: allowed origins from the config; STREST verbs are arbitrary,
///    so every method is allowed
/// 4. `Timeout`: 408 after `request_timeout`
/// 5. `PropagateRequestId`: copies `x-request-id` onto the response
#[must_use]
pub fn build_http_layers(config: &NetworkConfig) -> HttpLayers {
    let header = HeaderName::from_static(REQUEST_ID_HEADER);
    let timeout = TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, config.request_timeout);

    ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(header.clone(), MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(cors(&config.cors_origins))
        .layer(timeout)
        .layer(PropagateRequestIdLayer::new(header))
        .into_inner()
}

/// `"*"` anywhere in `origins` allows every origin; otherwise only the
/// origins that parse as header values are allowed.
fn cors(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(AllowOrigin::any());
    }
    layer.allow_origin(AllowOrigin::list(
        origins.iter().filter_map(|o| o.parse().ok()),
    ))
}
