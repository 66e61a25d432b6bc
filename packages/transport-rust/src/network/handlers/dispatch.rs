//! HTTP front door for the router.
//!
//! `METHOD /path?query` with an optional JSON object body becomes a STREST
//! [`Request`]: query pairs and body fields land in `strest.params`, and the
//! transaction id is the `x-request-id` assigned by the middleware stack.
//! The controller's first response is rendered as the JSON body, with its
//! `status.code` as the HTTP status.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::Json;
use strest_core::{Request, Response, Value};
use tracing::debug;
use uuid::Uuid;

use super::AppState;
use crate::network::middleware::REQUEST_ID_HEADER;
use crate::network::sink::HttpSink;

/// Fallback handler: every path not claimed by a built-in endpoint.
pub async fn strest_http_handler(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<BTreeMap<String, String>>,
    body: Bytes,
) -> HttpResponse {
    let target = uri.path_and_query().map_or_else(|| uri.path(), |pq| pq.as_str());
    let mut request = Request::new(method.as_str(), target);
    let txn_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
    request.set_txn_id(txn_id);

    if state.shutdown.is_shutting_down() {
        return render(&Response::error(&request, 503, "server is shutting down"));
    }

    for (name, value) in query {
        request.set_param(&name, value);
    }
    if !body.is_empty() {
        match serde_json::from_slice::<BTreeMap<String, Value>>(&body) {
            Ok(fields) => {
                for (name, value) in fields {
                    request.set_param(&name, value);
                }
            }
            Err(e) => {
                let message = format!("body must be a JSON object: {e}");
                return render(&Response::error(&request, 400, &message));
            }
        }
    }

    let _guard = state.shutdown.in_flight_guard();
    let (sink, rx) = HttpSink::new();
    if let Err(e) = state.router.dispatch(request.clone(), Arc::new(sink)).await {
        debug!(uri = request.uri(), error = %e, "http dispatch did not deliver");
    }
    match rx.await {
        Ok(response) => render(&response),
        Err(_) => render(&Response::error(
            &request,
            500,
            "controller finished without a response",
        )),
    }
}

fn render(response: &Response) -> HttpResponse {
    let status = u16::try_from(response.status_code())
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response.to_json_value())).into_response()
}
