//! HTTP route definitions and the proxy handler.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{debug, warn};

use collapse_server::{BatcherState, UpstreamResponse};

use super::state::AppState;
use crate::errors::ApiError;
use crate::observability::{metrics_handler, record_proxied_request, MetricsState};
use crate::upstream::ForwardedRequest;
use crate::utils::coalescing_key;

/// Default request body size limit (1MB).
pub const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;

/// Default path of the Prometheus endpoint.
pub const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Proxy routes: `/health` plus a fallback that forwards everything else.
fn proxy_routes(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .fallback(proxy)
        .with_state(Arc::new(state))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
}

/// Creates the proxy router with the default body size limit.
pub fn create_router(state: AppState) -> Router {
    create_router_with_body_limit(state, DEFAULT_BODY_LIMIT)
}

/// Creates the proxy router with a custom body size limit.
pub fn create_router_with_body_limit(state: AppState, body_limit: usize) -> Router {
    proxy_routes(state, body_limit)
}

/// Creates the proxy router plus the Prometheus endpoint at `metrics_path`.
///
/// `metrics_path` shadows any upstream resource with the same path.
pub fn create_router_with_observability(
    state: AppState,
    metrics_state: MetricsState,
    metrics_path: &str,
    body_limit: usize,
) -> Router {
    let observability_router = Router::new()
        .route(metrics_path, get(metrics_handler))
        .with_state(metrics_state);

    proxy_routes(state, body_limit).merge(observability_router)
}

async fn health_check() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Forwards one client request, through the batcher when its method is
/// collapsible and directly otherwise.
async fn proxy(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, ApiError> {
    let body = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::payload_too_large(rejection.body_text())
        } else {
            ApiError::bad_request(rejection.body_text())
        }
    })?;

    if state.settings.coalesces(method.as_str()) {
        let key = coalescing_key(&method, &uri, state.settings.include_query);
        let request = ForwardedRequest::new(method, &uri, headers, body);
        let response = state.batcher.submit(key, request).await?;
        record_proxied_request("collapsed", response.status);
        return Ok(to_http_response(response));
    }

    // Direct forwarding follows the batcher's lifecycle so that shutdown
    // refuses new work uniformly.
    if state.batcher.state() != BatcherState::Running {
        return Err(ApiError::service_unavailable("proxy is shutting down"));
    }

    debug!(%method, %uri, "forwarding without collapsing");
    let request = ForwardedRequest::new(method, &uri, headers, body);
    let response = match state.upstream.forward(&request).await {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, "direct upstream request failed");
            UpstreamResponse::from_invoke_error(&err)
        }
    };
    record_proxied_request("direct", response.status);
    Ok(to_http_response(response))
}

/// Relays status and body. Upstream headers are not carried over.
fn to_http_response(response: UpstreamResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, response.body).into_response()
}
