//! The axum surface. The listener's concerns are request identity, body
//! caps, and header decoration; everything else belongs to the dispatcher.

use crate::dispatcher::{DispatchResult, Dispatcher, IncomingRequest};
use crate::headers;
use axum::Router;
use axum::extract::rejection::BytesRejection;
use axum::extract::{ConnectInfo, DefaultBodyLimit, OriginalUri, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use portway_core::catalog::EndpointCatalog;
use portway_core::environment::EnvironmentRegistry;
use portway_core::error::GatewayError;
use portway_core::response::GatewayResponse;
use portway_observability::GatewayMetrics;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub catalog: Arc<EndpointCatalog>,
    pub environments: Arc<EnvironmentRegistry>,
    pub metrics: Arc<GatewayMetrics>,
    pub max_body_bytes: usize,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state.max_body_bytes;
    Router::new()
        .route("/health/live", get(health_live))
        .route("/health/details", get(health_details))
        .route("/health/metrics", get(health_metrics))
        .route("/api/{*rest}", any(dispatch_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the shutdown future resolves.
pub async fn serve(
    state: Arc<AppState>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Portway listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

async fn health_live() -> Response {
    axum::Json(json!({ "status": "alive" })).into_response()
}

async fn health_details(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.catalog.snapshot();
    axum::Json(json!({
        "status": "alive",
        "endpoints": snapshot.len(),
        "catalogLoadedAt": snapshot.loaded_at.to_rfc3339(),
        "environments": state.environments.allowed(),
    }))
    .into_response()
}

async fn health_metrics(State(state): State<Arc<AppState>>) -> Response {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.gather_text(),
    )
        .into_response()
}

async fn dispatch_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    OriginalUri(uri): OriginalUri,
    method: Method,
    request_headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();

    let body = match body {
        Ok(body) => body,
        Err(_) => {
            let err = GatewayError::PayloadTooLarge;
            let result = DispatchResult {
                response: GatewayResponse::from(&err),
                rate_limit: None,
            };
            return finalize(result, &request_id);
        }
    };

    let path = uri
        .path()
        .strip_prefix("/api/")
        .unwrap_or(uri.path())
        .to_string();
    let query = uri.query().unwrap_or_default().to_string();

    let client_ip = request_headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| peer.ip().to_string());
    let scheme = request_headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http")
        .to_string();
    let host = request_headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost")
        .to_string();

    let result = state
        .dispatcher
        .dispatch(IncomingRequest {
            method,
            path,
            query,
            headers: request_headers,
            body,
            client_ip,
            scheme,
            host,
            request_id: request_id.clone(),
        })
        .await;

    finalize(result, &request_id)
}

/// Convert a dispatch result into the wire response: status and handler
/// headers, then the correlation id, security set, and rate-limit set.
fn finalize(result: DispatchResult, request_id: &str) -> Response {
    let status =
        StatusCode::from_u16(result.response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::new(axum::body::Body::from(result.response.body.clone()));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in &result.response.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert("x-request-id", value);
    }
    for (name, value) in headers::SECURITY_HEADERS {
        headers.insert(*name, HeaderValue::from_static(value));
    }
    if let Some(decision) = &result.rate_limit {
        for (name, value) in headers::rate_limit_headers(decision) {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(name, value);
            }
        }
    }

    response
}
