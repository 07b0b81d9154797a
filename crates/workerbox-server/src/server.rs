// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP server: host dispatch in front of the REST API.
//!
//! Requests whose `Host` is a subdomain of the configured domain are
//! proxied to the matching unit; everything else reaches the API routes.

use std::time::Instant;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::Json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::{self, AppState, Envelope, MAX_SCRIPT_SIZE};
use crate::router::request_host;

/// Build the axum application.
pub fn build_app(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/", get(api::index))
        .route("/health", get(api::health))
        .route("/v1/scripts", get(api::list_scripts))
        .route(
            "/v1/scripts/{name}",
            put(api::put_script).delete(api::delete_script),
        )
        .route("/v1/scripts/{selector}/bundle.js", get(api::get_bundle))
        .route("/v1/secrets/{script_name}", put(api::put_secrets))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(MAX_SCRIPT_SIZE + 64 * 1024))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            dispatch_by_host,
        ))
        .layer(middleware::from_fn(response_time))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `app` on `listener` until `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    app: axum::Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "HTTP server listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}

async fn dispatch_by_host(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let host = request_host(&request).unwrap_or_default();
    if state.router.handles(&host) {
        return state.router.proxy(request).await;
    }
    next.run(request).await
}

async fn response_time(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();

    let mut response = next.run(request).await;

    let elapsed = started.elapsed();
    if let Ok(value) = HeaderValue::from_str(&format!("{}ms", elapsed.as_millis())) {
        response.headers_mut().insert("x-response-time", value);
    }
    info!(
        method = %method,
        uri = %uri,
        status = response.status().as_u16(),
        elapsed_ms = elapsed.as_millis() as u64,
        "Request served"
    );
    response
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(Envelope::error("Not found"))).into_response()
}
