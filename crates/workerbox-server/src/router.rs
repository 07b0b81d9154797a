// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host-based routing of inbound requests to live units.
//!
//! The Router keeps `hostKey -> Script` for every running script, keyed by
//! both `name` and `nameId`, and rebuilds it purely from Store events.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, Request, Response, StatusCode, header};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

use crate::event_bus::{Event, Subscription};
use crate::model::{Script, ScriptStatus};
use crate::runner::Runner;
use crate::store::Store;

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

type RouteTable = Arc<RwLock<HashMap<String, Script>>>;

/// Resolves hostnames under the configured domain to running scripts.
#[derive(Clone)]
pub struct Router {
    domain: String,
    table: RouteTable,
    runner: Runner,
}

/// The Router's event loop; spawn [`RouterLoop::run`] on its own task.
pub struct RouterLoop {
    table: RouteTable,
    events: Subscription,
    shutdown: Arc<Notify>,
}

impl Router {
    /// Create the Router and its loop, subscribing to `store` right away.
    pub fn new(store: &Store, runner: Runner, domain: impl Into<String>) -> (Router, RouterLoop) {
        let table: RouteTable = Arc::new(RwLock::new(HashMap::new()));
        let router = Router {
            domain: domain.into().trim_matches('.').to_ascii_lowercase(),
            table: table.clone(),
            runner,
        };
        let router_loop = RouterLoop {
            table,
            events: store.subscribe(),
            shutdown: Arc::new(Notify::new()),
        };
        (router, router_loop)
    }

    /// Configured domain suffix.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// True if `host` is a subdomain of the configured domain.
    pub fn handles(&self, host: &str) -> bool {
        normalize_host(host).ends_with(&format!(".{}", self.domain))
    }

    /// Strip `.{domain}` from `host`; empty when `host` is not ours.
    pub fn trim_domain(&self, host: &str) -> String {
        let host = normalize_host(host);
        let suffix = format!(".{}", self.domain);
        match host.strip_suffix(&suffix) {
            Some(key) => key.to_string(),
            None => String::new(),
        }
    }

    /// Script currently routed for `host`.
    pub async fn get_target(&self, host: &str) -> Option<Script> {
        let key = self.trim_domain(host);
        if key.is_empty() {
            return None;
        }
        self.table.read().await.get(&key).cloned()
    }

    /// Snapshot of the routing table.
    pub async fn routes(&self) -> HashMap<String, Script> {
        self.table.read().await.clone()
    }

    /// Forward `request` to the unit serving its host.
    ///
    /// Unknown hosts get `404`, a failed forward gets `500` with no retry.
    pub async fn proxy(&self, request: Request<Body>) -> Response<Body> {
        let host = request_host(&request).unwrap_or_default();
        let Some(script) = self.get_target(&host).await else {
            debug!(host = %host, "No route for host");
            return plain(StatusCode::NOT_FOUND, "not found");
        };

        let (mut parts, body) = request.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        let request = Request::from_parts(parts, body);

        match self.runner.fetch(script.id, request).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, body)
            }
            Err(e) => {
                warn!(host = %host, name_id = %script.name_id(), error = %e, "Proxy failed");
                plain(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

impl RouterLoop {
    /// Handle used to stop the loop.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Apply events until shutdown is signalled or the bus goes away.
    pub async fn run(mut self) {
        info!("Router started");
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Router shutting down");
                    break;
                }

                event = self.events.recv() => {
                    match event {
                        Some(event) => apply_event(&self.table, event).await,
                        None => {
                            info!("Event bus closed, router exiting");
                            break;
                        }
                    }
                }
            }
        }
    }
}

async fn apply_event(table: &RouteTable, event: Event) {
    let Event::ScriptStatusChanged { script } = event else {
        return;
    };
    let mut table = table.write().await;

    match script.status {
        ScriptStatus::Running => {
            table.insert(script.name_id(), script.clone());
            table.insert(script.name.clone(), script.clone());
            info!(name_id = %script.name_id(), url = script.url.as_deref().unwrap_or(""), "Route added");
        }
        ScriptStatus::Stopping | ScriptStatus::Stopped => {
            let before = table.len();
            table.retain(|_, routed| routed.id != script.id);
            if table.len() == before {
                return;
            }

            // Another running deployment with the same name takes the name over.
            if !table.contains_key(&script.name) {
                let successor = table
                    .values()
                    .filter(|routed| routed.name == script.name)
                    .max_by_key(|routed| routed.updated_at)
                    .cloned();
                if let Some(successor) = successor {
                    debug!(name_id = %successor.name_id(), "Name route re-pointed");
                    table.insert(script.name.clone(), successor);
                }
            }
            info!(name_id = %script.name_id(), status = %script.status, "Route removed");
        }
        ScriptStatus::Pending => {}
    }
}

/// Lowercase `host` and drop any port.
fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    without_port.trim_end_matches('.').to_ascii_lowercase()
}

/// Host a request was addressed to, from the `Host` header or the URI.
pub fn request_host<B>(request: &Request<B>) -> Option<String> {
    request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().host().map(str::to_string))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn plain(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("Foo.Workers.Local:8000"), "foo.workers.local");
        assert_eq!(normalize_host("foo.workers.local."), "foo.workers.local");
        assert_eq!(normalize_host("localhost"), "localhost");
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "close".parse().unwrap());
        headers.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
        headers.insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::CONTENT_TYPE));
    }

    #[test]
    fn test_request_host_prefers_header() {
        let request = Request::builder()
            .uri("http://other.example/")
            .header(header::HOST, "demo.workers.local")
            .body(())
            .unwrap();
        assert_eq!(request_host(&request).as_deref(), Some("demo.workers.local"));

        let request = Request::builder()
            .uri("http://other.example/")
            .body(())
            .unwrap();
        assert_eq!(request_host(&request).as_deref(), Some("other.example"));
    }

    #[tokio::test]
    async fn test_name_route_moves_to_remaining_deployment() {
        let table: RouteTable = Arc::new(RwLock::new(HashMap::new()));

        let mut first = Script::new("demo", "a");
        first.status = ScriptStatus::Running;
        let mut second = Script::new("demo", "b");
        second.status = ScriptStatus::Running;

        apply_event(&table, Event::ScriptStatusChanged { script: first.clone() }).await;
        apply_event(&table, Event::ScriptStatusChanged { script: second.clone() }).await;
        assert_eq!(table.read().await["demo"].id, second.id);
        assert_eq!(table.read().await.len(), 3);

        second.status = ScriptStatus::Stopping;
        apply_event(&table, Event::ScriptStatusChanged { script: second.clone() }).await;
        let routes = table.read().await;
        assert_eq!(routes["demo"].id, first.id);
        assert!(routes.contains_key(&first.name_id()));
        assert!(!routes.contains_key(&second.name_id()));
    }
}
