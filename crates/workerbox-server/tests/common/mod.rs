// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for workerbox-server integration tests.
//!
//! Provides TestContext: in-memory persistence, a MockHost, and the Store,
//! Runner and Router loops running on the test runtime.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use tokio::sync::Notify;
use tower::ServiceExt;
use uuid::Uuid;

use workerbox_server::api::AppState;
use workerbox_server::event_bus::EventBus;
use workerbox_server::host::{MockHost, WorkerHost};
use workerbox_server::model::{Script, ScriptStatus};
use workerbox_server::persistence::{Persistence, SqlitePersistence};
use workerbox_server::router::Router;
use workerbox_server::runner::{Runner, RunnerConfig};
use workerbox_server::server::build_app;
use workerbox_server::store::Store;

pub const DOMAIN: &str = "workers.local";
pub const PUBLIC_URL: &str = "http://127.0.0.1:8000";

/// Everything a control-plane test needs, wired like the runtime does.
pub struct TestContext {
    pub store: Arc<Store>,
    pub host: Arc<MockHost>,
    pub runner: Runner,
    pub router: Router,
    pub app: axum::Router,
    runner_shutdown: Arc<Notify>,
    router_shutdown: Arc<Notify>,
    _data_dir: tempfile::TempDir,
}

impl TestContext {
    /// Context with a mock host whose units answer `ok`.
    pub async fn new() -> Self {
        Self::with_host(MockHost::new()).await
    }

    /// Context around a specific mock host.
    pub async fn with_host(host: MockHost) -> Self {
        let persistence = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        Self::with_persistence(persistence, host).await
    }

    /// Context whose Runner gives up on a start after `ready_timeout`.
    pub async fn with_ready_timeout(host: MockHost, ready_timeout: Duration) -> Self {
        let persistence = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        Self::build(persistence, host, ready_timeout).await
    }

    /// Context over existing persistence, running startup reconciliation
    /// and the pending replay exactly as the runtime does.
    pub async fn with_persistence(persistence: Arc<dyn Persistence>, host: MockHost) -> Self {
        Self::build(persistence, host, Duration::from_secs(5)).await
    }

    async fn build(
        persistence: Arc<dyn Persistence>,
        host: MockHost,
        ready_timeout: Duration,
    ) -> Self {
        let data_dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(
            Store::open(persistence, Arc::new(EventBus::new()))
                .await
                .unwrap(),
        );
        store.startup().await.unwrap();

        let host = Arc::new(host);
        let worker_host: Arc<dyn WorkerHost> = host.clone();
        let (runner, runner_loop) = Runner::new(
            store.clone(),
            worker_host,
            RunnerConfig {
                data_dir: data_dir.path().to_path_buf(),
                ready_timeout,
                fetch_timeout: Duration::from_secs(5),
            },
        );
        let (router, router_loop) = Router::new(&store, runner.clone(), DOMAIN);

        let runner_shutdown = runner_loop.shutdown_handle();
        let router_shutdown = router_loop.shutdown_handle();
        tokio::spawn(runner_loop.run());
        tokio::spawn(router_loop.run());
        store.replay_pending().await;

        let app = build_app(AppState {
            store: store.clone(),
            runner: runner.clone(),
            router: router.clone(),
            public_url: PUBLIC_URL.to_string(),
        });

        Self {
            store,
            host,
            runner,
            router,
            app,
            runner_shutdown,
            router_shutdown,
            _data_dir: data_dir,
        }
    }

    /// Send one request through the full HTTP stack.
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    /// Deploy `content` as `name` and wait until it is running and routed.
    pub async fn deploy_running(&self, name: &str, content: &str) -> Script {
        let script = self
            .store
            .put_script(name, content.to_string())
            .await
            .unwrap();
        let script = wait_for_status(&self.store, script.id, ScriptStatus::Running).await;
        wait_for_route(&self.router, &format!("{}.{}", script.name_id(), DOMAIN), true).await;
        script
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        self.runner_shutdown.notify_one();
        self.router_shutdown.notify_one();
    }
}

/// Poll until the script reaches `status`, or panic after five seconds.
pub async fn wait_for_status(store: &Store, id: Uuid, status: ScriptStatus) -> Script {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let current = store.get_script_by_id(id).await;
        if let Some(script) = &current {
            if script.status == status {
                return script.clone();
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "script {} never reached {}, last seen {:?}",
                id,
                status,
                current.map(|s| s.status)
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until `host` is (or is not) routed, or panic after five seconds.
pub async fn wait_for_route(router: &Router, host: &str, present: bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while router.get_target(host).await.is_some() != present {
        if tokio::time::Instant::now() >= deadline {
            panic!("route for {} never became present={}", host, present);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until `check` holds, or panic after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Read a whole response body as JSON.
pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Read a whole response body as text.
pub async fn text_body(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
