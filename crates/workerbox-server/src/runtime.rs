// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for workerbox-server.
//!
//! [`WorkerboxRuntime`] wires the Store, Runner, Router and HTTP server
//! together so the whole control plane can run inside an existing tokio
//! application.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use workerbox_server::host::{ProcessHost, ProcessHostConfig};
//! use workerbox_server::persistence::SqlitePersistence;
//! use workerbox_server::runtime::WorkerboxRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::from_path("workerbox.db").await?);
//!     let host = Arc::new(ProcessHost::new(ProcessHostConfig::new(
//!         vec!["workerbox-worker".to_string()],
//!         ".data",
//!     ))?);
//!
//!     let runtime = WorkerboxRuntime::builder()
//!         .persistence(persistence)
//!         .host(host)
//!         .bind_addr("0.0.0.0:8000".parse()?)
//!         .domain("workers.local")
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::api::AppState;
use crate::event_bus::EventBus;
use crate::host::WorkerHost;
use crate::persistence::Persistence;
use crate::router::Router;
use crate::runner::{Runner, RunnerConfig};
use crate::server::{build_app, serve};
use crate::store::Store;

/// Builder for a [`WorkerboxRuntime`].
pub struct WorkerboxRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    host: Option<Arc<dyn WorkerHost>>,
    bind_addr: SocketAddr,
    public_url: Option<String>,
    domain: String,
    data_dir: PathBuf,
    ready_timeout: Duration,
    fetch_timeout: Duration,
}

impl Default for WorkerboxRuntimeBuilder {
    fn default() -> Self {
        let runner = RunnerConfig::default();
        Self {
            persistence: None,
            host: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            public_url: None,
            domain: "workers.local".to_string(),
            data_dir: runner.data_dir,
            ready_timeout: runner.ready_timeout,
            fetch_timeout: runner.fetch_timeout,
        }
    }
}

impl WorkerboxRuntimeBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence backend (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the worker host strategy (required).
    pub fn host(mut self, host: Arc<dyn WorkerHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Set the HTTP listen address. Port 0 picks a free port.
    ///
    /// Default: `0.0.0.0:8000`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the public base URL used in responses.
    ///
    /// Default: `http://{bound address}`
    pub fn public_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = Some(url.into());
        self
    }

    /// Set the routing domain suffix.
    ///
    /// Default: `workers.local`
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Set the directory for per-unit files.
    ///
    /// Default: `.data`
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// Bound on a unit start.
    ///
    /// Default: 10 seconds
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Bound on a proxied fetch.
    ///
    /// Default: 30 seconds
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<WorkerboxRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let host = self
            .host
            .ok_or_else(|| anyhow::anyhow!("host is required"))?;

        Ok(WorkerboxRuntimeConfig {
            persistence,
            host,
            bind_addr: self.bind_addr,
            public_url: self.public_url,
            domain: self.domain,
            runner: RunnerConfig {
                data_dir: self.data_dir,
                ready_timeout: self.ready_timeout,
                fetch_timeout: self.fetch_timeout,
            },
        })
    }
}

/// Configuration for a [`WorkerboxRuntime`].
pub struct WorkerboxRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    host: Arc<dyn WorkerHost>,
    bind_addr: SocketAddr,
    public_url: Option<String>,
    domain: String,
    runner: RunnerConfig,
}

impl WorkerboxRuntimeConfig {
    /// Start the runtime: reconcile stored state, spawn the subscriber
    /// loops, restart recovered scripts and begin serving HTTP.
    pub async fn start(self) -> Result<WorkerboxRuntime> {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(
            Store::open(self.persistence, bus)
                .await
                .context("failed to load scripts")?,
        );
        store
            .startup()
            .await
            .context("startup reconciliation failed")?;

        let (runner, runner_loop) = Runner::new(store.clone(), self.host, self.runner);
        let (router, router_loop) = Router::new(&store, runner.clone(), self.domain);

        let runner_shutdown = runner_loop.shutdown_handle();
        let runner_handle = tokio::spawn(runner_loop.run());
        let router_shutdown = router_loop.shutdown_handle();
        let router_handle = tokio::spawn(router_loop.run());

        store.replay_pending().await;

        let listener = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.bind_addr))?;
        let local_addr = listener.local_addr()?;
        let public_url = self
            .public_url
            .unwrap_or_else(|| format!("http://{}", local_addr));

        let state = AppState {
            store: store.clone(),
            runner: runner.clone(),
            router: router.clone(),
            public_url,
        };
        let (server_shutdown_tx, server_shutdown_rx) = watch::channel(false);
        let server_handle = tokio::spawn(serve(listener, build_app(state), server_shutdown_rx));

        info!(
            addr = %local_addr,
            domain = router.domain(),
            host = runner.host_type(),
            "WorkerboxRuntime started"
        );

        Ok(WorkerboxRuntime {
            store,
            runner,
            router,
            local_addr,
            server_handle,
            runner_handle,
            router_handle,
            server_shutdown_tx,
            runner_shutdown,
            router_shutdown,
        })
    }
}

/// A running control plane.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct WorkerboxRuntime {
    store: Arc<Store>,
    runner: Runner,
    router: Router,
    local_addr: SocketAddr,
    server_handle: JoinHandle<std::io::Result<()>>,
    runner_handle: JoinHandle<()>,
    router_handle: JoinHandle<()>,
    server_shutdown_tx: watch::Sender<bool>,
    runner_shutdown: Arc<Notify>,
    router_shutdown: Arc<Notify>,
}

impl WorkerboxRuntime {
    /// Create a builder for configuring the runtime.
    pub fn builder() -> WorkerboxRuntimeBuilder {
        WorkerboxRuntimeBuilder::new()
    }

    /// Address the HTTP server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The shared Store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The Runner handle.
    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    /// The Router handle.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops accepting requests, stops both subscriber loops, then stops
    /// every live unit. Script status is left as is; the next start
    /// reconciles it.
    pub async fn shutdown(self) -> Result<()> {
        info!("WorkerboxRuntime shutting down...");

        let _ = self.server_shutdown_tx.send(true);
        self.runner_shutdown.notify_one();
        self.router_shutdown.notify_one();

        match self.server_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "HTTP server failed"),
            Err(e) => error!("HTTP server task panicked: {}", e),
        }
        if let Err(e) = self.runner_handle.await {
            error!("Runner task panicked: {}", e);
        }
        if let Err(e) = self.router_handle.await {
            error!("Router task panicked: {}", e);
        }

        self.runner.stop_all().await;

        info!("WorkerboxRuntime shutdown complete");
        Ok(())
    }
}
