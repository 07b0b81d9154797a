// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workerbox Server
//!
//! Serves the REST API and proxies `*.{domain}` requests to script units.

use std::sync::Arc;

use tracing::{info, warn};
use workerbox_server::config::{Config, HostKind};
use workerbox_server::host::{EmbeddedHost, ProcessHost, ProcessHostConfig, WorkerHost};
use workerbox_server::persistence::SqlitePersistence;
use workerbox_server::runtime::WorkerboxRuntime;
use workerbox_worker::StaticEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "workerbox_server=info".into()),
        )
        .init();

    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        addr = %config.addr,
        domain = %config.domain,
        db = %config.db_path.display(),
        data_dir = %config.data_dir.display(),
        "Starting Workerbox"
    );

    let persistence = Arc::new(SqlitePersistence::from_path(&config.db_path).await?);
    info!("Database ready");

    let host: Arc<dyn WorkerHost> = match config.host {
        HostKind::Process => Arc::new(ProcessHost::new(ProcessHostConfig::new(
            config.worker_command.clone(),
            &config.data_dir,
        ))?),
        HostKind::Embedded => Arc::new(
            EmbeddedHost::new(Arc::new(StaticEngine)).with_persistence(persistence.clone()),
        ),
    };
    info!(host_type = host.host_type(), "Worker host initialized");

    let runtime = WorkerboxRuntime::builder()
        .persistence(persistence)
        .host(host)
        .bind_addr(config.addr)
        .public_url(&config.public_url)
        .domain(&config.domain)
        .data_dir(&config.data_dir)
        .ready_timeout(config.ready_timeout)
        .fetch_timeout(config.fetch_timeout)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.local_addr(), "Workerbox ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Workerbox shut down");
    Ok(())
}
