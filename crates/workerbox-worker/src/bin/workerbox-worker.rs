// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workerbox execution unit.
//!
//! Spawned by the process host, one per running script. Stdout carries the
//! control protocol, so logs go to stderr.

use std::sync::Arc;

use tracing::info;
use workerbox_worker::{StaticEngine, serve_stdio};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "workerbox_worker=info".into()),
        )
        .init();

    info!(pid = std::process::id(), "Execution unit starting");

    serve_stdio(Arc::new(StaticEngine)).await?;

    info!("Execution unit exiting");
    Ok(())
}
