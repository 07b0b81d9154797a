// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker host trait definitions.
//!
//! A [`WorkerHost`] starts, stops, reconfigures and forwards requests to
//! execution units. The Runner is written against this trait only.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;
use workerbox_protocol::SecretEntry;

use crate::model::{Script, Secret};

/// Errors from worker host operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HostError {
    /// The unit could not be started or rejected the script.
    #[error("Unit start failed: {0}")]
    StartFailed(String),

    /// The unit did not report ready in time.
    #[error("Unit not ready after {0:?}")]
    ReadyTimeout(Duration),

    /// The unit cannot be reached.
    #[error("Unit unreachable: {0}")]
    Unreachable(String),

    /// A proxied fetch took too long.
    #[error("Fetch timed out after {0:?}")]
    FetchTimeout(Duration),

    /// The unit broke the control protocol or failed a request.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No live unit for this handle.
    #[error("Unit not running: {0}")]
    NotRunning(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Outbound HTTP failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type for host operations.
pub type Result<T> = std::result::Result<T, HostError>;

/// Request forwarded to a unit.
pub type ProxyRequest = http::Request<Body>;

/// Response relayed back from a unit.
pub type ProxyResponse = http::Response<Body>;

/// Options for starting a unit.
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Script to run
    pub script: Script,
    /// Initial environment
    pub env: HashMap<String, String>,
    /// Per-unit database path handed to the unit
    pub db_path: Option<PathBuf>,
}

impl StartOptions {
    /// Options with an environment built from stored secrets.
    pub fn new(script: Script, secrets: &[Secret]) -> Self {
        Self {
            script,
            env: secrets
                .iter()
                .map(|s| (s.name.clone(), s.value.clone()))
                .collect(),
            db_path: None,
        }
    }

    /// Set the per-unit database path.
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    /// Environment as wire entries, sorted by name.
    pub fn env_entries(&self) -> Vec<SecretEntry> {
        let mut entries: Vec<SecretEntry> = self
            .env
            .iter()
            .map(|(k, v)| SecretEntry::new(k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }
}

/// Handle for a live unit.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    /// Unique per start
    pub handle_id: String,
    /// Script the unit serves
    pub script_id: Uuid,
    /// Display key of that script
    pub name_id: String,
    /// Address reported by the readiness handshake
    pub address: String,
    /// When the unit became ready
    pub started_at: DateTime<Utc>,
    /// OS process id, for process-backed units
    pub pid: Option<u32>,
}

/// How a unit ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitExit {
    /// Process exit code, when there is one
    pub code: Option<i32>,
    /// Human readable cause
    pub reason: String,
}

impl UnitExit {
    /// Exit with a reason and no code.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            reason: reason.into(),
        }
    }

    /// The host has no record of the unit.
    pub fn unknown() -> Self {
        Self::new("unit unknown to host")
    }
}

/// Capability for running execution units.
#[async_trait]
pub trait WorkerHost: Send + Sync {
    /// Short strategy name for logs.
    fn host_type(&self) -> &'static str;

    /// Start a unit and wait for its readiness handshake.
    ///
    /// Dropping the returned future before it resolves must not leak the unit.
    async fn start(&self, options: StartOptions) -> Result<WorkerHandle>;

    /// Replace the unit's environment without restarting it.
    async fn update_environment(&self, handle: &WorkerHandle, secrets: &[Secret]) -> Result<()>;

    /// Terminate the unit.
    async fn stop(&self, handle: &WorkerHandle) -> Result<()>;

    /// Forward one request to the unit.
    async fn fetch(&self, handle: &WorkerHandle, request: ProxyRequest) -> Result<ProxyResponse>;

    /// Resolve once the unit has exited, for any reason.
    async fn wait(&self, handle: &WorkerHandle) -> UnitExit;
}

/// Secrets as wire entries.
pub fn secret_entries(secrets: &[Secret]) -> Vec<SecretEntry> {
    secrets
        .iter()
        .map(|s| SecretEntry::new(s.name.clone(), s.value.clone()))
        .collect()
}

/// Script content as UTF-8, which the control protocol requires.
pub(crate) fn script_text(script: &Script) -> Result<String> {
    String::from_utf8(script.content.to_vec()).map_err(|_| {
        HostError::StartFailed(format!(
            "script {} is not valid UTF-8",
            script.name_id()
        ))
    })
}

/// Wait on an exit watch until the unit reports how it ended.
pub(crate) async fn wait_exit(
    mut exit_rx: tokio::sync::watch::Receiver<Option<UnitExit>>,
) -> UnitExit {
    let exit = match exit_rx.wait_for(Option::is_some).await {
        Ok(exit) => exit.clone(),
        Err(_) => None,
    };
    exit.unwrap_or_else(|| UnitExit::new("unit monitor went away"))
}
