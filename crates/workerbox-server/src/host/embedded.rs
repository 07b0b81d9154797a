// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process worker host.
//!
//! Each unit is a tokio task holding the [`FetchHandler`] its
//! [`ScriptEngine`] produced. Requests reach it over a channel and are
//! answered through the same single-use responder contract the stdio units
//! use, without a network hop. A panicking handler takes its unit down.
//!
//! Unit storage lives in the server database when the host was given one,
//! otherwise in the unit's `dbPath` file.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use chrono::Utc;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use workerbox_protocol::ScriptPayload;
use workerbox_worker::unit::MAX_REQUEST_BODY;
use workerbox_worker::{
    FetchHandler, FetchRequest, FetchResponse, ScriptEngine, SqliteStorage, StorageArea,
    WorkerEnv, WorkerError, dispatch_event,
};

use super::storage::PersistenceStorage;
use super::traits::*;
use crate::model::Secret;
use crate::persistence::Persistence;

/// Requests a unit may have queued before senders wait.
const UNIT_QUEUE: usize = 256;

struct UnitRequest {
    request: FetchRequest,
    reply: oneshot::Sender<std::result::Result<FetchResponse, WorkerError>>,
}

struct EmbeddedUnit {
    requests: mpsc::Sender<UnitRequest>,
    env: WorkerEnv,
    exit_rx: watch::Receiver<Option<UnitExit>>,
    stop_tx: oneshot::Sender<()>,
}

/// Runs units as tasks inside the server process.
pub struct EmbeddedHost {
    engine: Arc<dyn ScriptEngine>,
    persistence: Option<Arc<dyn Persistence>>,
    units: Mutex<HashMap<String, EmbeddedUnit>>,
}

impl EmbeddedHost {
    /// Create a host that loads scripts with `engine`.
    pub fn new(engine: Arc<dyn ScriptEngine>) -> Self {
        Self {
            engine,
            persistence: None,
            units: Mutex::new(HashMap::new()),
        }
    }

    /// Keep unit storage in `persistence`, one namespace per script name.
    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    async fn open_storage(&self, options: &StartOptions) -> Result<Option<Arc<dyn StorageArea>>> {
        if let Some(persistence) = &self.persistence {
            let storage: Arc<dyn StorageArea> = Arc::new(PersistenceStorage::new(
                persistence.clone(),
                &options.script.name,
            ));
            return Ok(Some(storage));
        }
        match &options.db_path {
            Some(path) => {
                let storage: Arc<dyn StorageArea> = Arc::new(
                    SqliteStorage::open(path)
                        .await
                        .map_err(|e| HostError::StartFailed(format!("unit storage: {}", e)))?,
                );
                Ok(Some(storage))
            }
            None => Ok(None),
        }
    }

    /// Number of live units.
    pub async fn unit_count(&self) -> usize {
        self.units.lock().await.len()
    }
}

async fn run_unit(
    name_id: String,
    handler: Arc<dyn FetchHandler>,
    env: WorkerEnv,
    storage: Option<Arc<dyn StorageArea>>,
    mut requests: mpsc::Receiver<UnitRequest>,
    mut stop_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<UnitExit>>,
) {
    let (crash_tx, mut crash_rx) = mpsc::channel::<String>(1);

    let exit = loop {
        tokio::select! {
            _ = &mut stop_rx => break UnitExit::new("stopped"),
            Some(reason) = crash_rx.recv() => break UnitExit::new(reason),
            next = requests.recv() => {
                let Some(UnitRequest { request, reply }) = next else {
                    break UnitExit::new("host dropped the unit");
                };
                let handler = handler.clone();
                let env = env.clone();
                let storage = storage.clone();
                let crash_tx = crash_tx.clone();
                tokio::spawn(async move {
                    let result = dispatch_event(handler, &env, storage, request).await;
                    if matches!(result, Err(WorkerError::HandlerPanicked)) {
                        let _ = crash_tx.try_send("handler panicked".to_string());
                    }
                    let _ = reply.send(result);
                });
            }
        }
    };

    if exit.reason == "stopped" {
        debug!(name_id = %name_id, "Embedded unit stopped");
    } else {
        error!(name_id = %name_id, reason = %exit.reason, "Embedded unit died");
    }
    exit_tx.send_replace(Some(exit));
}

#[async_trait]
impl WorkerHost for EmbeddedHost {
    fn host_type(&self) -> &'static str {
        "embedded"
    }

    async fn start(&self, options: StartOptions) -> Result<WorkerHandle> {
        let script = &options.script;
        let name_id = script.name_id();

        let content = script_text(script)?;
        let mut payload = ScriptPayload::new(&script.name, script.id.to_string(), content);
        if let Some(db_path) = &options.db_path {
            payload = payload.with_db_path(db_path.to_string_lossy());
        }
        let handler = self
            .engine
            .load(&payload)
            .map_err(|e| HostError::StartFailed(e.to_string()))?;
        let storage = self.open_storage(&options).await?;

        let env = WorkerEnv::from_secrets(&options.env_entries());
        let handle_id = format!("embedded-{}", Uuid::new_v4().simple());
        let (requests_tx, requests_rx) = mpsc::channel(UNIT_QUEUE);
        let (stop_tx, stop_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        self.units.lock().await.insert(
            handle_id.clone(),
            EmbeddedUnit {
                requests: requests_tx,
                env: env.clone(),
                exit_rx,
                stop_tx,
            },
        );
        tokio::spawn(run_unit(
            name_id.clone(),
            handler,
            env,
            storage,
            requests_rx,
            stop_rx,
            exit_tx,
        ));

        let handle = WorkerHandle {
            address: format!("embedded://{}", handle_id),
            handle_id,
            script_id: script.id,
            name_id,
            started_at: Utc::now(),
            pid: None,
        };
        info!(
            name_id = %handle.name_id,
            engine = self.engine.engine_type(),
            "Embedded unit ready"
        );
        Ok(handle)
    }

    async fn update_environment(&self, handle: &WorkerHandle, secrets: &[Secret]) -> Result<()> {
        let units = self.units.lock().await;
        let unit = units
            .get(&handle.handle_id)
            .ok_or_else(|| HostError::NotRunning(handle.name_id.clone()))?;
        unit.env.replace(&secret_entries(secrets));
        Ok(())
    }

    async fn stop(&self, handle: &WorkerHandle) -> Result<()> {
        let unit = self
            .units
            .lock()
            .await
            .remove(&handle.handle_id)
            .ok_or_else(|| HostError::NotRunning(handle.name_id.clone()))?;
        let _ = unit.stop_tx.send(());
        wait_exit(unit.exit_rx).await;
        Ok(())
    }

    async fn fetch(&self, handle: &WorkerHandle, request: ProxyRequest) -> Result<ProxyResponse> {
        let requests = self
            .units
            .lock()
            .await
            .get(&handle.handle_id)
            .map(|unit| unit.requests.clone())
            .ok_or_else(|| HostError::Unreachable(handle.name_id.clone()))?;

        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, MAX_REQUEST_BODY)
            .await
            .map_err(|e| HostError::Protocol(format!("request body: {}", e)))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        requests
            .send(UnitRequest {
                request: http::Request::from_parts(parts, body),
                reply: reply_tx,
            })
            .await
            .map_err(|_| HostError::Unreachable(handle.name_id.clone()))?;

        match reply_rx.await {
            Ok(Ok(response)) => Ok(response.map(Body::from)),
            Ok(Err(WorkerError::HandlerPanicked)) | Err(_) => {
                Err(HostError::Unreachable(handle.name_id.clone()))
            }
            Ok(Err(e)) => {
                warn!(name_id = %handle.name_id, error = %e, "Embedded unit failed a request");
                Err(HostError::Protocol(e.to_string()))
            }
        }
    }

    async fn wait(&self, handle: &WorkerHandle) -> UnitExit {
        let exit_rx = self
            .units
            .lock()
            .await
            .get(&handle.handle_id)
            .map(|unit| unit.exit_rx.clone());
        match exit_rx {
            Some(exit_rx) => wait_exit(exit_rx).await,
            None => UnitExit::unknown(),
        }
    }
}
