// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner: keeps one live unit per running script.
//!
//! The Runner consumes Store events on its own task:
//!
//! - `pending`: start a unit through the [`WorkerHost`] with the script's
//!   secrets as its environment, then report `running` with the unit address
//! - `stopping`: stop the unit, then report `stopped`
//! - secrets changed: push the new environment to every unit of that name
//!
//! It also watches every unit it started. A unit that exits without being
//! asked to, or that becomes unreachable mid-request, is dropped and its
//! script reported `stopped`, so the Router stops routing to it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event_bus::{Event, Subscription};
use crate::host::{
    HostError, ProxyRequest, ProxyResponse, StartOptions, UnitExit, WorkerHandle, WorkerHost,
};
use crate::model::{Script, ScriptStatus};
use crate::store::Store;

/// Configuration for the Runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Directory for per-unit databases
    pub data_dir: PathBuf,
    /// Bound on a unit start, readiness handshake included
    pub ready_timeout: Duration,
    /// Bound on a proxied fetch, up to the response head
    pub fetch_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".data"),
            ready_timeout: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

/// Notices from unit watchers and the fetch bridge back to the loop.
#[derive(Debug)]
enum Notice {
    Exited {
        script_id: Uuid,
        handle_id: String,
        exit: UnitExit,
    },
    Unreachable {
        script_id: Uuid,
        handle_id: String,
    },
}

struct LiveUnit {
    handle: WorkerHandle,
    script: Script,
    watcher: JoinHandle<()>,
}

struct RunnerInner {
    store: Arc<Store>,
    host: Arc<dyn WorkerHost>,
    config: RunnerConfig,
    // Written only by the runner loop.
    units: RwLock<HashMap<Uuid, LiveUnit>>,
    notices: mpsc::UnboundedSender<Notice>,
}

/// Cheap handle to the Runner, used by the Router and the API.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<RunnerInner>,
}

/// The Runner's event loop; spawn [`RunnerLoop::run`] on its own task.
pub struct RunnerLoop {
    runner: Runner,
    events: Subscription,
    notices: mpsc::UnboundedReceiver<Notice>,
    shutdown: Arc<Notify>,
}

impl Runner {
    /// Create the Runner and its loop, subscribing to `store` right away.
    pub fn new(
        store: Arc<Store>,
        host: Arc<dyn WorkerHost>,
        config: RunnerConfig,
    ) -> (Runner, RunnerLoop) {
        let events = store.subscribe();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let runner = Runner {
            inner: Arc::new(RunnerInner {
                store,
                host,
                config,
                units: RwLock::new(HashMap::new()),
                notices: notices_tx,
            }),
        };
        let runner_loop = RunnerLoop {
            runner: runner.clone(),
            events,
            notices: notices_rx,
            shutdown: Arc::new(Notify::new()),
        };
        (runner, runner_loop)
    }

    /// Strategy name of the underlying host.
    pub fn host_type(&self) -> &'static str {
        self.inner.host.host_type()
    }

    /// Handles of every live unit.
    pub async fn live_units(&self) -> Vec<WorkerHandle> {
        self.inner
            .units
            .read()
            .await
            .values()
            .map(|unit| unit.handle.clone())
            .collect()
    }

    /// Handle of the live unit serving `script_id`.
    pub async fn handle_for(&self, script_id: Uuid) -> Option<WorkerHandle> {
        self.inner
            .units
            .read()
            .await
            .get(&script_id)
            .map(|unit| unit.handle.clone())
    }

    /// Forward a request to the unit serving `script_id`.
    pub async fn fetch(&self, script_id: Uuid, request: ProxyRequest) -> Result<ProxyResponse> {
        let handle = self
            .handle_for(script_id)
            .await
            .ok_or_else(|| Error::Upstream(format!("no live unit for script {}", script_id)))?;

        let timeout = self.inner.config.fetch_timeout;
        let result = match tokio::time::timeout(timeout, self.inner.host.fetch(&handle, request)).await
        {
            Ok(result) => result,
            Err(_) => Err(HostError::FetchTimeout(timeout)),
        };

        result.map_err(|e| {
            if matches!(e, HostError::Unreachable(_)) {
                let _ = self.inner.notices.send(Notice::Unreachable {
                    script_id,
                    handle_id: handle.handle_id.clone(),
                });
            }
            warn!(name_id = %handle.name_id, error = %e, "Proxied fetch failed");
            Error::Upstream(e.to_string())
        })
    }

    /// Stop every live unit without touching script status.
    ///
    /// Used at shutdown: the scripts stay `running` in storage and the next
    /// startup reconciliation brings them back.
    pub async fn stop_all(&self) {
        let units: Vec<LiveUnit> = self.inner.units.write().await.drain().map(|(_, u)| u).collect();
        for unit in units {
            unit.watcher.abort();
            if let Err(e) = self.inner.host.stop(&unit.handle).await {
                warn!(name_id = %unit.handle.name_id, error = %e, "Failed to stop unit at shutdown");
            }
        }
    }

    async fn handle_event(&self, event: Event) -> Result<()> {
        match event {
            Event::ScriptStatusChanged { script } => match script.status {
                ScriptStatus::Pending => self.start_unit(script).await,
                ScriptStatus::Stopping => self.stop_unit(script).await,
                ScriptStatus::Running | ScriptStatus::Stopped => Ok(()),
            },
            Event::ScriptSecretsChanged { script_name } => self.push_secrets(&script_name).await,
        }
    }

    async fn start_unit(&self, script: Script) -> Result<()> {
        let inner = &self.inner;
        if inner.units.read().await.contains_key(&script.id) {
            return Err(Error::ProtocolViolation(format!(
                "script {} already has a live unit",
                script.name_id()
            )));
        }

        let secrets = inner.store.get_secrets(&script.name).await?;
        let db_path = inner
            .config
            .data_dir
            .join(format!("worker-{}.db", script.name));
        let options = StartOptions::new(script.clone(), &secrets).with_db_path(db_path);

        debug!(name_id = %script.name_id(), host = inner.host.host_type(), "Starting unit");

        let started = match tokio::time::timeout(inner.config.ready_timeout, inner.host.start(options)).await
        {
            Ok(started) => started,
            Err(_) => Err(HostError::ReadyTimeout(inner.config.ready_timeout)),
        };

        let handle = match started {
            Ok(handle) => handle,
            Err(e) => {
                error!(name_id = %script.name_id(), error = %e, "Unit failed to start");
                inner
                    .store
                    .update_script_status(&script, ScriptStatus::Stopped, None)
                    .await?;
                return Err(e.into());
            }
        };

        let watcher = {
            let host = inner.host.clone();
            let notices = inner.notices.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                let exit = host.wait(&handle).await;
                let _ = notices.send(Notice::Exited {
                    script_id: handle.script_id,
                    handle_id: handle.handle_id,
                    exit,
                });
            })
        };

        let address = handle.address.clone();
        inner.units.write().await.insert(
            script.id,
            LiveUnit {
                handle: handle.clone(),
                script: script.clone(),
                watcher,
            },
        );

        if let Err(e) = inner
            .store
            .update_script_status(&script, ScriptStatus::Running, Some(address))
            .await
        {
            if let Some(unit) = inner.units.write().await.remove(&script.id) {
                unit.watcher.abort();
            }
            let _ = inner.host.stop(&handle).await;
            return Err(e);
        }

        info!(
            name_id = %script.name_id(),
            address = %handle.address,
            "Unit running"
        );
        Ok(())
    }

    async fn stop_unit(&self, script: Script) -> Result<()> {
        let inner = &self.inner;
        let Some(unit) = inner.units.write().await.remove(&script.id) else {
            // A crash can beat the stop request; the script is already stopped then.
            let current = inner.store.get_script_by_id(script.id).await;
            if current.is_some_and(|s| s.status == ScriptStatus::Stopped) {
                debug!(name_id = %script.name_id(), "Unit already gone");
                return Ok(());
            }
            return Err(Error::ProtocolViolation(format!(
                "handle not found for script {}",
                script.name_id()
            )));
        };

        unit.watcher.abort();
        if let Err(e) = inner.host.stop(&unit.handle).await {
            warn!(name_id = %script.name_id(), error = %e, "Unit stop failed");
        }

        inner
            .store
            .update_script_status(&script, ScriptStatus::Stopped, None)
            .await?;
        info!(name_id = %script.name_id(), "Unit stopped");
        Ok(())
    }

    async fn push_secrets(&self, script_name: &str) -> Result<()> {
        let inner = &self.inner;
        let handles: Vec<WorkerHandle> = inner
            .units
            .read()
            .await
            .values()
            .filter(|unit| unit.script.name == script_name)
            .map(|unit| unit.handle.clone())
            .collect();
        if handles.is_empty() {
            return Ok(());
        }

        let secrets = inner.store.get_secrets(script_name).await?;
        for handle in handles {
            match inner.host.update_environment(&handle, &secrets).await {
                Ok(()) => debug!(name_id = %handle.name_id, count = secrets.len(), "Environment pushed"),
                Err(e) => warn!(name_id = %handle.name_id, error = %e, "Environment push failed"),
            }
        }
        Ok(())
    }

    async fn handle_notice(&self, notice: Notice) -> Result<()> {
        let (script_id, handle_id, reason) = match notice {
            Notice::Exited {
                script_id,
                handle_id,
                exit,
            } => (script_id, handle_id, exit.reason),
            Notice::Unreachable {
                script_id,
                handle_id,
            } => (script_id, handle_id, "unreachable".to_string()),
        };

        let unit = {
            let mut units = self.inner.units.write().await;
            match units.get(&script_id) {
                Some(unit) if unit.handle.handle_id == handle_id => units.remove(&script_id),
                // Stale notice for a unit that was already stopped.
                _ => None,
            }
        };
        let Some(unit) = unit else {
            return Ok(());
        };

        warn!(
            name_id = %unit.handle.name_id,
            reason = %reason,
            "Unit lost outside of a stop request"
        );
        unit.watcher.abort();
        // The host keeps its own entry for the unit until stop releases it.
        if let Err(e) = self.inner.host.stop(&unit.handle).await {
            debug!(name_id = %unit.handle.name_id, error = %e, "Cleanup of lost unit failed");
        }

        let Some(current) = self.inner.store.get_script_by_id(script_id).await else {
            return Ok(());
        };
        if matches!(current.status, ScriptStatus::Running | ScriptStatus::Stopping) {
            self.inner
                .store
                .update_script_status(&current, ScriptStatus::Stopped, None)
                .await?;
        }
        Ok(())
    }
}

impl RunnerLoop {
    /// Handle used to stop the loop.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Process events until shutdown is signalled or the bus goes away.
    ///
    /// A failed event is logged and the loop moves on.
    pub async fn run(mut self) {
        info!(host = self.runner.host_type(), "Runner started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Runner shutting down");
                    break;
                }

                Some(notice) = self.notices.recv() => {
                    if let Err(e) = self.runner.handle_notice(notice).await {
                        error!(error = %e, "Runner failed to handle unit exit");
                    }
                }

                event = self.events.recv() => {
                    let Some(event) = event else {
                        info!("Event bus closed, runner exiting");
                        break;
                    };
                    let kind = event.kind();
                    if let Err(e) = self.runner.handle_event(event).await {
                        error!(event = kind, error = %e, "Runner failed to handle event");
                    }
                }
            }
        }
    }
}
