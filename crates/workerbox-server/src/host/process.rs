// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-backed worker host.
//!
//! Every unit is a child process speaking the line-delimited control
//! protocol on stdin/stdout:
//!
//! 1. The script is written to `{data_dir}/scripts/{name_id}.js`.
//! 2. The worker command is spawned with piped stdin/stdout.
//! 3. `updateSecrets` then `runScript` are sent.
//! 4. The host waits for `ready` and records the announced address.
//! 5. Requests are forwarded over loopback HTTP.
//! 6. Stop closes stdin, then kills the child after a grace period.
//!
//! The script file lives exactly as long as the host's entry for the unit.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use chrono::Utc;
use tokio::process::{ChildStdin, Command};
use tokio::sync::{Mutex, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;
use workerbox_protocol::{
    FrameError, FramedReader, FramedWriter, HostMessage, ScriptPayload, WorkerMessage,
};

use super::traits::*;
use crate::model::Secret;

/// Configuration for [`ProcessHost`].
#[derive(Debug, Clone)]
pub struct ProcessHostConfig {
    /// Program and arguments spawned per unit
    pub command: Vec<String>,
    /// Where script files are written
    pub data_dir: PathBuf,
    /// How long a unit may take to exit after its stdin closes
    pub stop_grace: Duration,
}

impl ProcessHostConfig {
    /// Config with the default 5 second stop grace.
    pub fn new(command: Vec<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            command,
            data_dir: data_dir.into(),
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// Script file written for one unit; removed on drop.
struct ScriptFile {
    path: PathBuf,
}

impl Drop for ScriptFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove script file");
            }
        }
    }
}

struct ProcessUnit {
    control: Arc<Mutex<FramedWriter<ChildStdin>>>,
    exit_rx: watch::Receiver<Option<UnitExit>>,
    kill_tx: oneshot::Sender<()>,
    _script_file: ScriptFile,
}

/// Runs each unit as a child process.
pub struct ProcessHost {
    config: ProcessHostConfig,
    client: reqwest::Client,
    units: Mutex<HashMap<String, ProcessUnit>>,
}

impl ProcessHost {
    /// Create a process host.
    ///
    /// The forwarding client never follows redirects; they are relayed.
    pub fn new(config: ProcessHostConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            config,
            client,
            units: Mutex::new(HashMap::new()),
        })
    }

    /// Number of live child processes.
    pub async fn unit_count(&self) -> usize {
        self.units.lock().await.len()
    }

    async fn write_script_file(&self, name_id: &str, content: &str) -> Result<ScriptFile> {
        let scripts_dir = self.config.data_dir.join("scripts");
        tokio::fs::create_dir_all(&scripts_dir).await?;
        let path = scripts_dir.join(format!("{}.js", name_id));
        tokio::fs::write(&path, content).await?;
        Ok(ScriptFile { path })
    }
}

fn exit_from_status(status: io::Result<ExitStatus>) -> UnitExit {
    match status {
        Ok(status) => UnitExit {
            code: status.code(),
            reason: status.to_string(),
        },
        Err(e) => UnitExit::new(format!("wait failed: {}", e)),
    }
}

fn control_error(e: FrameError) -> HostError {
    match e {
        FrameError::Io(e) => HostError::Io(e),
        other => HostError::Protocol(other.to_string()),
    }
}

#[async_trait]
impl WorkerHost for ProcessHost {
    fn host_type(&self) -> &'static str {
        "process"
    }

    async fn start(&self, options: StartOptions) -> Result<WorkerHandle> {
        let script = &options.script;
        let name_id = script.name_id();
        let content = script_text(script)?;
        let script_file = self.write_script_file(&name_id, &content).await?;

        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| HostError::StartFailed("empty worker command".to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .env("WORKERBOX_SCRIPT_PATH", &script_file.path)
            .env("WORKERBOX_SCRIPT_ID", script.id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HostError::StartFailed(format!("failed to spawn {}: {}", program, e)))?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HostError::StartFailed("child stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HostError::StartFailed("child stdout not captured".to_string()))?;
        let mut writer = FramedWriter::new(stdin);
        let mut reader = FramedReader::new(stdout);

        debug!(name_id = %name_id, pid = ?pid, "Unit process spawned");

        let mut payload = ScriptPayload::new(&script.name, script.id.to_string(), content);
        if let Some(db_path) = &options.db_path {
            payload = payload.with_db_path(db_path.to_string_lossy());
        }

        writer
            .send(&HostMessage::UpdateSecrets {
                secrets: options.env_entries(),
            })
            .await
            .map_err(control_error)?;
        writer
            .send(&HostMessage::RunScript { script: payload })
            .await
            .map_err(control_error)?;

        let address = loop {
            match reader.recv::<WorkerMessage>().await {
                Ok(WorkerMessage::Ready { address }) => break address,
                Ok(WorkerMessage::Error { message }) => {
                    return Err(HostError::StartFailed(message));
                }
                Err(FrameError::ConnectionClosed) => {
                    return Err(HostError::StartFailed(
                        "unit exited before reporting ready".to_string(),
                    ));
                }
                Err(FrameError::Json(e)) => {
                    warn!(name_id = %name_id, error = %e, "Ignoring non-protocol unit output");
                }
                Err(e) => return Err(control_error(e)),
            }
        };

        let handle = WorkerHandle {
            handle_id: format!("proc-{}", Uuid::new_v4().simple()),
            script_id: script.id,
            name_id: name_id.clone(),
            address,
            started_at: Utc::now(),
            pid,
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        self.units.lock().await.insert(
            handle.handle_id.clone(),
            ProcessUnit {
                control: Arc::new(Mutex::new(writer)),
                exit_rx,
                kill_tx,
                _script_file: script_file,
            },
        );

        // Owns the child from here on; reports exactly one exit.
        tokio::spawn(async move {
            let mut stdout_open = true;
            let exit = loop {
                tokio::select! {
                    status = child.wait() => break exit_from_status(status),
                    _ = &mut kill_rx => {
                        if let Err(e) = child.start_kill() {
                            warn!(name_id = %name_id, error = %e, "Failed to kill unit");
                        }
                        let mut exit = exit_from_status(child.wait().await);
                        exit.reason = format!("killed ({})", exit.reason);
                        break exit;
                    }
                    msg = reader.recv::<WorkerMessage>(), if stdout_open => match msg {
                        Ok(WorkerMessage::Error { message }) => {
                            warn!(name_id = %name_id, message = %message, "Unit reported an error");
                        }
                        Ok(other) => debug!(name_id = %name_id, message = ?other, "Unexpected unit message"),
                        Err(FrameError::Json(e)) => {
                            debug!(name_id = %name_id, error = %e, "Ignoring non-protocol unit output");
                        }
                        Err(_) => stdout_open = false,
                    },
                }
            };

            info!(name_id = %name_id, code = ?exit.code, reason = %exit.reason, "Unit process exited");
            exit_tx.send_replace(Some(exit));
        });

        info!(
            name_id = %handle.name_id,
            pid = ?handle.pid,
            address = %handle.address,
            "Unit ready"
        );
        Ok(handle)
    }

    async fn update_environment(&self, handle: &WorkerHandle, secrets: &[Secret]) -> Result<()> {
        let control = self
            .units
            .lock()
            .await
            .get(&handle.handle_id)
            .map(|unit| unit.control.clone())
            .ok_or_else(|| HostError::NotRunning(handle.name_id.clone()))?;

        control
            .lock()
            .await
            .send(&HostMessage::UpdateSecrets {
                secrets: secret_entries(secrets),
            })
            .await
            .map_err(|e| HostError::Unreachable(e.to_string()))
    }

    async fn stop(&self, handle: &WorkerHandle) -> Result<()> {
        let unit = self
            .units
            .lock()
            .await
            .remove(&handle.handle_id)
            .ok_or_else(|| HostError::NotRunning(handle.name_id.clone()))?;
        let ProcessUnit {
            control,
            exit_rx,
            kill_tx,
            _script_file,
        } = unit;

        // Closing stdin asks the unit to shut down on its own.
        drop(control);

        match tokio::time::timeout(self.config.stop_grace, wait_exit(exit_rx.clone())).await {
            Ok(exit) => {
                debug!(name_id = %handle.name_id, reason = %exit.reason, "Unit stopped");
            }
            Err(_) => {
                warn!(
                    name_id = %handle.name_id,
                    grace = ?self.config.stop_grace,
                    "Unit ignored stdin close, killing"
                );
                let _ = kill_tx.send(());
                wait_exit(exit_rx).await;
            }
        }

        Ok(())
    }

    async fn fetch(&self, handle: &WorkerHandle, request: ProxyRequest) -> Result<ProxyResponse> {
        let path = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", handle.address.trim_end_matches('/'), path);

        let (parts, body) = request.into_parts();
        let response = self
            .client
            .request(parts.method, url)
            .headers(parts.headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    HostError::Unreachable(format!("{}: {}", handle.name_id, e))
                } else {
                    HostError::Http(e)
                }
            })?;

        let status = response.status();
        let headers = response.headers().clone();
        let mut relayed = http::Response::new(Body::from_stream(response.bytes_stream()));
        *relayed.status_mut() = status;
        *relayed.headers_mut() = headers;
        Ok(relayed)
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
