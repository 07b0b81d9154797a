// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Unit listener and control loop.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use workerbox_protocol::{FrameError, FramedReader, FramedWriter, HostMessage, WorkerMessage};

use crate::engine::{FetchHandler, ScriptEngine};
use crate::env::WorkerEnv;
use crate::error::{Result, WorkerError};
use crate::event::{FetchEvent, FetchRequest, FetchResponse, Responder};
use crate::storage::{SqliteStorage, StorageArea};

/// Largest request body a unit buffers (16 MB).
pub const MAX_REQUEST_BODY: usize = 16 * 1024 * 1024;

/// Run one request through a handler and wait for its response.
///
/// The handler runs on its own task, so a panicking handler surfaces here as
/// [`WorkerError::HandlerPanicked`] instead of taking the caller down.
pub async fn dispatch_event(
    handler: Arc<dyn FetchHandler>,
    env: &WorkerEnv,
    storage: Option<Arc<dyn StorageArea>>,
    request: FetchRequest,
) -> Result<FetchResponse> {
    let (responder, rx) = Responder::channel();
    let event = FetchEvent::new(request, responder, env.snapshot()).with_storage(storage);

    let task = tokio::spawn(async move { handler.handle(event).await });

    match rx.await {
        Ok(response) => Ok(response),
        Err(_) => match task.await {
            Err(e) if e.is_panic() => Err(WorkerError::HandlerPanicked),
            _ => Err(WorkerError::Script(
                "handler finished without responding".to_string(),
            )),
        },
    }
}

#[derive(Clone)]
struct UnitState {
    handler: Arc<dyn FetchHandler>,
    env: WorkerEnv,
    storage: Option<Arc<dyn StorageArea>>,
}

/// A handler bound to its own loopback listener.
pub struct ListeningUnit {
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ListeningUnit {
    /// Bind `127.0.0.1:0` and start serving `handler`.
    pub async fn bind(
        handler: Arc<dyn FetchHandler>,
        env: WorkerEnv,
        storage: Option<Arc<dyn StorageArea>>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let local_addr = listener.local_addr()?;

        let app = axum::Router::new()
            .fallback(handle_request)
            .with_state(UnitState {
                handler,
                env,
                storage,
            });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, "Unit listener failed");
            }
        });

        info!(addr = %local_addr, "Unit listening");

        Ok(Self {
            local_addr,
            shutdown_tx,
            task,
        })
    }

    /// Base URL announced in the readiness handshake.
    pub fn address(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Bound socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting requests and wait for the listener to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            error!("Unit listener task panicked: {}", e);
        }
    }
}

async fn handle_request(State(state): State<UnitState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_REQUEST_BODY).await {
        Ok(body) => body,
        Err(e) => return (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()).into_response(),
    };

    let request = http::Request::from_parts(parts, body);
    match dispatch_event(state.handler, &state.env, state.storage, request).await {
        Ok(response) => response.map(axum::body::Body::from),
        Err(e) => {
            warn!(error = %e, "Request failed inside unit");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Drive a unit from a host control channel.
///
/// Applies `updateSecrets` whenever it arrives, answers the first `runScript`
/// with `ready` once the listener is bound, and returns when the host closes
/// the channel. A `dbPath` in `runScript` is opened as the unit's storage.
pub async fn run_control_loop<R, W>(
    reader: R,
    writer: W,
    engine: Arc<dyn ScriptEngine>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FramedReader::new(reader);
    let mut writer = FramedWriter::new(writer);
    let env = WorkerEnv::default();
    let mut unit: Option<ListeningUnit> = None;

    let outcome = loop {
        let msg: HostMessage = match reader.recv().await {
            Ok(msg) => msg,
            Err(FrameError::ConnectionClosed) => {
                info!("Control channel closed");
                break Ok(());
            }
            Err(FrameError::Json(e)) => {
                warn!(error = %e, "Ignoring malformed control message");
                continue;
            }
            Err(e) => break Err(e.into()),
        };

        match msg {
            HostMessage::UpdateSecrets { secrets } => {
                env.replace(&secrets);
                debug!(count = secrets.len(), "Environment updated");
            }
            HostMessage::RunScript { script } => {
                if unit.is_some() {
                    error!(script = %script.name, "runScript received twice, ignoring");
                    continue;
                }

                info!(
                    script = %script.name,
                    engine = engine.engine_type(),
                    "Loading script"
                );

                let handler = match engine.load(&script) {
                    Ok(handler) => handler,
                    Err(e) => {
                        let _ = writer
                            .send(&WorkerMessage::Error {
                                message: e.to_string(),
                            })
                            .await;
                        break Err(e);
                    }
                };

                let storage = match &script.db_path {
                    Some(path) => match SqliteStorage::open(path).await {
                        Ok(storage) => Some(Arc::new(storage) as Arc<dyn StorageArea>),
                        Err(e) => {
                            let _ = writer
                                .send(&WorkerMessage::Error {
                                    message: e.to_string(),
                                })
                                .await;
                            break Err(e);
                        }
                    },
                    None => None,
                };

                let listening = match ListeningUnit::bind(handler, env.clone(), storage).await {
                    Ok(listening) => listening,
                    Err(e) => break Err(e),
                };
                let address = listening.address();
                unit = Some(listening);

                if let Err(e) = writer.send(&WorkerMessage::Ready { address }).await {
                    break Err(e.into());
                }
            }
        }
    };

    if let Some(unit) = unit {
        unit.shutdown().await;
    }

    outcome
}

/// Run the control loop over this process's stdin/stdout.
pub async fn serve_stdio(engine: Arc<dyn ScriptEngine>) -> Result<()> {
    run_control_loop(tokio::io::stdin(), tokio::io::stdout(), engine).await
}
