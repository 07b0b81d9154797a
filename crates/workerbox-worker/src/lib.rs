// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workerbox Worker - execution unit runtime
//!
//! An execution unit hosts exactly one script. It registers one inbound
//! request handler, receives each request as a [`FetchEvent`] and answers it
//! through a single-use [`Responder`].
//!
//! # Lifecycle
//!
//! ```text
//!   host                                   unit
//!    │  {"action":"updateSecrets",...}      │  environment replaced
//!    │ ───────────────────────────────────▶ │
//!    │  {"action":"runScript",...}          │  script loaded by the ScriptEngine,
//!    │ ───────────────────────────────────▶ │  listener bound on 127.0.0.1:0
//!    │  {"action":"ready","address":...}    │
//!    │ ◀─────────────────────────────────── │
//!    │           HTTP requests              │
//!    │ ═══════════════════════════════════▶ │  FetchHandler::handle(FetchEvent)
//!    │  stdin closed                        │  listener shut down, exit
//! ```
//!
//! The same [`FetchEvent`]/[`Responder`] contract is used by hosts that run
//! units inside their own process and skip the network hop.
//!
//! # Modules
//!
//! - [`engine`]: Script loading and the request handler seam
//! - [`env`]: Per-unit environment built from secrets
//! - [`error`]: Error types for the runtime
//! - [`event`]: Fetch events and the single-use responder
//! - [`storage`]: Per-unit key-value storage
//! - [`unit`]: HTTP listener and the stdio control loop

#![deny(missing_docs)]

/// Script loading and the request handler seam.
pub mod engine;

/// Per-unit environment built from secrets.
pub mod env;

/// Error types for the runtime.
pub mod error;

/// Fetch events and the single-use responder.
pub mod event;

/// Per-unit key-value storage.
pub mod storage;

/// HTTP listener and the stdio control loop.
pub mod unit;

pub use engine::{FetchHandler, ScriptEngine, StaticEngine};
pub use env::WorkerEnv;
pub use error::{Result, WorkerError};
pub use event::{FetchEvent, FetchRequest, FetchResponse, Responder};
pub use storage::{SqliteStorage, StorageArea};
pub use unit::{ListeningUnit, dispatch_event, run_control_loop, serve_stdio};
