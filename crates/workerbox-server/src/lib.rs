// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workerbox Server - multi-tenant script hosting control plane
//!
//! Clients upload scripts over a REST API. Each script runs as an isolated
//! execution unit, and requests to `{name}.{domain}` or `{nameId}.{domain}`
//! are proxied to the unit serving that script.
//!
//! # Architecture
//!
//! ```text
//!        REST API                       *.workers.local
//!           │                                 │
//!           ▼                                 ▼
//!   ┌───────────────┐   events   ┌───────────────────────┐
//!   │     Store     │ ─────────▶ │        Router         │
//!   │ (SQLite+cache)│            │ host -> script table  │
//!   └───────────────┘            └───────────────────────┘
//!      ▲       │ events                      │ fetch
//!      │       ▼                             ▼
//!      │  ┌─────────────────────────────────────────────┐
//!      └──│                   Runner                    │
//!  status │     script id -> live unit handle           │
//!         └─────────────────────────────────────────────┘
//!                            │ WorkerHost
//!                ┌───────────┴────────────┐
//!                ▼                        ▼
//!          ProcessHost              EmbeddedHost
//!      (child + loopback HTTP)    (in-process tasks)
//! ```
//!
//! # Script lifecycle
//!
//! | From | To | Who |
//! |------|----|-----|
//! | - | `pending` | Store, on upload |
//! | `pending` | `running` | Runner, after the readiness handshake |
//! | `pending` | `stopped` | Runner, when the unit fails to start |
//! | `running` | `stopping` | Store, on delete |
//! | `stopping` | `stopped` | Runner, once the unit is gone |
//! | `running` | `stopped` | Runner, when the unit dies on its own |
//!
//! On start, [`Store::startup`](store::Store::startup) returns `pending` and
//! `running` scripts to `pending` and finishes `stopping` ones as `stopped`.
//!
//! # Modules
//!
//! - [`api`]: REST handlers and the response envelope
//! - [`config`]: Environment-based configuration
//! - [`event_bus`]: In-process fan-out of Store events
//! - [`host`]: WorkerHost trait and its strategies
//! - [`model`]: Scripts, secrets and lifecycle states
//! - [`persistence`]: Storage contract and the SQLite backend
//! - [`router`]: Host-based routing and proxying
//! - [`runner`]: Live unit management and crash detection
//! - [`runtime`]: Embeddable runtime with graceful shutdown
//! - [`server`]: axum application and host dispatch
//! - [`store`]: Canonical script and secret state

#![deny(missing_docs)]

/// REST handlers and the response envelope.
pub mod api;

/// Environment-based configuration.
pub mod config;

/// Error types.
pub mod error;

/// In-process fan-out of Store events.
pub mod event_bus;

/// WorkerHost trait and its strategies.
pub mod host;

/// Scripts, secrets and lifecycle states.
pub mod model;

/// Storage contract and the SQLite backend.
pub mod persistence;

/// Host-based routing and proxying.
pub mod router;

/// Live unit management and crash detection.
pub mod runner;

/// Embeddable runtime.
pub mod runtime;

/// axum application and host dispatch.
pub mod server;

/// Canonical script and secret state.
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use event_bus::{Event, EventBus};
pub use model::{KeyValue, Script, ScriptStatus, Secret};
pub use router::Router;
pub use runner::{Runner, RunnerConfig};
pub use runtime::WorkerboxRuntime;
pub use store::Store;
