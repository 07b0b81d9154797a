// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workerbox Protocol - host/unit control channel
//!
//! This crate defines the messages exchanged between the workerbox host and an
//! execution unit, and the framing used to carry them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐   runScript / updateSecrets   ┌──────────────────────┐
//! │   workerbox-server   │ ────────────────────────────▶ │   execution unit     │
//! │   (WorkerHost)       │                               │   (workerbox-worker) │
//! │                      │ ◀──────────────────────────── │                      │
//! └──────────────────────┘          ready / error        └──────────────────────┘
//! ```
//!
//! Messages are JSON objects tagged by an `action` field. On a byte stream
//! (the unit's stdin/stdout) each message occupies exactly one line.
//!
//! # Usage
//!
//! ```ignore
//! use workerbox_protocol::{HostMessage, ScriptPayload, frame::FramedWriter};
//!
//! let mut writer = FramedWriter::new(child_stdin);
//! writer
//!     .send(&HostMessage::RunScript {
//!         script: ScriptPayload::new("demo", id, content),
//!     })
//!     .await?;
//! ```

pub mod frame;
mod messages;

pub use frame::{FrameError, FramedReader, FramedWriter};
pub use messages::*;
