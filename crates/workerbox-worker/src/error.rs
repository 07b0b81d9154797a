// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for workerbox-worker.

use thiserror::Error;

/// Execution unit errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// A responder was invoked a second time for the same request.
    #[error("Already responded to this fetch event")]
    AlreadyResponded,

    /// The requester went away before the response was delivered.
    #[error("Response channel closed")]
    Closed,

    /// The script could not be loaded or finished a request without answering it.
    #[error("Script error: {0}")]
    Script(String),

    /// The request handler panicked; the unit should be considered dead.
    #[error("Handler panicked")]
    HandlerPanicked,

    /// The control channel carried an unexpected message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Control channel framing failed.
    #[error("Frame error: {0}")]
    Frame(#[from] workerbox_protocol::FrameError),

    /// Unit storage could not be read or written.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Unit storage database failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Unit storage schema could not be applied.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type using [`WorkerError`].
pub type Result<T> = std::result::Result<T, WorkerError>;
