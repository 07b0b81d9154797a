// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for workerbox-server.

use axum::http::StatusCode;
use thiserror::Error;

/// Control plane errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Persistence operation failed.
    #[error("Persistence error: {0}")]
    Persistence(#[from] crate::persistence::PersistenceError),

    /// Worker host operation failed.
    #[error("Host error: {0}")]
    Host(#[from] crate::host::HostError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Request validation failed.
    #[error("{0}")]
    Validation(String),

    /// Selector matched no script.
    #[error("{0}")]
    NotFound(String),

    /// A unit is unreachable, errored or went away.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// A component observed a state it should never see.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// HTTP status reported for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Result type using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            Error::Validation("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::NotFound("gone".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::Upstream("down".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            Error::ProtocolViolation("twice".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
