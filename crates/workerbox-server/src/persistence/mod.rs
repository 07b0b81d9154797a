// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interface and the SQLite backend.
//!
//! The Store only relies on the put/get contract below; any backend that
//! keeps scripts unique by id, secrets unique by `(script, name)` and
//! key-values unique by `(namespace, name)` will do.

pub mod sqlite;

pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{KeyValue, Script, Secret};

/// Persistence errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PersistenceError {
    /// Query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored row could not be turned back into a record.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Filesystem setup failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for persistence operations.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Storage backend for scripts, secrets and key-values.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Insert a script, or overwrite the row with the same id.
    async fn put_script(&self, script: &Script) -> Result<()>;

    /// Persist `status`, `url` and `updated_at` of an existing script.
    async fn update_script_status(&self, script: &Script) -> Result<()>;

    /// Every script, in insertion order.
    async fn get_scripts(&self) -> Result<Vec<Script>>;

    /// Raw content of one script.
    async fn get_script_content(&self, id: Uuid) -> Result<Option<Vec<u8>>>;

    /// Upsert a secret.
    async fn put_secret(&self, secret: &Secret) -> Result<()>;

    /// Every secret of a script name, ordered by secret name.
    async fn get_secrets(&self, script_name: &str) -> Result<Vec<Secret>>;

    /// Upsert a key-value entry.
    async fn put_key_value(&self, kv: &KeyValue) -> Result<()>;

    /// Read a key-value entry.
    async fn get_key_value(&self, namespace: &str, name: &str) -> Result<Option<KeyValue>>;

    /// Remove a key-value entry; false if it was not there.
    async fn delete_key_value(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Every entry of a namespace, ordered by name.
    async fn get_key_values(&self, namespace: &str) -> Result<Vec<KeyValue>>;

    /// Cheap connectivity check.
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}
