// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-unit key-value storage.
//!
//! A [`StorageArea`] is the state a script keeps across requests and
//! restarts. Units launched with a `dbPath` get a [`SqliteStorage`] on that
//! file; in-process hosts may hand in their own implementation.

use std::path::Path;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::debug;

use crate::error::Result;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Area used when a script does not name one.
pub const DEFAULT_AREA: &str = "default";

/// Key-value storage visible to a script.
#[async_trait]
pub trait StorageArea: Send + Sync {
    /// Value stored under `name`.
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Insert or overwrite `name`.
    async fn set(&self, name: &str, value: &[u8]) -> Result<()>;

    /// Remove `name`; false if it was not there.
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Every entry, ordered by name.
    async fn entries(&self) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Storage area backed by a SQLite file.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    area: String,
}

impl SqliteStorage {
    /// Open (or create) the default area of the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_area(path, DEFAULT_AREA).await
    }

    /// Open (or create) a named area of the database at `path`.
    pub async fn open_area(path: impl AsRef<Path>, area: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        MIGRATOR.run(&pool).await?;

        let area = area.into();
        debug!(path = %path.display(), area = %area, "Storage opened");
        Ok(Self { pool, area })
    }

    /// Name of the area this handle reads and writes.
    pub fn area(&self) -> &str {
        &self.area
    }
}

#[async_trait]
impl StorageArea for SqliteStorage {
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT value FROM kv WHERE namespace = ? AND name = ?")
                .bind(&self.area)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn set(&self, name: &str, value: &[u8]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv (namespace, name, value)
            VALUES (?, ?, ?)
            ON CONFLICT (namespace, name) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(&self.area)
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv WHERE namespace = ? AND name = ?")
            .bind(&self.area)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn entries(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let rows: Vec<(String, Vec<u8>)> =
            sqlx::query_as("SELECT name, value FROM kv WHERE namespace = ? ORDER BY name")
                .bind(&self.area)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_overwrites_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("units").join("worker-demo.db");

        {
            let storage = SqliteStorage::open(&path).await.unwrap();
            storage.set("value", b"first").await.unwrap();
            storage.set("value", b"second").await.unwrap();
            storage.set("updated_at", b"now").await.unwrap();
            storage.pool.close().await;
        }

        let storage = SqliteStorage::open(&path).await.unwrap();
        assert_eq!(storage.get("value").await.unwrap().as_deref(), Some(&b"second"[..]));
        let names: Vec<String> = storage
            .entries()
            .await
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["updated_at", "value"]);
    }

    #[tokio::test]
    async fn test_areas_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.db");
        let jobs = SqliteStorage::open_area(&path, "jobs").await.unwrap();
        let other = SqliteStorage::open(&path).await.unwrap();

        jobs.set("k", b"v").await.unwrap();
        assert_eq!(other.get("k").await.unwrap(), None);
        assert!(!other.delete("k").await.unwrap());
        assert!(jobs.delete("k").await.unwrap());
        assert!(jobs.entries().await.unwrap().is_empty());
    }
}
