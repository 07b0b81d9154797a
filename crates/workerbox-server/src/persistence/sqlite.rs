// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

use super::{Persistence, PersistenceError, Result};
use crate::model::{KeyValue, Script, ScriptStatus, Secret};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Script row as stored.
#[derive(Debug, sqlx::FromRow)]
struct ScriptRecord {
    uuid: String,
    name: String,
    status: String,
    url: Option<String>,
    updated_at: String,
    content: Vec<u8>,
}

impl TryFrom<ScriptRecord> for Script {
    type Error = PersistenceError;

    fn try_from(record: ScriptRecord) -> Result<Self> {
        let id = Uuid::parse_str(&record.uuid)
            .map_err(|e| PersistenceError::InvalidRecord(format!("uuid {}: {}", record.uuid, e)))?;
        let status = record
            .status
            .parse::<ScriptStatus>()
            .map_err(PersistenceError::InvalidRecord)?;
        let updated_at = DateTime::parse_from_rfc3339(&record.updated_at)
            .map_err(|e| {
                PersistenceError::InvalidRecord(format!(
                    "updated_at {}: {}",
                    record.updated_at, e
                ))
            })?
            .with_timezone(&Utc);

        Ok(Script {
            id,
            name: record.name,
            content: record.content.into(),
            status,
            updated_at,
            url: record.url,
        })
    }
}

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Wrap an existing pool. Migrations are not run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) a database file and run migrations.
    ///
    /// Parent directories are created when missing.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/workerbox.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    /// Private in-memory database, mostly for tests.
    ///
    /// Pinned to a single connection that never expires, since every new
    /// connection to `:memory:` would see an empty database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn put_script(&self, script: &Script) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scripts (uuid, name, status, url, updated_at, content)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (uuid) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                url = excluded.url,
                updated_at = excluded.updated_at,
                content = excluded.content
            "#,
        )
        .bind(script.id.to_string())
        .bind(&script.name)
        .bind(script.status.as_str())
        .bind(script.url.as_deref())
        .bind(script.updated_at.to_rfc3339())
        .bind(script.content.as_ref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_script_status(&self, script: &Script) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE scripts
            SET status = ?, url = ?, updated_at = ?
            WHERE uuid = ?
            "#,
        )
        .bind(script.status.as_str())
        .bind(script.url.as_deref())
        .bind(script.updated_at.to_rfc3339())
        .bind(script.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::InvalidRecord(format!(
                "no stored script with id {}",
                script.id
            )));
        }

        Ok(())
    }

    async fn get_scripts(&self) -> Result<Vec<Script>> {
        let records = sqlx::query_as::<_, ScriptRecord>(
            r#"
            SELECT uuid, name, status, url, updated_at, content
            FROM scripts
            ORDER BY seq
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        records.into_iter().map(Script::try_from).collect()
    }

    async fn get_script_content(&self, id: Uuid) -> Result<Option<Vec<u8>>> {
        let content: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT content FROM scripts WHERE uuid = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        Ok(content.map(|(c,)| c))
    }

    async fn put_secret(&self, secret: &Secret) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO secrets (script, name, value)
            VALUES (?, ?, ?)
            ON CONFLICT (script, name) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(&secret.script)
        .bind(&secret.name)
        .bind(&secret.value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_secrets(&self, script_name: &str) -> Result<Vec<Secret>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT script, name, value
            FROM secrets
            WHERE script = ?
            ORDER BY name
            "#,
        )
        .bind(script_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(script, name, value)| Secret {
                script,
                name,
                value,
            })
            .collect())
    }

    async fn put_key_value(&self, kv: &KeyValue) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv (namespace, name, value)
            VALUES (?, ?, ?)
            ON CONFLICT (namespace, name) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(&kv.namespace)
        .bind(&kv.name)
        .bind(&kv.value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_key_value(&self, namespace: &str, name: &str) -> Result<Option<KeyValue>> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT value FROM kv WHERE namespace = ? AND name = ?")
                .bind(namespace)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(value,)| KeyValue {
            namespace: namespace.to_string(),
            name: name.to_string(),
            value,
        }))
    }

    async fn delete_key_value(&self, namespace: &str, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv WHERE namespace = ? AND name = ?")
            .bind(namespace)
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_key_values(&self, namespace: &str) -> Result<Vec<KeyValue>> {
        let rows: Vec<(String, Vec<u8>)> =
            sqlx::query_as("SELECT name, value FROM kv WHERE namespace = ? ORDER BY name")
                .bind(namespace)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(name, value)| KeyValue {
                namespace: namespace.to_string(),
                name,
                value,
            })
            .collect())
    }

    async fn health_check(&self) -> Result<bool> {
        let (one,): (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(one == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_upsert_and_status_update() {
        let db = SqlitePersistence::in_memory().await.unwrap();
        let mut script = Script::new("demo", "export default {}");
        db.put_script(&script).await.unwrap();

        script.status = ScriptStatus::Running;
        script.url = Some("http://127.0.0.1:4000".to_string());
        script.updated_at = Utc::now();
        db.update_script_status(&script).await.unwrap();

        let scripts = db.get_scripts().await.unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].id, script.id);
        assert_eq!(scripts[0].status, ScriptStatus::Running);
        assert_eq!(scripts[0].url.as_deref(), Some("http://127.0.0.1:4000"));
        assert_eq!(scripts[0].content, script.content);

        // Re-putting the same id overwrites instead of duplicating.
        db.put_script(&script).await.unwrap();
        assert_eq!(db.get_scripts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scripts_keep_insertion_order() {
        let db = SqlitePersistence::in_memory().await.unwrap();
        let names = ["b", "a", "c"];
        for name in names {
            db.put_script(&Script::new(name, "x")).await.unwrap();
        }
        let stored: Vec<String> = db
            .get_scripts()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(stored, names);
    }

    #[tokio::test]
    async fn test_status_update_of_unknown_script_fails() {
        let db = SqlitePersistence::in_memory().await.unwrap();
        let script = Script::new("ghost", "x");
        assert!(matches!(
            db.update_script_status(&script).await,
            Err(PersistenceError::InvalidRecord(_))
        ));
    }

    #[tokio::test]
    async fn test_script_content_lookup() {
        let db = SqlitePersistence::in_memory().await.unwrap();
        let script = Script::new("demo", vec![0u8, 159, 146, 150]);
        db.put_script(&script).await.unwrap();

        assert_eq!(
            db.get_script_content(script.id).await.unwrap(),
            Some(vec![0u8, 159, 146, 150])
        );
        assert_eq!(db.get_script_content(Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_secret_upsert_is_unique_per_script_and_name() {
        let db = SqlitePersistence::in_memory().await.unwrap();
        db.put_secret(&Secret::new("demo", "TOKEN", "one")).await.unwrap();
        db.put_secret(&Secret::new("demo", "TOKEN", "two")).await.unwrap();
        db.put_secret(&Secret::new("demo", "API", "k")).await.unwrap();
        db.put_secret(&Secret::new("other", "TOKEN", "x")).await.unwrap();

        let secrets = db.get_secrets("demo").await.unwrap();
        assert_eq!(
            secrets,
            vec![
                Secret::new("demo", "API", "k"),
                Secret::new("demo", "TOKEN", "two"),
            ]
        );
        assert!(db.get_secrets("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_key_value_upsert() {
        let db = SqlitePersistence::in_memory().await.unwrap();
        let mut kv = KeyValue {
            namespace: "demo".to_string(),
            name: "counter".to_string(),
            value: b"1".to_vec(),
        };
        db.put_key_value(&kv).await.unwrap();
        kv.value = b"2".to_vec();
        db.put_key_value(&kv).await.unwrap();

        assert_eq!(db.get_key_value("demo", "counter").await.unwrap(), Some(kv));
        assert_eq!(db.get_key_value("demo", "other").await.unwrap(), None);
        assert_eq!(db.get_key_value("other", "counter").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_key_value_list_and_delete() {
        let db = SqlitePersistence::in_memory().await.unwrap();
        for (namespace, name) in [("demo", "b"), ("demo", "a"), ("other", "a")] {
            db.put_key_value(&KeyValue {
                namespace: namespace.to_string(),
                name: name.to_string(),
                value: b"v".to_vec(),
            })
            .await
            .unwrap();
        }

        let names: Vec<String> = db
            .get_key_values("demo")
            .await
            .unwrap()
            .into_iter()
            .map(|kv| kv.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);

        assert!(db.delete_key_value("demo", "a").await.unwrap());
        assert!(!db.delete_key_value("demo", "a").await.unwrap());
        assert_eq!(db.get_key_values("demo").await.unwrap().len(), 1);
        assert!(db.get_key_value("other", "a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_from_path_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("workerbox.db");
        let script = Script::new("demo", "x");
        {
            let db = SqlitePersistence::from_path(&path).await.unwrap();
            db.put_script(&script).await.unwrap();
            assert!(db.health_check().await.unwrap());
        }

        let reopened = SqlitePersistence::from_path(&path).await.unwrap();
        assert_eq!(reopened.get_scripts().await.unwrap()[0].id, script.id);
    }
}
