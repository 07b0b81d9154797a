// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Unit storage kept in the server's own database.
//!
//! In-process units have no private database file; their storage area is
//! the `kv` namespace named after the script, so every deployment of a name
//! shares one area, like the per-name file process units get.

use std::sync::Arc;

use async_trait::async_trait;
use workerbox_worker::{StorageArea, WorkerError};

use crate::model::KeyValue;
use crate::persistence::{Persistence, PersistenceError};

/// [`StorageArea`] over a [`Persistence`] key-value namespace.
#[derive(Clone)]
pub struct PersistenceStorage {
    persistence: Arc<dyn Persistence>,
    namespace: String,
}

impl PersistenceStorage {
    /// Storage area for `namespace`.
    pub fn new(persistence: Arc<dyn Persistence>, namespace: impl Into<String>) -> Self {
        Self {
            persistence,
            namespace: namespace.into(),
        }
    }
}

fn storage_error(e: PersistenceError) -> WorkerError {
    WorkerError::Storage(e.to_string())
}

#[async_trait]
impl StorageArea for PersistenceStorage {
    async fn get(&self, name: &str) -> workerbox_worker::Result<Option<Vec<u8>>> {
        let kv = self
            .persistence
            .get_key_value(&self.namespace, name)
            .await
            .map_err(storage_error)?;
        Ok(kv.map(|kv| kv.value))
    }

    async fn set(&self, name: &str, value: &[u8]) -> workerbox_worker::Result<()> {
        self.persistence
            .put_key_value(&KeyValue {
                namespace: self.namespace.clone(),
                name: name.to_string(),
                value: value.to_vec(),
            })
            .await
            .map_err(storage_error)
    }

    async fn delete(&self, name: &str) -> workerbox_worker::Result<bool> {
        self.persistence
            .delete_key_value(&self.namespace, name)
            .await
            .map_err(storage_error)
    }

    async fn entries(&self) -> workerbox_worker::Result<Vec<(String, Vec<u8>)>> {
        let entries = self
            .persistence
            .get_key_values(&self.namespace)
            .await
            .map_err(storage_error)?;
        Ok(entries.into_iter().map(|kv| (kv.name, kv.value)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;

    #[tokio::test]
    async fn test_areas_follow_namespaces() {
        let persistence: Arc<dyn Persistence> =
            Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let demo = PersistenceStorage::new(persistence.clone(), "demo");
        let other = PersistenceStorage::new(persistence.clone(), "other");

        demo.set("value", b"stored").await.unwrap();
        assert_eq!(demo.get("value").await.unwrap().as_deref(), Some(&b"stored"[..]));
        assert_eq!(other.get("value").await.unwrap(), None);

        let kv = persistence.get_key_value("demo", "value").await.unwrap().unwrap();
        assert_eq!(kv.value, b"stored");

        assert!(demo.delete("value").await.unwrap());
        assert!(demo.entries().await.unwrap().is_empty());
    }
}
