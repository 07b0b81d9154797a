// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-unit environment.
//!
//! Every request sees an immutable snapshot. Secret rotation swaps the whole
//! map; requests already in flight keep the snapshot they started with.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use workerbox_protocol::SecretEntry;

/// Shared, swappable environment of one unit.
#[derive(Debug, Clone)]
pub struct WorkerEnv {
    tx: Arc<watch::Sender<Arc<HashMap<String, String>>>>,
}

impl Default for WorkerEnv {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

impl WorkerEnv {
    /// Create an environment with an initial mapping.
    pub fn new(initial: HashMap<String, String>) -> Self {
        let (tx, _) = watch::channel(Arc::new(initial));
        Self { tx: Arc::new(tx) }
    }

    /// Build an environment from a secret set.
    pub fn from_secrets(secrets: &[SecretEntry]) -> Self {
        Self::new(to_map(secrets))
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<HashMap<String, String>> {
        self.tx.borrow().clone()
    }

    /// Look up a single variable in the current snapshot.
    pub fn get(&self, key: &str) -> Option<String> {
        self.tx.borrow().get(key).cloned()
    }

    /// Replace the environment with a new secret set.
    pub fn replace(&self, secrets: &[SecretEntry]) {
        self.tx.send_replace(Arc::new(to_map(secrets)));
    }
}

fn to_map(secrets: &[SecretEntry]) -> HashMap<String, String> {
    secrets
        .iter()
        .map(|s| (s.name.clone(), s.value.clone()))
        .collect()
}
