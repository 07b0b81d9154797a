// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Canonical script and secret state.
//!
//! The Store is the only writer of scripts. Every mutation is persisted
//! first, then applied to the in-memory cache, then published on the
//! [`EventBus`]. The cache write lock is held across all three steps so the
//! order of published events always matches the order of persisted states.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event_bus::{Event, EventBus, Subscription};
use crate::model::{Script, ScriptStatus, Secret};
use crate::persistence::Persistence;

/// Single source of truth for scripts and secrets.
pub struct Store {
    persistence: Arc<dyn Persistence>,
    bus: Arc<EventBus>,
    scripts: RwLock<Vec<Script>>,
}

impl Store {
    /// Create an empty store. Use [`Store::open`] to load persisted scripts.
    pub fn new(persistence: Arc<dyn Persistence>, bus: Arc<EventBus>) -> Self {
        Self {
            persistence,
            bus,
            scripts: RwLock::new(Vec::new()),
        }
    }

    /// Create a store and load every persisted script into the cache.
    pub async fn open(persistence: Arc<dyn Persistence>, bus: Arc<EventBus>) -> Result<Self> {
        let scripts = persistence.get_scripts().await?;
        info!(scripts = scripts.len(), "Store loaded");
        Ok(Self {
            persistence,
            bus,
            scripts: RwLock::new(scripts),
        })
    }

    /// The bus this store publishes on.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Subscribe to this store's change events.
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    /// Persistence backend.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Normalize state left behind by a previous process.
    ///
    /// Units never survive a restart, so `pending` and `running` scripts go
    /// back to `pending` and `stopping` scripts finish as `stopped`. Must run
    /// before the Runner and Router subscribe.
    pub async fn startup(&self) -> Result<usize> {
        let mut scripts = self.scripts.write().await;
        let mut repaired = 0;

        for index in 0..scripts.len() {
            let target = match scripts[index].status {
                ScriptStatus::Pending | ScriptStatus::Running => ScriptStatus::Pending,
                ScriptStatus::Stopping => ScriptStatus::Stopped,
                ScriptStatus::Stopped => continue,
            };

            let mut next = scripts[index].clone();
            let previous = next.status;
            next.status = target;
            next.url = None;
            next.updated_at = Utc::now();

            self.persistence.update_script_status(&next).await?;
            debug!(
                name_id = %next.name_id(),
                from = %previous,
                to = %target,
                "Recovered script status"
            );
            scripts[index] = next.clone();
            self.bus.publish(Event::ScriptStatusChanged { script: next });
            repaired += 1;
        }

        if repaired > 0 {
            info!(repaired, "Startup reconciliation complete");
        }
        Ok(repaired)
    }

    /// Publish `scriptStatusChanged` again for every pending script.
    ///
    /// Called once subscribers are attached so recovered scripts get started.
    pub async fn replay_pending(&self) -> usize {
        let scripts = self.scripts.read().await;
        let mut replayed = 0;
        for script in scripts.iter().filter(|s| s.status == ScriptStatus::Pending) {
            self.bus.publish(Event::ScriptStatusChanged {
                script: script.clone(),
            });
            replayed += 1;
        }
        if replayed > 0 {
            info!(replayed, "Re-announced pending scripts");
        }
        replayed
    }

    /// Persist a new deployment as `pending` and announce it.
    pub async fn put_script(
        &self,
        name: impl Into<String>,
        content: impl Into<Bytes>,
    ) -> Result<Script> {
        let script = Script::new(name, content);
        let mut scripts = self.scripts.write().await;

        self.persistence.put_script(&script).await?;
        scripts.push(script.clone());
        self.bus.publish(Event::ScriptStatusChanged {
            script: script.clone(),
        });

        info!(
            name_id = %script.name_id(),
            script_id = %script.id,
            size = script.content.len(),
            "Script deployed"
        );
        Ok(script)
    }

    /// Request deletion of every script matching `selector`.
    ///
    /// Running matches move to `stopping`; other matches are left alone.
    /// Returns whether anything matched.
    pub async fn delete_script(&self, selector: &str) -> Result<bool> {
        let mut scripts = self.scripts.write().await;
        let mut matched = false;

        for index in 0..scripts.len() {
            if !scripts[index].matches_selector(selector) {
                continue;
            }
            matched = true;

            if scripts[index].status != ScriptStatus::Running {
                debug!(
                    name_id = %scripts[index].name_id(),
                    status = %scripts[index].status,
                    "Delete leaves non-running script untouched"
                );
                continue;
            }

            let next = self
                .apply_status(&mut scripts, index, ScriptStatus::Stopping, None)
                .await?;
            info!(name_id = %next.name_id(), "Script stopping");
        }

        Ok(matched)
    }

    /// Move a script to `status`.
    ///
    /// `url` is stored only when the new status is `running`. Illegal
    /// transitions are rejected with [`Error::ProtocolViolation`].
    pub async fn update_script_status(
        &self,
        script: &Script,
        status: ScriptStatus,
        url: Option<String>,
    ) -> Result<Script> {
        let mut scripts = self.scripts.write().await;
        let index = scripts
            .iter()
            .position(|s| s.id == script.id)
            .ok_or_else(|| Error::NotFound(format!("No script with id {}", script.id)))?;

        let current = scripts[index].status;
        if !current.can_transition_to(status) {
            error!(
                name_id = %scripts[index].name_id(),
                from = %current,
                to = %status,
                "Rejected illegal status transition"
            );
            return Err(Error::ProtocolViolation(format!(
                "script {} cannot move from {} to {}",
                scripts[index].name_id(),
                current,
                status
            )));
        }

        let next = self.apply_status(&mut scripts, index, status, url).await?;
        info!(
            name_id = %next.name_id(),
            status = %next.status,
            url = next.url.as_deref().unwrap_or(""),
            "Script status changed"
        );
        Ok(next)
    }

    async fn apply_status(
        &self,
        scripts: &mut [Script],
        index: usize,
        status: ScriptStatus,
        url: Option<String>,
    ) -> Result<Script> {
        let mut next = scripts[index].clone();
        next.status = status;
        next.url = if status == ScriptStatus::Running {
            url
        } else {
            None
        };
        next.updated_at = Utc::now();

        self.persistence.update_script_status(&next).await?;
        scripts[index] = next.clone();
        self.bus.publish(Event::ScriptStatusChanged {
            script: next.clone(),
        });
        Ok(next)
    }

    /// Snapshot of every script, in deployment order.
    pub async fn get_scripts(&self) -> Vec<Script> {
        self.scripts.read().await.clone()
    }

    /// Resolve a selector; the newest matching deployment wins.
    pub async fn get_script(&self, selector: &str) -> Option<Script> {
        self.scripts
            .read()
            .await
            .iter()
            .rev()
            .find(|s| s.matches_selector(selector))
            .cloned()
    }

    /// Look up a script by id.
    pub async fn get_script_by_id(&self, id: Uuid) -> Option<Script> {
        self.scripts
            .read()
            .await
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    /// Stored content of the script a selector resolves to.
    pub async fn get_script_content(&self, selector: &str) -> Result<Option<Bytes>> {
        let Some(script) = self.get_script(selector).await else {
            return Ok(None);
        };
        Ok(self
            .persistence
            .get_script_content(script.id)
            .await?
            .map(Bytes::from))
    }

    /// Upsert secrets for the script a selector resolves to and notify
    /// subscribers. Returns the accepted secret names.
    pub async fn put_secrets<I, K, V>(&self, selector: &str, secrets: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let script_name = self
            .get_script(selector)
            .await
            .map(|s| s.name)
            .ok_or_else(|| Error::NotFound("No script with given ID or name found".to_string()))?;

        let secrets: Vec<Secret> = secrets
            .into_iter()
            .map(|(name, value)| Secret::new(script_name.clone(), name, value))
            .collect();

        if secrets.iter().any(|s| s.name.trim().is_empty()) {
            warn!(script = %script_name, "Rejected unnamed secret");
            return Err(Error::Validation(
                "Secret names must not be empty".to_string(),
            ));
        }

        let _guard = self.scripts.write().await;
        for secret in &secrets {
            self.persistence.put_secret(secret).await?;
        }
        self.bus.publish(Event::ScriptSecretsChanged {
            script_name: script_name.clone(),
        });

        info!(script = %script_name, count = secrets.len(), "Secrets updated");
        Ok(secrets.into_iter().map(|s| s.name).collect())
    }

    /// Every secret for a script name.
    pub async fn get_secrets(&self, script_name: &str) -> Result<Vec<Secret>> {
        Ok(self.persistence.get_secrets(script_name).await?)
    }
}
