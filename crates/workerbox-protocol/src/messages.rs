// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control messages.

use serde::{Deserialize, Serialize};

/// Script delivered to a unit by `runScript`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptPayload {
    /// Script name (not unique).
    pub name: String,
    /// Script id (UUID string).
    pub id: String,
    /// Script source text.
    pub content: String,
    /// Path of the unit's private key-value database, if the host assigned one.
    #[serde(rename = "dbPath", default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
}

impl ScriptPayload {
    /// Create a payload without a database path.
    pub fn new(name: impl Into<String>, id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            content: content.into(),
            db_path: None,
        }
    }

    /// Attach a database path.
    pub fn with_db_path(mut self, path: impl Into<String>) -> Self {
        self.db_path = Some(path.into());
        self
    }
}

/// A single secret as seen by a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretEntry {
    /// Secret name; becomes the environment key.
    pub name: String,
    /// Secret value.
    pub value: String,
}

impl SecretEntry {
    /// Create a secret entry.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Messages sent from the host to a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum HostMessage {
    /// Load and serve a script.
    RunScript {
        /// The script to run.
        script: ScriptPayload,
    },
    /// Replace the unit's environment with this secret set.
    UpdateSecrets {
        /// Complete secret set for the script.
        secrets: Vec<SecretEntry>,
    },
}

/// Messages sent from a unit to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum WorkerMessage {
    /// The unit is listening and reachable at `address` (`<scheme>://<host>:<port>`).
    Ready {
        /// Base URL of the unit's listener.
        address: String,
    },
    /// The unit could not load its script and is about to exit.
    Error {
        /// Human readable reason.
        message: String,
    },
}
