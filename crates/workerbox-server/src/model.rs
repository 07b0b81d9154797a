// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain records: scripts, secrets and key-value entries.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a script.
///
/// ```text
///   pending ──▶ running ──▶ stopping ──▶ stopped
///      │           │                        ▲
///      └───────────┴────────────────────────┘
///        start failure / unit crash
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptStatus {
    /// Accepted and waiting for a unit.
    Pending,
    /// A live unit serves the script.
    Running,
    /// Deletion requested; the unit is being torn down.
    Stopping,
    /// Terminal.
    Stopped,
}

impl ScriptStatus {
    /// Lowercase name used in storage and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptStatus::Pending => "pending",
            ScriptStatus::Running => "running",
            ScriptStatus::Stopping => "stopping",
            ScriptStatus::Stopped => "stopped",
        }
    }

    /// Whether a regular (non-recovery) transition to `next` is allowed.
    pub fn can_transition_to(&self, next: ScriptStatus) -> bool {
        use ScriptStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Stopped)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Stopping, Stopped)
        )
    }

    /// Whether the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScriptStatus::Stopped)
    }
}

impl fmt::Display for ScriptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScriptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ScriptStatus::Pending),
            "running" => Ok(ScriptStatus::Running),
            "stopping" => Ok(ScriptStatus::Stopping),
            "stopped" => Ok(ScriptStatus::Stopped),
            other => Err(format!("unknown script status '{}'", other)),
        }
    }
}

/// A deployed script.
///
/// `url` is only set while the script is running.
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    /// Unique per deployment.
    pub id: Uuid,
    /// Human name, shared by every deployment of the same script.
    pub name: String,
    /// Script source as uploaded.
    pub content: Bytes,
    /// Lifecycle state.
    pub status: ScriptStatus,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
    /// Address of the live unit.
    pub url: Option<String>,
}

impl Script {
    /// New pending script with a fresh id.
    pub fn new(name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            content: content.into(),
            status: ScriptStatus::Pending,
            updated_at: Utc::now(),
            url: None,
        }
    }

    /// `<name>-<first 8 hex chars of id>`, disambiguates same-named scripts.
    pub fn name_id(&self) -> String {
        let id = self.id.simple().to_string();
        format!("{}-{}", self.name, &id[..8])
    }

    /// A selector matches the id, the name or the name-id.
    pub fn matches_selector(&self, selector: &str) -> bool {
        self.name == selector || self.id.to_string() == selector || self.name_id() == selector
    }
}

/// Environment value scoped to every deployment of a script name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    /// Script name the secret belongs to.
    pub script: String,
    /// Variable name.
    pub name: String,
    /// Variable value.
    pub value: String,
}

impl Secret {
    /// Create a secret.
    pub fn new(
        script: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            script: script.into(),
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Opaque value stored under `(namespace, name)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// Namespace, usually a script name.
    pub namespace: String,
    /// Key within the namespace.
    pub name: String,
    /// Raw value.
    pub value: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            ScriptStatus::Pending,
            ScriptStatus::Running,
            ScriptStatus::Stopping,
            ScriptStatus::Stopped,
        ] {
            assert_eq!(status.as_str().parse::<ScriptStatus>().unwrap(), status);
        }
        assert!("paused".parse::<ScriptStatus>().is_err());
    }

    #[test]
    fn test_regular_transitions() {
        use ScriptStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Stopped));

        assert!(!Running.can_transition_to(Pending));
        assert!(!Stopped.can_transition_to(Pending));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Stopping));
        assert!(!Stopping.can_transition_to(Running));
    }

    #[test]
    fn test_selector_matching() {
        let script = Script::new("demo", "hi");
        assert!(script.matches_selector("demo"));
        assert!(script.matches_selector(&script.id.to_string()));
        assert!(script.matches_selector(&script.name_id()));
        assert!(!script.matches_selector("dem"));
        assert!(!script.matches_selector(""));
    }

    #[test]
    fn test_name_id_format() {
        let mut script = Script::new("foo", "hi");
        script.id = Uuid::parse_str("1234abcd-0000-4000-8000-000000000000").unwrap();
        assert_eq!(script.name_id(), "foo-1234abcd");
        assert!(script.matches_selector("foo-1234abcd"));
        assert!(script.matches_selector("1234abcd-0000-4000-8000-000000000000"));
    }
}
