// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for workerbox-server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which [`WorkerHost`](crate::host::WorkerHost) strategy runs units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKind {
    /// One child process per unit, reached over loopback HTTP.
    Process,
    /// Units run as tasks inside the server process.
    Embedded,
}

impl FromStr for HostKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(HostKind::Process),
            "embedded" => Ok(HostKind::Embedded),
            other => Err(ConfigError::InvalidRunner(other.to_string())),
        }
    }
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address for the API and the proxy
    pub addr: SocketAddr,
    /// Public base URL of this server
    pub public_url: String,
    /// Domain suffix for host-based routing
    pub domain: String,
    /// SQLite database file
    pub db_path: PathBuf,
    /// Directory for unit files (script bundles, unit databases)
    pub data_dir: PathBuf,
    /// Worker host strategy
    pub host: HostKind,
    /// Program and arguments spawned per unit by the process host
    pub worker_command: Vec<String>,
    /// Bound on the readiness handshake
    pub ready_timeout: Duration,
    /// Bound on a proxied fetch
    pub fetch_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let addr_raw = var("WORKERBOX_ADDR", "0.0.0.0:8000");
        let addr = addr_raw
            .parse()
            .map_err(|_| ConfigError::InvalidAddr(addr_raw.clone()))?;

        let public_url = var("WORKERBOX_URL", "http://127.0.0.1:8000")
            .trim_end_matches('/')
            .to_string();

        let domain = var("WORKERBOX_DOMAIN", "workers.local")
            .trim_matches('.')
            .to_ascii_lowercase();
        if domain.is_empty() {
            return Err(ConfigError::MissingEnvVar("WORKERBOX_DOMAIN"));
        }

        let db_path = PathBuf::from(var("WORKERBOX_DB", "workerbox.db"));
        let data_dir = PathBuf::from(var("WORKERBOX_DATA_DIR", ".data"));
        let host = var("WORKERBOX_RUNNER", "process").parse()?;

        let worker_command: Vec<String> = var("WORKERBOX_WORKER_COMMAND", "workerbox-worker")
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if worker_command.is_empty() {
            return Err(ConfigError::MissingEnvVar("WORKERBOX_WORKER_COMMAND"));
        }

        let ready_timeout = Duration::from_secs(parse_secs(
            "WORKERBOX_READY_TIMEOUT_SECS",
            &var("WORKERBOX_READY_TIMEOUT_SECS", "10"),
        )?);
        let fetch_timeout = Duration::from_secs(parse_secs(
            "WORKERBOX_FETCH_TIMEOUT_SECS",
            &var("WORKERBOX_FETCH_TIMEOUT_SECS", "30"),
        )?);

        Ok(Self {
            addr,
            public_url,
            domain,
            db_path,
            data_dir,
            host,
            worker_command,
            ready_timeout,
            fetch_timeout,
        })
    }
}

fn parse_secs(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(secs),
        _ => Err(ConfigError::InvalidNumber {
            key,
            value: value.to_string(),
        }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing or empty.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The listen address is invalid.
    #[error("Invalid listen address: {0}")]
    InvalidAddr(String),
    /// Unknown worker host strategy.
    #[error("Invalid runner '{0}', expected 'process' or 'embedded'")]
    InvalidRunner(String),
    /// A numeric setting could not be parsed.
    #[error("Invalid value for {key}: {value}")]
    InvalidNumber {
        /// Variable name.
        key: &'static str,
        /// Offending value.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.addr, "0.0.0.0:8000".parse().unwrap());
        assert_eq!(config.public_url, "http://127.0.0.1:8000");
        assert_eq!(config.domain, "workers.local");
        assert_eq!(config.db_path, PathBuf::from("workerbox.db"));
        assert_eq!(config.data_dir, PathBuf::from(".data"));
        assert_eq!(config.host, HostKind::Process);
        assert_eq!(config.worker_command, vec!["workerbox-worker"]);
        assert_eq!(config.ready_timeout, Duration::from_secs(10));
        assert_eq!(config.fetch_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("WORKERBOX_ADDR", "127.0.0.1:9000"),
            ("WORKERBOX_URL", "https://box.example.com/"),
            ("WORKERBOX_DOMAIN", ".Apps.Example.com"),
            ("WORKERBOX_RUNNER", "Embedded"),
            ("WORKERBOX_WORKER_COMMAND", "node  worker.js"),
            ("WORKERBOX_FETCH_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();
        assert_eq!(config.addr.port(), 9000);
        assert_eq!(config.public_url, "https://box.example.com");
        assert_eq!(config.domain, "apps.example.com");
        assert_eq!(config.host, HostKind::Embedded);
        assert_eq!(config.worker_command, vec!["node", "worker.js"]);
        assert_eq!(config.fetch_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            Config::from_lookup(lookup(&[("WORKERBOX_ADDR", "nope")])),
            Err(ConfigError::InvalidAddr(_))
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[("WORKERBOX_RUNNER", "docker")])),
            Err(ConfigError::InvalidRunner(_))
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[("WORKERBOX_READY_TIMEOUT_SECS", "0")])),
            Err(ConfigError::InvalidNumber { .. })
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[("WORKERBOX_WORKER_COMMAND", "  ")])),
            Err(ConfigError::MissingEnvVar(_))
        ));
    }
}
