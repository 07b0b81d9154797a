// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock worker host for testing.
//!
//! Simulates units without spawning anything, counts every lifecycle call
//! and can crash a unit, or cut it off, on demand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::body::Body;
use chrono::Utc;
use tokio::sync::{Mutex, watch};
use uuid::Uuid;

use super::traits::*;
use crate::model::Secret;

struct MockUnit {
    handle: WorkerHandle,
    env: HashMap<String, String>,
    exit_tx: watch::Sender<Option<UnitExit>>,
    reachable: bool,
}

/// Mock worker host for testing.
pub struct MockHost {
    units: Mutex<HashMap<String, MockUnit>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    env_updates: AtomicUsize,
    /// If true, every start fails
    pub fail_start: bool,
    /// If true, no start ever reports ready
    pub hang_start: bool,
    /// Body returned by every fetch
    pub response_body: String,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHost {
    /// Create a mock host whose units answer `ok`.
    pub fn new() -> Self {
        Self {
            units: Mutex::new(HashMap::new()),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            env_updates: AtomicUsize::new(0),
            fail_start: false,
            hang_start: false,
            response_body: "ok".to_string(),
        }
    }

    /// Create a mock host that refuses to start units.
    pub fn failing() -> Self {
        Self {
            fail_start: true,
            ..Self::new()
        }
    }

    /// Create a mock host whose units never report ready.
    pub fn hanging() -> Self {
        Self {
            hang_start: true,
            ..Self::new()
        }
    }

    /// Successful starts so far.
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Explicit stops so far.
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Environment updates so far.
    pub fn env_update_count(&self) -> usize {
        self.env_updates.load(Ordering::SeqCst)
    }

    /// Live units.
    pub async fn live_count(&self) -> usize {
        self.units.lock().await.len()
    }

    /// Current environment of the live unit serving `script_id`.
    pub async fn env_of(&self, script_id: Uuid) -> Option<HashMap<String, String>> {
        self.units
            .lock()
            .await
            .values()
            .find(|u| u.handle.script_id == script_id)
            .map(|u| u.env.clone())
    }

    /// Make the live unit serving `script_id` refuse connections while
    /// staying alive. Returns false when no such unit is live.
    pub async fn cut_off(&self, script_id: Uuid) -> bool {
        let mut units = self.units.lock().await;
        match units.values_mut().find(|u| u.handle.script_id == script_id) {
            Some(unit) => {
                unit.reachable = false;
                true
            }
            None => false,
        }
    }

    /// Kill the live unit serving `script_id` as if it crashed.
    ///
    /// Returns false when no such unit is live.
    pub async fn crash(&self, script_id: Uuid) -> bool {
        let mut units = self.units.lock().await;
        let Some(handle_id) = units
            .values()
            .find(|u| u.handle.script_id == script_id)
            .map(|u| u.handle.handle_id.clone())
        else {
            return false;
        };
        if let Some(unit) = units.remove(&handle_id) {
            unit.exit_tx.send_replace(Some(UnitExit {
                code: Some(137),
                reason: "simulated crash".to_string(),
            }));
        }
        true
    }
}

#[async_trait]
impl WorkerHost for MockHost {
    fn host_type(&self) -> &'static str {
        "mock"
    }

    async fn start(&self, options: StartOptions) -> Result<WorkerHandle> {
        if self.fail_start {
            return Err(HostError::StartFailed("mock start failure".to_string()));
        }
        if self.hang_start {
            std::future::pending::<()>().await;
        }

        let handle_id = format!("mock-{}", Uuid::new_v4().simple());
        let handle = WorkerHandle {
            address: format!("http://mock.invalid/{}", handle_id),
            handle_id,
            script_id: options.script.id,
            name_id: options.script.name_id(),
            started_at: Utc::now(),
            pid: None,
        };

        let (exit_tx, _) = watch::channel(None);
        self.units.lock().await.insert(
            handle.handle_id.clone(),
            MockUnit {
                handle: handle.clone(),
                env: options.env,
                exit_tx,
                reachable: true,
            },
        );
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn update_environment(&self, handle: &WorkerHandle, secrets: &[Secret]) -> Result<()> {
        let mut units = self.units.lock().await;
        let unit = units
            .get_mut(&handle.handle_id)
            .ok_or_else(|| HostError::NotRunning(handle.name_id.clone()))?;
        unit.env = secrets
            .iter()
            .map(|s| (s.name.clone(), s.value.clone()))
            .collect();
        self.env_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, handle: &WorkerHandle) -> Result<()> {
        let unit = self
            .units
            .lock()
            .await
            .remove(&handle.handle_id)
            .ok_or_else(|| HostError::NotRunning(handle.name_id.clone()))?;
        unit.exit_tx.send_replace(Some(UnitExit::new("stopped")));
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch(&self, handle: &WorkerHandle, request: ProxyRequest) -> Result<ProxyResponse> {
        let reachable = self
            .units
            .lock()
            .await
            .get(&handle.handle_id)
            .is_some_and(|unit| unit.reachable);
        if !reachable {
            return Err(HostError::Unreachable(handle.name_id.clone()));
        }
        let response = http::Response::builder()
            .status(http::StatusCode::OK)
            .header("x-mock-unit", handle.name_id.as_str())
            .header("x-mock-path", request.uri().path())
            .body(Body::from(self.response_body.clone()))
            .map_err(|e| HostError::Protocol(e.to_string()))?;
        Ok(response)
    }

    async fn wait(&self, handle: &WorkerHandle) -> UnitExit {
        let exit_rx = self
            .units
            .lock()
            .await
            .get(&handle.handle_id)
            .map(|unit| unit.exit_tx.subscribe());
        match exit_rx {
            Some(exit_rx) => wait_exit(exit_rx).await,
            None => UnitExit::unknown(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Script;

    #[tokio::test]
    async fn test_counts_and_crash() {
        let host = MockHost::new();
        let script = Script::new("demo", "x");
        let handle = host
            .start(StartOptions::new(
                script.clone(),
                &[Secret::new("demo", "A", "1")],
            ))
            .await
            .unwrap();
        assert_eq!(host.start_count(), 1);
        assert_eq!(host.env_of(script.id).await.unwrap()["A"], "1");

        let (exit, crashed) = tokio::join!(host.wait(&handle), async {
            tokio::task::yield_now().await;
            host.crash(script.id).await
        });
        assert!(crashed);
        assert_eq!(exit.code, Some(137));
        assert_eq!(host.live_count().await, 0);
        assert!(!host.crash(script.id).await);
    }

    #[tokio::test]
    async fn test_failing_host() {
        let host = MockHost::failing();
        assert!(
            host.start(StartOptions::new(Script::new("demo", "x"), &[]))
                .await
                .is_err()
        );
        assert_eq!(host.start_count(), 0);
    }

    #[tokio::test]
    async fn test_cut_off_unit_is_unreachable_but_alive() {
        let host = MockHost::new();
        let script = Script::new("demo", "x");
        let handle = host
            .start(StartOptions::new(script.clone(), &[]))
            .await
            .unwrap();

        assert!(host.cut_off(script.id).await);
        let request = http::Request::new(Body::empty());
        assert!(matches!(
            host.fetch(&handle, request).await,
            Err(HostError::Unreachable(_))
        ));
        assert_eq!(host.live_count().await, 1);
    }
}
