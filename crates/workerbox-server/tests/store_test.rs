// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the Store: selectors, delete semantics and restart recovery.

use std::sync::Arc;
use std::time::Duration;

use workerbox_server::event_bus::{Event, EventBus, Subscription};
use workerbox_server::model::{Script, ScriptStatus};
use workerbox_server::persistence::{Persistence, SqlitePersistence};
use workerbox_server::store::Store;
use workerbox_server::Error;

async fn new_store() -> (Store, Subscription) {
    let persistence = Arc::new(SqlitePersistence::in_memory().await.unwrap());
    let store = Store::new(persistence, Arc::new(EventBus::new()));
    let events = store.subscribe();
    (store, events)
}

/// Every event already published. The Store publishes before it returns,
/// so a short quiet period means the queue is empty.
async fn queued(events: &mut Subscription) -> Vec<Event> {
    let mut seen = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(20), events.recv()).await
    {
        seen.push(event);
    }
    seen
}

async fn drain(events: &mut Subscription) -> Vec<(uuid::Uuid, ScriptStatus)> {
    queued(events)
        .await
        .into_iter()
        .filter_map(|event| match event {
            Event::ScriptStatusChanged { script } => Some((script.id, script.status)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_every_selector_resolves_the_same_script() {
    let (store, _events) = new_store().await;
    let script = store.put_script("foo", "x").await.unwrap();
    store.put_script("bar", "y").await.unwrap();

    for selector in [
        "foo".to_string(),
        script.id.to_string(),
        script.name_id(),
    ] {
        let found = store.get_script(&selector).await.unwrap();
        assert_eq!(found.id, script.id, "selector {}", selector);
    }
    assert!(store.get_script("foo-00000000").await.is_none());
    assert!(store.get_script("").await.is_none());
}

#[tokio::test]
async fn test_delete_pending_script_returns_true_without_transition() {
    let (store, mut events) = new_store().await;
    let script = store.put_script("demo", "x").await.unwrap();
    drain(&mut events).await;

    assert!(store.delete_script("demo").await.unwrap());
    assert!(drain(&mut events).await.is_empty());
    assert_eq!(
        store.get_script_by_id(script.id).await.unwrap().status,
        ScriptStatus::Pending
    );

    assert!(!store.delete_script("missing").await.unwrap());
}

#[tokio::test]
async fn test_delete_stops_only_running_matches() {
    let (store, mut events) = new_store().await;
    let first = store.put_script("demo", "a").await.unwrap();
    let second = store.put_script("demo", "b").await.unwrap();
    store
        .update_script_status(&first, ScriptStatus::Running, Some("http://127.0.0.1:1".into()))
        .await
        .unwrap();
    drain(&mut events).await;

    assert!(store.delete_script("demo").await.unwrap());
    assert_eq!(drain(&mut events).await, vec![(first.id, ScriptStatus::Stopping)]);

    let first = store.get_script_by_id(first.id).await.unwrap();
    assert_eq!(first.status, ScriptStatus::Stopping);
    assert!(first.url.is_none());
    assert_eq!(
        store.get_script_by_id(second.id).await.unwrap().status,
        ScriptStatus::Pending
    );
}

#[tokio::test]
async fn test_status_sequence_follows_lifecycle() {
    let (store, mut events) = new_store().await;
    let script = store.put_script("demo", "x").await.unwrap();

    store
        .update_script_status(&script, ScriptStatus::Running, Some("http://a".into()))
        .await
        .unwrap();
    store.delete_script(&script.name_id()).await.unwrap();
    store
        .update_script_status(&script, ScriptStatus::Stopped, None)
        .await
        .unwrap();

    let statuses: Vec<ScriptStatus> = drain(&mut events).await.into_iter().map(|(_, s)| s).collect();
    assert_eq!(
        statuses,
        vec![
            ScriptStatus::Pending,
            ScriptStatus::Running,
            ScriptStatus::Stopping,
            ScriptStatus::Stopped,
        ]
    );

    let result = store
        .update_script_status(&script, ScriptStatus::Running, Some("http://b".into()))
        .await;
    assert!(matches!(result, Err(Error::ProtocolViolation(_))));
}

#[tokio::test]
async fn test_startup_recovers_interrupted_scripts() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = dir.path().join("workerbox.db");

    let mut by_status = Vec::new();
    {
        let persistence = SqlitePersistence::from_path(&db).await.unwrap();
        for status in [
            ScriptStatus::Pending,
            ScriptStatus::Running,
            ScriptStatus::Stopping,
            ScriptStatus::Stopped,
        ] {
            let mut script = Script::new(format!("s-{}", status), "x");
            script.status = status;
            if status == ScriptStatus::Running {
                script.url = Some("http://127.0.0.1:9".into());
            }
            persistence.put_script(&script).await.unwrap();
            by_status.push((status, script.id));
        }
        persistence.pool().close().await;
    }

    let persistence = Arc::new(SqlitePersistence::from_path(&db).await.unwrap());
    let store = Store::open(persistence.clone(), Arc::new(EventBus::new()))
        .await
        .unwrap();
    let mut events = store.subscribe();

    assert_eq!(store.startup().await.unwrap(), 3);

    let expected = [
        (ScriptStatus::Pending, ScriptStatus::Pending),
        (ScriptStatus::Running, ScriptStatus::Pending),
        (ScriptStatus::Stopping, ScriptStatus::Stopped),
        (ScriptStatus::Stopped, ScriptStatus::Stopped),
    ];
    for ((before, after), (_, id)) in expected.iter().zip(&by_status) {
        let script = store.get_script_by_id(*id).await.unwrap();
        assert_eq!(script.status, *after, "script that was {}", before);
        assert!(script.url.is_none());
    }
    assert_eq!(drain(&mut events).await.len(), 3);

    let persisted = persistence.get_scripts().await.unwrap();
    assert!(persisted
        .iter()
        .all(|s| matches!(s.status, ScriptStatus::Pending | ScriptStatus::Stopped)));

    assert_eq!(store.replay_pending().await, 2);
}

#[tokio::test]
async fn test_secrets_upsert_and_notify() {
    let (store, mut events) = new_store().await;
    store.put_script("demo", "x").await.unwrap();
    drain(&mut events).await;

    let names = store
        .put_secrets("demo", [("A", "1"), ("B", "2")])
        .await
        .unwrap();
    assert_eq!(names, vec!["A", "B"]);
    store.put_secrets("demo", [("A", "3")]).await.unwrap();

    let secrets = store.get_secrets("demo").await.unwrap();
    assert_eq!(secrets.len(), 2);
    assert_eq!(secrets[0].value, "3");

    let mut changed = 0;
    for event in queued(&mut events).await {
        match event {
            Event::ScriptSecretsChanged { script_name } => {
                assert_eq!(script_name, "demo");
                changed += 1;
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(changed, 2);

    let missing = store.put_secrets("ghost", [("A", "1")]).await;
    assert!(matches!(missing, Err(Error::NotFound(_))));
    let unnamed = store.put_secrets("demo", [("", "1")]).await;
    assert!(matches!(unnamed, Err(Error::Validation(_))));
}
