// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process publish/subscribe between the Store and its subscribers.
//!
//! Every subscriber owns an unbounded queue, so a slow subscriber never
//! blocks the publisher or its peers. Events are not durable: a subscriber
//! that is dropped simply stops receiving them.

use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::model::Script;

/// Change notifications emitted by the Store.
#[derive(Debug, Clone)]
pub enum Event {
    /// A script's status (and possibly url) changed.
    ScriptStatusChanged {
        /// Snapshot of the script after the change.
        script: Script,
    },
    /// Secrets for every deployment of a script name changed.
    ScriptSecretsChanged {
        /// Name of the affected script.
        script_name: String,
    },
}

impl Event {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ScriptStatusChanged { .. } => "scriptStatusChanged",
            Event::ScriptSecretsChanged { .. } => "scriptSecretsChanged",
        }
    }
}

/// Fan-out event bus.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Event>>>,
}

impl EventBus {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every live subscriber.
    ///
    /// Publishing under the subscriber lock keeps delivery FIFO per publisher.
    pub fn publish(&self, event: Event) {
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        trace!(
            kind = event.kind(),
            subscribers = subscribers.len(),
            "Event published"
        );
    }

    /// Register a new subscriber; it only sees events published from now on.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.push(tx);
        debug!(subscribers = subscribers.len(), "Subscriber registered");
        Subscription { rx }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        match self.subscribers.lock() {
            Ok(guard) => guard.iter().filter(|tx| !tx.is_closed()).count(),
            Err(poisoned) => poisoned.into_inner().iter().filter(|tx| !tx.is_closed()).count(),
        }
    }
}

/// One subscriber's private queue.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Subscription {
    /// Wait for the next event. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn nothing_queued(sub: &mut Subscription) -> bool {
        tokio::time::timeout(Duration::from_millis(20), sub.recv())
            .await
            .is_err()
    }

    fn secrets(name: &str) -> Event {
        Event::ScriptSecretsChanged {
            script_name: name.to_string(),
        }
    }

    fn name_of(event: Event) -> String {
        match event {
            Event::ScriptSecretsChanged { script_name } => script_name,
            Event::ScriptStatusChanged { script } => script.name,
        }
    }

    #[tokio::test]
    async fn test_fan_out_preserves_order_per_subscriber() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        for name in ["one", "two", "three"] {
            bus.publish(secrets(name));
        }

        for sub in [&mut a, &mut b] {
            let mut seen = Vec::new();
            for _ in 0..3 {
                seen.push(name_of(sub.recv().await.unwrap()));
            }
            assert_eq!(seen, vec!["one", "two", "three"]);
            assert!(nothing_queued(sub).await);
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let bus = EventBus::new();
        bus.publish(secrets("early"));
        let mut late = bus.subscribe();
        bus.publish(secrets("late"));

        assert_eq!(name_of(late.recv().await.unwrap()), "late");
        assert!(nothing_queued(&mut late).await);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let keep = bus.subscribe();
        let gone = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(gone);
        bus.publish(secrets("x"));
        assert_eq!(bus.subscriber_count(), 1);
        drop(keep);
    }

    #[tokio::test]
    async fn test_status_event_carries_snapshot() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let script = Script::new("demo", "body");
        bus.publish(Event::ScriptStatusChanged {
            script: script.clone(),
        });

        match sub.recv().await.unwrap() {
            Event::ScriptStatusChanged { script: got } => assert_eq!(got, script),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
