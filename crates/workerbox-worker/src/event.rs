// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fetch events.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::error;

use crate::error::{Result, WorkerError};
use crate::storage::StorageArea;

/// Request delivered to a unit's handler.
pub type FetchRequest = http::Request<Bytes>;

/// Response produced by a unit's handler.
pub type FetchResponse = http::Response<Bytes>;

/// Single-use responder for one request.
///
/// The first call to [`respond`](Self::respond) delivers the response. Any
/// further call is a protocol violation: it is logged at `error` level and
/// returns [`WorkerError::AlreadyResponded`].
#[derive(Debug)]
pub struct Responder {
    tx: Mutex<Option<oneshot::Sender<FetchResponse>>>,
}

impl Responder {
    /// Create a responder and the receiver its response arrives on.
    pub fn channel() -> (Self, oneshot::Receiver<FetchResponse>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Deliver the response.
    pub fn respond(&self, response: FetchResponse) -> Result<()> {
        let tx = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        let Some(tx) = tx else {
            error!("respond called twice for the same fetch event");
            return Err(WorkerError::AlreadyResponded);
        };

        tx.send(response).map_err(|_| WorkerError::Closed)
    }

    /// Whether a response was already delivered.
    pub fn has_responded(&self) -> bool {
        match self.tx.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

/// One inbound request together with its responder, environment snapshot
/// and the unit's storage area.
pub struct FetchEvent {
    request: FetchRequest,
    responder: Responder,
    env: Arc<HashMap<String, String>>,
    storage: Option<Arc<dyn StorageArea>>,
}

impl fmt::Debug for FetchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchEvent")
            .field("request", &self.request)
            .field("responder", &self.responder)
            .field("env", &self.env)
            .field("storage", &self.storage.is_some())
            .finish()
    }
}

impl FetchEvent {
    /// Create an event.
    pub fn new(
        request: FetchRequest,
        responder: Responder,
        env: Arc<HashMap<String, String>>,
    ) -> Self {
        Self {
            request,
            responder,
            env,
            storage: None,
        }
    }

    /// Attach the unit's storage area.
    pub fn with_storage(mut self, storage: Option<Arc<dyn StorageArea>>) -> Self {
        self.storage = storage;
        self
    }

    /// The inbound request.
    pub fn request(&self) -> &FetchRequest {
        &self.request
    }

    /// Environment visible to this request.
    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// Storage area of the unit, when the host assigned one.
    pub fn storage(&self) -> Option<&dyn StorageArea> {
        self.storage.as_deref()
    }

    /// Answer the request. See [`Responder::respond`].
    pub fn respond_with(&self, response: FetchResponse) -> Result<()> {
        self.responder.respond(response)
    }

    /// Whether the request has been answered.
    pub fn has_responded(&self) -> bool {
        self.responder.has_responded()
    }
}
