// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Script engines.
//!
//! A [`ScriptEngine`] turns a script payload into the unit's single
//! [`FetchHandler`]. The runtime never looks inside the script itself.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderValue};
use tracing::debug;
use workerbox_protocol::ScriptPayload;

use crate::error::{Result, WorkerError};
use crate::event::FetchEvent;

/// Header naming the script that produced a response.
pub const SCRIPT_HEADER: &str = "x-workerbox-script";

/// The inbound request handler a unit registers.
///
/// Implementations must answer each event exactly once through
/// [`FetchEvent::respond_with`]. An event dropped without a response is
/// reported to the caller as an upstream failure.
#[async_trait]
pub trait FetchHandler: Send + Sync {
    /// Handle one request.
    async fn handle(&self, event: FetchEvent);
}

/// Loads scripts into request handlers.
pub trait ScriptEngine: Send + Sync {
    /// Engine identifier (e.g., "static").
    fn engine_type(&self) -> &'static str;

    /// Load a script. Errors here abort the unit before it reports ready.
    fn load(&self, script: &ScriptPayload) -> Result<Arc<dyn FetchHandler>>;
}

/// Reference engine that serves the script body verbatim.
#[derive(Debug, Default, Clone)]
pub struct StaticEngine;

impl ScriptEngine for StaticEngine {
    fn engine_type(&self) -> &'static str {
        "static"
    }

    fn load(&self, script: &ScriptPayload) -> Result<Arc<dyn FetchHandler>> {
        if script.content.is_empty() {
            return Err(WorkerError::Script(format!(
                "script '{}' has no content",
                script.name
            )));
        }

        let label = HeaderValue::from_str(&script.name)
            .map_err(|e| WorkerError::Script(format!("invalid script name: {}", e)))?;

        Ok(Arc::new(StaticHandler {
            label,
            body: Bytes::from(script.content.clone()),
        }))
    }
}

struct StaticHandler {
    label: HeaderValue,
    body: Bytes,
}

#[async_trait]
impl FetchHandler for StaticHandler {
    async fn handle(&self, event: FetchEvent) {
        debug!(
            method = %event.request().method(),
            uri = %event.request().uri(),
            "Serving static script body"
        );

        let mut response = http::Response::new(self.body.clone());
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
            .headers_mut()
            .insert(SCRIPT_HEADER, self.label.clone());

        // The event is answered exactly once here; a failure only means the
        // requester went away.
        let _ = event.respond_with(response);
    }
}
