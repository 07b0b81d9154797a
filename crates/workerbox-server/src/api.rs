// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! REST API over the Store.
//!
//! Every JSON response uses the envelope
//! `{success, errors: [{message}], messages, result}`.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{FromRequest, Multipart, Path, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::model::{Script, ScriptStatus};
use crate::router::Router;
use crate::runner::Runner;
use crate::store::Store;

/// Upper bound on an uploaded script.
pub const MAX_SCRIPT_SIZE: usize = 1024 * 1024;

/// Longest accepted script name; keeps `nameId` a valid DNS label.
const MAX_NAME_LEN: usize = 54;

/// Content types accepted as a raw script body or multipart file.
const PLAIN_SCRIPT_TYPES: [&str; 6] = [
    "text/plain",
    "application/octet-stream",
    "application/javascript",
    "application/x-javascript",
    "application/typescript",
    "application/x-typescript",
];

/// Shared state of the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    /// Canonical script state
    pub store: Arc<Store>,
    /// Live units
    pub runner: Runner,
    /// Host routing table
    pub router: Router,
    /// Public base URL, for links in responses
    pub public_url: String,
}

/// One entry of `errors` or `messages`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiMessage {
    /// Human readable text
    pub message: String,
}

/// Response envelope.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    /// Whether the call succeeded
    pub success: bool,
    /// Errors, empty on success
    pub errors: Vec<ApiMessage>,
    /// Informational messages
    pub messages: Vec<ApiMessage>,
    /// Payload, null on failure
    pub result: Option<T>,
}

impl<T: Serialize> Envelope<T> {
    /// Successful envelope around `result`.
    pub fn ok(result: T) -> Self {
        Self {
            success: true,
            errors: Vec::new(),
            messages: Vec::new(),
            result: Some(result),
        }
    }
}

impl Envelope<()> {
    /// Failed envelope with one error.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            errors: vec![ApiMessage {
                message: message.into(),
            }],
            messages: Vec::new(),
            result: None,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        } else {
            debug!(error = %self, "Request rejected");
        }
        (status, Json(Envelope::error(self.to_string()))).into_response()
    }
}

/// Script as reported by the API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptSummary {
    /// Script name
    pub name: String,
    /// Script id
    pub id: String,
    /// Disambiguating display key
    pub name_id: String,
    /// Lifecycle status
    pub status: ScriptStatus,
    /// Last status change
    pub updated_at: DateTime<Utc>,
    /// Unit address while running
    pub url: Option<String>,
    /// Where the stored content can be downloaded
    pub bundle_url: String,
}

impl ScriptSummary {
    fn new(script: &Script, public_url: &str) -> Self {
        let name_id = script.name_id();
        Self {
            bundle_url: format!(
                "{}/v1/scripts/{}/bundle.js",
                public_url.trim_end_matches('/'),
                name_id
            ),
            name: script.name.clone(),
            id: script.id.to_string(),
            name_id,
            status: script.status,
            updated_at: script.updated_at,
            url: script.url.clone(),
        }
    }
}

/// Body of `PUT /v1/secrets/{scriptName}`.
#[derive(Debug, Deserialize)]
pub struct PutSecretsRequest {
    /// Secret name to value
    pub secrets: BTreeMap<String, String>,
}

/// `GET /`
pub async fn index() -> &'static str {
    "Hello world!"
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Response {
    let persistence = state.store.persistence().health_check().await;
    let healthy = matches!(persistence, Ok(true));
    if let Err(e) = &persistence {
        warn!(error = %e, "Persistence health check failed");
    }
    let body = json!({
        "healthy": healthy,
        "version": env!("CARGO_PKG_VERSION"),
        "host": state.runner.host_type(),
        "domain": state.router.domain(),
        "scripts": state.store.get_scripts().await.len(),
        "liveUnits": state.runner.live_units().await.len(),
    });
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(Envelope::ok(body))).into_response()
}

/// `GET /v1/scripts`
pub async fn list_scripts(State(state): State<AppState>) -> Json<Envelope<serde_json::Value>> {
    let scripts: Vec<ScriptSummary> = state
        .store
        .get_scripts()
        .await
        .iter()
        .map(|script| ScriptSummary::new(script, &state.public_url))
        .collect();
    Json(Envelope::ok(json!({ "scripts": scripts })))
}

/// `PUT /v1/scripts/{name}` with a raw body or a multipart file.
pub async fn put_script(
    State(state): State<AppState>,
    Path(name): Path<String>,
    request: Request,
) -> Result<Json<Envelope<serde_json::Value>>> {
    validate_name(&name)?;

    let content_type = media_type(request.headers());
    let content = if PLAIN_SCRIPT_TYPES.contains(&content_type.as_str()) {
        let body = axum::body::to_bytes(request.into_body(), MAX_SCRIPT_SIZE)
            .await
            .map_err(|_| Error::Validation("Script exceeds the 1 MiB limit".to_string()))?;
        Some(body)
    } else if content_type == "multipart/form-data" {
        read_multipart(&state, request).await?
    } else {
        None
    };

    let content = content
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Error::Validation("No script found".to_string()))?;

    let script = state.store.put_script(name, content).await?;
    let summary = ScriptSummary::new(&script, &state.public_url);
    Ok(Json(Envelope::ok(json!({ "script": summary }))))
}

/// `GET /v1/scripts/{selector}/bundle.js`
pub async fn get_bundle(
    State(state): State<AppState>,
    Path(selector): Path<String>,
) -> Result<Response> {
    let content = state
        .store
        .get_script_content(&selector)
        .await?
        .ok_or_else(|| Error::NotFound("No script with given ID or name found".to_string()))?;

    let mut response = Response::new(Body::from(content));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/javascript"),
    );
    Ok(response)
}

/// `DELETE /v1/scripts/{selector}`
pub async fn delete_script(
    State(state): State<AppState>,
    Path(selector): Path<String>,
) -> Result<Json<Envelope<bool>>> {
    if !state.store.delete_script(&selector).await? {
        return Err(Error::NotFound(
            "No script with given ID or name found".to_string(),
        ));
    }
    Ok(Json(Envelope::ok(true)))
}

/// `PUT /v1/secrets/{scriptName}`
pub async fn put_secrets(
    State(state): State<AppState>,
    Path(script_name): Path<String>,
    body: Bytes,
) -> Result<Json<Envelope<serde_json::Value>>> {
    let request: PutSecretsRequest = serde_json::from_slice(&body)?;
    let script = state
        .store
        .get_script(&script_name)
        .await
        .map(|s| s.name)
        .unwrap_or_else(|| script_name.clone());

    let names = state.store.put_secrets(&script_name, request.secrets).await?;
    let secrets: Vec<serde_json::Value> = names
        .into_iter()
        .map(|name| json!({ "script": script, "name": name }))
        .collect();
    Ok(Json(Envelope::ok(json!({ "secrets": secrets }))))
}

async fn read_multipart(state: &AppState, request: Request) -> Result<Option<Bytes>> {
    let mut multipart = Multipart::from_request(request, state)
        .await
        .map_err(|e| Error::Validation(e.body_text()))?;

    let mut content = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::Validation(e.body_text()))?
    {
        let accepted = field
            .content_type()
            .map(|t| PLAIN_SCRIPT_TYPES.contains(&essence(t).as_str()))
            .unwrap_or(false);
        if !accepted {
            continue;
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|e| Error::Validation(e.body_text()))?;
        if bytes.len() > MAX_SCRIPT_SIZE {
            return Err(Error::Validation(
                "Script exceeds the 1 MiB limit".to_string(),
            ));
        }
        content = Some(bytes);
    }
    Ok(content)
}

/// Script names become hostnames, so they are lowercase DNS labels.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("No script name given".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::Validation(format!(
            "Script name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }
    let valid = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if !valid || name.starts_with('-') {
        return Err(Error::Validation(format!(
            "Invalid script name '{}': use lowercase letters, digits, '-' and '_'",
            name
        )));
    }
    Ok(())
}

fn media_type(headers: &HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(essence)
        .unwrap_or_default()
}

fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("demo").is_ok());
        assert!(validate_name("my_worker-2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("Demo").is_err());
        assert!(validate_name("has.dot").is_err());
        assert!(validate_name("-leading").is_err());
        assert!(validate_name(&"a".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_essence() {
        assert_eq!(essence("text/plain; charset=utf-8"), "text/plain");
        assert_eq!(essence("Application/JavaScript"), "application/javascript");
        assert_eq!(
            essence("multipart/form-data; boundary=xyz"),
            "multipart/form-data"
        );
    }

    #[test]
    fn test_error_envelope_shape() {
        let value = serde_json::to_value(Envelope::error("nope")).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["errors"][0]["message"], "nope");
        assert!(value["result"].is_null());
    }

    #[test]
    fn test_summary_links_bundle() {
        let script = Script::new("demo", "x");
        let summary = ScriptSummary::new(&script, "http://127.0.0.1:8000/");
        assert_eq!(
            summary.bundle_url,
            format!("http://127.0.0.1:8000/v1/scripts/{}/bundle.js", script.name_id())
        );
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["nameId"], script.name_id());
        assert_eq!(value["status"], "pending");
    }
}
