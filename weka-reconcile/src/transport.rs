//! Transport to the Weka REST API.
//!
//! A single request goes out with the bearer token attached; the full body
//! is read back and classified. The API reports errors inconsistently with
//! respect to status codes, so the body is inspected for a structured error
//! envelope before the status code is looked at.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::{ReconcileError, Result};
use crate::session::Session;

/// Sends one request and returns the success payload.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Vec<u8>>;
}

/// The generic error envelope: `{"message": ..., "data": {"error": ..., "reason": ...}}`.
#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<ErrorData>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorData {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// Classify a status/body pair.
///
/// 1. A body that parses as the error envelope with a non-empty `data.error`
///    or `data.reason` is [`ReconcileError::RemoteRejected`], whatever the status.
/// 2. Otherwise a non-200 status is [`ReconcileError::RemoteHttp`], carrying
///    the envelope's `message` when one parsed.
/// 3. Otherwise the body is the success payload.
pub fn classify_response(status: u16, body: &[u8]) -> Result<()> {
    let envelope = serde_json::from_slice::<ErrorEnvelope>(body).ok();

    if let Some(envelope) = &envelope {
        let flagged = envelope.data.as_ref().is_some_and(|d| {
            d.error.as_deref().is_some_and(|e| !e.is_empty())
                || d.reason.as_deref().is_some_and(|r| !r.is_empty())
        });

        if flagged {
            return Err(ReconcileError::RemoteRejected {
                status,
                message: envelope.message.clone().unwrap_or_default(),
            });
        }
    }

    if status != 200 {
        return Err(ReconcileError::RemoteHttp {
            status,
            message: envelope
                .and_then(|e| e.message)
                .filter(|m| !m.is_empty()),
        });
    }

    Ok(())
}

/// Decode a success payload into its typed wire record.
pub fn decode<T: DeserializeOwned>(payload: &[u8], context: &str) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| ReconcileError::unexpected(context, e))
}

/// Every successful payload wraps the record under `data`.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
}

/// [`Transport`] over reqwest, authenticated by a [`Session`].
///
/// Cloning is cheap; the connection pool and session are shared.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    session: Arc<Session>,
}

impl HttpTransport {
    pub fn new(http: reqwest::Client, session: Arc<Session>) -> Self {
        Self { http, session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Vec<u8>> {
        let url = self.session.url_for(path);
        debug!(method = %method, url = %url, "Weka request");

        let mut request = self
            .http
            .request(method.clone(), url)
            .bearer_auth(self.session.token());

        if let Some(body) = body {
            let encoded = serde_json::to_vec(body)
                .map_err(|e| ReconcileError::invalid(path, format!("unencodable body: {e}")))?;
            request = request
                .header(CONTENT_TYPE, "application/json; charset=utf-8")
                .body(encoded);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let payload = response.bytes().await?;

        debug!(
            method = %method,
            path = %path,
            status,
            body = %String::from_utf8_lossy(&payload),
            "Weka response"
        );

        classify_response(status, &payload)?;
        Ok(payload.to_vec())
    }
}
