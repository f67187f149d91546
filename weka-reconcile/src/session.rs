//! Authenticated context for one reconciliation run.

use std::fmt;

use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::ProviderConfig;
use crate::error::{ReconcileError, Result};

#[derive(Debug, Deserialize)]
struct LoginResponse {
    data: LoginData,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    access_token: String,
    token_type: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Bearer token, base endpoint and organization for one run.
///
/// Built once by [`Session::login`] and never refreshed: an expired token
/// surfaces as whatever error the API returns for it.
#[derive(Clone)]
pub struct Session {
    endpoint: Url,
    org: String,
    token: String,
    expires_in: Option<i64>,
}

impl Session {
    /// Validate `config` and exchange its credentials for a bearer token.
    pub async fn login(http: &reqwest::Client, config: &ProviderConfig) -> Result<Self> {
        let endpoint = config.validate()?;
        let login_url = join_path(&endpoint, "login");

        info!(endpoint = %endpoint, org = %config.org, "Authenticating to Weka");

        let response = http
            .post(login_url.clone())
            .json(&json!({
                "username": config.username,
                "password": config.password,
                "org": config.org,
            }))
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;

        if status != StatusCode::OK {
            return Err(ReconcileError::Authentication(format!(
                "non-200 response ({}) from Weka API path {login_url}: {}",
                status.as_u16(),
                String::from_utf8_lossy(&body)
            )));
        }

        let parsed: LoginResponse = serde_json::from_slice(&body).map_err(|e| {
            ReconcileError::Authentication(format!("malformed login response: {e}"))
        })?;

        if !parsed.data.token_type.eq_ignore_ascii_case("bearer") {
            return Err(ReconcileError::Authentication(format!(
                "unknown token type from Weka API ({}) path {login_url}",
                parsed.data.token_type
            )));
        }

        debug!(expires_in = ?parsed.data.expires_in, "Obtained Weka access token");

        Ok(Self {
            endpoint,
            org: config.org.clone(),
            token: parsed.data.access_token,
            expires_in: parsed.data.expires_in,
        })
    }

    /// Session around a token obtained elsewhere.
    pub fn with_token(endpoint: Url, org: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            endpoint,
            org: org.into(),
            token: token.into(),
            expires_in: None,
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn org(&self) -> &str {
        &self.org
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Token lifetime in seconds as reported at login. Informational only.
    pub fn expires_in(&self) -> Option<i64> {
        self.expires_in
    }

    /// Absolute URL for an API path relative to the endpoint.
    pub fn url_for(&self, path: &str) -> Url {
        join_path(&self.endpoint, path)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.endpoint.as_str())
            .field("org", &self.org)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Append `path` to the endpoint's own path, keeping exactly one slash between.
fn join_path(endpoint: &Url, path: &str) -> Url {
    let mut url = endpoint.clone();
    let base = endpoint.path().trim_end_matches('/');
    let tail = path.trim_start_matches('/');
    url.set_path(&format!("{base}/{tail}"));
    url
}
