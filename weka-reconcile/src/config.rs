//! Bootstrap configuration for one reconciliation run.

use std::fmt;
use std::time::Duration;

use reqwest::Url;

use crate::error::{ReconcileError, Result};

/// Default per-request deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Credentials and endpoint used to open a [`crate::session::Session`].
///
/// All four credential fields are mandatory; there is no partial-credential mode.
#[derive(Clone)]
pub struct ProviderConfig {
    pub username: String,
    pub password: String,
    pub org: String,
    pub endpoint: String,
    pub timeout: Duration,
    /// Verify the server certificate. Weka clusters commonly run with
    /// self-signed certificates, so hosts may turn this off.
    pub tls_verify: bool,
}

impl ProviderConfig {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        org: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            org: org.into(),
            endpoint: endpoint.into(),
            timeout: DEFAULT_TIMEOUT,
            tls_verify: true,
        }
    }

    /// Check that every credential is present and the endpoint is an
    /// absolute http(s) URL. Returns the parsed endpoint.
    pub fn validate(&self) -> Result<Url> {
        let missing: Vec<&str> = [
            ("username", &self.username),
            ("password", &self.password),
            ("org", &self.org),
            ("endpoint", &self.endpoint),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect();

        if !missing.is_empty() {
            return Err(ReconcileError::Configuration(format!(
                "missing required parameters to authenticate to Weka: {}",
                missing.join(", ")
            )));
        }

        let url = Url::parse(self.endpoint.trim()).map_err(|e| {
            ReconcileError::Configuration(format!("invalid endpoint {}: {e}", self.endpoint))
        })?;

        match url.scheme() {
            "http" | "https" if url.has_host() => Ok(url),
            _ => Err(ReconcileError::Configuration(format!(
                "endpoint {} must be an absolute http(s) URL",
                self.endpoint
            ))),
        }
    }

    /// Build the HTTP client shared by every request of the run.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .danger_accept_invalid_certs(!self.tls_verify)
            .user_agent(concat!("weka-reconcile/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ReconcileError::Configuration(format!("failed to build HTTP client: {e}")))
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("org", &self.org)
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .field("tls_verify", &self.tls_verify)
            .finish()
    }
}
