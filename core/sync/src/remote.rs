//! Remote API transport used to replay queued mutations.

use async_trait::async_trait;
use reqwest::{Client, Method};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use medstock_common::{Error, HttpMethod, Result};
use medstock_storage::{Headers, PendingChange};

/// Name of the header rewritten by [`ReplayAuth::Refresh`].
const AUTHORIZATION: &str = "Authorization";

/// A captured HTTP request, replayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayRequest {
    pub url: String,
    pub method: HttpMethod,
    pub headers: Headers,
    pub body: Option<String>,
}

impl ReplayRequest {
    /// Create a request without headers or body.
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            headers: Headers::new(),
            body: None,
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the pre-serialized body.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Replace any authorization header with a bearer token.
    pub fn set_bearer(&mut self, token: &str) {
        self.headers
            .retain(|name, _| !name.eq_ignore_ascii_case(AUTHORIZATION));
        self.headers
            .insert(AUTHORIZATION.to_string(), format!("Bearer {token}"));
    }
}

impl From<&PendingChange> for ReplayRequest {
    fn from(change: &PendingChange) -> Self {
        Self {
            url: change.url.clone(),
            method: change.method.clone(),
            headers: change.headers.clone(),
            body: change.body.clone(),
        }
    }
}

/// A response received from the remote API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: String,
}

impl RemoteResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// The request produced no response (DNS, connect, timeout, abort).
#[derive(Debug, Clone, Error)]
#[error("transport failure: {0}")]
pub struct TransportError(pub String);

/// Remote API accepting replayed mutations.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Send one request and report what came back.
    ///
    /// Any received response, whatever its status, is `Ok`.
    async fn send(&self, request: &ReplayRequest) -> std::result::Result<RemoteResponse, TransportError>;
}

/// Source of the current credential, consulted at replay time.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Current bearer token, if the user is signed in.
    async fn bearer_token(&self) -> Option<String>;
}

/// What to do with captured credentials when replaying.
#[derive(Clone, Default)]
pub enum ReplayAuth {
    /// Replay headers exactly as captured at enqueue time.
    #[default]
    Captured,
    /// Overwrite `Authorization` with the current token when one exists.
    Refresh(Arc<dyn CredentialSource>),
}

impl ReplayAuth {
    /// Apply the policy to a request about to be replayed.
    pub async fn apply(&self, request: &mut ReplayRequest) {
        if let Self::Refresh(source) = self {
            if let Some(token) = source.bearer_token().await {
                request.set_bearer(&token);
            }
        }
    }
}

impl std::fmt::Debug for ReplayAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Captured => f.write_str("Captured"),
            Self::Refresh(_) => f.write_str("Refresh"),
        }
    }
}

/// HTTP transport for the inventory API.
pub struct HttpRemote {
    http: Client,
    base_url: Option<Url>,
}

impl HttpRemote {
    /// Create a transport.
    ///
    /// Relative request URLs are resolved against `base_url`. No timeout is
    /// applied unless `timeout` is given.
    ///
    /// # Errors
    /// - `Config` if the base URL is invalid or the client cannot be built
    pub fn new(base_url: Option<&str>, user_agent: &str, timeout: Option<Duration>) -> Result<Self> {
        let base_url = base_url
            .map(|raw| {
                Url::parse(raw).map_err(|e| Error::Config(format!("invalid API base URL {raw}: {e}")))
            })
            .transpose()?;

        let mut builder = Client::builder().user_agent(user_agent);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { http, base_url })
    }

    /// Resolve a captured URL to an absolute one.
    pub fn resolve(&self, url: &str) -> std::result::Result<Url, TransportError> {
        match Url::parse(url) {
            Ok(absolute) => Ok(absolute),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = self.base_url.as_ref().ok_or_else(|| {
                    TransportError(format!("relative URL {url} and no API base URL configured"))
                })?;
                base.join(url)
                    .map_err(|e| TransportError(format!("invalid URL {url}: {e}")))
            }
            Err(e) => Err(TransportError(format!("invalid URL {url}: {e}"))),
        }
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn send(&self, request: &ReplayRequest) -> std::result::Result<RemoteResponse, TransportError> {
        let url = self.resolve(&request.url)?;
        let method = Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| TransportError(format!("invalid method {}: {e}", request.method)))?;

        let mut builder = self.http.request(method, url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        debug!("{} {} -> {}", request.method, url, status);

        Ok(RemoteResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedToken(Option<&'static str>);

    #[async_trait]
    impl CredentialSource for FixedToken {
        async fn bearer_token(&self) -> Option<String> {
            self.0.map(str::to_string)
        }
    }

    fn remote(base: Option<&str>) -> HttpRemote {
        HttpRemote::new(base, "medstock-test", None).unwrap()
    }

    #[test]
    fn test_resolve_relative_against_base() {
        let remote = remote(Some("https://inventory.example.org/"));
        let url = remote.resolve("/api/materials/3").unwrap();
        assert_eq!(url.as_str(), "https://inventory.example.org/api/materials/3");
    }

    #[test]
    fn test_resolve_absolute_ignores_base() {
        let remote = remote(Some("https://inventory.example.org/"));
        let url = remote.resolve("https://other.example.org/api/stock").unwrap();
        assert_eq!(url.host_str(), Some("other.example.org"));
    }

    #[test]
    fn test_resolve_relative_without_base_fails() {
        assert!(remote(None).resolve("/api/materials").is_err());
    }

    #[test]
    fn test_invalid_base_url_is_config_error() {
        let err = HttpRemote::new(Some("not a url"), "medstock-test", None)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transport_error() {
        let remote = HttpRemote::new(None, "medstock-test", Some(Duration::from_secs(2))).unwrap();
        let request = ReplayRequest::new(HttpMethod::Post, "http://127.0.0.1:9/api/materials");
        assert!(remote.send(&request).await.is_err());
    }

    #[tokio::test]
    async fn test_captured_auth_keeps_headers() {
        let mut request = ReplayRequest::new(HttpMethod::Put, "/api/stock/1")
            .with_header("authorization", "Bearer stale");
        ReplayAuth::Captured.apply(&mut request).await;
        assert_eq!(request.headers.get("authorization").unwrap(), "Bearer stale");
    }

    #[tokio::test]
    async fn test_refresh_auth_replaces_header() {
        let mut request = ReplayRequest::new(HttpMethod::Put, "/api/stock/1")
            .with_header("authorization", "Bearer stale")
            .with_body("{}");
        ReplayAuth::Refresh(Arc::new(FixedToken(Some("fresh"))))
            .apply(&mut request)
            .await;

        assert!(!request.headers.contains_key("authorization"));
        assert_eq!(request.headers.get("Authorization").unwrap(), "Bearer fresh");
        assert_eq!(request.body.as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn test_refresh_without_token_keeps_captured() {
        let mut request = ReplayRequest::new(HttpMethod::Delete, "/api/stock/1")
            .with_header("Authorization", "Bearer stale");
        ReplayAuth::Refresh(Arc::new(FixedToken(None)))
            .apply(&mut request)
            .await;
        assert_eq!(request.headers.get("Authorization").unwrap(), "Bearer stale");
    }
}
