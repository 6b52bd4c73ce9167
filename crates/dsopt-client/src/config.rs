use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};

use crate::credentials::{API_HOST_VAR, API_KEY_VAR, CredentialLocation, read_credentials};
use crate::errors::ClientError;
use crate::retry::RetryPolicy;

pub const DEFAULT_API_HOST: &str = "https://api.hirundo.io";
/// Client protocol version announced to the server.
pub const API_VERSION: &str = "0.2";
pub const API_VERSION_HEADER: &str = "HIRUNDO-API-VERSION";

/// Configuration shared by every client component.
///
/// Build it once per process and hand it to `RunMonitor` / `ApiClient`.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// API key used for bearer auth.
    pub api_key: String,
    /// Base URL of the API server, without a trailing path.
    pub api_host: String,
    /// Connect timeout for every request, including the live event stream.
    pub connect_timeout: Duration,
    /// Timeout for plain read requests.
    pub read_timeout: Duration,
    /// Timeout for create/delete/update requests.
    pub modify_timeout: Duration,
    /// Read timeout for result archive downloads.
    pub download_timeout: Duration,
    /// Directory holding downloaded result archives. `None` uses the
    /// per-user cache directory.
    pub cache_dir: Option<PathBuf>,
    /// Retry policy for request/response calls.
    pub transport_retry: RetryPolicy,
    /// Backoff layered on top of the server's reconnect hint.
    pub stream_reconnect: RetryPolicy,
}

impl ClientConfig {
    /// Creates a config with default host and timeouts.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_host: DEFAULT_API_HOST.to_string(),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            modify_timeout: Duration::from_secs(60),
            download_timeout: Duration::from_secs(600),
            cache_dir: None,
            transport_retry: RetryPolicy::transport(),
            stream_reconnect: RetryPolicy::stream_reconnect(),
        }
    }

    /// Builds a config from `API_KEY` / `API_HOST`.
    ///
    /// Process environment wins; missing values are read from the
    /// credential file (`./.env`, else `~/.dsopt.conf`).
    pub fn from_env() -> Result<Self, ClientError> {
        let location = CredentialLocation::resolve()?;
        let file_values = read_credentials(location.path())?;
        let lookup = |key: &str| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .or_else(|| file_values.get(key).cloned())
        };
        let api_key = lookup(API_KEY_VAR).unwrap_or_default();
        if api_key.trim().is_empty() {
            return Err(ClientError::Config(
                "API_KEY is not set. Run `dsopt setup` to store an API key".into(),
            ));
        }
        let mut config = Self::new(api_key);
        if let Some(host) = lookup(API_HOST_VAR) {
            config = config.api_host(host);
        }
        Ok(config)
    }

    /// Overrides the API host (for on-premises installs or test servers).
    pub fn api_host(mut self, api_host: impl Into<String>) -> Self {
        self.api_host = api_host.into().trim_end_matches('/').to_string();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn transport_retry(mut self, policy: RetryPolicy) -> Self {
        self.transport_retry = policy;
        self
    }

    pub fn stream_reconnect(mut self, policy: RetryPolicy) -> Self {
        self.stream_reconnect = policy;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ClientError> {
        if self.api_key.trim().is_empty() {
            return Err(ClientError::Config("api_key must not be empty".into()));
        }
        let host = url::Url::parse(&self.api_host)
            .map_err(|e| ClientError::Config(format!("invalid api_host {}: {e}", self.api_host)))?;
        if !matches!(host.scheme(), "http" | "https") {
            return Err(ClientError::Config(format!(
                "api_host must use http or https: {}",
                self.api_host
            )));
        }
        Ok(())
    }

    /// Resolved archive cache directory.
    pub fn resolved_cache_dir(&self) -> Result<PathBuf, ClientError> {
        if let Some(dir) = &self.cache_dir {
            return Ok(dir.clone());
        }
        dirs::cache_dir()
            .map(|dir| dir.join("dsopt"))
            .or_else(|| dirs::home_dir().map(|home| home.join(".dsopt").join("cache")))
            .ok_or_else(|| ClientError::Config("cannot determine a cache directory".into()))
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_host, path.trim_start_matches('/'))
    }

    /// Bearer auth plus the protocol version header.
    pub fn auth_headers(&self) -> Result<HeaderMap, ClientError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| ClientError::Config(format!("api_key is not a valid header: {e}")))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(
            HeaderName::from_static("hirundo-api-version"),
            HeaderValue::from_static(API_VERSION),
        );
        Ok(headers)
    }

    /// `auth_headers` plus JSON content negotiation.
    pub fn json_headers(&self) -> Result<HeaderMap, ClientError> {
        let mut headers = self.auth_headers()?;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}
