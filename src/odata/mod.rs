//! OData HTTP clients.
//!
//! [`pull::PullClient`] reads paginated collections; [`push::PushClient`]
//! performs the CSRF handshake and writes entities or actions. Both share the
//! error type and credentials defined here.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::config::ODataConfig;

pub mod pull;
pub mod push;

pub use pull::{PullClient, RetryPolicy};
pub use push::{CsrfSession, PushClient};

/// Response bodies attached to errors are clipped to this many characters.
pub const MAX_ERROR_BODY_CHARS: usize = 500;

/// Basic-auth credentials for the OData service.
#[derive(Clone, Default)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn from_config(config: &ODataConfig) -> Self {
        Self::new(config.user.clone(), config.password.clone())
    }

    /// Attach basic auth when a user is configured.
    pub(crate) fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.user.is_empty() {
            request
        } else {
            request.basic_auth(&self.user, Some(&self.password))
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// OData client errors
#[derive(Debug, Error)]
pub enum ODataError {
    #[error("OData request to {url} failed with status {status}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },

    #[error("HTTP Timeout after {timeout_ms}ms calling {url}")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("Missing CSRF token in response from {url}")]
    MissingCsrfToken { url: String },

    #[error("network error calling {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("response from {url} has no `value` array")]
    Envelope { url: String },

    #[error("`@odata.nextLink` in {url} points back to an already fetched page: {next}")]
    PagingCycle { url: String, next: String },

    #[error("invalid OData URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

impl ODataError {
    /// Classify a reqwest failure, keeping timeouts distinguishable.
    pub(crate) fn from_reqwest(url: &str, err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            ODataError::Timeout {
                url: url.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }
        } else {
            ODataError::Transport {
                url: url.to_string(),
                source: err,
            }
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ODataError::Status { status, .. } => Some(*status),
            ODataError::Transport { source, .. } => source.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            ODataError::Status { url, .. }
            | ODataError::Timeout { url, .. }
            | ODataError::MissingCsrfToken { url }
            | ODataError::Transport { url, .. }
            | ODataError::Decode { url, .. }
            | ODataError::Envelope { url }
            | ODataError::PagingCycle { url, .. }
            | ODataError::InvalidUrl { url, .. } => Some(url),
        }
    }

    pub fn body(&self) -> Option<&str> {
        match self {
            ODataError::Status { body, .. } if !body.is_empty() => Some(body),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ODataError::Timeout { .. })
    }
}

/// Shared HTTP client for all jobs.
pub fn build_http_client() -> Result<reqwest::Client, ODataError> {
    reqwest::Client::builder()
        .user_agent(concat!("odata-sync/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|source| ODataError::Transport {
            url: String::new(),
            source,
        })
}
