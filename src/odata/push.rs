//! CSRF-protected OData writer.

use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE, COOKIE, SET_COOKIE};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use super::{Credentials, MAX_ERROR_BODY_CHARS, ODataError};
use crate::config::ODataConfig;
use crate::logging::clip;

const CSRF_HEADER: &str = "x-csrf-token";

/// Token and session cookies returned by the CSRF handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrfSession {
    pub token: String,
    pub cookies: String,
}

/// Sends JSON payloads to OData entity sets or actions.
#[derive(Debug, Clone)]
pub struct PushClient {
    http: reqwest::Client,
    credentials: Credentials,
    timeout: Duration,
    debug: bool,
}

impl PushClient {
    pub fn new(http: reqwest::Client, credentials: Credentials, timeout: Duration) -> Self {
        Self {
            http,
            credentials,
            timeout,
            debug: false,
        }
    }

    pub fn from_config(http: reqwest::Client, config: &ODataConfig) -> Self {
        Self::new(
            http,
            Credentials::from_config(config),
            Duration::from_millis(config.timeout_ms),
        )
        .with_debug(config.debug)
    }

    /// Log full request and response payloads.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Fetch a CSRF token and the session cookies that go with it.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn fetch_csrf(&self, url: &str) -> Result<CsrfSession, ODataError> {
        let request = self
            .http
            .get(url)
            .header(CSRF_HEADER, "fetch")
            .header(ACCEPT, "application/json")
            .timeout(self.timeout);

        let response = self
            .credentials
            .apply(request)
            .send()
            .await
            .map_err(|err| ODataError::from_reqwest(url, err, self.timeout))?;

        let status = response.status();
        let token = response
            .headers()
            .get(CSRF_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|token| !token.is_empty() && !token.eq_ignore_ascii_case("required"))
            .map(str::to_string);
        let cookies = flatten_set_cookies(
            response
                .headers()
                .get_all(SET_COOKIE)
                .iter()
                .filter_map(|value| value.to_str().ok()),
        );

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ODataError::Status {
                status: status.as_u16(),
                url: url.to_string(),
                body: clip(&body, MAX_ERROR_BODY_CHARS),
            });
        }

        let token = token.ok_or_else(|| ODataError::MissingCsrfToken {
            url: url.to_string(),
        })?;

        if self.debug {
            debug!(url, cookies = %cookies, "CSRF handshake complete");
        }

        Ok(CsrfSession { token, cookies })
    }

    /// POST `body` as JSON using a previously fetched CSRF session.
    ///
    /// JSON responses are parsed, other non-empty bodies come back as
    /// `{"__raw": text}` and empty bodies as `{}`.
    #[instrument(skip(self, body, session), fields(url = %url))]
    pub async fn post_json(
        &self,
        url: &str,
        body: &Value,
        session: &CsrfSession,
    ) -> Result<Value, ODataError> {
        if self.debug {
            debug!(url, payload = %body, "POST OData payload");
        }

        let mut request = self
            .http
            .post(url)
            .header(CSRF_HEADER, &session.token)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .timeout(self.timeout)
            .json(body);
        if !session.cookies.is_empty() {
            request = request.header(COOKIE, &session.cookies);
        }

        let response = self
            .credentials
            .apply(request)
            .send()
            .await
            .map_err(|err| ODataError::from_reqwest(url, err, self.timeout))?;

        let status = response.status();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_ascii_lowercase().contains("json"))
            .unwrap_or(false);
        let text = response
            .text()
            .await
            .map_err(|err| ODataError::from_reqwest(url, err, self.timeout))?;

        if self.debug {
            debug!(url, status = status.as_u16(), response = %text, "OData POST response");
        }

        if !status.is_success() {
            return Err(ODataError::Status {
                status: status.as_u16(),
                url: url.to_string(),
                body: clip(&text, MAX_ERROR_BODY_CHARS),
            });
        }

        if text.trim().is_empty() {
            return Ok(json!({}));
        }

        if is_json {
            serde_json::from_str(&text).map_err(|source| ODataError::Decode {
                url: url.to_string(),
                source,
            })
        } else {
            Ok(json!({ "__raw": text }))
        }
    }
}

/// Collapse `Set-Cookie` headers into a single `Cookie` value.
///
/// Each header may itself hold several comma-folded cookies; only the
/// `name=value` part of each cookie is kept.
pub fn flatten_set_cookies<'a, I>(headers: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut pairs = Vec::new();

    for header in headers {
        let mut current = String::new();
        for piece in header.split(',') {
            if starts_cookie(piece) && !current.is_empty() {
                push_pair(&mut pairs, &current);
                current.clear();
            }
            if !current.is_empty() {
                current.push(',');
            }
            current.push_str(piece);
        }
        if !current.is_empty() {
            push_pair(&mut pairs, &current);
        }
    }

    pairs.join("; ")
}

/// A comma-separated piece opens a new cookie when it begins with `name=`;
/// otherwise it continues an attribute such as `Expires=Wed, 21 Oct ...`.
fn starts_cookie(piece: &str) -> bool {
    let head = piece.split(';').next().unwrap_or_default().trim_start();
    match head.split_once('=') {
        Some((name, _)) => !name.is_empty() && !name.contains(char::is_whitespace),
        None => false,
    }
}

fn push_pair(pairs: &mut Vec<String>, cookie: &str) {
    let pair = cookie.split(';').next().unwrap_or_default().trim();
    if pair.contains('=') {
        pairs.push(pair.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folded_cookies_are_split() {
        assert_eq!(flatten_set_cookies(["a=1; Path=/, b=2"]), "a=1; b=2");
    }

    #[test]
    fn expires_commas_do_not_split_cookies() {
        let header = "SAP_SESSIONID=abc; Expires=Wed, 21 Oct 2026 07:28:00 GMT; Path=/, sap-usercontext=sap-client=100; path=/";
        assert_eq!(
            flatten_set_cookies([header]),
            "SAP_SESSIONID=abc; sap-usercontext=sap-client=100"
        );
    }

    #[test]
    fn multiple_headers_are_joined() {
        assert_eq!(
            flatten_set_cookies(["a=1; HttpOnly", "b=2; Secure"]),
            "a=1; b=2"
        );
        assert_eq!(flatten_set_cookies(Vec::<&str>::new()), "");
    }
}
