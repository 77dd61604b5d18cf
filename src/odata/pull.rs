//! Paginated, retrying OData collection reader.

use std::collections::HashSet;
use std::time::Duration;

use metrics::counter;
use reqwest::header::ACCEPT;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use super::{Credentials, MAX_ERROR_BODY_CHARS, ODataError};
use crate::config::ODataConfig;
use crate::logging::clip;

/// Bounded retry with exponential backoff: `base * 2^attempt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, base_delay: Duration) -> Self {
        Self {
            retries,
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2_u32.saturating_pow(attempt.min(16)))
    }
}

/// Reads every page of an OData collection.
#[derive(Debug, Clone)]
pub struct PullClient {
    http: reqwest::Client,
    credentials: Credentials,
    retry: RetryPolicy,
    timeout: Duration,
}

impl PullClient {
    pub fn new(
        http: reqwest::Client,
        credentials: Credentials,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            credentials,
            retry,
            timeout,
        }
    }

    pub fn from_config(http: reqwest::Client, config: &ODataConfig) -> Self {
        Self::new(
            http,
            Credentials::from_config(config),
            RetryPolicy::new(config.retries, Duration::from_millis(config.retry_base_ms)),
            Duration::from_millis(config.timeout_ms),
        )
    }

    /// Fetch all entities, following `@odata.nextLink` until it is absent.
    ///
    /// A next link that leads back to a page already fetched in this call is
    /// an error.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn fetch_all(&self, url: &str, page_size: u32) -> Result<Vec<Value>, ODataError> {
        let base = Url::parse(url).map_err(|source| ODataError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;

        let mut next = Some(with_top(&base, page_size));
        let mut visited = HashSet::new();
        let mut rows = Vec::new();
        let mut page = 0_u32;

        while let Some(current) = next.take() {
            visited.insert(current.to_string());
            page += 1;
            let body = self.fetch_page_with_retry(&current).await?;
            let (values, next_link) = split_page(&current, body)?;

            let count = values.len();
            rows.extend(values);
            counter!("odata_pull_pages_total").increment(1);
            info!(page, rows = count, total = rows.len(), "Fetched OData page");

            next = match next_link {
                Some(link) => {
                    let resolved = base.join(&link).map_err(|source| ODataError::InvalidUrl {
                        url: link.clone(),
                        source,
                    })?;
                    if visited.contains(resolved.as_str()) {
                        return Err(ODataError::PagingCycle {
                            url: current.to_string(),
                            next: resolved.to_string(),
                        });
                    }
                    Some(resolved)
                }
                None => None,
            };
        }

        Ok(rows)
    }

    async fn fetch_page_with_retry(&self, url: &Url) -> Result<Value, ODataError> {
        let mut attempt = 0_u32;

        loop {
            match self.fetch_page(url).await {
                Ok(body) => return Ok(body),
                Err(err) if attempt < self.retry.retries => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        url = %url,
                        attempt = attempt + 1,
                        status = ?err.status(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "OData page fetch failed; retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    error!(
                        url = %url,
                        attempts = attempt + 1,
                        status = ?err.status(),
                        body = err.body().unwrap_or_default(),
                        error = %err,
                        "OData page fetch failed; retries exhausted"
                    );
                    return Err(err);
                }
            }
        }
    }

    async fn fetch_page(&self, url: &Url) -> Result<Value, ODataError> {
        debug!(url = %url, "GET OData page");
        let request = self
            .http
            .get(url.clone())
            .header(ACCEPT, "application/json")
            .timeout(self.timeout);

        let response = self
            .credentials
            .apply(request)
            .send()
            .await
            .map_err(|err| ODataError::from_reqwest(url.as_str(), err, self.timeout))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| ODataError::from_reqwest(url.as_str(), err, self.timeout))?;

        if !status.is_success() {
            return Err(ODataError::Status {
                status: status.as_u16(),
                url: url.to_string(),
                body: clip(&text, MAX_ERROR_BODY_CHARS),
            });
        }

        serde_json::from_str(&text).map_err(|source| ODataError::Decode {
            url: url.to_string(),
            source,
        })
    }
}

/// Replace any `$top` in `url` with `page_size`.
fn with_top(url: &Url, page_size: u32) -> Url {
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != "$top")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    let mut out = url.clone();
    {
        let mut pairs = out.query_pairs_mut();
        pairs.clear();
        for (key, value) in &retained {
            pairs.append_pair(key, value);
        }
        pairs.append_pair("$top", &page_size.to_string());
    }
    out
}

/// Add `filter` to the URL's `$filter`, combining with an existing one by `and`.
pub fn with_filter(url: &str, filter: &str) -> Result<String, ODataError> {
    let mut parsed = Url::parse(url).map_err(|source| ODataError::InvalidUrl {
        url: url.to_string(),
        source,
    })?;

    let mut existing = None;
    let retained: Vec<(String, String)> = parsed
        .query_pairs()
        .filter_map(|(key, value)| {
            if key == "$filter" {
                existing = Some(value.into_owned());
                None
            } else {
                Some((key.into_owned(), value.into_owned()))
            }
        })
        .collect();

    let combined = match existing {
        Some(current) if !current.trim().is_empty() => format!("({current}) and ({filter})"),
        _ => filter.to_string(),
    };

    {
        let mut pairs = parsed.query_pairs_mut();
        pairs.clear();
        for (key, value) in &retained {
            pairs.append_pair(key, value);
        }
        pairs.append_pair("$filter", &combined);
    }

    Ok(parsed.to_string())
}

/// Split a page body into its entities and the optional next link.
///
/// Accepts the v4 envelope (`value` + `@odata.nextLink`) and the v2 one
/// (`d.results` + `d.__next`).
fn split_page(url: &Url, body: Value) -> Result<(Vec<Value>, Option<String>), ODataError> {
    let next_link = body
        .get("@odata.nextLink")
        .or_else(|| body.get("odata.nextLink"))
        .or_else(|| body.pointer("/d/__next"))
        .and_then(Value::as_str)
        .filter(|link| !link.is_empty())
        .map(str::to_string);

    let values = match body {
        Value::Object(mut map) => match map.remove("value") {
            Some(Value::Array(values)) => Some(values),
            _ => match map.remove("d") {
                Some(Value::Object(mut d)) => match d.remove("results") {
                    Some(Value::Array(values)) => Some(values),
                    _ => None,
                },
                Some(Value::Array(values)) => Some(values),
                _ => None,
            },
        },
        _ => None,
    };

    match values {
        Some(values) => Ok((values, next_link)),
        None => Err(ODataError::Envelope {
            url: url.to_string(),
        }),
    }
}
