//! Remote hub channels, the source side of replication.
//!
//! A remote channel is addressed by URL (`http://hub/channel/name/`). Its
//! items are addressed by sequence number under that URL, and the remote
//! answers `GET {url}latest` with a redirect to the newest item.
//!
//! [`HttpChannelSource`] speaks that protocol over `reqwest`. A 404 from any
//! endpoint is an answer ("no such thing"), not an error. Other failures
//! are retried with backoff and then surface as [`HubError::Remote`].

use crate::channel::ChannelConfig;
use crate::error::{HubError, Result};
use crate::resilience::RetryConfig;
use crate::store::BoxFuture;
use chrono::{DateTime, Utc};
use reqwest::{header, StatusCode};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Header carrying an item's creation time.
pub const CREATION_DATE_HEADER: &str = "Creation-Date";

/// A remote channel URL, normalized to end in `/`, with its channel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelUrl {
    url: String,
    name: String,
}

impl ChannelUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let trimmed = url.trim();
        let name = trimmed
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty() && !segment.contains(':'))
            .ok_or_else(|| HubError::Config(format!("no channel name in url {:?}", url)))?
            .to_string();

        let mut url = trimmed.to_string();
        if !url.ends_with('/') {
            url.push('/');
        }
        Ok(Self { url, name })
    }

    /// The URL, always ending in `/`.
    pub fn as_str(&self) -> &str {
        &self.url
    }

    /// Last path segment of the URL.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn item(&self, sequence: u64) -> String {
        format!("{}{}", self.url, sequence)
    }

    pub fn latest(&self) -> String {
        format!("{}latest", self.url)
    }
}

impl std::fmt::Display for ChannelUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url)
    }
}

/// Read access to channels on another hub.
pub trait RemoteChannelSource: Send + Sync + 'static {
    /// Channel configuration, or `None` if the channel does not exist.
    fn get_configuration<'a>(&'a self, channel: &'a ChannelUrl) -> BoxFuture<'a, Option<ChannelConfig>>;

    /// Newest sequence, or `None` if the channel is empty.
    fn get_latest_sequence<'a>(&'a self, channel: &'a ChannelUrl) -> BoxFuture<'a, Option<u64>>;

    /// Creation time of one item, or `None` if it does not exist.
    fn get_creation_date<'a>(
        &'a self,
        channel: &'a ChannelUrl,
        sequence: u64,
    ) -> BoxFuture<'a, Option<DateTime<Utc>>>;

    /// Payload of one item, or `None` if it does not exist.
    fn fetch<'a>(&'a self, channel: &'a ChannelUrl, sequence: u64) -> BoxFuture<'a, Option<Vec<u8>>>;
}

/// Sequence number from the last segment of a `latest` redirect target.
pub fn sequence_from_location(location: &str) -> Option<u64> {
    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|segment| segment.parse().ok())
}

/// Parse a `Creation-Date` header (RFC 3339, or RFC 2822 as a fallback).
pub fn parse_creation_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_rfc2822(value))
        .ok()
        .map(|time| time.with_timezone(&Utc))
}

/// [`RemoteChannelSource`] over HTTP.
pub struct HttpChannelSource {
    client: reqwest::Client,
    retry: RetryConfig,
}

impl HttpChannelSource {
    pub fn new(timeout: Duration, retry: RetryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            // `latest` answers with a redirect we want to read, not follow.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| HubError::Config(format!("http client: {}", e)))?;
        Ok(Self { client, retry })
    }

    async fn with_retry<T, F, Fut>(&self, url: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    debug!(url = %url, attempt, error = %e, delay = ?delay, "Remote request failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(url = %url, attempt, error = %e, "Remote request failed");
                    return Err(e);
                }
            }
        }
    }

    async fn get(&self, url: &str) -> Result<Option<reqwest::Response>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| HubError::remote(url, e))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() || status.is_redirection() => Ok(Some(response)),
            status => Err(HubError::remote_msg(url, format!("HTTP {}", status))),
        }
    }
}

impl RemoteChannelSource for HttpChannelSource {
    fn get_configuration<'a>(&'a self, channel: &'a ChannelUrl) -> BoxFuture<'a, Option<ChannelConfig>> {
        Box::pin(async move {
            let url = channel.as_str();
            self.with_retry(url, || async move {
                let Some(response) = self.get(url).await? else {
                    return Ok(None);
                };
                let config = response
                    .json::<ChannelConfig>()
                    .await
                    .map_err(|e| HubError::remote(url, e))?;
                Ok(Some(config))
            })
            .await
        })
    }

    fn get_latest_sequence<'a>(&'a self, channel: &'a ChannelUrl) -> BoxFuture<'a, Option<u64>> {
        Box::pin(async move {
            let url = channel.latest();
            let url = url.as_str();
            self.with_retry(url, || async move {
                let Some(response) = self.get(url).await? else {
                    return Ok(None);
                };
                let location = response
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| HubError::remote_msg(url, "latest response has no Location"))?;
                sequence_from_location(location)
                    .map(Some)
                    .ok_or_else(|| HubError::remote_msg(url, format!("unparseable Location {:?}", location)))
            })
            .await
        })
    }

    fn get_creation_date<'a>(
        &'a self,
        channel: &'a ChannelUrl,
        sequence: u64,
    ) -> BoxFuture<'a, Option<DateTime<Utc>>> {
        Box::pin(async move {
            let url = channel.item(sequence);
            let url = url.as_str();
            self.with_retry(url, || async move {
                let Some(response) = self.get(url).await? else {
                    return Ok(None);
                };
                Ok(response
                    .headers()
                    .get(CREATION_DATE_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(parse_creation_date))
            })
            .await
        })
    }

    fn fetch<'a>(&'a self, channel: &'a ChannelUrl, sequence: u64) -> BoxFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            let url = channel.item(sequence);
            let url = url.as_str();
            self.with_retry(url, || async move {
                let Some(response) = self.get(url).await? else {
                    return Ok(None);
                };
                let bytes = response.bytes().await.map_err(|e| HubError::remote(url, e))?;
                Ok(Some(bytes.to_vec()))
            })
            .await
        })
    }
}
