use crate::config::HttpConfig;
use crate::error::TransportError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, CONTENT_RANGE, HeaderMap, HeaderValue, LAST_MODIFIED,
    RANGE, REFERER, USER_AGENT,
};
use tracing::debug;

/// Body and the few response headers the pipeline cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedBody {
    pub status: u16,
    pub body: String,
    /// Full resource size, when the server answered a range request with `Content-Range`.
    pub total_size: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl FetchedBody {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            total_size: None,
            last_modified: None,
        }
    }
}

/// Swappable network seam. Every call enforces its own timeout.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// Plain GET. Non-2xx and empty bodies are errors.
    async fn get_text(&self, url: &str) -> Result<FetchedBody, TransportError>;

    /// GET of the first `len` bytes.
    async fn get_range(&self, url: &str, len: u64) -> Result<FetchedBody, TransportError>;

    /// Cheap existence check (HEAD).
    async fn probe(&self, url: &str) -> Result<(), TransportError>;
}

fn browser_headers(config: &HttpConfig) -> Result<HeaderMap> {
    let mut h = HeaderMap::new();
    h.insert(
        USER_AGENT,
        HeaderValue::from_str(&config.user_agent).context("bad user agent")?,
    );
    h.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,text/csv,*/*;q=0.8"),
    );
    h.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    h.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    h.insert(
        REFERER,
        HeaderValue::from_str(&config.referer).context("bad referer")?,
    );
    Ok(h)
}

/// `bytes 0-8191/123456` → 123456
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

pub struct HttpClient {
    inner: reqwest::Client,
}

impl HttpClient {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .default_headers(browser_headers(config)?)
            .timeout(config.timeout())
            .gzip(true)
            // Accept cookies so session-gated archive pages work
            .cookie_store(true)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { inner })
    }

    async fn read(url: &str, resp: reqwest::Response) -> Result<FetchedBody, TransportError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::from_status(url, status.as_u16()));
        }

        let headers = resp.headers();
        let total_size = headers
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total);
        let last_modified = headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);

        let body = resp
            .text()
            .await
            .map_err(|e| TransportError::from_reqwest(url, &e))?;

        if body.trim().is_empty() {
            return Err(TransportError::EmptyBody { url: url.to_string() });
        }

        Ok(FetchedBody {
            status: status.as_u16(),
            body,
            total_size,
            last_modified,
        })
    }
}

#[async_trait]
impl HttpFetcher for HttpClient {
    async fn get_text(&self, url: &str) -> Result<FetchedBody, TransportError> {
        debug!("GET {}", url);
        let resp = self
            .inner
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(url, &e))?;
        Self::read(url, resp).await
    }

    async fn get_range(&self, url: &str, len: u64) -> Result<FetchedBody, TransportError> {
        debug!("GET {} (first {} bytes)", url, len);
        let resp = self
            .inner
            .get(url)
            .header(RANGE, format!("bytes=0-{}", len.saturating_sub(1)))
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(url, &e))?;
        Self::read(url, resp).await
    }

    async fn probe(&self, url: &str) -> Result<(), TransportError> {
        debug!("HEAD {}", url);
        let resp = self
            .inner
            .head(url)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(url, &e))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::from_status(url, resp.status().as_u16()))
        }
    }
}
