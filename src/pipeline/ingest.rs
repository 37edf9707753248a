//! Per-endpoint download state machine.
//!
//! ```text
//! PENDING → DOWNLOADING → VALIDATING → CACHED
//!               ↑    ↓
//!            RETRY_WAIT
//!                    ↓ (attempts exhausted)
//!           CACHE_FALLBACK | EMPTY (optional) | FAILED (required)
//! ```
//!
//! Endpoints run in descending priority, `concurrency` at a time; each batch
//! settles before the next one starts.

use super::PipelineObserver;
use crate::config::IngestionConfig;
use crate::error::PipelineError;
use crate::models::{CacheEntry, Category, EndpointDescriptor};
use crate::scraper::http_client::HttpFetcher;
use crate::storage::CsvCache;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_retry::Retry;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestState {
    Downloaded,
    CacheHit,
    CacheFallback,
    /// Optional endpoint with nothing to serve.
    Empty,
    /// Required endpoint with nothing to serve.
    Failed,
}

#[derive(Debug)]
pub struct EndpointOutcome {
    /// Descriptor with its failure counter already updated.
    pub endpoint: EndpointDescriptor,
    pub state: IngestState,
    pub attempts: u32,
    pub payload: Option<String>,
    pub error: Option<PipelineError>,
}

impl EndpointOutcome {
    pub fn category(&self) -> Category {
        self.endpoint.category
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(
            self.state,
            IngestState::CacheFallback | IngestState::Empty | IngestState::Failed
        )
    }
}

#[derive(Debug, Default)]
pub struct IngestionReport {
    /// In processing order.
    pub outcomes: Vec<EndpointOutcome>,
}

impl IngestionReport {
    /// The first required endpoint that ended with nothing to serve.
    pub fn fatal(&self) -> Option<&PipelineError> {
        self.outcomes
            .iter()
            .filter(|o| o.state == IngestState::Failed)
            .find_map(|o| o.error.as_ref())
    }

    pub fn endpoints(&self) -> Vec<EndpointDescriptor> {
        self.outcomes.iter().map(|o| o.endpoint.clone()).collect()
    }

    pub fn used_cache_fallback(&self) -> bool {
        self.outcomes.iter().any(|o| o.state == IngestState::CacheFallback)
    }

    pub fn all_from_cache(&self) -> bool {
        !self.outcomes.is_empty()
            && self
                .outcomes
                .iter()
                .filter(|o| o.payload.is_some())
                .all(|o| o.state == IngestState::CacheHit)
    }
}

// ── Validation / backoff ──────────────────────────────────────────────────────

/// At least a header plus one data line, and a header of three or more fields.
pub fn validate_payload(url: &str, body: &str) -> Result<(), PipelineError> {
    let mut lines = body.lines().filter(|l| !l.trim().is_empty());
    let header = lines
        .next()
        .ok_or_else(|| PipelineError::Validation(format!("{url}: empty payload")))?;
    if lines.next().is_none() {
        return Err(PipelineError::Validation(format!("{url}: header only")));
    }
    let fields = header.split(',').count();
    if fields < 3 {
        return Err(PipelineError::Validation(format!(
            "{url}: header has {fields} fields"
        )));
    }
    Ok(())
}

/// Waits between attempts: `min(base * 2^n + jitter, cap)`, one fewer than
/// the attempt budget.
pub fn backoff_delays(config: &IngestionConfig) -> impl Iterator<Item = Duration> {
    let base = config.base_delay_ms as f64;
    let cap = config.cap_delay_ms as f64;
    let jitter = config.jitter_ms as f64;
    (0..config.max_retries.saturating_sub(1)).map(move |n| {
        let exp = base * 2f64.powi(n as i32);
        let delay = (exp + rand::random::<f64>() * jitter).min(cap);
        Duration::from_millis(delay as u64)
    })
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub struct IngestionEngine {
    fetcher: Arc<dyn HttpFetcher>,
    cache: Arc<dyn CsvCache>,
    config: IngestionConfig,
    observer: Arc<dyn PipelineObserver>,
}

impl IngestionEngine {
    pub fn new(
        fetcher: Arc<dyn HttpFetcher>,
        cache: Arc<dyn CsvCache>,
        config: IngestionConfig,
        observer: Arc<dyn PipelineObserver>,
    ) -> Self {
        Self {
            fetcher,
            cache,
            config,
            observer,
        }
    }

    pub async fn ingest_all(&self, endpoints: &[EndpointDescriptor], force_refresh: bool) -> IngestionReport {
        let mut ordered = endpoints.to_vec();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut report = IngestionReport::default();
        for batch in ordered.chunks(self.config.concurrency.max(1)) {
            let settled = join_all(batch.iter().map(|e| self.ingest_one(e, force_refresh))).await;
            report.outcomes.extend(settled);
        }
        report
    }

    pub async fn ingest_one(&self, endpoint: &EndpointDescriptor, force_refresh: bool) -> EndpointOutcome {
        let mut endpoint = endpoint.clone();
        let cached = self.cached(&endpoint.cache_key);

        if !force_refresh {
            if let Some(entry) = cached.as_ref() {
                if entry.is_valid(Utc::now(), self.config.cache_max_age()) {
                    debug!("{}: fresh cache ({} lines)", endpoint.category, entry.line_count);
                    self.observer.on_cache_hit(endpoint.category);
                    return EndpointOutcome {
                        endpoint,
                        state: IngestState::CacheHit,
                        attempts: 0,
                        payload: Some(entry.raw_payload.clone()),
                        error: None,
                    };
                }
            }
        }

        let attempts = AtomicU32::new(0);
        let category = endpoint.category;
        let url = endpoint.url.clone();
        let result = Retry::start(backoff_delays(&self.config), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n > 1 {
                self.observer.on_retry(category, n);
            }
            self.download(&url)
        })
        .await;
        let attempts = attempts.into_inner();

        match result {
            Ok(body) => {
                let entry = CacheEntry::from_payload(body, Utc::now());
                if let Err(e) = self.cache.put(&endpoint.cache_key, &entry) {
                    warn!("{}: cache write failed: {:#}", category, e);
                }
                info!(
                    "{}: downloaded {} lines ({} bytes, attempt {})",
                    category, entry.line_count, entry.size_bytes, attempts
                );
                self.observer.on_download(category, true);
                endpoint.consecutive_failures = 0;
                EndpointOutcome {
                    endpoint,
                    state: IngestState::Downloaded,
                    attempts,
                    payload: Some(entry.raw_payload),
                    error: None,
                }
            }
            Err(e) => {
                self.observer.on_download(category, false);
                endpoint.consecutive_failures += 1;
                let reason = e.to_string();

                if let Some(entry) = cached {
                    warn!(
                        "{}: {} attempts failed ({}); serving cache from {}",
                        category, attempts, reason, entry.timestamp
                    );
                    self.observer.on_cache_fallback(category);
                    return EndpointOutcome {
                        endpoint,
                        state: IngestState::CacheFallback,
                        attempts,
                        payload: Some(entry.raw_payload),
                        error: Some(e),
                    };
                }

                if endpoint.required {
                    warn!("{}: required endpoint exhausted: {}", category, reason);
                    EndpointOutcome {
                        endpoint,
                        state: IngestState::Failed,
                        attempts,
                        payload: None,
                        error: Some(PipelineError::RequiredEndpointExhausted {
                            category,
                            attempts,
                            reason,
                        }),
                    }
                } else {
                    warn!("{}: optional endpoint left empty: {}", category, reason);
                    EndpointOutcome {
                        endpoint,
                        state: IngestState::Empty,
                        attempts,
                        payload: None,
                        error: Some(PipelineError::OptionalEndpointExhausted {
                            category,
                            attempts,
                            reason,
                        }),
                    }
                }
            }
        }
    }

    async fn download(&self, url: &str) -> Result<String, PipelineError> {
        let fetched = self.fetcher.get_text(url).await.map_err(|e| {
            debug!("{}", e);
            PipelineError::from(e)
        })?;
        validate_payload(url, &fetched.body)?;
        Ok(fetched.body)
    }

    fn cached(&self, key: &str) -> Option<CacheEntry> {
        match self.cache.get(key) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("cache read for {} failed: {:#}", key, e);
                None
            }
        }
    }
}
