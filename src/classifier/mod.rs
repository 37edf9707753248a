//! CSV classifier: category, static priority, quality score and a use/skip
//! decision for one candidate URL.
//!
//! Two stages:
//! 1. URL pattern table ([`rules::match_url`]).
//! 2. A short byte-range sample whose header row is matched against the
//!    expected header shapes. Headers only decide the category when the URL
//!    said nothing, because several categories share near-identical schemas.
//!
//! Scoring is a fixed additive table; there is no trained model behind it.

pub mod learning;
pub mod rules;

use crate::config::ClassifierConfig;
use crate::error::PipelineError;
use crate::models::{Category, CsvCandidate};
use crate::scraper::http_client::HttpFetcher;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info};

use self::learning::LearningState;

/// What the byte-range sample told us.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sample {
    pub headers: Vec<String>,
    pub estimated_rows: usize,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Below this many estimated rows a file is never used.
pub const MIN_ROWS: usize = 10;

impl Sample {
    /// Parse the head of a CSV. `total_size` is the full resource size when
    /// `body` is only a prefix; the row count is then extrapolated.
    pub fn parse(body: &str, total_size: Option<u64>, last_modified: Option<DateTime<Utc>>) -> Self {
        let trimmed = body.trim_start();
        if trimmed.starts_with('<') {
            // HTML error page served with a 200
            return Self {
                last_modified,
                ..Default::default()
            };
        }

        let partial = total_size.map(|t| (body.len() as u64) < t).unwrap_or(false);

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(body.as_bytes());

        let mut headers = Vec::new();
        let mut rows = 0usize;
        let mut last_counted = false;
        for result in reader.records() {
            let Ok(record) = result else {
                last_counted = false;
                break;
            };
            if record.iter().all(|c| c.trim().is_empty()) {
                continue;
            }
            if headers.is_empty() {
                headers = record
                    .iter()
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .collect();
                last_counted = false;
            } else {
                rows += 1;
                last_counted = true;
            }
        }

        // A prefix that stops mid-line ends in a truncated row.
        if partial && last_counted && !body.ends_with('\n') {
            rows -= 1;
        }

        let estimated_rows = match total_size {
            Some(total) if partial && !body.is_empty() => {
                ((rows as f64) * (total as f64) / (body.len() as f64)).round() as usize
            }
            _ => rows,
        };

        Self {
            headers,
            estimated_rows,
            last_modified,
        }
    }
}

pub struct CsvClassifier {
    fetcher: Arc<dyn HttpFetcher>,
    learning: Arc<dyn LearningState>,
    config: ClassifierConfig,
}

impl CsvClassifier {
    pub fn new(
        fetcher: Arc<dyn HttpFetcher>,
        learning: Arc<dyn LearningState>,
        config: ClassifierConfig,
    ) -> Self {
        Self {
            fetcher,
            learning,
            config,
        }
    }

    pub fn learning(&self) -> &Arc<dyn LearningState> {
        &self.learning
    }

    /// Fetch the first few KB of `url` and read its header row.
    pub async fn sample(&self, url: &str) -> Result<Sample, PipelineError> {
        let fetched = self
            .fetcher
            .get_range(url, self.config.sample_bytes)
            .await
            .map_err(|e| PipelineError::ClassificationFailure {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Sample::parse(
            &fetched.body,
            fetched.total_size,
            fetched.last_modified,
        ))
    }

    /// Classify one URL. Sampling failures degrade to URL-only evidence.
    pub async fn classify(&self, url: &str) -> CsvCandidate {
        let sample = match self.sample(url).await {
            Ok(s) => Some(s),
            Err(e) => {
                debug!("{}", e);
                None
            }
        };

        let candidate = self.evaluate(url, sample.as_ref(), Utc::now());

        // Opportunistic feedback, independent of what ingestion later does.
        match &sample {
            None => self.learning.remember_bad(url),
            Some(s) if s.estimated_rows < MIN_ROWS => self.learning.remember_bad(url),
            Some(s) if candidate.should_use && s.estimated_rows > self.config.learning_row_threshold => {
                self.learning.remember_good(url)
            }
            Some(_) => {}
        }

        debug!(
            "{} → {} (priority {}, quality {:.1}, use={})",
            url, candidate.category, candidate.priority, candidate.quality_score, candidate.should_use
        );
        candidate
    }

    /// Classify many URLs with at most `sample_concurrency` samples in flight.
    /// Output is sorted by URL.
    pub async fn classify_all<I>(&self, urls: I) -> Vec<CsvCandidate>
    where
        I: IntoIterator<Item = String>,
    {
        let mut out: Vec<CsvCandidate> = stream::iter(urls)
            .map(|url| async move { self.classify(&url).await })
            .buffer_unordered(self.config.sample_concurrency.max(1))
            .collect()
            .await;
        out.sort_by(|a, b| a.url.cmp(&b.url));
        info!(
            "Classified {} candidates ({} usable)",
            out.len(),
            out.iter().filter(|c| c.should_use).count()
        );
        out
    }

    /// Pure decision over already-gathered evidence.
    pub fn evaluate(&self, url: &str, sample: Option<&Sample>, now: DateTime<Utc>) -> CsvCandidate {
        let (mut category, priority) = rules::match_url(url).unwrap_or((Category::Unknown, 0));

        let headers = sample.map(|s| s.headers.clone()).unwrap_or_default();
        if priority == 0 {
            if let Some((by_header, _)) = rules::match_headers(&headers) {
                category = by_header;
            }
        }

        let quality_score = self.quality_score(url, sample, now);
        let estimated_row_count = sample.map(|s| s.estimated_rows).unwrap_or(0);
        let coverage = rules::header_coverage(category, &headers);
        let confidence = (0.6 * priority as f64 / 10.0 + 0.4 * coverage).clamp(0.0, 1.0);

        let mut candidate = CsvCandidate {
            url: url.to_string(),
            category,
            priority,
            quality_score,
            confidence,
            should_use: false,
            sampled_headers: headers,
            estimated_row_count,
        };
        candidate.should_use = self.should_use(&candidate);
        candidate
    }

    /// Additive 0–10 score from URL shape, sampled content, freshness and learning.
    pub fn quality_score(&self, url: &str, sample: Option<&Sample>, now: DateTime<Utc>) -> f64 {
        let mut q = 0.0;

        if let Some(s) = sample {
            if !s.headers.is_empty() {
                q += 3.0;
                q += (s.headers.len() as f64 / 10.0 * 2.0).min(2.0);
            }

            q += match s.estimated_rows {
                n if n > 1000 => 2.0,
                n if n > 100 => 1.5,
                n if n > 10 => 1.0,
                _ => 0.0,
            };

            if let Some(modified) = s.last_modified {
                let age = now - modified;
                if age <= chrono::Duration::days(7) {
                    q += 1.0;
                } else if age <= chrono::Duration::days(30) {
                    q += 0.5;
                }
            }
        }

        if rules::is_on_host(url, &self.config.archive_host) {
            q += 1.0;
        }
        let debt = rules::is_debt_like(url);
        if rules::is_primary_equity_file(url) {
            q += 3.0;
        } else if rules::is_equity_named(url) && !debt {
            q += 2.0;
        }
        if rules::is_securities_url(url) {
            q += 1.0;
        }
        if rules::has_listing_suffix(url) {
            q += 0.5;
        }
        if debt {
            q -= 2.0;
        }

        if self.learning.is_known_good(url) {
            q += 1.0;
        } else if self.learning.is_known_bad(url) {
            q -= 1.0;
        }

        q.clamp(0.0, 10.0)
    }

    /// Ordered rules; first match wins.
    pub fn should_use(&self, c: &CsvCandidate) -> bool {
        if c.quality_score < 3.0 {
            return false;
        }
        if c.sampled_headers.len() < 2 {
            return false;
        }
        if c.estimated_row_count < MIN_ROWS {
            return false;
        }
        if c.category == Category::Unknown {
            return false;
        }
        // Equity must never starve behind the generic thresholds.
        if c.category == Category::Equity && c.quality_score >= 5.0 {
            return true;
        }
        if c.category == Category::Debt && c.priority < 5 {
            return false;
        }
        if c.priority >= 8 {
            return true;
        }
        if c.priority >= 6 && c.quality_score >= 6.0 {
            return true;
        }
        if c.priority >= 4 && c.quality_score >= 8.0 {
            return true;
        }
        if self.learning.is_known_good(&c.url) {
            return true;
        }
        false
    }
}
