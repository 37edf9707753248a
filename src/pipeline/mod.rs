//! Fetch cycle orchestrator: resolver → ingestion → normalize → dedup.
//!
//! ## Cycle
//!
//!   1. Ask the resolver for the endpoint table (TTL-gated re-discovery).
//!   2. Download every selected endpoint through the [`ingest::IngestionEngine`].
//!   3. Hand the updated failure counters back to the resolver.
//!   4. Normalize each payload and merge everything by symbol.
//!
//! Discovery always finishes before the first download starts.

pub mod ingest;

use crate::classifier::learning::LearningState;
use crate::error::PipelineError;
use crate::loader::{dedup::dedup, normalize};
use crate::models::{Category, EndpointDescriptor, StockRecord};
use crate::resolver::{ResolutionSource, UrlResolver};
use crate::utils::Timer;
use chrono::{DateTime, Utc};
use ingest::{IngestState, IngestionEngine, IngestionReport};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

// ── Observer ──────────────────────────────────────────────────────────────────

/// Optional hooks for metrics. Every method defaults to a no-op.
pub trait PipelineObserver: Send + Sync {
    fn on_cache_hit(&self, _category: Category) {}
    fn on_retry(&self, _category: Category, _attempt: u32) {}
    fn on_download(&self, _category: Category, _ok: bool) {}
    fn on_cache_fallback(&self, _category: Category) {}
    fn on_cycle(&self, _success: bool, _elapsed: Duration) {}
}

pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

// ── Options / results ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FetchOptions {
    pub force_refresh: bool,
    pub include_optional: bool,
}

/// Where the records of a cycle came from, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Network,
    Cache,
    Fallback,
}

#[derive(Debug)]
pub struct CycleResult {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub resolution: ResolutionSource,
    pub report: IngestionReport,
    /// Normalized record count per category, before dedup.
    pub breakdown: BTreeMap<Category, usize>,
    pub records: Vec<StockRecord>,
}

impl CycleResult {
    pub fn source(&self) -> DataSource {
        if self.report.used_cache_fallback() {
            DataSource::Fallback
        } else if self.report.all_from_cache() {
            DataSource::Cache
        } else {
            DataSource::Network
        }
    }

    /// Non-fatal per-endpoint errors, one line each.
    pub fn diagnostics(&self) -> Vec<String> {
        self.report
            .outcomes
            .iter()
            .filter_map(|o| o.error.as_ref().map(|e| format!("{}: {}", o.category(), e)))
            .collect()
    }

    pub fn has_empty_endpoints(&self) -> bool {
        self.report.outcomes.iter().any(|o| o.state == IngestState::Empty)
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

pub struct Pipeline {
    resolver: Arc<UrlResolver>,
    engine: IngestionEngine,
    learning: Arc<dyn LearningState>,
    learning_row_threshold: usize,
    observer: Arc<dyn PipelineObserver>,
}

impl Pipeline {
    pub fn new(
        resolver: Arc<UrlResolver>,
        engine: IngestionEngine,
        learning: Arc<dyn LearningState>,
        learning_row_threshold: usize,
        observer: Arc<dyn PipelineObserver>,
    ) -> Self {
        Self {
            resolver,
            engine,
            learning,
            learning_row_threshold,
            observer,
        }
    }

    pub fn resolver(&self) -> &Arc<UrlResolver> {
        &self.resolver
    }

    pub async fn run(&self, opts: FetchOptions) -> Result<CycleResult, PipelineError> {
        let timer = Timer::start("Fetch cycle");
        let result = self.run_cycle(opts).await;
        self.observer.on_cycle(result.is_ok(), timer.elapsed());
        result
    }

    async fn run_cycle(&self, opts: FetchOptions) -> Result<CycleResult, PipelineError> {
        let started_at = Utc::now();

        // ── 1. Resolve ────────────────────────────────────────────────────────
        let resolved = self.resolver.endpoints(opts.force_refresh).await;
        let selected: Vec<EndpointDescriptor> = resolved
            .endpoints
            .iter()
            .filter(|e| e.required || opts.include_optional)
            .cloned()
            .collect();
        info!(
            "=== Ingesting {} of {} endpoints (source={:?}) ===",
            selected.len(),
            resolved.endpoints.len(),
            resolved.source
        );

        // ── 2. Ingest ─────────────────────────────────────────────────────────
        let mut report = self.engine.ingest_all(&selected, opts.force_refresh).await;

        // ── 3. Write back failure counters ────────────────────────────────────
        let updated = report.endpoints();
        let table = resolved
            .endpoints
            .iter()
            .map(|e| {
                updated
                    .iter()
                    .find(|u| u.category == e.category)
                    .cloned()
                    .unwrap_or_else(|| e.clone())
            })
            .collect();
        self.resolver.replace_endpoints(table).await;

        // ── 4. Normalize ──────────────────────────────────────────────────────
        let now = Utc::now();
        let mut breakdown = BTreeMap::new();
        let mut all = Vec::new();
        for outcome in &report.outcomes {
            let url = &outcome.endpoint.url;
            if outcome.is_exhausted() {
                self.learning.remember_bad(url);
            }
            let Some(payload) = outcome.payload.as_deref() else {
                breakdown.insert(outcome.category(), 0);
                continue;
            };

            let records = normalize(payload, outcome.category(), url, now);
            if outcome.state == IngestState::Downloaded && records.len() > self.learning_row_threshold {
                self.learning.remember_good(url);
            }
            breakdown.insert(outcome.category(), records.len());
            all.extend(records);
        }

        let failed = report
            .outcomes
            .iter_mut()
            .filter(|o| o.state == IngestState::Failed)
            .find_map(|o| o.error.take());
        if let Some(err) = failed {
            warn!("Fetch cycle failed: {}", err);
            return Err(err);
        }

        let normalized = all.len();
        let records = dedup(all);
        info!(
            "=== Cycle done: {} normalized → {} unique symbols ===",
            normalized,
            records.len()
        );

        Ok(CycleResult {
            started_at,
            finished_at: Utc::now(),
            resolution: resolved.source,
            report,
            breakdown,
            records,
        })
    }
}
