//! Query / health facade over the merged record set.
//!
//! The merged set is rebuilt wholesale by each successful fetch cycle and
//! swapped in behind a lock; readers never see a half-built set.

pub mod metrics;

use crate::classifier::CsvClassifier;
use crate::classifier::learning::{InMemoryLearning, LearningSnapshot, LearningState};
use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::models::{Category, CycleMetadata, SearchOptions, StockRecord};
use crate::pipeline::ingest::IngestionEngine;
use crate::pipeline::{DataSource, FetchOptions, Pipeline, PipelineObserver};
use crate::resolver::{DiscoveryReport, ResolvedEndpoints, UrlResolver};
use crate::scraper::PageCrawler;
use crate::scraper::http_client::{HttpClient, HttpFetcher};
use crate::storage::memory::{MemoryCsvCache, RecordCache};
use crate::storage::{CsvCache, RecordStore, Repository};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use metrics::{Metrics, MetricsSnapshot};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{info, warn};

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct FetchResponse {
    pub success: bool,
    pub message: String,
    pub source: Option<DataSource>,
    pub count: usize,
    pub breakdown: BTreeMap<Category, usize>,
    pub records: Vec<StockRecord>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CsvCacheStatus {
    pub key: String,
    pub timestamp: DateTime<Utc>,
    pub age_secs: i64,
    pub size_bytes: usize,
    pub line_count: usize,
    pub checksum: String,
    pub valid: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordSetStatus {
    pub count: usize,
    pub loaded_at: DateTime<Utc>,
    pub source: DataSource,
    pub fresh: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub csv: Vec<CsvCacheStatus>,
    pub records: Option<RecordSetStatus>,
    pub fast_cache_entries: usize,
    pub endpoints: Option<ResolvedEndpoints>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealth {
    pub category: Category,
    pub url: String,
    pub required: bool,
    pub consecutive_failures: u32,
    pub retries: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastCycle {
    pub at: DateTime<Utc>,
    pub success: bool,
    /// Fallback data served or an optional endpoint left empty.
    pub degraded: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: Health,
    pub record_count: usize,
    pub last_cycle: Option<LastCycle>,
    pub metrics: MetricsSnapshot,
    pub endpoints: Vec<EndpointHealth>,
    pub learning: LearningSnapshot,
}

struct MergedSet {
    records: Arc<Vec<StockRecord>>,
    breakdown: BTreeMap<Category, usize>,
    loaded_at: DateTime<Utc>,
    source: DataSource,
    include_optional: bool,
}

// ── Search ranking ────────────────────────────────────────────────────────────

/// Exact symbol, then symbol prefix, then symbol substring, then name
/// substring. `query` is expected uppercased.
pub fn rank_matches(records: &[StockRecord], query: &str, opts: &SearchOptions) -> Vec<StockRecord> {
    let mut hits: Vec<(u8, &StockRecord)> = records
        .iter()
        .filter_map(|r| {
            let tier = if r.symbol == query {
                0
            } else if opts.exact_match {
                return None;
            } else if r.symbol.starts_with(query) {
                1
            } else if r.symbol.contains(query) {
                2
            } else if r.name.to_uppercase().contains(query) {
                3
            } else {
                return None;
            };
            Some((tier, r))
        })
        .collect();
    hits.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.symbol.cmp(&b.1.symbol)));
    hits.into_iter()
        .take(opts.limit)
        .map(|(_, r)| r.clone())
        .collect()
}

// ── Service ───────────────────────────────────────────────────────────────────

pub struct StockService {
    pipeline: Pipeline,
    resolver: Arc<UrlResolver>,
    learning: Arc<dyn LearningState>,
    csv_cache: Arc<dyn CsvCache>,
    store: Option<Arc<dyn RecordStore>>,
    record_cache: RecordCache,
    record_ttl: chrono::Duration,
    cache_max_age: chrono::Duration,
    metrics: Arc<Metrics>,
    merged: RwLock<Option<Arc<MergedSet>>>,
    last_cycle: RwLock<Option<LastCycle>>,
}

impl StockService {
    /// Wire the whole pipeline over the given collaborators.
    pub fn build(
        config: &AppConfig,
        fetcher: Arc<dyn HttpFetcher>,
        csv_cache: Arc<dyn CsvCache>,
        store: Option<Arc<dyn RecordStore>>,
    ) -> Result<Self> {
        let learning: Arc<dyn LearningState> = Arc::new(InMemoryLearning::new());
        let metrics = Arc::new(Metrics::new());
        let observer: Arc<dyn PipelineObserver> = metrics.clone();

        let crawler = PageCrawler::new(fetcher.clone(), &config.crawler)?;
        let classifier = Arc::new(CsvClassifier::new(
            fetcher.clone(),
            learning.clone(),
            config.classifier.clone(),
        ));
        let resolver = Arc::new(UrlResolver::new(
            crawler,
            classifier,
            fetcher.clone(),
            config.crawler.listing_pages.clone(),
            config.resolver.clone(),
        ));
        let engine = IngestionEngine::new(
            fetcher,
            csv_cache.clone(),
            config.ingestion.clone(),
            observer.clone(),
        );
        let pipeline = Pipeline::new(
            resolver.clone(),
            engine,
            learning.clone(),
            config.classifier.learning_row_threshold,
            observer,
        );

        Ok(Self {
            pipeline,
            resolver,
            learning,
            csv_cache,
            store,
            record_cache: RecordCache::new(config.storage.record_cache_ttl()),
            record_ttl: config.storage.record_cache_ttl(),
            cache_max_age: config.ingestion.cache_max_age(),
            metrics,
            merged: RwLock::new(None),
            last_cycle: RwLock::new(None),
        })
    }

    /// Production wiring: reqwest client plus the DuckDB repository. An
    /// unreachable database degrades to in-memory caching only.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let fetcher: Arc<dyn HttpFetcher> =
            Arc::new(HttpClient::new(&config.http).context("Failed to build HTTP client")?);

        match Self::open_repository(config) {
            Ok(repo) => {
                let repo = Arc::new(repo);
                let store: Arc<dyn RecordStore> = repo.clone();
                Self::build(config, fetcher, repo, Some(store))
            }
            Err(e) => {
                warn!("{}", PipelineError::StorageUnavailable(format!("{e:#}")));
                Self::build(config, fetcher, Arc::new(MemoryCsvCache::new()), None)
            }
        }
    }

    fn open_repository(config: &AppConfig) -> Result<Repository> {
        let repo = Repository::open(&config.storage.db_path)?;
        if config.storage.run_migrations {
            repo.run_migrations()?;
        }
        Ok(repo)
    }

    fn merged(&self) -> Option<Arc<MergedSet>> {
        self.merged.read().ok()?.clone()
    }

    fn set_last_cycle(&self, cycle: LastCycle) {
        if let Ok(mut last) = self.last_cycle.write() {
            *last = Some(cycle);
        }
    }

    // ── Fetch ─────────────────────────────────────────────────────────────────

    pub async fn fetch_all(&self, opts: FetchOptions) -> FetchResponse {
        let started = Instant::now();
        let started_at = Utc::now();

        if !opts.force_refresh {
            if let Some(set) = self.merged() {
                let fresh = Utc::now() - set.loaded_at < self.record_ttl;
                if fresh && (set.include_optional || !opts.include_optional) {
                    return FetchResponse {
                        success: true,
                        message: format!("Served {} records from the record cache", set.records.len()),
                        source: Some(DataSource::Cache),
                        count: set.records.len(),
                        breakdown: set.breakdown.clone(),
                        records: set.records.to_vec(),
                        error: None,
                        duration_ms: started.elapsed().as_millis() as u64,
                        timestamp: Utc::now(),
                    };
                }
            }
        }

        let cycle = match self.pipeline.run(opts).await {
            Ok(cycle) => cycle,
            Err(e) => {
                let message = e.to_string();
                let finished_at = Utc::now();
                self.log_failed_cycle(&CycleMetadata {
                    started_at,
                    finished_at,
                    success: false,
                    source: "none".to_string(),
                    record_count: 0,
                    breakdown: BTreeMap::new(),
                    error: Some(message.clone()),
                });
                self.set_last_cycle(LastCycle {
                    at: finished_at,
                    success: false,
                    degraded: true,
                    error: Some(message.clone()),
                });
                return FetchResponse {
                    success: false,
                    message: "Fetch cycle failed".to_string(),
                    source: None,
                    count: 0,
                    breakdown: BTreeMap::new(),
                    records: vec![],
                    error: Some(message),
                    duration_ms: started.elapsed().as_millis() as u64,
                    timestamp: Utc::now(),
                };
            }
        };

        let source = cycle.source();
        let mut diagnostics = cycle.diagnostics();
        let degraded = source == DataSource::Fallback || cycle.has_empty_endpoints();
        let records = Arc::new(cycle.records);
        let now = Utc::now();

        self.record_cache.put_all(&records, now);

        let meta = CycleMetadata {
            started_at: cycle.started_at,
            finished_at: cycle.finished_at,
            success: true,
            source: format!("{source:?}").to_lowercase(),
            record_count: records.len(),
            breakdown: cycle.breakdown.clone(),
            error: (!diagnostics.is_empty()).then(|| diagnostics.join("; ")),
        };
        if let Some(err) = self.persist(&records, &meta) {
            diagnostics.push(err.to_string());
        }

        if let Ok(mut merged) = self.merged.write() {
            *merged = Some(Arc::new(MergedSet {
                records: records.clone(),
                breakdown: cycle.breakdown.clone(),
                loaded_at: now,
                source,
                include_optional: opts.include_optional,
            }));
        }

        let error = (!diagnostics.is_empty()).then(|| diagnostics.join("; "));
        self.set_last_cycle(LastCycle {
            at: now,
            success: true,
            degraded,
            error: error.clone(),
        });

        FetchResponse {
            success: true,
            message: format!(
                "Fetched {} records ({} endpoint tables, resolution {:?})",
                records.len(),
                cycle.breakdown.len(),
                cycle.resolution
            ),
            source: Some(source),
            count: records.len(),
            breakdown: cycle.breakdown,
            records: records.to_vec(),
            error,
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: now,
        }
    }

    pub async fn force_refresh(&self) -> FetchResponse {
        self.fetch_all(FetchOptions {
            force_refresh: true,
            include_optional: true,
        })
        .await
    }

    /// Best-effort write to the persistent store.
    fn persist(&self, records: &[StockRecord], meta: &CycleMetadata) -> Option<PipelineError> {
        let store = self.store.as_ref()?;
        match store.put(records, meta) {
            Ok(n) => {
                info!("Persisted {} records", n);
                None
            }
            Err(e) => {
                let err = PipelineError::StorageUnavailable(format!("{e:#}"));
                warn!("{}", err);
                Some(err)
            }
        }
    }

    fn log_failed_cycle(&self, meta: &CycleMetadata) {
        if let Some(store) = self.store.as_ref() {
            if let Err(e) = store.record_cycle(meta) {
                warn!("{}", PipelineError::StorageUnavailable(format!("{e:#}")));
            }
        }
    }

    /// Last cycle run by this process, else the last one the store logged.
    fn last_known_cycle(&self) -> Option<(LastCycle, Option<usize>)> {
        if let Some(cycle) = self.last_cycle.read().ok().and_then(|l| l.clone()) {
            return Some((cycle, None));
        }
        let stored = match self.store.as_ref()?.last_cycle() {
            Ok(stored) => stored?,
            Err(e) => {
                warn!("{}", PipelineError::StorageUnavailable(format!("{e:#}")));
                return None;
            }
        };
        let cycle = LastCycle {
            at: stored.finished_at,
            success: stored.success,
            degraded: !stored.success
                || stored.source == "fallback"
                || stored.error.is_some(),
            error: stored.error,
        };
        Some((cycle, Some(stored.record_count)))
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn search(&self, query: &str, opts: &SearchOptions) -> Vec<StockRecord> {
        let q = query.trim().to_uppercase();
        if q.is_empty() {
            return vec![];
        }
        if let Some(set) = self.merged() {
            return rank_matches(&set.records, &q, opts);
        }
        match self.store.as_ref().map(|s| s.search(&q, opts)) {
            Some(Ok(records)) => records,
            Some(Err(e)) => {
                warn!("{}", PipelineError::StorageUnavailable(format!("{e:#}")));
                vec![]
            }
            None => vec![],
        }
    }

    /// Fast cache, then the merged set, then the persistent store.
    pub fn get_by_symbol(&self, symbol: &str) -> Option<StockRecord> {
        let key = symbol.trim().to_uppercase();
        if key.is_empty() {
            return None;
        }
        if let Some(r) = self.record_cache.get_symbol(&key, Utc::now()) {
            return Some(r);
        }
        if let Some(set) = self.merged() {
            if let Ok(i) = set.records.binary_search_by(|r| r.symbol.as_str().cmp(&key)) {
                return Some(set.records[i].clone());
            }
        }
        match self.store.as_ref()?.get(&key) {
            Ok(r) => r,
            Err(e) => {
                warn!("{}", PipelineError::StorageUnavailable(format!("{e:#}")));
                None
            }
        }
    }

    /// All records of one category, sorted by symbol. Same lookup order as
    /// [`Self::get_by_symbol`].
    pub fn get_by_category(&self, category: Category) -> Vec<StockRecord> {
        if let Some(mut records) = self.record_cache.get_category(category, Utc::now()) {
            records.sort_by(|a, b| a.symbol.cmp(&b.symbol));
            return records;
        }
        if let Some(set) = self.merged() {
            return set
                .records
                .iter()
                .filter(|r| r.category == category)
                .cloned()
                .collect();
        }
        match self.store.as_ref().map(|s| s.by_category(category)) {
            Some(Ok(records)) => records,
            Some(Err(e)) => {
                warn!("{}", PipelineError::StorageUnavailable(format!("{e:#}")));
                vec![]
            }
            None => vec![],
        }
    }

    pub async fn discover(&self, force: bool) -> DiscoveryReport {
        if !force {
            if let Some(resolved) = self.resolver.fresh().await {
                return DiscoveryReport {
                    crawl_outcome: None,
                    candidates: vec![],
                    resolved,
                    error: None,
                };
            }
        }
        self.resolver.discover().await
    }

    // ── Status ────────────────────────────────────────────────────────────────

    pub async fn get_cache_status(&self) -> CacheStatus {
        let now = Utc::now();
        let csv = match self.csv_cache.list() {
            Ok(entries) => entries
                .into_iter()
                .map(|(key, e)| CsvCacheStatus {
                    key,
                    timestamp: e.timestamp,
                    age_secs: e.age(now).num_seconds(),
                    size_bytes: e.size_bytes,
                    line_count: e.line_count,
                    valid: e.is_valid(now, self.cache_max_age),
                    checksum: e.checksum,
                })
                .collect(),
            Err(e) => {
                warn!("Could not list CSV cache: {:#}", e);
                vec![]
            }
        };

        CacheStatus {
            csv,
            records: self.merged().map(|set| RecordSetStatus {
                count: set.records.len(),
                loaded_at: set.loaded_at,
                source: set.source,
                fresh: now - set.loaded_at < self.record_ttl,
            }),
            fast_cache_entries: self.record_cache.len(),
            endpoints: self.resolver.current().await,
        }
    }

    pub async fn get_health_status(&self) -> HealthStatus {
        let metrics = self.metrics.snapshot();
        let (last_cycle, stored_count) = self.last_known_cycle().unzip();
        let record_count = self
            .merged()
            .map(|s| s.records.len())
            .or(stored_count.flatten())
            .unwrap_or(0);

        let status = match &last_cycle {
            None => Health::Unhealthy,
            Some(c) if !c.success => Health::Unhealthy,
            Some(c) if c.degraded => Health::Degraded,
            Some(_) => Health::Healthy,
        };

        let endpoints = self
            .resolver
            .current()
            .await
            .map(|r| r.endpoints)
            .unwrap_or_default()
            .into_iter()
            .map(|e| EndpointHealth {
                retries: metrics.retries.get(&e.category).copied().unwrap_or(0),
                category: e.category,
                url: e.url,
                required: e.required,
                consecutive_failures: e.consecutive_failures,
            })
            .collect();

        HealthStatus {
            status,
            record_count,
            last_cycle,
            metrics,
            endpoints,
            learning: self.learning.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CacheEntry;
    use crate::pipeline::tests::{EQUITY_CSV, PAGE, SME_CSV, equity_url, fast_ingestion, sme_url};
    use crate::scraper::http_client::testing::StubFetcher;
    use anyhow::anyhow;

    struct DownStore;

    impl RecordStore for DownStore {
        fn put(&self, _records: &[StockRecord], _cycle: &CycleMetadata) -> Result<usize> {
            Err(anyhow!("connection refused"))
        }
        fn get(&self, _symbol: &str) -> Result<Option<StockRecord>> {
            Err(anyhow!("connection refused"))
        }
        fn search(&self, _query: &str, _opts: &SearchOptions) -> Result<Vec<StockRecord>> {
            Err(anyhow!("connection refused"))
        }
        fn by_category(&self, _category: Category) -> Result<Vec<StockRecord>> {
            Err(anyhow!("connection refused"))
        }
        fn record_cycle(&self, _cycle: &CycleMetadata) -> Result<()> {
            Err(anyhow!("connection refused"))
        }
        fn last_cycle(&self) -> Result<Option<CycleMetadata>> {
            Err(anyhow!("connection refused"))
        }
    }

    fn memory_repo() -> Arc<Repository> {
        let repo = Arc::new(Repository::open_in_memory().unwrap());
        repo.run_migrations().unwrap();
        repo
    }

    fn config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.crawler.listing_pages = vec![PAGE.to_string()];
        cfg.resolver.volatile_categories = vec![];
        cfg.ingestion = fast_ingestion();
        cfg
    }

    fn service(
        fetcher: StubFetcher,
        cache: Arc<dyn CsvCache>,
        store: Option<Arc<dyn RecordStore>>,
    ) -> StockService {
        StockService::build(&config(), Arc::new(fetcher), cache, store).unwrap()
    }

    fn healthy_fetcher() -> StubFetcher {
        StubFetcher::new()
            .ok(&equity_url(), EQUITY_CSV)
            .ok(&sme_url(), SME_CSV)
    }

    fn record(symbol: &str, name: &str) -> StockRecord {
        StockRecord {
            symbol: symbol.into(),
            name: name.into(),
            series: Some("EQ".into()),
            listing_date: None,
            isin: None,
            face_value: None,
            market_lot: None,
            category: Category::Equity,
            source: "test".into(),
            last_updated: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_get_by_symbol_after_fetch_is_uppercase() {
        let repo = memory_repo();
        let store: Arc<dyn RecordStore> = repo.clone();
        let svc = service(healthy_fetcher(), Arc::new(MemoryCsvCache::new()), Some(store));

        let resp = svc
            .fetch_all(FetchOptions {
                force_refresh: false,
                include_optional: true,
            })
            .await;
        assert!(resp.success);
        assert_eq!(resp.source, Some(DataSource::Network));
        assert_eq!(resp.count, 3);

        for s in ["abc", "Def", " ghi "] {
            let r = svc.get_by_symbol(s).unwrap();
            assert_eq!(r.symbol, s.trim().to_uppercase());
        }
        assert!(svc.get_by_symbol("NOPE").is_none());
        assert_eq!(repo.list_symbols().unwrap(), vec!["ABC", "DEF", "GHI"]);
    }

    #[tokio::test]
    async fn test_get_by_category_cache_then_store() {
        let repo = memory_repo();
        let store: Arc<dyn RecordStore> = repo.clone();
        let svc = service(healthy_fetcher(), Arc::new(MemoryCsvCache::new()), Some(store.clone()));
        assert!(svc.get_by_category(Category::Sme).is_empty());

        svc.fetch_all(FetchOptions {
            force_refresh: false,
            include_optional: true,
        })
        .await;
        let symbols = |records: Vec<StockRecord>| -> Vec<String> {
            records.into_iter().map(|r| r.symbol).collect()
        };
        assert_eq!(symbols(svc.get_by_category(Category::Equity)), vec!["ABC", "DEF"]);
        assert_eq!(symbols(svc.get_by_category(Category::Sme)), vec!["GHI"]);
        assert!(svc.get_by_category(Category::Etf).is_empty());

        // A fresh service with nothing in memory reads the store.
        let cold = service(StubFetcher::new(), Arc::new(MemoryCsvCache::new()), Some(store));
        assert_eq!(symbols(cold.get_by_category(Category::Sme)), vec!["GHI"]);
    }

    #[tokio::test]
    async fn test_required_failure_without_cache_is_unsuccessful() {
        let fetcher = StubFetcher::new().fail(&equity_url(), 503);
        let svc = service(fetcher, Arc::new(MemoryCsvCache::new()), None);

        let resp = svc.fetch_all(FetchOptions::default()).await;
        assert!(!resp.success);
        assert_eq!(resp.count, 0);
        assert!(resp.error.unwrap().contains("equity"));
        assert_eq!(svc.get_health_status().await.status, Health::Unhealthy);
    }

    #[tokio::test]
    async fn test_stale_cache_reports_fallback() {
        let cache = Arc::new(MemoryCsvCache::new());
        let stale = Utc::now() - chrono::Duration::days(2);
        cache
            .put("nse_equity_csv", &CacheEntry::from_payload(EQUITY_CSV.into(), stale))
            .unwrap();
        let fetcher = StubFetcher::new().fail(&equity_url(), 503);
        let svc = service(fetcher, cache, None);

        let resp = svc.fetch_all(FetchOptions::default()).await;
        assert!(resp.success);
        assert_eq!(resp.source, Some(DataSource::Fallback));
        assert_eq!(resp.count, 2);
        assert!(resp.error.is_some());

        let health = svc.get_health_status().await;
        assert_eq!(health.status, Health::Degraded);
        assert_eq!(health.metrics.cache_fallbacks, 1);
        assert_eq!(health.metrics.retries.get(&Category::Equity), Some(&1));
    }

    #[tokio::test]
    async fn test_store_outage_does_not_fail_cycle() {
        let store: Arc<dyn RecordStore> = Arc::new(DownStore);
        let svc = service(healthy_fetcher(), Arc::new(MemoryCsvCache::new()), Some(store));

        let resp = svc.fetch_all(FetchOptions::default()).await;
        assert!(resp.success);
        assert_eq!(resp.count, 2);
        assert!(resp.error.unwrap().contains("storage unavailable"));
        assert!(svc.get_by_symbol("ABC").is_some());
    }

    #[tokio::test]
    async fn test_record_set_reused_within_ttl() {
        let svc = service(healthy_fetcher(), Arc::new(MemoryCsvCache::new()), None);

        let first = svc.fetch_all(FetchOptions::default()).await;
        assert_eq!(first.source, Some(DataSource::Network));
        let second = svc.fetch_all(FetchOptions::default()).await;
        assert_eq!(second.source, Some(DataSource::Cache));
        assert_eq!(second.count, first.count);

        // Asking for more than the cached set holds triggers a cycle.
        let wider = svc
            .fetch_all(FetchOptions {
                force_refresh: false,
                include_optional: true,
            })
            .await;
        assert_ne!(wider.source, Some(DataSource::Cache));
        assert_eq!(wider.count, 3);
    }

    #[tokio::test]
    async fn test_health_and_cache_status() {
        let svc = service(healthy_fetcher(), Arc::new(MemoryCsvCache::new()), None);
        assert_eq!(svc.get_health_status().await.status, Health::Unhealthy);

        svc.fetch_all(FetchOptions::default()).await;
        let health = svc.get_health_status().await;
        assert_eq!(health.status, Health::Healthy);
        assert_eq!(health.record_count, 2);
        assert_eq!(health.metrics.success_rate, 1.0);

        // ETF and friends 404 on the stub, leaving optional endpoints empty.
        let resp = svc.force_refresh().await;
        assert!(resp.success);
        assert_eq!(svc.get_health_status().await.status, Health::Degraded);

        let status = svc.get_cache_status().await;
        let keys: Vec<&str> = status.csv.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["nse_equity_csv", "nse_sme_csv"]);
        assert!(status.csv.iter().all(|c| c.valid));
        assert_eq!(status.records.unwrap().count, 3);
        assert_eq!(status.endpoints.unwrap().endpoints.len(), 5);
    }

    #[tokio::test]
    async fn test_health_in_new_process_reads_logged_cycle() {
        let repo = memory_repo();
        let store: Arc<dyn RecordStore> = repo.clone();
        let first = service(healthy_fetcher(), repo.clone(), Some(store.clone()));
        assert!(first.fetch_all(FetchOptions::default()).await.success);

        // A second service over the same database has run no cycle itself.
        let second = service(StubFetcher::new(), repo.clone(), Some(store));
        let health = second.get_health_status().await;
        assert_eq!(health.status, Health::Healthy);
        assert_eq!(health.metrics.cycles, 0);
        assert_eq!(health.record_count, 2);
        assert!(health.last_cycle.unwrap().success);
    }

    #[tokio::test]
    async fn test_failed_cycle_is_logged_for_later_health_checks() {
        let repo = memory_repo();
        let store: Arc<dyn RecordStore> = repo.clone();
        let fetcher = StubFetcher::new().fail(&equity_url(), 503);
        let svc = service(fetcher, repo.clone(), Some(store.clone()));
        assert!(!svc.fetch_all(FetchOptions::default()).await.success);

        let later = service(StubFetcher::new(), repo.clone(), Some(store));
        let health = later.get_health_status().await;
        assert_eq!(health.status, Health::Unhealthy);
        assert!(health.last_cycle.unwrap().error.unwrap().contains("equity"));
        assert_eq!(repo.stats().unwrap().cycles, 1);
    }

    #[tokio::test]
    async fn test_health_with_store_outage_and_no_cycle() {
        let store: Arc<dyn RecordStore> = Arc::new(DownStore);
        let svc = service(healthy_fetcher(), Arc::new(MemoryCsvCache::new()), Some(store));
        let health = svc.get_health_status().await;
        assert_eq!(health.status, Health::Unhealthy);
        assert!(health.last_cycle.is_none());
    }

    #[test]
    fn test_search_ranking() {
        let records = vec![
            record("BANKBEES", "Nippon India ETF Bank BeES"),
            record("AXISBANK", "Axis Bank Limited"),
            record("BANK", "Plain Bank Ltd"),
            record("HDFC", "HDFC Bank Limited"),
            record("TCS", "Tata Consultancy Services"),
        ];
        let opts = SearchOptions::default();
        let hits: Vec<String> = rank_matches(&records, "BANK", &opts)
            .into_iter()
            .map(|r| r.symbol)
            .collect();
        assert_eq!(hits, vec!["BANK", "BANKBEES", "AXISBANK", "HDFC"]);

        let exact = SearchOptions {
            exact_match: true,
            ..SearchOptions::default()
        };
        assert_eq!(rank_matches(&records, "BANK", &exact).len(), 1);

        let limited = SearchOptions {
            limit: 2,
            ..SearchOptions::default()
        };
        assert_eq!(rank_matches(&records, "BANK", &limited).len(), 2);
    }

    #[tokio::test]
    async fn test_search_through_service_is_case_insensitive() {
        let svc = service(healthy_fetcher(), Arc::new(MemoryCsvCache::new()), None);
        assert!(svc.search("abc", &SearchOptions::default()).is_empty());
        svc.fetch_all(FetchOptions::default()).await;
        let hits = svc.search("motors", &SearchOptions::default());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].symbol, "DEF");
    }
}
