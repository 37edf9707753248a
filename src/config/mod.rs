use crate::models::Category;
use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Shared HTTP client settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_referer")]
    pub referer: String,
}

/// Page crawler configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CrawlerConfig {
    #[serde(default = "default_listing_pages")]
    pub listing_pages: Vec<String>,

    /// Base that relative CSV links are resolved against.
    #[serde(default = "default_archive_base")]
    pub archive_base: String,
}

/// CSV classifier configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_sample_bytes")]
    pub sample_bytes: u64,

    #[serde(default = "default_sample_concurrency")]
    pub sample_concurrency: usize,

    /// Rows above which an accepted URL is remembered as high quality.
    #[serde(default = "default_learning_row_threshold")]
    pub learning_row_threshold: usize,

    #[serde(default = "default_archive_host")]
    pub archive_host: String,
}

/// URL resolver configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResolverConfig {
    #[serde(default = "default_discovery_ttl_secs")]
    pub discovery_ttl_secs: u64,

    #[serde(default = "default_volatile_categories")]
    pub volatile_categories: Vec<Category>,

    #[serde(default = "default_alternates")]
    pub alternates: BTreeMap<Category, Vec<String>>,
}

/// Ingestion engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestionConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_cap_delay_ms")]
    pub cap_delay_ms: u64,

    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_cache_max_age_secs")]
    pub cache_max_age_secs: u64,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_true")]
    pub run_migrations: bool,

    #[serde(default = "default_record_cache_ttl_secs")]
    pub record_cache_ttl_secs: u64,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_timeout_secs() -> u64 {
    30
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36".to_string()
}
fn default_referer() -> String {
    "https://www.nseindia.com/".to_string()
}
fn default_listing_pages() -> Vec<String> {
    vec!["https://www.nseindia.com/market-data/securities-available-for-trading".to_string()]
}
fn default_archive_base() -> String {
    "https://nsearchives.nseindia.com/".to_string()
}
fn default_sample_bytes() -> u64 {
    8192
}
fn default_sample_concurrency() -> usize {
    4
}
fn default_learning_row_threshold() -> usize {
    100
}
fn default_archive_host() -> String {
    "nsearchives.nseindia.com".to_string()
}
fn default_discovery_ttl_secs() -> u64 {
    24 * 60 * 60
}
fn default_volatile_categories() -> Vec<Category> {
    vec![Category::Sme]
}
fn default_alternates() -> BTreeMap<Category, Vec<String>> {
    BTreeMap::from([(
        Category::Sme,
        vec!["https://archives.nseindia.com/emerge/corporates/content/SME_EQUITY_L.csv".to_string()],
    )])
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_cap_delay_ms() -> u64 {
    10_000
}
fn default_jitter_ms() -> u64 {
    500
}
fn default_concurrency() -> usize {
    3
}
fn default_cache_max_age_secs() -> u64 {
    60 * 60
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/nse.duckdb")
}
fn default_true() -> bool {
    true
}
fn default_record_cache_ttl_secs() -> u64 {
    15 * 60
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            referer: default_referer(),
        }
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            listing_pages: default_listing_pages(),
            archive_base: default_archive_base(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            sample_bytes: default_sample_bytes(),
            sample_concurrency: default_sample_concurrency(),
            learning_row_threshold: default_learning_row_threshold(),
            archive_host: default_archive_host(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            discovery_ttl_secs: default_discovery_ttl_secs(),
            volatile_categories: default_volatile_categories(),
            alternates: default_alternates(),
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            cap_delay_ms: default_cap_delay_ms(),
            jitter_ms: default_jitter_ms(),
            concurrency: default_concurrency(),
            cache_max_age_secs: default_cache_max_age_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            run_migrations: true,
            record_cache_ttl_secs: default_record_cache_ttl_secs(),
        }
    }
}

// ── Accessors ────────────────────────────────────────────────────────────────

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ResolverConfig {
    pub fn discovery_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.discovery_ttl_secs as i64)
    }
}

impl IngestionConfig {
    pub fn cache_max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cache_max_age_secs as i64)
    }
}

impl StorageConfig {
    pub fn record_cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.record_cache_ttl_secs as i64)
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides, then validate.
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("NSE").separator("__"))
            .build()?;

        let app_cfg: AppConfig = cfg
            .try_deserialize()
            .context("Invalid configuration")?;
        app_cfg.validate()?;
        Ok(app_cfg)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.http.timeout_secs > 0, "http.timeout_secs must be > 0");
        ensure!(
            !self.crawler.listing_pages.is_empty(),
            "crawler.listing_pages must not be empty"
        );
        for page in &self.crawler.listing_pages {
            url::Url::parse(page).with_context(|| format!("bad listing page URL {page}"))?;
        }
        url::Url::parse(&self.crawler.archive_base)
            .with_context(|| format!("bad archive base {}", self.crawler.archive_base))?;
        for urls in self.resolver.alternates.values() {
            for u in urls {
                url::Url::parse(u).with_context(|| format!("bad alternate URL {u}"))?;
            }
        }
        ensure!(self.classifier.sample_bytes > 0, "classifier.sample_bytes must be > 0");
        ensure!(
            self.classifier.sample_concurrency > 0,
            "classifier.sample_concurrency must be > 0"
        );
        ensure!(self.ingestion.max_retries > 0, "ingestion.max_retries must be > 0");
        ensure!(self.ingestion.concurrency > 0, "ingestion.concurrency must be > 0");
        ensure!(
            self.ingestion.base_delay_ms <= self.ingestion.cap_delay_ms,
            "ingestion.base_delay_ms must not exceed cap_delay_ms"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.ingestion.max_retries, 3);
        assert_eq!(cfg.resolver.discovery_ttl(), chrono::Duration::hours(24));
        assert!(cfg.resolver.alternates.contains_key(&Category::Sme));
    }

    #[test]
    fn test_rejects_inverted_delays() {
        let mut cfg = AppConfig::default();
        cfg.ingestion.base_delay_ms = 20_000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let mut cfg = AppConfig::default();
        cfg.ingestion.concurrency = 0;
        assert!(cfg.validate().is_err());
    }
}
