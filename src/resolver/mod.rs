//! URL resolver: turns a pile of classified candidates into one download URL
//! per output category, with a hardcoded table as the safety net.

use crate::classifier::CsvClassifier;
use crate::classifier::rules::{is_primary_equity_file, is_sme_equity_file, loosely_matches};
use crate::config::ResolverConfig;
use crate::error::PipelineError;
use crate::models::{Category, CsvCandidate, EndpointDescriptor};
use crate::scraper::http_client::HttpFetcher;
use crate::scraper::{CrawlOutcome, PageCrawler};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

// ── Fallback table ────────────────────────────────────────────────────────────

const ARCHIVE: &str = "https://nsearchives.nseindia.com";

/// Ingestion priority and required flag per endpoint category.
pub fn endpoint_profile(category: Category) -> (u8, bool) {
    match category {
        Category::Equity => (10, true),
        Category::Sme => (9, false),
        Category::Etf => (8, false),
        Category::Reits | Category::Invits => (7, false),
        _ => (0, false),
    }
}

pub fn fallback_url(category: Category) -> Option<String> {
    let path = match category {
        Category::Equity => "/content/equities/EQUITY_L.csv",
        Category::Sme => "/emerge/corporates/content/SME_EQUITY_L.csv",
        Category::Etf => "/content/equities/eq_etfseclist.csv",
        Category::Reits => "/content/equities/REITS_L.csv",
        Category::Invits => "/content/equities/INVITS_L.csv",
        _ => return None,
    };
    Some(format!("{ARCHIVE}{path}"))
}

fn descriptor(category: Category, url: String) -> EndpointDescriptor {
    let (priority, required) = endpoint_profile(category);
    EndpointDescriptor::new(category, url, priority, required)
}

pub fn fallback_endpoints() -> Vec<EndpointDescriptor> {
    Category::ENDPOINTS
        .iter()
        .filter_map(|c| fallback_url(*c).map(|u| descriptor(*c, u)))
        .collect()
}

// ── Pure resolution ───────────────────────────────────────────────────────────

/// One URL per endpoint category.
///
/// Candidates are eligible when `priority >= 9` or `should_use`, and are
/// visited best-first by `priority * 10 + quality`. Equity is sticky for the
/// pass and never takes the SME file. Other categories only swap an assigned
/// URL for an equally ranked candidate with priority > 8 or quality > 7.
/// Gaps are backfilled from loose keyword matches, then from the fallback
/// table. Failure counters carry over when the URL is unchanged.
pub fn resolve(candidates: &[CsvCandidate], previous: &[EndpointDescriptor]) -> Vec<EndpointDescriptor> {
    let mut ranked: Vec<&CsvCandidate> = candidates.iter().collect();
    ranked.sort_by(|a, b| {
        b.rank()
            .partial_cmp(&a.rank())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.url.cmp(&b.url))
    });

    let mut assigned: BTreeMap<Category, &CsvCandidate> = BTreeMap::new();

    for &c in ranked.iter().filter(|c| c.priority >= 9 || c.should_use) {
        if !c.category.is_endpoint() {
            continue;
        }

        if c.category == Category::Equity {
            if assigned.contains_key(&Category::Equity) || is_sme_equity_file(&c.url) {
                continue;
            }
            if is_primary_equity_file(&c.url) {
                info!("Equity pinned to primary file {}", c.url);
            }
            assigned.insert(Category::Equity, c);
            continue;
        }

        let replace = match assigned.get(&c.category) {
            None => true,
            Some(current) => {
                c.rank() >= current.rank() && (c.priority > 8 || c.quality_score > 7.0)
            }
        };
        if replace {
            assigned.insert(c.category, c);
        }
    }

    Category::ENDPOINTS
        .iter()
        .filter_map(|&category| {
            let url = match assigned.get(&category) {
                Some(c) => c.url.clone(),
                None => {
                    let loose = ranked.iter().find(|c| {
                        loosely_matches(&c.url, category)
                            && !(category == Category::Equity && is_sme_equity_file(&c.url))
                    });
                    match loose {
                        Some(c) => {
                            info!("{}: backfilled from loose match {}", category, c.url);
                            c.url.clone()
                        }
                        None => fallback_url(category)?,
                    }
                }
            };

            let mut d = descriptor(category, url);
            if let Some(prev) = previous.iter().find(|p| p.category == category && p.url == d.url) {
                d.consecutive_failures = prev.consecutive_failures;
            }
            Some(d)
        })
        .collect()
}

// ── Stateful resolver ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Discovered,
    Cached,
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedEndpoints {
    pub endpoints: Vec<EndpointDescriptor>,
    pub source: ResolutionSource,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryReport {
    pub crawl_outcome: Option<CrawlOutcome>,
    pub candidates: Vec<CsvCandidate>,
    pub resolved: ResolvedEndpoints,
    pub error: Option<String>,
}

pub struct UrlResolver {
    crawler: PageCrawler,
    classifier: Arc<CsvClassifier>,
    fetcher: Arc<dyn HttpFetcher>,
    listing_pages: Vec<String>,
    config: ResolverConfig,
    current: RwLock<Option<ResolvedEndpoints>>,
}

impl UrlResolver {
    pub fn new(
        crawler: PageCrawler,
        classifier: Arc<CsvClassifier>,
        fetcher: Arc<dyn HttpFetcher>,
        listing_pages: Vec<String>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            crawler,
            classifier,
            fetcher,
            listing_pages,
            config,
            current: RwLock::new(None),
        }
    }

    /// Current table, re-discovered when older than the TTL or when forced.
    pub async fn endpoints(&self, force: bool) -> ResolvedEndpoints {
        if !force {
            if let Some(fresh) = self.fresh().await {
                return fresh;
            }
        }
        self.discover().await.resolved
    }

    /// The current table if it is still inside the TTL, marked as cached.
    pub async fn fresh(&self) -> Option<ResolvedEndpoints> {
        let current = self.current.read().await;
        let current = current.as_ref()?;
        if Utc::now() - current.resolved_at >= self.config.discovery_ttl() {
            return None;
        }
        Some(ResolvedEndpoints {
            source: ResolutionSource::Cached,
            ..current.clone()
        })
    }

    /// Run a discovery cycle now. Never fails: errors fall back to the
    /// hardcoded table.
    pub async fn discover(&self) -> DiscoveryReport {
        let previous = self
            .current
            .read()
            .await
            .as_ref()
            .map(|c| c.endpoints.clone())
            .unwrap_or_default();

        let mut report = match self.run_discovery(&previous).await {
            Ok(report) => report,
            Err(e) => {
                warn!("Discovery failed, using fallback table: {}", e);
                DiscoveryReport {
                    crawl_outcome: None,
                    candidates: vec![],
                    resolved: ResolvedEndpoints {
                        endpoints: fallback_endpoints(),
                        source: ResolutionSource::Fallback,
                        resolved_at: Utc::now(),
                    },
                    error: Some(e.to_string()),
                }
            }
        };

        self.probe_volatile(&mut report.resolved.endpoints).await;
        *self.current.write().await = Some(report.resolved.clone());
        report
    }

    async fn run_discovery(&self, previous: &[EndpointDescriptor]) -> Result<DiscoveryReport, PipelineError> {
        if self.listing_pages.is_empty() {
            return Err(PipelineError::Config("no listing pages configured".into()));
        }

        let crawl = self.crawler.discover_all(&self.listing_pages).await;

        // Known-good locations are always worth classifying.
        let mut urls: BTreeSet<String> = crawl.urls.clone();
        urls.extend(Category::ENDPOINTS.iter().filter_map(|c| fallback_url(*c)));

        let candidates = self.classifier.classify_all(urls).await;
        let endpoints = resolve(&candidates, previous);

        let all_fallback = endpoints
            .iter()
            .all(|e| fallback_url(e.category).as_deref() == Some(e.url.as_str()))
            && !candidates.iter().any(|c| c.should_use);
        let source = if all_fallback {
            ResolutionSource::Fallback
        } else {
            ResolutionSource::Discovered
        };

        info!(
            "Discovery: crawl={:?}, {} candidates, source={:?}",
            crawl.outcome,
            candidates.len(),
            source
        );
        for e in &endpoints {
            info!("  {:<7} → {}", e.category.as_str(), e.url);
        }

        Ok(DiscoveryReport {
            crawl_outcome: Some(crawl.outcome),
            candidates,
            resolved: ResolvedEndpoints {
                endpoints,
                source,
                resolved_at: Utc::now(),
            },
            error: None,
        })
    }

    /// Swap flaky endpoints for a registered alternate that answers a HEAD.
    /// If none does, the primary stays and retries decide.
    async fn probe_volatile(&self, endpoints: &mut [EndpointDescriptor]) {
        for endpoint in endpoints
            .iter_mut()
            .filter(|e| self.config.volatile_categories.contains(&e.category))
        {
            if self.fetcher.probe(&endpoint.url).await.is_ok() {
                continue;
            }
            warn!("{}: probe failed for {}", endpoint.category, endpoint.url);

            let alternates = self
                .config
                .alternates
                .get(&endpoint.category)
                .cloned()
                .unwrap_or_default();
            for alt in alternates.iter().filter(|a| **a != endpoint.url) {
                if self.fetcher.probe(alt).await.is_ok() {
                    info!("{}: switching to alternate {}", endpoint.category, alt);
                    endpoint.url = alt.clone();
                    endpoint.consecutive_failures = 0;
                    break;
                }
            }
        }
    }

    /// Replace the whole table, e.g. with updated failure counters.
    pub async fn replace_endpoints(&self, endpoints: Vec<EndpointDescriptor>) {
        let mut current = self.current.write().await;
        let resolved_at = current.as_ref().map(|c| c.resolved_at).unwrap_or_else(Utc::now);
        let source = current
            .as_ref()
            .map(|c| c.source)
            .unwrap_or(ResolutionSource::Fallback);
        *current = Some(ResolvedEndpoints {
            endpoints,
            source,
            resolved_at,
        });
    }

    pub async fn current(&self) -> Option<ResolvedEndpoints> {
        self.current.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::learning::InMemoryLearning;
    use crate::config::{ClassifierConfig, CrawlerConfig};
    use crate::scraper::http_client::testing::StubFetcher;

    const EQ: &str = "https://nsearchives.nseindia.com/content/equities/EQUITY_L.csv";
    const SME: &str = "https://nsearchives.nseindia.com/emerge/corporates/content/SME_EQUITY_L.csv";
    const DEBT: &str = "https://nsearchives.nseindia.com/content/equities/DEBT.csv";
    const PAGE: &str = "https://www.nseindia.com/market-data/securities-available-for-trading";

    fn cand(url: &str, category: Category, priority: u8, quality: f64, should_use: bool) -> CsvCandidate {
        CsvCandidate {
            url: url.to_string(),
            category,
            priority,
            quality_score: quality,
            confidence: 0.9,
            should_use,
            sampled_headers: vec!["SYMBOL".into(), "NAME OF COMPANY".into()],
            estimated_row_count: 500,
        }
    }

    fn url_for(endpoints: &[EndpointDescriptor], c: Category) -> &str {
        &endpoints.iter().find(|e| e.category == c).unwrap().url
    }

    #[test]
    fn test_resolves_equity_sme_and_excludes_debt() {
        let candidates = vec![
            cand(DEBT, Category::Debt, 3, 4.0, false),
            cand(SME, Category::Sme, 9, 8.0, true),
            cand(EQ, Category::Equity, 10, 9.0, true),
        ];
        let endpoints = resolve(&candidates, &[]);

        assert_eq!(endpoints.len(), 5);
        assert_eq!(url_for(&endpoints, Category::Equity), EQ);
        assert_eq!(url_for(&endpoints, Category::Sme), SME);
        assert!(endpoints.iter().all(|e| e.url != DEBT));
        assert!(endpoints.iter().find(|e| e.category == Category::Equity).unwrap().required);
    }

    #[test]
    fn test_sme_file_never_becomes_equity() {
        let candidates = vec![cand(SME, Category::Equity, 10, 10.0, true)];
        let endpoints = resolve(&candidates, &[]);
        assert_eq!(url_for(&endpoints, Category::Equity), EQ);
    }

    #[test]
    fn test_non_equity_replacement_rule() {
        let a = "https://nsearchives.nseindia.com/content/equities/a_etf.csv";
        let b = "https://nsearchives.nseindia.com/content/equities/b_etf.csv";

        // Equal rank and quality above 7: the later candidate takes over.
        let swapped = resolve(
            &[cand(b, Category::Etf, 7, 7.5, true), cand(a, Category::Etf, 7, 7.5, true)],
            &[],
        );
        assert_eq!(url_for(&swapped, Category::Etf), b);

        // Equal rank but neither priority above 8 nor quality above 7.
        let kept = resolve(
            &[cand(a, Category::Etf, 7, 6.5, true), cand(b, Category::Etf, 7, 6.5, true)],
            &[],
        );
        assert_eq!(url_for(&kept, Category::Etf), a);

        // Priority above 8 is enough on its own.
        let high_priority = resolve(
            &[cand(a, Category::Etf, 9, 5.0, false), cand(b, Category::Etf, 9, 5.0, false)],
            &[],
        );
        assert_eq!(url_for(&high_priority, Category::Etf), b);

        // A worse-ranked file never displaces a better one, whatever its quality.
        let ranked = resolve(
            &[cand(b, Category::Etf, 7, 9.5, true), cand(a, Category::Etf, 8, 9.0, true)],
            &[],
        );
        assert_eq!(url_for(&ranked, Category::Etf), a);
    }

    #[test]
    fn test_equity_is_sticky() {
        let other = "https://nsearchives.nseindia.com/content/equities/equity_full.csv";
        let candidates = vec![
            cand(EQ, Category::Equity, 10, 9.0, true),
            cand(other, Category::Equity, 10, 9.0, true),
        ];
        let endpoints = resolve(&candidates, &[]);
        assert_eq!(url_for(&endpoints, Category::Equity), EQ);
    }

    #[test]
    fn test_loose_backfill_before_fallback() {
        let etf = "https://mirror.example.com/files/etf_list_2024.csv";
        let candidates = vec![cand(etf, Category::Unknown, 0, 2.0, false)];
        let endpoints = resolve(&candidates, &[]);
        assert_eq!(url_for(&endpoints, Category::Etf), etf);
        assert_eq!(url_for(&endpoints, Category::Reits), fallback_url(Category::Reits).unwrap());
    }

    #[test]
    fn test_failure_counter_carries_over() {
        let mut prev = fallback_endpoints();
        prev[0].consecutive_failures = 2;
        let endpoints = resolve(&[], &prev);
        assert_eq!(endpoints[0].category, Category::Equity);
        assert_eq!(endpoints[0].consecutive_failures, 2);
    }

    fn resolver(stub: StubFetcher, listing_pages: Vec<String>) -> UrlResolver {
        let fetcher: Arc<dyn HttpFetcher> = Arc::new(stub);
        let crawler = PageCrawler::new(fetcher.clone(), &CrawlerConfig::default()).unwrap();
        let classifier = Arc::new(CsvClassifier::new(
            fetcher.clone(),
            Arc::new(InMemoryLearning::new()),
            ClassifierConfig::default(),
        ));
        UrlResolver::new(crawler, classifier, fetcher, listing_pages, ResolverConfig::default())
    }

    #[tokio::test]
    async fn test_discovery_error_degrades_to_fallback() {
        let r = resolver(StubFetcher::new(), vec![]);
        let report = r.discover().await;
        assert_eq!(report.resolved.source, ResolutionSource::Fallback);
        assert!(report.error.is_some());
        assert_eq!(report.resolved.endpoints, fallback_endpoints());
    }

    #[tokio::test]
    async fn test_ttl_serves_cached_table() {
        let r = resolver(StubFetcher::new().fail(PAGE, 403), vec![PAGE.to_string()]);
        let first = r.endpoints(false).await;
        assert_ne!(first.source, ResolutionSource::Cached);
        let second = r.endpoints(false).await;
        assert_eq!(second.source, ResolutionSource::Cached);
        let forced = r.endpoints(true).await;
        assert_ne!(forced.source, ResolutionSource::Cached);
    }

    #[tokio::test]
    async fn test_volatile_probe_switches_to_alternate() {
        let alt = "https://archives.nseindia.com/emerge/corporates/content/SME_EQUITY_L.csv";
        let stub = StubFetcher::new()
            .fail(PAGE, 403)
            .probe_fails(SME)
            .ok(alt, "SYMBOL,NAME OF COMPANY\n");
        let r = resolver(stub, vec![PAGE.to_string()]);
        let resolved = r.endpoints(true).await;
        assert_eq!(url_for(&resolved.endpoints, Category::Sme), alt);
    }

    #[tokio::test]
    async fn test_volatile_probe_keeps_primary_when_all_fail() {
        let alt = "https://archives.nseindia.com/emerge/corporates/content/SME_EQUITY_L.csv";
        let stub = StubFetcher::new()
            .fail(PAGE, 403)
            .probe_fails(SME)
            .probe_fails(alt);
        let r = resolver(stub, vec![PAGE.to_string()]);
        let resolved = r.endpoints(true).await;
        assert_eq!(url_for(&resolved.endpoints, Category::Sme), SME);
    }
}
