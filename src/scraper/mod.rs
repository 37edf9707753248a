pub mod cleaner;
pub mod http_client;
pub mod parsers;

use crate::config::CrawlerConfig;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use self::http_client::HttpFetcher;
use self::parsers::extract_csv_urls;

// ── Outcome ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlOutcome {
    Ok,
    /// HTTP 403 from the listing page.
    Blocked,
    /// Any other transport failure.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlResult {
    pub urls: BTreeSet<String>,
    pub outcome: CrawlOutcome,
}

impl CrawlResult {
    fn empty(outcome: CrawlOutcome) -> Self {
        Self {
            urls: BTreeSet::new(),
            outcome,
        }
    }
}

// ── Crawler ───────────────────────────────────────────────────────────────────

/// Pulls candidate CSV URLs off listing pages. Never errors: a page that
/// can't be fetched just contributes nothing.
pub struct PageCrawler {
    fetcher: Arc<dyn HttpFetcher>,
    archive_base: Url,
}

impl PageCrawler {
    pub fn new(fetcher: Arc<dyn HttpFetcher>, config: &CrawlerConfig) -> Result<Self> {
        let archive_base = Url::parse(&config.archive_base)
            .with_context(|| format!("bad archive base {}", config.archive_base))?;
        Ok(Self {
            fetcher,
            archive_base,
        })
    }

    pub async fn discover_candidate_urls(&self, page_url: &str) -> CrawlResult {
        info!("Crawling listing page {}", page_url);

        match self.fetcher.get_text(page_url).await {
            Ok(page) => {
                let urls = extract_csv_urls(&page.body, &self.archive_base);
                info!("{}: {} CSV links", page_url, urls.len());
                CrawlResult {
                    urls,
                    outcome: CrawlOutcome::Ok,
                }
            }
            Err(e) if e.is_blocked() => {
                warn!("Listing page blocked: {}", e);
                CrawlResult::empty(CrawlOutcome::Blocked)
            }
            Err(e) => {
                warn!("Listing page fetch failed: {}", e);
                CrawlResult::empty(CrawlOutcome::Failed)
            }
        }
    }

    /// Union over several pages. `Ok` if any page answered, `Blocked` if
    /// every failure was a 403.
    pub async fn discover_all(&self, pages: &[String]) -> CrawlResult {
        let mut urls = BTreeSet::new();
        let mut any_ok = false;
        let mut all_blocked = true;

        for page in pages {
            let result = self.discover_candidate_urls(page).await;
            match result.outcome {
                CrawlOutcome::Ok => any_ok = true,
                CrawlOutcome::Blocked => {}
                CrawlOutcome::Failed => all_blocked = false,
            }
            urls.extend(result.urls);
        }

        let outcome = if any_ok {
            CrawlOutcome::Ok
        } else if all_blocked && !pages.is_empty() {
            CrawlOutcome::Blocked
        } else {
            CrawlOutcome::Failed
        };

        CrawlResult { urls, outcome }
    }
}

#[cfg(test)]
mod tests {
    use super::http_client::testing::StubFetcher;
    use super::*;

    const PAGE: &str = "https://www.nseindia.com/market-data/securities-available-for-trading";

    fn crawler(stub: StubFetcher) -> PageCrawler {
        PageCrawler::new(Arc::new(stub), &CrawlerConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_discovers_from_anchors_and_scripts() {
        let html = r#"<a href="/content/equities/EQUITY_L.csv">EQ</a>
            <script>load("https://nsearchives.nseindia.com/content/equities/eq_etfseclist.csv")</script>"#;
        let c = crawler(StubFetcher::new().ok(PAGE, html));

        let result = c.discover_candidate_urls(PAGE).await;
        assert_eq!(result.outcome, CrawlOutcome::Ok);
        assert!(result
            .urls
            .contains("https://nsearchives.nseindia.com/content/equities/EQUITY_L.csv"));
        assert!(result
            .urls
            .contains("https://nsearchives.nseindia.com/content/equities/eq_etfseclist.csv"));
    }

    #[tokio::test]
    async fn test_blocked_vs_failed() {
        let c = crawler(StubFetcher::new().fail(PAGE, 403));
        let result = c.discover_candidate_urls(PAGE).await;
        assert_eq!(result.outcome, CrawlOutcome::Blocked);
        assert!(result.urls.is_empty());

        let c = crawler(StubFetcher::new().fail(PAGE, 500));
        assert_eq!(c.discover_candidate_urls(PAGE).await.outcome, CrawlOutcome::Failed);
    }

    #[tokio::test]
    async fn test_discover_all_is_ok_when_any_page_answers() {
        let other = "https://www.nseindia.com/other";
        let c = crawler(
            StubFetcher::new()
                .fail(PAGE, 403)
                .ok(other, r#"<a href="/content/equities/REITS_L.csv">r</a>"#),
        );
        let result = c.discover_all(&[PAGE.to_string(), other.to_string()]).await;
        assert_eq!(result.outcome, CrawlOutcome::Ok);
        assert_eq!(result.urls.len(), 1);
    }
}
