use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

// ── Category ──────────────────────────────────────────────────────────────────

/// What a listing CSV contains. Only the first five ever become endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Equity,
    Sme,
    Etf,
    Reits,
    Invits,
    Debt,
    NewListing,
    Delisted,
    NameChange,
    SymbolChange,
    Unknown,
}

impl Category {
    /// Categories that map to an output endpoint, in ingestion order.
    pub const ENDPOINTS: [Category; 5] = [
        Category::Equity,
        Category::Sme,
        Category::Etf,
        Category::Reits,
        Category::Invits,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Equity => "equity",
            Category::Sme => "sme",
            Category::Etf => "etf",
            Category::Reits => "reits",
            Category::Invits => "invits",
            Category::Debt => "debt",
            Category::NewListing => "new_listing",
            Category::Delisted => "delisted",
            Category::NameChange => "name_change",
            Category::SymbolChange => "symbol_change",
            Category::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let c = match s.trim().to_ascii_lowercase().as_str() {
            "equity" => Category::Equity,
            "sme" => Category::Sme,
            "etf" => Category::Etf,
            "reits" | "reit" => Category::Reits,
            "invits" | "invit" => Category::Invits,
            "debt" => Category::Debt,
            "new_listing" => Category::NewListing,
            "delisted" => Category::Delisted,
            "name_change" => Category::NameChange,
            "symbol_change" => Category::SymbolChange,
            "unknown" => Category::Unknown,
            _ => return None,
        };
        Some(c)
    }

    pub fn is_endpoint(&self) -> bool {
        Self::ENDPOINTS.contains(self)
    }

    /// Key under which the raw CSV for this category is cached.
    pub fn cache_key(&self) -> String {
        format!("nse_{}_csv", self.as_str())
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Endpoint ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointDescriptor {
    pub category: Category,
    pub url: String,
    pub cache_key: String,
    pub priority: u8,
    pub required: bool,
    pub consecutive_failures: u32,
}

impl EndpointDescriptor {
    pub fn new(category: Category, url: impl Into<String>, priority: u8, required: bool) -> Self {
        Self {
            category,
            url: url.into(),
            cache_key: category.cache_key(),
            priority,
            required,
            consecutive_failures: 0,
        }
    }
}

// ── Classification candidate ──────────────────────────────────────────────────

/// Output of one classification pass over one URL. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CsvCandidate {
    pub url: String,
    pub category: Category,
    pub priority: u8,
    pub quality_score: f64,
    pub confidence: f64,
    pub should_use: bool,
    pub sampled_headers: Vec<String>,
    pub estimated_row_count: usize,
}

impl CsvCandidate {
    /// Sort key for resolution: priority dominates, quality breaks ties.
    pub fn rank(&self) -> f64 {
        self.priority as f64 * 10.0 + self.quality_score
    }
}

// ── Cache entry ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub raw_payload: String,
    pub timestamp: DateTime<Utc>,
    pub size_bytes: usize,
    pub line_count: usize,
    pub checksum: String,
}

impl CacheEntry {
    pub fn from_payload(raw_payload: String, timestamp: DateTime<Utc>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(raw_payload.as_bytes());
        Self {
            size_bytes: raw_payload.len(),
            line_count: raw_payload.lines().filter(|l| !l.trim().is_empty()).count(),
            checksum: hex::encode(hasher.finalize()),
            raw_payload,
            timestamp,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.timestamp
    }

    pub fn is_valid(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        self.age(now) < max_age
    }
}

// ── Stock record ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StockRecord {
    pub symbol: String,
    pub name: String,
    pub series: Option<String>,
    pub listing_date: Option<NaiveDate>,
    pub isin: Option<String>,
    pub face_value: Option<f64>,
    pub market_lot: Option<i64>,
    pub category: Category,
    pub source: String,
    pub last_updated: DateTime<Utc>,
}

impl StockRecord {
    pub fn is_equity_series(&self) -> bool {
        self.series
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("EQ"))
            .unwrap_or(false)
    }

    /// Weighted presence of optional fields, used to settle symbol collisions.
    pub fn completeness(&self) -> u32 {
        let mut score = 0;
        if self.isin.is_some() {
            score += 2;
        }
        if self.listing_date.is_some() {
            score += 2;
        }
        if self.face_value.is_some() {
            score += 1;
        }
        if self.market_lot.is_some() {
            score += 1;
        }
        if self.series.is_some() {
            score += 1;
        }
        score
    }
}

// ── Query / cycle metadata ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchOptions {
    pub limit: usize,
    pub exact_match: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 50,
            exact_match: false,
        }
    }
}

/// Summary of one fetch cycle, stored alongside the record set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleMetadata {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub source: String,
    pub record_count: usize,
    pub breakdown: BTreeMap<Category, usize>,
    pub error: Option<String>,
}

// ── Raw CSV row ───────────────────────────────────────────────────────────────

/// One listing row after header alias resolution, before validation.
#[derive(Debug, Clone, Default)]
pub struct RawListingRow {
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub series: Option<String>,
    pub listing_date: Option<String>,
    pub isin: Option<String>,
    pub face_value: Option<String>,
    pub market_lot: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(series: Option<&str>) -> StockRecord {
        StockRecord {
            symbol: "ABC".into(),
            name: "Abc Ltd".into(),
            series: series.map(String::from),
            listing_date: None,
            isin: None,
            face_value: None,
            market_lot: None,
            category: Category::Equity,
            source: "test".into(),
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn test_completeness_weights() {
        let mut r = record(None);
        assert_eq!(r.completeness(), 0);
        r.isin = Some("INE000A01010".into());
        assert_eq!(r.completeness(), 2);
        r.listing_date = NaiveDate::from_ymd_opt(2010, 1, 4);
        r.face_value = Some(10.0);
        r.market_lot = Some(1);
        r.series = Some("EQ".into());
        assert_eq!(r.completeness(), 7);
    }

    #[test]
    fn test_equity_series_is_case_insensitive() {
        assert!(record(Some("eq")).is_equity_series());
        assert!(!record(Some("BE")).is_equity_series());
        assert!(!record(None).is_equity_series());
    }

    #[test]
    fn test_cache_entry_metadata() {
        let now = Utc::now();
        let entry = CacheEntry::from_payload("A,B,C\n1,2,3\n\n".to_string(), now);
        assert_eq!(entry.size_bytes, 13);
        assert_eq!(entry.line_count, 2);
        assert_eq!(entry.checksum.len(), 64);
        assert!(entry.is_valid(now, chrono::Duration::minutes(5)));
        assert!(!entry.is_valid(now + chrono::Duration::minutes(10), chrono::Duration::minutes(5)));
    }

    #[test]
    fn test_category_round_trip_names() {
        for c in Category::ENDPOINTS {
            assert_eq!(Category::parse(c.as_str()), Some(c));
        }
        assert_eq!(Category::Sme.cache_key(), "nse_sme_csv");
    }
}
