//! Static evidence tables: URL patterns and expected header shapes.

use crate::models::Category;
use regex::Regex;
use std::sync::LazyLock;
use url::Url;

pub struct UrlRule {
    pub category: Category,
    pub priority: u8,
    patterns: Vec<Regex>,
}

impl UrlRule {
    fn new(category: Category, priority: u8, patterns: &[&str]) -> Self {
        Self {
            category,
            priority,
            patterns: patterns
                .iter()
                .map(|p| Regex::new(p).expect("static pattern"))
                .collect(),
        }
    }

    pub fn matches(&self, url: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(url))
    }
}

/// Ordered by priority, highest first. Debt sits at the bottom on purpose:
/// its files look like equity files.
static URL_RULES: LazyLock<Vec<UrlRule>> = LazyLock::new(|| {
    let mut rules = vec![
        UrlRule::new(Category::Equity, 10, &[r"(?i)(^|/)EQUITY_L\.csv"]),
        UrlRule::new(
            Category::Sme,
            9,
            &[r"(?i)SME_EQUITY_L\.csv", r"(?i)/emerge/[^?#]*\.csv"],
        ),
        UrlRule::new(
            Category::Etf,
            8,
            &[r"(?i)eq_etfseclist\.csv", r"(?i)etf[^/]*\.csv"],
        ),
        UrlRule::new(Category::Reits, 7, &[r"(?i)REITS?_L\.csv", r"(?i)reit[^/]*\.csv"]),
        UrlRule::new(Category::Invits, 7, &[r"(?i)INVITS?_L\.csv", r"(?i)invit[^/]*\.csv"]),
        UrlRule::new(
            Category::Equity,
            6,
            &[r"(?i)equit(y|ies)[^/]*\.csv", r"(?i)sec_?list[^/]*\.csv"],
        ),
        UrlRule::new(Category::NewListing, 5, &[r"(?i)new_?listing"]),
        UrlRule::new(Category::Delisted, 4, &[r"(?i)delist"]),
        UrlRule::new(Category::NameChange, 4, &[r"(?i)name_?change"]),
        UrlRule::new(Category::SymbolChange, 4, &[r"(?i)symbol_?change"]),
        UrlRule::new(Category::Debt, 3, &[r"(?i)debt|bond|ncd|gsec|_dl\.csv"]),
    ];
    rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    rules
});

/// First rule (by priority) matching `url`.
pub fn match_url(url: &str) -> Option<(Category, u8)> {
    URL_RULES
        .iter()
        .find(|r| r.matches(url))
        .map(|r| (r.category, r.priority))
}

// ── URL shape predicates ──────────────────────────────────────────────────────

static DEBT_LIKE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)debt|bond|ncd|gsec|_dl\.csv").expect("static pattern")
});

pub fn file_name(url: &str) -> String {
    if let Ok(u) = Url::parse(url) {
        if let Some(last) = u.path_segments().and_then(|mut s| s.next_back()) {
            return last.to_string();
        }
    }
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path).to_string()
}

pub fn is_primary_equity_file(url: &str) -> bool {
    file_name(url).eq_ignore_ascii_case("EQUITY_L.csv")
}

pub fn is_sme_equity_file(url: &str) -> bool {
    file_name(url).eq_ignore_ascii_case("SME_EQUITY_L.csv")
}

pub fn is_debt_like(url: &str) -> bool {
    DEBT_LIKE.is_match(url)
}

pub fn is_equity_named(url: &str) -> bool {
    let name = file_name(url).to_ascii_lowercase();
    name.contains("equity") || name.contains("equities")
}

pub fn is_securities_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.contains("securit") || lower.contains("seclist") || lower.contains("sec_list")
}

pub fn has_listing_suffix(url: &str) -> bool {
    file_name(url).to_ascii_lowercase().ends_with("_l.csv")
}

pub fn is_on_host(url: &str, host: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        .map(|h| h == host || h.ends_with(&format!(".{host}")))
        .unwrap_or(false)
}

/// Keyword match used when backfilling a category nothing claimed.
pub fn loosely_matches(url: &str, category: Category) -> bool {
    if is_debt_like(url) {
        return false;
    }
    let name = file_name(url).to_ascii_lowercase();
    match category {
        Category::Equity => name.contains("equity") && !name.contains("sme"),
        Category::Sme => name.contains("sme") || url.to_ascii_lowercase().contains("/emerge/"),
        Category::Etf => name.contains("etf"),
        Category::Reits => name.contains("reit"),
        Category::Invits => name.contains("invit"),
        _ => false,
    }
}

// ── Header expectations ───────────────────────────────────────────────────────

/// Minimum share of expected headers that must be present for a header match.
pub const HEADER_COVERAGE_THRESHOLD: f64 = 0.5;

struct HeaderRule {
    category: Category,
    expected: Vec<Regex>,
}

impl HeaderRule {
    fn new(category: Category, expected: &[&str]) -> Self {
        Self {
            category,
            expected: expected
                .iter()
                .map(|p| Regex::new(&format!("^(?:{p})$")).expect("static pattern"))
                .collect(),
        }
    }

    fn coverage(&self, headers: &[String]) -> f64 {
        if self.expected.is_empty() {
            return 0.0;
        }
        let hit = self
            .expected
            .iter()
            .filter(|re| headers.iter().any(|h| re.is_match(h)))
            .count();
        hit as f64 / self.expected.len() as f64
    }
}

static HEADER_RULES: LazyLock<Vec<HeaderRule>> = LazyLock::new(|| {
    vec![
        HeaderRule::new(
            Category::Equity,
            &[
                "SYMBOL",
                "NAME OF (THE )?COMPANY",
                "SERIES",
                "DATE OF LISTING",
                "PAID UP VALUE",
                "MARKET LOT",
                "ISIN( NUMBER)?",
                "FACE VALUE",
            ],
        ),
        HeaderRule::new(
            Category::Etf,
            &[
                "SYMBOL",
                "UNDERLYING",
                "SECURITY ?NAME",
                "DATE ?OF ?LISTING",
                "MARKET ?LOT",
                "ISIN ?NUMBER",
                "FACE ?VALUE",
            ],
        ),
        HeaderRule::new(
            Category::Debt,
            &[
                "SYMBOL",
                "SERIES",
                "ISIN( NUMBER)?",
                "(COUPON|IP) ?(RATE)?|INTEREST RATE",
                "(DATE OF )?(MATURITY|REDEMPTION)( DATE)?",
                "(ISSUE|SECURITY|ISSUER) ?(NAME|DESCRIPTION)?",
            ],
        ),
        HeaderRule::new(
            Category::Delisted,
            &["SYMBOL", "(NAME OF (THE )?)?COMPANY( NAME)?", "(DATE OF )?DELISTING( DATE)?"],
        ),
        HeaderRule::new(
            Category::NameChange,
            &["SYMBOL", "(OLD|PREVIOUS) NAME", "NEW NAME", "DATE OF (NAME )?CHANGE"],
        ),
        HeaderRule::new(
            Category::SymbolChange,
            &["(SM KEY SYMBOL|COMPANY NAME|NAME OF COMPANY)", "(OLD|PREVIOUS) SYMBOL", "NEW SYMBOL", "DATE OF CHANGE"],
        ),
    ]
});

/// "Name_of_company " → "NAME OF COMPANY"
pub fn normalise_header(h: &str) -> String {
    h.trim()
        .trim_matches('"')
        .replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Best header match above the coverage threshold; ties go to the earlier rule.
pub fn match_headers(headers: &[String]) -> Option<(Category, f64)> {
    let normalised: Vec<String> = headers.iter().map(|h| normalise_header(h)).collect();
    let mut best: Option<(Category, f64)> = None;
    for rule in HEADER_RULES.iter() {
        let cov = rule.coverage(&normalised);
        if cov >= HEADER_COVERAGE_THRESHOLD && best.map(|(_, b)| cov > b).unwrap_or(true) {
            best = Some((rule.category, cov));
        }
    }
    best
}

/// Coverage of `headers` against the expectations for `category`. Categories
/// without their own table borrow the equity one.
pub fn header_coverage(category: Category, headers: &[String]) -> f64 {
    let normalised: Vec<String> = headers.iter().map(|h| normalise_header(h)).collect();
    let lookup = match category {
        Category::Sme | Category::Reits | Category::Invits | Category::NewListing => Category::Equity,
        other => other,
    };
    HEADER_RULES
        .iter()
        .find(|r| r.category == lookup)
        .map(|r| r.coverage(&normalised))
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://nsearchives.nseindia.com";

    #[test]
    fn test_url_rules_by_priority() {
        assert_eq!(
            match_url(&format!("{BASE}/content/equities/EQUITY_L.csv")),
            Some((Category::Equity, 10))
        );
        assert_eq!(
            match_url(&format!("{BASE}/emerge/corporates/content/SME_EQUITY_L.csv")),
            Some((Category::Sme, 9))
        );
        assert_eq!(
            match_url(&format!("{BASE}/content/equities/eq_etfseclist.csv")),
            Some((Category::Etf, 8))
        );
        assert_eq!(
            match_url(&format!("{BASE}/content/equities/REITS_L.csv")),
            Some((Category::Reits, 7))
        );
        assert_eq!(
            match_url(&format!("{BASE}/content/equities/DEBT.csv")),
            Some((Category::Debt, 3))
        );
        assert_eq!(match_url(&format!("{BASE}/content/misc/report.csv")), None);
    }

    #[test]
    fn test_sme_file_not_primary_equity() {
        let sme = format!("{BASE}/emerge/corporates/content/SME_EQUITY_L.csv");
        assert!(is_sme_equity_file(&sme));
        assert!(!is_primary_equity_file(&sme));
        assert!(is_primary_equity_file(&format!("{BASE}/content/equities/equity_l.csv")));
    }

    #[test]
    fn test_url_predicates() {
        assert!(is_debt_like("https://x/content/debt/BOND_L.csv"));
        assert!(!is_debt_like("https://x/content/equities/EQUITY_L.csv"));
        assert!(has_listing_suffix("https://x/REITS_L.csv"));
        assert!(is_on_host(&format!("{BASE}/a.csv"), "nsearchives.nseindia.com"));
        assert!(!is_on_host("https://example.com/a.csv", "nsearchives.nseindia.com"));
        assert_eq!(file_name("https://x/a/b/EQUITY_L.csv?v=2"), "EQUITY_L.csv");
    }

    #[test]
    fn test_match_headers_equity() {
        let headers: Vec<String> = [
            "SYMBOL",
            "NAME OF COMPANY",
            " SERIES",
            " DATE OF LISTING",
            " PAID UP VALUE",
            " MARKET LOT",
            " ISIN NUMBER",
            " FACE VALUE",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let (cat, cov) = match_headers(&headers).unwrap();
        assert_eq!(cat, Category::Equity);
        assert!((cov - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_match_headers_needs_coverage() {
        let headers = vec!["SYMBOL".to_string(), "PRICE".to_string()];
        assert!(match_headers(&headers).is_none());
    }

    #[test]
    fn test_normalise_header() {
        assert_eq!(normalise_header(" Name_of_company "), "NAME OF COMPANY");
        assert_eq!(normalise_header("\"ISIN  NUMBER\""), "ISIN NUMBER");
    }
}
