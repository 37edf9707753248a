use crate::models::{Category, RawListingRow, StockRecord};
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use std::sync::LazyLock;

static SYMBOL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9&\-.]+$").expect("static pattern"));

// ── Parsers ───────────────────────────────────────────────────────────────────

fn is_blank(s: &str) -> bool {
    let s = s.trim();
    s.is_empty() || s == "N/A" || s == "-" || s == "—" || s.eq_ignore_ascii_case("NA")
}

/// Parse a numeric cell: strip everything except digits, dot, minus.
/// "1,000.50" → 1000.5 | "10" → 10.0
pub fn parse_decimal(s: &str) -> Option<f64> {
    if is_blank(s) {
        return None;
    }
    let cleaned: String = s
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    cleaned.parse().ok()
}

/// Parse an integer cell, tolerating thousands separators and a trailing ".0".
pub fn parse_count(s: &str) -> Option<i64> {
    parse_decimal(s).filter(|v| v.is_finite()).map(|v| v as i64)
}

/// Listing dates: "06-OCT-2008" (archive format), ISO, or day-first.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if is_blank(s) {
        return None;
    }

    for fmt in ["%d-%b-%Y", "%Y-%m-%d", "%d-%m-%Y", "%d/%m/%Y", "%d %b %Y", "%b %d, %Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    None
}

pub fn normalise_symbol(s: &str) -> String {
    s.trim().to_uppercase()
}

pub fn is_valid_symbol(s: &str) -> bool {
    SYMBOL.is_match(s)
}

fn non_blank(s: Option<&str>) -> Option<String> {
    s.map(str::trim)
        .filter(|s| !is_blank(s))
        .map(|s| s.to_string())
}

// ── Raw row → StockRecord ─────────────────────────────────────────────────────

/// `None` when the row fails the record invariant (symbol + name, symbol charset).
pub fn raw_row_to_record(
    row: &RawListingRow,
    category: Category,
    source: &str,
    now: DateTime<Utc>,
) -> Option<StockRecord> {
    let symbol = normalise_symbol(row.symbol.as_deref()?);
    if symbol.is_empty() || !is_valid_symbol(&symbol) {
        return None;
    }

    let name = non_blank(row.name.as_deref())?;

    Some(StockRecord {
        symbol,
        name,
        series: non_blank(row.series.as_deref()).map(|s| s.to_uppercase()),
        listing_date: row.listing_date.as_deref().and_then(parse_date),
        isin: non_blank(row.isin.as_deref()).map(|s| s.to_uppercase()),
        face_value: row.face_value.as_deref().and_then(parse_decimal),
        market_lot: row.market_lot.as_deref().and_then(parse_count),
        category,
        source: source.to_string(),
        last_updated: now,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
