//! CSV → StockRecord normalization, plus bulk import of local listing files.

pub mod dedup;

use crate::classifier::rules::{match_headers, match_url, normalise_header};
use crate::models::{Category, RawListingRow, StockRecord};
use crate::scraper::cleaner::raw_row_to_record;
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use csv::StringRecord;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ── Column aliases ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Field {
    Symbol,
    Name,
    Series,
    ListingDate,
    Isin,
    FaceValue,
    MarketLot,
}

/// Header spellings per field, compared with spaces removed.
fn aliases(field: Field, category: Category) -> Vec<&'static str> {
    let mut out = match field {
        Field::Symbol => vec!["SYMBOL", "TICKER", "SCRIPSYMBOL"],
        Field::Name => vec!["NAMEOFCOMPANY", "NAMEOFTHECOMPANY", "COMPANYNAME", "SECURITYNAME", "NAME"],
        Field::Series => vec!["SERIES"],
        Field::ListingDate => vec!["DATEOFLISTING", "LISTINGDATE"],
        Field::Isin => vec!["ISINNUMBER", "ISIN", "ISINNO"],
        Field::FaceValue => vec!["FACEVALUE", "FV"],
        Field::MarketLot => vec!["MARKETLOT", "LOTSIZE"],
    };
    match (field, category) {
        (Field::Name, Category::Etf) => out.push("UNDERLYING"),
        (Field::Name, Category::Reits) => out.extend(["NAMEOFREIT", "NAMEOFTRUST", "REITNAME"]),
        (Field::Name, Category::Invits) => out.extend(["NAMEOFINVIT", "NAMEOFTRUST", "INVITNAME"]),
        _ => {}
    }
    out
}

fn squash(header: &str) -> String {
    normalise_header(header.trim_start_matches('\u{feff}')).replace(' ', "")
}

#[derive(Debug, Default)]
struct ColumnMap {
    symbol: Option<usize>,
    name: Option<usize>,
    series: Option<usize>,
    listing_date: Option<usize>,
    isin: Option<usize>,
    face_value: Option<usize>,
    market_lot: Option<usize>,
}

impl ColumnMap {
    fn resolve(headers: &StringRecord, category: Category) -> Self {
        let squashed: Vec<String> = headers.iter().map(squash).collect();
        // Earlier aliases win over later ones.
        let find = |field: Field| {
            aliases(field, category)
                .iter()
                .find_map(|alias| squashed.iter().position(|h| h == alias))
        };
        Self {
            symbol: find(Field::Symbol),
            name: find(Field::Name),
            series: find(Field::Series),
            listing_date: find(Field::ListingDate),
            isin: find(Field::Isin),
            face_value: find(Field::FaceValue),
            market_lot: find(Field::MarketLot),
        }
    }

    fn row(&self, record: &StringRecord) -> RawListingRow {
        let cell = |idx: Option<usize>| idx.and_then(|i| record.get(i)).map(|s| s.to_string());
        RawListingRow {
            symbol: cell(self.symbol),
            name: cell(self.name),
            series: cell(self.series),
            listing_date: cell(self.listing_date),
            isin: cell(self.isin),
            face_value: cell(self.face_value),
            market_lot: cell(self.market_lot),
        }
    }
}

// ── Normalize ─────────────────────────────────────────────────────────────────

/// Parse a raw listing CSV into records. Rows failing validation are dropped
/// quietly; a payload without a recognisable symbol column yields nothing.
pub fn normalize(raw: &str, category: Category, source: &str, now: DateTime<Utc>) -> Vec<StockRecord> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(raw.as_bytes());

    let headers = match reader.headers() {
        Ok(h) => h.clone(),
        Err(e) => {
            warn!("{}: unreadable header row: {}", category, e);
            return vec![];
        }
    };

    let columns = ColumnMap::resolve(&headers, category);
    if columns.symbol.is_none() || columns.name.is_none() {
        warn!("{}: no symbol/name columns in {:?}", category, headers);
        return vec![];
    }

    let mut records = Vec::new();
    let mut dropped = 0usize;
    for result in reader.records() {
        let Ok(record) = result else {
            dropped += 1;
            continue;
        };
        match raw_row_to_record(&columns.row(&record), category, source, now) {
            Some(r) => records.push(r),
            None => dropped += 1,
        }
    }

    debug!("{}: {} records, {} rows dropped", category, records.len(), dropped);
    records
}

// ── Local files ───────────────────────────────────────────────────────────────

/// Category of a local listing file: file name first, header row second.
pub fn category_for_file(path: &Path, raw: &str) -> Option<Category> {
    let name = path.file_name()?.to_string_lossy().to_string();
    if let Some((category, _)) = match_url(&format!("/{name}")) {
        return Some(category);
    }
    let first = raw.lines().find(|l| !l.trim().is_empty())?;
    let headers: Vec<String> = first.split(',').map(|h| h.trim().to_string()).collect();
    match_headers(&headers).map(|(c, _)| c)
}

/// Read and normalize one local listing CSV.
pub fn load_csv(path: &Path) -> Result<(Category, Vec<StockRecord>)> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;

    let category = category_for_file(path, &raw)
        .with_context(|| format!("Cannot tell what {:?} lists", path))?;
    if !category.is_endpoint() {
        bail!("{:?} is a {} file, not a listing", path, category);
    }

    let source = format!("file:{}", path.display());
    let records = normalize(&raw, category, &source, Utc::now());
    info!("{:?}: {} {} records", path, records.len(), category);
    Ok((category, records))
}

pub fn discover_csv_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file()
            && path
                .extension()
                .map(|e| e.eq_ignore_ascii_case("csv"))
                .unwrap_or(false)
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const EQUITY_CSV: &str = "\u{feff}SYMBOL,NAME OF COMPANY, SERIES, DATE OF LISTING, PAID UP VALUE, MARKET LOT, ISIN NUMBER, FACE VALUE
20MICRONS,20 Microns Limited,EQ,06-OCT-2008,5,1,INE144J01027,5
21STCENMGM,21st Century Management Services Limited,BE,03-MAY-1995,10,1,INE253B01015,10
BAD SYMBOL,Broken Row Ltd,EQ,01-JAN-2000,10,1,INE000000000,10
,No Symbol Ltd,EQ,01-JAN-2000,10,1,,10
NONAME,,EQ,01-JAN-2000,10,1,,10
";

    const ETF_CSV: &str = "Symbol,Underlying,SecurityName,DateofListing,MarketLot,ISINNumber,FaceValue
NIFTYBEES,Nifty 50 Index,Nippon India ETF Nifty 50 BeES,28-DEC-2001,1,INF204KB14I2,1
GOLDBEES,Gold,Nippon India ETF Gold BeES,19-MAR-2007,1,INF204KB17I5,1
";

    #[test]
    fn test_normalize_equity() {
        let now = Utc::now();
        let records = normalize(EQUITY_CSV, Category::Equity, "test", now);
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.symbol, "20MICRONS");
        assert_eq!(first.name, "20 Microns Limited");
        assert_eq!(first.series.as_deref(), Some("EQ"));
        assert_eq!(first.listing_date, NaiveDate::from_ymd_opt(2008, 10, 6));
        assert_eq!(first.isin.as_deref(), Some("INE144J01027"));
        assert_eq!(first.face_value, Some(5.0));
        assert_eq!(first.market_lot, Some(1));
        assert_eq!(first.category, Category::Equity);
    }

    #[test]
    fn test_normalize_etf_aliases() {
        let records = normalize(ETF_CSV, Category::Etf, "test", Utc::now());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "Nippon India ETF Nifty 50 BeES");
        assert_eq!(records[0].isin.as_deref(), Some("INF204KB14I2"));
        assert!(records[0].series.is_none());
    }

    #[test]
    fn test_normalize_without_symbol_column() {
        let raw = "TICKERNAME,PRICE\nABC,10\n";
        assert!(normalize(raw, Category::Equity, "test", Utc::now()).is_empty());
    }

    #[test]
    fn test_category_for_file() {
        assert_eq!(
            category_for_file(Path::new("data/EQUITY_L.csv"), ""),
            Some(Category::Equity)
        );
        assert_eq!(
            category_for_file(Path::new("data/SME_EQUITY_L.csv"), ""),
            Some(Category::Sme)
        );
        assert_eq!(
            category_for_file(Path::new("data/dump.csv"), ETF_CSV),
            Some(Category::Etf)
        );
    }
}
