pub mod memory;

use crate::models::{CacheEntry, Category, CycleMetadata, SearchOptions, StockRecord};
use anyhow::{Context, Result, anyhow};
use chrono::{NaiveDateTime, Utc};
use duckdb::{Connection, Row, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

// ── Collaborator contracts ────────────────────────────────────────────────────

/// Raw CSV blobs keyed by endpoint cache key.
pub trait CsvCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>>;
    fn put(&self, key: &str, entry: &CacheEntry) -> Result<()>;
    fn list(&self) -> Result<Vec<(String, CacheEntry)>>;
}

/// Durable home of the merged record set. Best-effort from the pipeline's view.
pub trait RecordStore: Send + Sync {
    fn put(&self, records: &[StockRecord], cycle: &CycleMetadata) -> Result<usize>;
    fn get(&self, symbol: &str) -> Result<Option<StockRecord>>;
    fn search(&self, query: &str, opts: &SearchOptions) -> Result<Vec<StockRecord>>;
    fn by_category(&self, category: Category) -> Result<Vec<StockRecord>>;
    /// Log a cycle that produced no records to store.
    fn record_cycle(&self, cycle: &CycleMetadata) -> Result<()>;
    /// Most recently finished cycle, successful or not.
    fn last_cycle(&self) -> Result<Option<CycleMetadata>>;
}

// ── Schema ────────────────────────────────────────────────────────────────────

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS stocks (
    symbol        VARCHAR PRIMARY KEY,
    name          VARCHAR NOT NULL,
    series        VARCHAR,
    listing_date  DATE,
    isin          VARCHAR,
    face_value    DOUBLE,
    market_lot    BIGINT,
    category      VARCHAR NOT NULL,
    source        VARCHAR NOT NULL,
    last_updated  TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS csv_cache (
    cache_key    VARCHAR PRIMARY KEY,
    raw_payload  VARCHAR NOT NULL,
    fetched_at   TIMESTAMP NOT NULL,
    size_bytes   BIGINT NOT NULL,
    line_count   BIGINT NOT NULL,
    checksum     VARCHAR NOT NULL
);

CREATE SEQUENCE IF NOT EXISTS fetch_cycle_id START 1;

CREATE TABLE IF NOT EXISTS fetch_cycles (
    id            INTEGER PRIMARY KEY DEFAULT nextval('fetch_cycle_id'),
    started_at    TIMESTAMP NOT NULL,
    finished_at   TIMESTAMP NOT NULL,
    status        VARCHAR NOT NULL,
    source        VARCHAR NOT NULL,
    record_count  BIGINT NOT NULL DEFAULT 0,
    breakdown     VARCHAR,
    error_msg     VARCHAR
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_stocks_category ON stocks (category);
CREATE INDEX IF NOT EXISTS idx_stocks_isin     ON stocks (isin);
"#;

const STOCK_COLUMNS: &str =
    "symbol, name, series, listing_date, isin, face_value, market_lot, category, source, last_updated";

fn row_to_record(r: &Row<'_>) -> duckdb::Result<StockRecord> {
    let category: String = r.get(7)?;
    let last_updated: NaiveDateTime = r.get(9)?;
    Ok(StockRecord {
        symbol: r.get(0)?,
        name: r.get(1)?,
        series: r.get(2)?,
        listing_date: r.get(3)?,
        isin: r.get(4)?,
        face_value: r.get(5)?,
        market_lot: r.get(6)?,
        category: Category::parse(&category).unwrap_or(Category::Unknown),
        source: r.get(8)?,
        last_updated: last_updated.and_utc(),
    })
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub stocks: i64,
    pub cycles: i64,
    pub last_cycle: Option<NaiveDateTime>,
    pub by_category: Vec<(String, i64)>,
}

// ── Repository ────────────────────────────────────────────────────────────────

/// DuckDB-backed store for records, CSV blobs and the cycle log.
pub struct Repository {
    conn: Mutex<Connection>,
}

impl Repository {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DuckDB at {:?}", path))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("DuckDB connection poisoned"))
    }

    pub fn run_migrations(&self) -> Result<()> {
        info!("Running migrations…");
        let conn = self.conn()?;
        conn.execute_batch(DDL).context("DDL failed")?;
        conn.execute_batch(INDEXES).context("Index creation failed")?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
            params![Utc::now().naive_utc()],
        )?;
        info!("Migrations done.");
        Ok(())
    }

    // ── Stocks ────────────────────────────────────────────────────────────────

    /// Upsert records by symbol. Re-running on the same data is a no-op.
    pub fn upsert_stocks(&self, records: &[StockRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let sql = r#"
            INSERT INTO stocks
                (symbol, name, series, listing_date, isin, face_value, market_lot, category, source, last_updated)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (symbol) DO UPDATE SET
                name         = excluded.name,
                series       = excluded.series,
                listing_date = COALESCE(excluded.listing_date, stocks.listing_date),
                isin         = COALESCE(excluded.isin,         stocks.isin),
                face_value   = COALESCE(excluded.face_value,   stocks.face_value),
                market_lot   = COALESCE(excluded.market_lot,   stocks.market_lot),
                category     = excluded.category,
                source       = excluded.source,
                last_updated = excluded.last_updated
        "#;

        for r in records {
            tx.execute(
                sql,
                params![
                    r.symbol,
                    r.name,
                    r.series,
                    r.listing_date,
                    r.isin,
                    r.face_value,
                    r.market_lot,
                    r.category.as_str(),
                    r.source,
                    r.last_updated.naive_utc(),
                ],
            )
            .with_context(|| format!("upsert stock {}", r.symbol))?;
        }

        tx.commit()?;
        Ok(records.len())
    }

    pub fn list_symbols(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT symbol FROM stocks ORDER BY symbol")?;
        let syms: Vec<String> = stmt
            .query_map([], |r| r.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(syms)
    }

    // ── Fetch cycle log ───────────────────────────────────────────────────────

    pub fn log_cycle(&self, cycle: &CycleMetadata) -> Result<()> {
        let breakdown = serde_json::to_string(&cycle.breakdown)?;
        self.conn()?.execute(
            r#"INSERT INTO fetch_cycles
               (started_at, finished_at, status, source, record_count, breakdown, error_msg)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
            params![
                cycle.started_at.naive_utc(),
                cycle.finished_at.naive_utc(),
                if cycle.success { "success" } else { "error" },
                cycle.source,
                cycle.record_count as i64,
                breakdown,
                cycle.error,
            ],
        )?;
        Ok(())
    }

    pub fn last_cycle(&self) -> Result<Option<CycleMetadata>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT started_at, finished_at, status, source, record_count, breakdown, error_msg
               FROM fetch_cycles ORDER BY finished_at DESC, id DESC LIMIT 1"#,
        )?;
        let mut rows = stmt.query_map([], |r| {
            let started_at: NaiveDateTime = r.get(0)?;
            let finished_at: NaiveDateTime = r.get(1)?;
            let status: String = r.get(2)?;
            let breakdown: Option<String> = r.get(5)?;
            Ok(CycleMetadata {
                started_at: started_at.and_utc(),
                finished_at: finished_at.and_utc(),
                success: status == "success",
                source: r.get(3)?,
                record_count: r.get::<_, i64>(4)? as usize,
                breakdown: breakdown
                    .and_then(|b| serde_json::from_str(&b).ok())
                    .unwrap_or_default(),
                error: r.get(6)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn()?;
        let stocks: i64 = conn.query_row("SELECT COUNT(*) FROM stocks", [], |r| r.get(0))?;
        let cycles: i64 = conn.query_row("SELECT COUNT(*) FROM fetch_cycles", [], |r| r.get(0))?;
        let last_cycle: Option<NaiveDateTime> =
            conn.query_row("SELECT MAX(finished_at) FROM fetch_cycles", [], |r| r.get(0))?;

        let mut stmt = conn.prepare(
            "SELECT category, COUNT(*) FROM stocks GROUP BY category ORDER BY category",
        )?;
        let by_category = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
            .filter_map(|r| r.ok())
            .collect();

        Ok(StoreStats {
            stocks,
            cycles,
            last_cycle,
            by_category,
        })
    }
}

impl RecordStore for Repository {
    fn put(&self, records: &[StockRecord], cycle: &CycleMetadata) -> Result<usize> {
        let n = self.upsert_stocks(records)?;
        self.log_cycle(cycle)?;
        Ok(n)
    }

    fn record_cycle(&self, cycle: &CycleMetadata) -> Result<()> {
        self.log_cycle(cycle)
    }

    fn last_cycle(&self) -> Result<Option<CycleMetadata>> {
        Repository::last_cycle(self)
    }

    fn get(&self, symbol: &str) -> Result<Option<StockRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {STOCK_COLUMNS} FROM stocks WHERE symbol = ?"
        ))?;
        let mut rows = stmt.query_map(params![symbol.trim().to_uppercase()], row_to_record)?;
        Ok(rows.next().transpose()?)
    }

    fn by_category(&self, category: Category) -> Result<Vec<StockRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {STOCK_COLUMNS} FROM stocks WHERE category = ? ORDER BY symbol"
        ))?;
        let rows = stmt.query_map(params![category.as_str()], row_to_record)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn search(&self, query: &str, opts: &SearchOptions) -> Result<Vec<StockRecord>> {
        let q = query.trim().to_uppercase();
        let conn = self.conn()?;

        if opts.exact_match {
            let mut stmt = conn.prepare(&format!(
                "SELECT {STOCK_COLUMNS} FROM stocks WHERE symbol = ? LIMIT ?"
            ))?;
            let rows = stmt.query_map(params![q, opts.limit as i64], row_to_record)?;
            return Ok(rows.filter_map(|r| r.ok()).collect());
        }

        let prefix = format!("{q}%");
        let contains = format!("%{q}%");
        let mut stmt = conn.prepare(&format!(
            r#"SELECT {STOCK_COLUMNS} FROM stocks
               WHERE symbol LIKE ? OR upper(name) LIKE ?
               ORDER BY CASE
                   WHEN symbol = ? THEN 0
                   WHEN symbol LIKE ? THEN 1
                   WHEN symbol LIKE ? THEN 2
                   ELSE 3 END,
                 symbol
               LIMIT ?"#
        ))?;
        let rows = stmt.query_map(
            params![contains, contains, q, prefix, contains, opts.limit as i64],
            row_to_record,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

impl CsvCache for Repository {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT raw_payload, fetched_at, size_bytes, line_count, checksum FROM csv_cache WHERE cache_key = ?",
        )?;
        let mut rows = stmt.query_map(params![key], |r| {
            let fetched_at: NaiveDateTime = r.get(1)?;
            Ok(CacheEntry {
                raw_payload: r.get(0)?,
                timestamp: fetched_at.and_utc(),
                size_bytes: r.get::<_, i64>(2)? as usize,
                line_count: r.get::<_, i64>(3)? as usize,
                checksum: r.get(4)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    fn put(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        self.conn()?
            .execute(
                r#"INSERT INTO csv_cache (cache_key, raw_payload, fetched_at, size_bytes, line_count, checksum)
                   VALUES (?, ?, ?, ?, ?, ?)
                   ON CONFLICT (cache_key) DO UPDATE SET
                       raw_payload = excluded.raw_payload,
                       fetched_at  = excluded.fetched_at,
                       size_bytes  = excluded.size_bytes,
                       line_count  = excluded.line_count,
                       checksum    = excluded.checksum"#,
                params![
                    key,
                    entry.raw_payload,
                    entry.timestamp.naive_utc(),
                    entry.size_bytes as i64,
                    entry.line_count as i64,
                    entry.checksum,
                ],
            )
            .with_context(|| format!("cache put {key}"))?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<(String, CacheEntry)>> {
        let keys: Vec<String> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare("SELECT cache_key FROM csv_cache ORDER BY cache_key")?;
            stmt.query_map([], |r| r.get(0))?
                .filter_map(|r| r.ok())
                .collect()
        };
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = CsvCache::get(self, &key)? {
                out.push((key, entry));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn repo() -> Repository {
        let r = Repository::open_in_memory().unwrap();
        r.run_migrations().unwrap();
        r
    }

    fn record(symbol: &str, name: &str) -> StockRecord {
        StockRecord {
            symbol: symbol.into(),
            name: name.into(),
            series: Some("EQ".into()),
            listing_date: NaiveDate::from_ymd_opt(2001, 5, 17),
            isin: Some(format!("INE{symbol}01")),
            face_value: Some(10.0),
            market_lot: Some(1),
            category: Category::Equity,
            source: "test".into(),
            last_updated: Utc::now(),
        }
    }

    fn cycle(n: usize) -> CycleMetadata {
        CycleMetadata {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            success: true,
            source: "network".into(),
            record_count: n,
            breakdown: BTreeMap::from([(Category::Equity, n)]),
            error: None,
        }
    }

    #[test]
    fn test_put_get_and_search() {
        let r = repo();
        let records = vec![
            record("TCS", "Tata Consultancy Services Limited"),
            record("TATAMOTORS", "Tata Motors Limited"),
            record("INFY", "Infosys Limited"),
        ];
        assert_eq!(RecordStore::put(&r, &records, &cycle(3)).unwrap(), 3);

        let tcs = RecordStore::get(&r, "tcs").unwrap().unwrap();
        assert_eq!(tcs.name, "Tata Consultancy Services Limited");
        assert_eq!(tcs.listing_date, NaiveDate::from_ymd_opt(2001, 5, 17));

        let hits = r.search("tata", &SearchOptions::default()).unwrap();
        assert_eq!(hits.len(), 2);

        let equity: Vec<String> = r
            .by_category(Category::Equity)
            .unwrap()
            .into_iter()
            .map(|s| s.symbol)
            .collect();
        assert_eq!(equity, vec!["INFY", "TATAMOTORS", "TCS"]);
        assert!(r.by_category(Category::Sme).unwrap().is_empty());

        let exact = r
            .search("TCS", &SearchOptions { limit: 10, exact_match: true })
            .unwrap();
        assert_eq!(exact.len(), 1);

        let stats = r.stats().unwrap();
        assert_eq!(stats.stocks, 3);
        assert_eq!(stats.cycles, 1);
    }

    #[test]
    fn test_last_cycle_is_most_recent() {
        let r = repo();
        assert!(r.last_cycle().unwrap().is_none());

        RecordStore::put(&r, &[record("TCS", "Tata Consultancy Services Limited")], &cycle(1)).unwrap();
        let mut failed = cycle(0);
        failed.started_at = Utc::now() + chrono::Duration::seconds(5);
        failed.finished_at = failed.started_at;
        failed.success = false;
        failed.breakdown.clear();
        failed.error = Some("equity: required endpoint exhausted".into());
        r.record_cycle(&failed).unwrap();

        let last = RecordStore::last_cycle(&r).unwrap().unwrap();
        assert!(!last.success);
        assert_eq!(last.error.as_deref(), Some("equity: required endpoint exhausted"));
        assert!(last.breakdown.is_empty());
        assert_eq!(r.stats().unwrap().cycles, 2);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let r = repo();
        let records = vec![record("TCS", "Tata Consultancy Services Limited")];
        r.upsert_stocks(&records).unwrap();
        r.upsert_stocks(&records).unwrap();
        assert_eq!(r.list_symbols().unwrap(), vec!["TCS"]);
    }

    #[test]
    fn test_csv_cache_round_trip() {
        let r = repo();
        let entry = CacheEntry::from_payload("SYMBOL,NAME,SERIES\nA,Alpha,EQ\n".into(), Utc::now());
        CsvCache::put(&r, "nse_equity_csv", &entry).unwrap();
        let back = CsvCache::get(&r, "nse_equity_csv").unwrap().unwrap();
        assert_eq!(back.checksum, entry.checksum);
        assert_eq!(back.line_count, 2);
        assert!(CsvCache::get(&r, "nse_sme_csv").unwrap().is_none());
        assert_eq!(r.list().unwrap().len(), 1);
    }
}
