//! In-process stores: a CSV blob cache and the fast record cache.

use super::CsvCache;
use crate::models::{CacheEntry, Category, StockRecord};
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
pub struct MemoryCsvCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCsvCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CsvCache for MemoryCsvCache {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let entries = self.entries.read().map_err(|_| anyhow!("cache lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    // Last writer wins per key.
    fn put(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| anyhow!("cache lock poisoned"))?;
        entries.insert(key.to_string(), entry.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<(String, CacheEntry)>> {
        let entries = self.entries.read().map_err(|_| anyhow!("cache lock poisoned"))?;
        let mut out: Vec<_> = entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

// ── Fast record cache ─────────────────────────────────────────────────────────

struct Snapshot {
    loaded_at: DateTime<Utc>,
    by_symbol: HashMap<String, StockRecord>,
    by_category: HashMap<Category, Vec<StockRecord>>,
}

/// TTL-bound lookup layer in front of the persistent store. Always replaced
/// as a whole.
pub struct RecordCache {
    ttl: chrono::Duration,
    inner: RwLock<Option<Snapshot>>,
}

impl RecordCache {
    pub fn new(ttl: chrono::Duration) -> Self {
        Self {
            ttl,
            inner: RwLock::new(None),
        }
    }

    pub fn put_all(&self, records: &[StockRecord], now: DateTime<Utc>) {
        let mut by_symbol = HashMap::with_capacity(records.len());
        let mut by_category: HashMap<Category, Vec<StockRecord>> = HashMap::new();
        for r in records {
            by_symbol.insert(r.symbol.to_uppercase(), r.clone());
            by_category.entry(r.category).or_default().push(r.clone());
        }
        if let Ok(mut inner) = self.inner.write() {
            *inner = Some(Snapshot {
                loaded_at: now,
                by_symbol,
                by_category,
            });
        }
    }

    fn with_fresh<T>(&self, now: DateTime<Utc>, f: impl FnOnce(&Snapshot) -> Option<T>) -> Option<T> {
        let inner = self.inner.read().ok()?;
        let snap = inner.as_ref()?;
        if now - snap.loaded_at >= self.ttl {
            return None;
        }
        f(snap)
    }

    pub fn get_symbol(&self, symbol: &str, now: DateTime<Utc>) -> Option<StockRecord> {
        let key = symbol.trim().to_uppercase();
        self.with_fresh(now, |s| s.by_symbol.get(&key).cloned())
    }

    pub fn get_category(&self, category: Category, now: DateTime<Utc>) -> Option<Vec<StockRecord>> {
        self.with_fresh(now, |s| s.by_category.get(&category).cloned())
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .ok()
            .and_then(|i| i.as_ref().map(|s| s.by_symbol.len()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
