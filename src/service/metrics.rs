use crate::models::Category;
use crate::pipeline::PipelineObserver;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters fed by the pipeline through [`PipelineObserver`].
#[derive(Default)]
pub struct Metrics {
    cycles: AtomicU64,
    successful_cycles: AtomicU64,
    downloads: AtomicU64,
    failed_downloads: AtomicU64,
    cache_hits: AtomicU64,
    cache_fallbacks: AtomicU64,
    last_cycle_ms: AtomicU64,
    retries: Mutex<BTreeMap<Category, u64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub cycles: u64,
    pub successful_cycles: u64,
    pub success_rate: f64,
    pub downloads: u64,
    pub failed_downloads: u64,
    pub cache_hits: u64,
    /// Cache hits over all endpoint servings (hits + download attempts that settled).
    pub cache_hit_rate: f64,
    pub cache_fallbacks: u64,
    pub last_cycle_ms: u64,
    pub retries: BTreeMap<Category, u64>,
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let cycles = self.cycles.load(Ordering::Relaxed);
        let successful_cycles = self.successful_cycles.load(Ordering::Relaxed);
        let downloads = self.downloads.load(Ordering::Relaxed);
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        MetricsSnapshot {
            cycles,
            successful_cycles,
            success_rate: ratio(successful_cycles, cycles),
            downloads,
            failed_downloads: self.failed_downloads.load(Ordering::Relaxed),
            cache_hits,
            cache_hit_rate: ratio(cache_hits, cache_hits + downloads),
            cache_fallbacks: self.cache_fallbacks.load(Ordering::Relaxed),
            last_cycle_ms: self.last_cycle_ms.load(Ordering::Relaxed),
            retries: self.retries.lock().map(|r| r.clone()).unwrap_or_default(),
        }
    }
}

impl PipelineObserver for Metrics {
    fn on_cache_hit(&self, _category: Category) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn on_retry(&self, category: Category, _attempt: u32) {
        if let Ok(mut retries) = self.retries.lock() {
            *retries.entry(category).or_default() += 1;
        }
    }

    fn on_download(&self, _category: Category, ok: bool) {
        self.downloads.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failed_downloads.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_cache_fallback(&self, _category: Category) {
        self.cache_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    fn on_cycle(&self, success: bool, elapsed: Duration) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_cycles.fetch_add(1, Ordering::Relaxed);
        }
        self.last_cycle_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);
    }
}
