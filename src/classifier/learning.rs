use serde::Serialize;
use std::collections::HashSet;
use std::sync::RwLock;

/// Soft memory of which URLs parsed well before. A hint, never a guarantee.
pub trait LearningState: Send + Sync {
    fn is_known_good(&self, url: &str) -> bool;
    fn is_known_bad(&self, url: &str) -> bool;
    fn remember_good(&self, url: &str);
    fn remember_bad(&self, url: &str);
    fn snapshot(&self) -> LearningSnapshot;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LearningSnapshot {
    pub known_good: usize,
    pub known_bad: usize,
}

/// Process-lifetime implementation; forgotten on restart.
#[derive(Default)]
pub struct InMemoryLearning {
    good: RwLock<HashSet<String>>,
    bad: RwLock<HashSet<String>>,
}

impl InMemoryLearning {
    pub fn new() -> Self {
        Self::default()
    }
}

fn contains(set: &RwLock<HashSet<String>>, url: &str) -> bool {
    set.read().map(|s| s.contains(url)).unwrap_or(false)
}

fn len(set: &RwLock<HashSet<String>>) -> usize {
    set.read().map(|s| s.len()).unwrap_or(0)
}

// A URL lives in at most one of the two sets.
fn move_into(to: &RwLock<HashSet<String>>, from: &RwLock<HashSet<String>>, url: &str) {
    if let Ok(mut from) = from.write() {
        from.remove(url);
    }
    if let Ok(mut to) = to.write() {
        to.insert(url.to_string());
    }
}

impl LearningState for InMemoryLearning {
    fn is_known_good(&self, url: &str) -> bool {
        contains(&self.good, url)
    }

    fn is_known_bad(&self, url: &str) -> bool {
        contains(&self.bad, url)
    }

    fn remember_good(&self, url: &str) {
        move_into(&self.good, &self.bad, url);
    }

    fn remember_bad(&self, url: &str) {
        move_into(&self.bad, &self.good, url);
    }

    fn snapshot(&self) -> LearningSnapshot {
        LearningSnapshot {
            known_good: len(&self.good),
            known_bad: len(&self.bad),
        }
    }
}
