//! Prior-search cache
//!
//! Two probes over the search history: an exact lookup by normalized query
//! (with an in-memory LRU in front of SQLite) and a cosine scan over the
//! stored query embeddings of recently used entries. A strong similarity
//! match counts as a hit; a weaker one is only surfaced as a suggestion.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::config::CacheConfig;
use crate::error::Result;
use crate::search::embeddings::rank_by_similarity;
use crate::storage::{HistoryEntry, HistoryResult, Store};

/// Result of probing the cache for a query.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheOutcome {
    /// Exact normalized match, or similarity at or above the hit threshold.
    Hit { entry: HistoryEntry, similarity: f32 },
    /// Similar prior search below the hit threshold. Never applied.
    Suggestion { entry: HistoryEntry, similarity: f32 },
    Miss,
}

impl CacheOutcome {
    pub const fn is_hit(&self) -> bool {
        matches!(self, Self::Hit { .. })
    }
}

pub struct SearchCache {
    store: Arc<Store>,
    config: CacheConfig,
    exact: Mutex<LruCache<String, HistoryEntry>>,
}

impl std::fmt::Debug for SearchCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchCache")
            .field("config", &self.config)
            .field("memory_entries", &self.exact.lock().len())
            .finish_non_exhaustive()
    }
}

impl SearchCache {
    pub fn new(store: Arc<Store>, config: CacheConfig) -> Self {
        let capacity =
            NonZeroUsize::new(config.memory_entries as usize).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            config,
            exact: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub const fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Look up a prior search by normalized query text.
    pub fn probe_exact(&self, normalized: &str) -> Result<Option<HistoryEntry>> {
        if !self.config.enabled || normalized.is_empty() {
            return Ok(None);
        }
        if let Some(entry) = self.exact.lock().get(normalized) {
            return Ok(Some(entry.clone()));
        }

        let entry = self.store.read(|db| db.get_history_by_query(normalized))?;
        if let Some(entry) = &entry {
            self.exact.lock().put(normalized.to_string(), entry.clone());
        }
        Ok(entry)
    }

    /// Prior searches whose query embedding is at least `threshold` similar,
    /// best first.
    pub fn probe_similar(
        &self,
        embedding: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<(HistoryEntry, f32)>> {
        if !self.config.enabled || embedding.is_empty() {
            return Ok(Vec::new());
        }

        let recent = self
            .store
            .read(|db| db.recent_query_embeddings(self.config.recent_window as usize))?;
        let ranked = rank_by_similarity(
            embedding,
            recent.iter().enumerate().filter_map(|(idx, entry)| {
                entry
                    .query_embedding
                    .as_deref()
                    .map(|vector| (idx, vector))
            }),
            threshold,
            limit,
        );

        Ok(ranked
            .into_iter()
            .map(|(idx, similarity)| (recent[idx].clone(), similarity))
            .collect())
    }

    /// Classify the closest prior search other than `exclude` (the query
    /// itself, already handled by the exact probe).
    pub fn classify(&self, embedding: &[f32], exclude: &str) -> Result<CacheOutcome> {
        let candidates = self.probe_similar(embedding, self.config.suggest_threshold, 4)?;
        let Some((entry, similarity)) = candidates
            .into_iter()
            .find(|(entry, _)| entry.normalized_query != exclude)
        else {
            return Ok(CacheOutcome::Miss);
        };

        if similarity >= self.config.hit_threshold {
            Ok(CacheOutcome::Hit { entry, similarity })
        } else {
            Ok(CacheOutcome::Suggestion { entry, similarity })
        }
    }

    /// Stored result snapshot for a hit.
    pub fn snapshot(&self, entry: &HistoryEntry) -> Result<Vec<HistoryResult>> {
        self.store.read(|db| db.history_results(entry.id))
    }

    /// Drop the memory entry after the history row changed.
    pub fn invalidate(&self, normalized: &str) {
        self.exact.lock().pop(normalized);
    }

    pub fn clear(&self) {
        self.exact.lock().clear();
    }
}
