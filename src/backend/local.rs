//! Offline adapters: hash embeddings, the store-backed corpus and a
//! deterministic term-overlap reranker.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{Corpus, CorpusSource, QueryEmbedder, RerankPolicy, Reranker};
use crate::error::{FerretError, Result};
use crate::search::HashEmbedder;
use crate::storage::Store;

#[async_trait]
impl QueryEmbedder for HashEmbedder {
    fn name(&self) -> &str {
        "hash"
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed(text))
    }
}

/// Loads item embeddings from the store on a blocking thread.
pub struct StoreCorpus {
    store: Arc<Store>,
}

impl StoreCorpus {
    pub const fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CorpusSource for StoreCorpus {
    async fn load_corpus(&self) -> Result<Corpus> {
        let store = Arc::clone(&self.store);
        let entries = tokio::task::spawn_blocking(move || store.read(|db| db.load_corpus()))
            .await
            .map_err(|err| FerretError::backend("corpus", err.to_string()))??;
        tracing::debug!(items = entries.len(), "corpus loaded");
        Ok(Corpus::new(entries))
    }
}

/// Scores a candidate by the share of query terms it contains, with a small
/// bonus for terms in the first line (the title).
#[derive(Debug, Clone)]
pub struct OverlapReranker {
    policy: RerankPolicy,
    delay: Duration,
}

impl OverlapReranker {
    pub const fn new(policy: RerankPolicy) -> Self {
        Self {
            policy,
            delay: Duration::ZERO,
        }
    }

    /// Simulated per-candidate latency.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn overlap(query: &str, candidate: &str) -> f32 {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return 0.0;
        }
        let title = candidate.lines().next().unwrap_or_default();
        let body_terms = terms(candidate);
        let title_terms = terms(title);

        let matched = query_terms.iter().filter(|t| body_terms.contains(*t)).count();
        let in_title = query_terms.iter().filter(|t| title_terms.contains(*t)).count();
        let total = query_terms.len() as f32;
        (matched as f32 / total).mul_add(0.8, in_title as f32 / total * 0.2)
    }
}

#[async_trait]
impl Reranker for OverlapReranker {
    fn name(&self) -> &str {
        "overlap"
    }

    fn policy(&self) -> RerankPolicy {
        self.policy
    }

    async fn rerank(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>> {
        let mut scores = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            scores.push(self.score(query, candidate).await?);
        }
        Ok(scores)
    }

    async fn score(&self, query: &str, candidate: &str) -> Result<f32> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(Self::overlap(query, candidate))
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_string)
        .collect()
}
