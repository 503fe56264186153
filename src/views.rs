//! Saved views
//!
//! A saved view is a pinned history entry. Refreshing re-runs its query
//! headlessly (lexical, cosine and batch rerank, no UI) and replaces the
//! stored snapshot. Refreshes run as tokio tasks bounded by a semaphore; each
//! carries a per-view token so a refresh superseded by a newer one for the
//! same view never writes, and its backend calls are cancelled.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backends, RerankPolicy, SharedCorpus, guarded};
use crate::config::Config;
use crate::error::{FerretError, Result};
use crate::pipeline::{SessionToken, TokenIssuer};
use crate::search::{RrfConfig, ScoreRecord, order_records, semantic_scores};
use crate::storage::{HistoryEntry, HistoryResult, ItemId, Store};

const MIN_CONCURRENCY: usize = 1;
const MAX_CONCURRENCY: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Updated { rows: usize },
    /// A newer refresh of the same view started before this one finished.
    Superseded,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshReport {
    pub history_id: i64,
    pub query: String,
    pub token: u64,
    #[serde(flatten)]
    pub outcome: RefreshOutcome,
}

/// Token and cancellation handle of one refresh run.
#[derive(Debug, Clone)]
struct ViewRun {
    token: SessionToken,
    cancel: CancellationToken,
}

#[derive(Debug, Clone)]
struct RankSettings {
    rrf: RrfConfig,
    lexical_limit: usize,
    semantic_limit: usize,
    min_cosine: f32,
    rerank_candidates: usize,
}

pub struct SavedViews {
    store: Arc<Store>,
    backends: Backends,
    corpus: Arc<SharedCorpus>,
    settings: RankSettings,
    permits: Arc<Semaphore>,
    issuer: Mutex<TokenIssuer>,
    latest: Mutex<HashMap<i64, ViewRun>>,
}

impl std::fmt::Debug for SavedViews {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SavedViews")
            .field("permits", &self.permits.available_permits())
            .field("tracked", &self.latest.lock().len())
            .finish_non_exhaustive()
    }
}

impl SavedViews {
    pub fn new(
        store: Arc<Store>,
        backends: Backends,
        corpus: Arc<SharedCorpus>,
        config: &Config,
    ) -> Self {
        let concurrency = (config.views.refresh_concurrency as usize)
            .clamp(MIN_CONCURRENCY, MAX_CONCURRENCY);
        Self {
            store,
            backends,
            corpus,
            settings: RankSettings {
                rrf: RrfConfig::from(&config.search),
                lexical_limit: config.search.lexical_limit as usize,
                semantic_limit: config.search.semantic_limit as usize,
                min_cosine: config.search.min_cosine,
                rerank_candidates: config.search.rerank_candidates as usize,
            },
            permits: Arc::new(Semaphore::new(concurrency)),
            issuer: Mutex::new(TokenIssuer::new()),
            latest: Mutex::new(HashMap::new()),
        }
    }

    /// Number of refreshes allowed to run at once.
    pub fn concurrency(&self) -> usize {
        self.permits.available_permits()
    }

    /// Pinned history entries, most recently used first.
    pub fn list(&self) -> Result<Vec<HistoryEntry>> {
        self.store.read(|db| db.pinned_history())
    }

    /// Refresh every saved view, at most `concurrency` at a time.
    pub async fn refresh_all(self: &Arc<Self>) -> Result<Vec<RefreshReport>> {
        let views = self.list()?;
        tracing::info!(views = views.len(), "refreshing saved views");

        let mut tasks = JoinSet::new();
        for entry in views {
            let run = self.begin(entry.id);
            let this = Arc::clone(self);
            tasks.spawn(async move { this.refresh_with(entry, run).await });
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(err) => tracing::warn!(error = %err, "view refresh task panicked"),
            }
        }
        reports.sort_by_key(|report| report.history_id);
        Ok(reports)
    }

    /// Refresh one view now.
    pub async fn refresh(&self, history_id: i64) -> Result<RefreshReport> {
        let entry = self
            .store
            .read(|db| db.get_history(history_id))?
            .ok_or_else(|| FerretError::NotFound(format!("history entry {history_id}")))?;
        let run = self.begin(history_id);
        Ok(self.refresh_with(entry, run).await)
    }

    /// Issue a fresh token for `history_id`. The previous run for the view
    /// becomes stale and its in-flight backend calls are cancelled.
    fn begin(&self, history_id: i64) -> ViewRun {
        let run = ViewRun {
            token: self.issuer.lock().issue(),
            cancel: CancellationToken::new(),
        };
        if let Some(previous) = self.latest.lock().insert(history_id, run.clone()) {
            previous.cancel.cancel();
        }
        run
    }

    fn is_current(&self, history_id: i64, token: SessionToken) -> bool {
        self.latest
            .lock()
            .get(&history_id)
            .is_some_and(|run| run.token == token)
    }

    async fn refresh_with(&self, entry: HistoryEntry, run: ViewRun) -> RefreshReport {
        let token = run.token;
        let report = |outcome| RefreshReport {
            history_id: entry.id,
            query: entry.raw_query.clone(),
            token: token.get(),
            outcome,
        };

        let Ok(_permit) = self.permits.acquire().await else {
            return report(RefreshOutcome::Failed {
                reason: "refresh pool closed".to_string(),
            });
        };
        if !self.is_current(entry.id, token) {
            return report(RefreshOutcome::Superseded);
        }

        let results = match self.rank(&entry.raw_query, &run).await {
            Ok(results) => results,
            Err(err) => {
                tracing::warn!(view = entry.id, %token, error = %err, "view refresh failed");
                return report(RefreshOutcome::Failed {
                    reason: err.to_string(),
                });
            }
        };

        if !self.is_current(entry.id, token) {
            tracing::debug!(view = entry.id, %token, "discarding superseded view refresh");
            return report(RefreshOutcome::Superseded);
        }

        let rows = results.len();
        let store = Arc::clone(&self.store);
        let written = tokio::task::spawn_blocking(move || {
            store.write(|db| db.replace_history_results(entry.id, token.get(), &results))
        })
        .await
        .map_err(|err| FerretError::TransactionFailed(err.to_string()))
        .and_then(|result| result);

        match written {
            Ok(()) => {
                tracing::debug!(view = entry.id, %token, rows, "view refreshed");
                report(RefreshOutcome::Updated { rows })
            }
            Err(err) => {
                tracing::warn!(view = entry.id, error = %err, "failed to store view snapshot");
                report(RefreshOutcome::Failed {
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Headless ranking of `query`: lexical hits, then cosine over the shared
    /// corpus, then a batch rerank when one is configured. Embedding, corpus
    /// and rerank failures degrade the result like they do interactively.
    async fn rank(&self, query: &str, run: &ViewRun) -> Result<Vec<HistoryResult>> {
        let token = run.token;
        let cancel = &run.cancel;
        let timeouts = self.backends.timeouts;

        let lexical = Arc::clone(&self.backends.lexical);
        let text = query.to_string();
        let limit = self.settings.lexical_limit;
        let hits = tokio::task::spawn_blocking(move || lexical.search_lexical(&text, limit))
            .await
            .map_err(|err| FerretError::backend("lexical", err.to_string()))??;

        let mut records: HashMap<ItemId, ScoreRecord> = HashMap::new();
        let mut texts: HashMap<ItemId, String> = HashMap::new();
        for hit in hits {
            records
                .entry(hit.item.id)
                .or_insert_with(|| ScoreRecord::new(hit.item.id))
                .record_lexical(hit.score);
            texts.insert(hit.item.id, hit.item.document_text());
        }

        let embedding = guarded(
            "embed",
            cancel,
            timeouts.embed,
            self.backends.embedder.embed_query(query),
        )
        .await;
        let semantic = match embedding {
            Ok(vector) => guarded(
                "corpus",
                cancel,
                timeouts.corpus,
                self.corpus.load(self.backends.corpus.as_ref()),
            )
            .await
            .map(|corpus| (vector, corpus)),
            Err(err) => Err(err),
        };

        match semantic {
            Ok((vector, corpus)) => {
                let known: Vec<ItemId> = records.keys().copied().collect();
                let scored = semantic_scores(
                    &vector,
                    known,
                    |id| corpus.embedding(id),
                    corpus
                        .entries()
                        .iter()
                        .map(|entry| (entry.item.id, entry.embedding.as_slice())),
                    self.settings.min_cosine,
                    self.settings.semantic_limit,
                );
                for (id, score) in scored {
                    records
                        .entry(id)
                        .or_insert_with(|| ScoreRecord::new(id))
                        .record_cosine(score);
                    if let Some(entry) = corpus.get(id) {
                        texts
                            .entry(id)
                            .or_insert_with(|| entry.item.document_text());
                    }
                }
            }
            Err(err) => {
                tracing::warn!(%token, error = %err, "view semantic stage failed, keeping lexical order");
            }
        }

        let mut order = order_records(&records, &self.settings.rrf);
        if let Some(reranker) = &self.backends.reranker {
            if reranker.policy() == RerankPolicy::Batch && !order.is_empty() {
                let candidates: Vec<ItemId> = order
                    .iter()
                    .take(self.settings.rerank_candidates)
                    .copied()
                    .collect();
                let docs: Vec<String> = candidates
                    .iter()
                    .map(|id| texts.get(id).cloned().unwrap_or_default())
                    .collect();
                match guarded("rerank", cancel, timeouts.rerank, reranker.rerank(query, &docs))
                    .await
                {
                    Ok(scores) if scores.len() == candidates.len() => {
                        for (id, score) in candidates.iter().zip(scores) {
                            if let Some(record) = records.get_mut(id) {
                                record.record_rerank(score);
                            }
                        }
                        order = order_records(&records, &self.settings.rrf);
                    }
                    Ok(scores) => {
                        tracing::warn!(
                            expected = candidates.len(),
                            got = scores.len(),
                            "view rerank returned wrong number of scores"
                        );
                    }
                    Err(err) => {
                        tracing::warn!(%token, error = %err, "view rerank failed");
                    }
                }
            }
        }

        Ok(order
            .iter()
            .enumerate()
            .filter_map(|(rank, id)| {
                records.get(id).map(|record| HistoryResult {
                    session_id: token.get(),
                    rank: u32::try_from(rank).unwrap_or(u32::MAX),
                    item_id: *id,
                    lexical_score: record.lexical(),
                    cosine_score: record.cosine(),
                    rerank_score: record.rerank(),
                    provenance: record.provenance().bits(),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::backend::{Corpus, CorpusSource, OverlapReranker, Reranker, StageTimeouts, StoreCorpus};
    use crate::search::{HashEmbedder, Provenance};
    use crate::storage::NewHistory;
    use crate::test_utils::fixtures::seeded_store;

    const DIMS: usize = 64;

    struct BrokenCorpus;

    #[async_trait]
    impl CorpusSource for BrokenCorpus {
        async fn load_corpus(&self) -> Result<Corpus> {
            Err(FerretError::backend("corpus", "disk unplugged"))
        }
    }

    fn views_for(store: &Arc<Store>, concurrency: u32) -> Arc<SavedViews> {
        views_with(
            store,
            concurrency,
            Arc::new(StoreCorpus::new(Arc::clone(store))),
            Arc::new(OverlapReranker::new(RerankPolicy::Batch)),
        )
    }

    fn views_with(
        store: &Arc<Store>,
        concurrency: u32,
        corpus: Arc<dyn CorpusSource>,
        reranker: Arc<dyn Reranker>,
    ) -> Arc<SavedViews> {
        let mut config = Config::default();
        config.views.refresh_concurrency = concurrency;
        config.search.min_cosine = 0.0;
        let backends = Backends {
            embedder: Arc::new(HashEmbedder::new(DIMS)),
            corpus,
            reranker: Some(reranker),
            lexical: Arc::clone(store) as Arc<dyn crate::backend::LexicalSearch>,
            timeouts: StageTimeouts {
                embed: Duration::from_secs(2),
                corpus: Duration::from_secs(2),
                rerank: Duration::from_secs(2),
            },
        };
        Arc::new(SavedViews::new(
            Arc::clone(store),
            backends,
            Arc::new(SharedCorpus::new()),
            &config,
        ))
    }

    fn save_view(store: &Store, query: &str, pinned: bool) -> i64 {
        store
            .write(|db| {
                let id = db.upsert_history(
                    &NewHistory {
                        normalized_query: query,
                        raw_query: query,
                        backend: "hash",
                        duration_ms: 1,
                        query_embedding: None,
                        used_at: Utc::now(),
                    },
                    0,
                    &[],
                    100,
                )?;
                db.set_pinned(id, pinned)?;
                Ok(id)
            })
            .unwrap()
    }

    #[test]
    fn concurrency_is_clamped() {
        let store = Arc::new(seeded_store(DIMS));
        assert_eq!(views_for(&store, 0).concurrency(), 1);
        assert_eq!(views_for(&store, 2).concurrency(), 2);
        assert_eq!(views_for(&store, 12).concurrency(), 3);
    }

    #[tokio::test]
    async fn refresh_all_updates_pinned_views_only() {
        let store = Arc::new(seeded_store(DIMS));
        let climate = save_view(&store, "climate risk", true);
        let battery = save_view(&store, "battery storage", true);
        let unpinned = save_view(&store, "heat pumps", false);

        let views = views_for(&store, 2);
        let reports = views.refresh_all().await.unwrap();
        assert_eq!(reports.len(), 2);
        for report in &reports {
            assert!(matches!(report.outcome, RefreshOutcome::Updated { rows } if rows > 0));
        }

        let rows = store.read(|db| db.history_results(climate)).unwrap();
        assert!(!rows.is_empty());
        assert!(Provenance::from_bits(rows[0].provenance).contains(Provenance::RERANKED));
        assert!(!store.read(|db| db.history_results(battery)).unwrap().is_empty());
        assert!(store.read(|db| db.history_results(unpinned)).unwrap().is_empty());

        let entry = store.read(|db| db.get_history(climate)).unwrap().unwrap();
        assert_eq!(entry.use_count, 1);
    }

    #[tokio::test]
    async fn superseded_refresh_does_not_write() {
        let store = Arc::new(seeded_store(DIMS));
        let id = save_view(&store, "climate risk", true);
        let views = views_for(&store, 1);

        let stale = views.begin(id);
        let fresh = views.begin(id);
        let entry = store.read(|db| db.get_history(id)).unwrap().unwrap();

        let report = views.refresh_with(entry.clone(), stale).await;
        assert_eq!(report.outcome, RefreshOutcome::Superseded);
        assert!(store.read(|db| db.history_results(id)).unwrap().is_empty());

        let report = views.refresh_with(entry, fresh.clone()).await;
        assert!(matches!(report.outcome, RefreshOutcome::Updated { .. }));
        let rows = store.read(|db| db.history_results(id)).unwrap();
        assert!(rows.iter().all(|row| row.session_id == fresh.token.get()));
    }

    #[test]
    fn begin_cancels_the_previous_run() {
        let store = Arc::new(seeded_store(DIMS));
        let views = views_for(&store, 1);

        let first = views.begin(7);
        let second = views.begin(7);
        let other = views.begin(8);
        assert!(first.cancel.is_cancelled());
        assert!(!second.cancel.is_cancelled());
        assert!(!other.cancel.is_cancelled());
        assert!(views.is_current(7, second.token));
        assert!(!views.is_current(7, first.token));
    }

    #[tokio::test]
    async fn superseded_refresh_stops_its_rerank() {
        let store = Arc::new(seeded_store(DIMS));
        let id = save_view(&store, "climate risk", true);
        let slow = OverlapReranker::new(RerankPolicy::Batch).with_delay(Duration::from_millis(300));
        let views = views_with(
            &store,
            1,
            Arc::new(StoreCorpus::new(Arc::clone(&store))),
            Arc::new(slow),
        );

        let running = {
            let views = Arc::clone(&views);
            tokio::spawn(async move { views.refresh(id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        views.begin(id);

        let report = tokio::time::timeout(Duration::from_millis(500), running)
            .await
            .expect("cancelled refresh should return promptly")
            .unwrap()
            .unwrap();
        assert_eq!(report.outcome, RefreshOutcome::Superseded);
        assert!(store.read(|db| db.history_results(id)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn corpus_failure_keeps_lexical_results() {
        let store = Arc::new(seeded_store(DIMS));
        let id = save_view(&store, "climate risk", true);
        let views = views_with(
            &store,
            1,
            Arc::new(BrokenCorpus),
            Arc::new(OverlapReranker::new(RerankPolicy::Batch)),
        );

        let report = views.refresh(id).await.unwrap();
        let RefreshOutcome::Updated { rows } = report.outcome else {
            panic!("expected an updated view, got {:?}", report.outcome);
        };
        assert!(rows >= 2);

        let stored = store.read(|db| db.history_results(id)).unwrap();
        assert_eq!(stored.len(), rows);
        for row in &stored {
            let provenance = Provenance::from_bits(row.provenance);
            assert!(provenance.contains(Provenance::LEXICAL));
            assert!(!provenance.contains(Provenance::COSINE));
            assert!(row.cosine_score.is_none());
        }
    }

    #[tokio::test]
    async fn refresh_unknown_view_is_not_found() {
        let store = Arc::new(seeded_store(DIMS));
        let views = views_for(&store, 1);
        let err = views.refresh(999).await.unwrap_err();
        assert!(matches!(err, FerretError::NotFound(_)));
    }
}
