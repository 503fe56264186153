//! Search pipeline orchestration
//!
//! The [`Orchestrator`] is owned by the single-threaded core. A committed
//! query runs the cache probe and lexical search synchronously, then spawns
//! the query embedding and corpus load as tokio tasks. Tasks report back as
//! [`PipelineEvent`]s over an unbounded channel; the core drains it and calls
//! [`Orchestrator::apply`]. Every event carries the token of the session that
//! spawned it and is ignored unless that session is still current.

pub mod events;
pub mod session;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::backend::{Backends, Corpus, RerankPolicy, SharedCorpus, guarded};
use crate::cache::{CacheOutcome, SearchCache};
use crate::config::Config;
use crate::error::{ErrorClass, FerretError, Result};
use crate::search::{RrfConfig, ScoreRecord, normalize_query, semantic_scores};
use crate::storage::{HistoryEntry, HistoryResult, ItemId, ItemRecord, NewHistory, Store};

pub use events::PipelineEvent;
pub use session::{
    Placeholder, RerankProgress, SearchSession, SessionOrigin, SessionToken, StageFlags,
    StageStatus, TokenIssuer,
};

const DIAGNOSTIC_LINES: usize = 64;

/// The item list shown before a search started, restored on leaving results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListSnapshot {
    pub items: Vec<ItemRecord>,
    pub selected: usize,
}

/// One visible result row.
#[derive(Debug, Clone, Copy)]
pub struct ResultRow<'a> {
    pub item: &'a ItemRecord,
    pub score: Option<&'a ScoreRecord>,
    /// Row comes from a cached prior search, not from this session's stages.
    pub cached: bool,
}

pub struct Orchestrator {
    store: Arc<Store>,
    cache: SearchCache,
    backends: Backends,
    corpus: Arc<SharedCorpus>,
    rrf: RrfConfig,
    lexical_limit: usize,
    semantic_limit: usize,
    min_cosine: f32,
    rerank_candidates: usize,
    max_unpinned: usize,
    issuer: TokenIssuer,
    session: Option<SearchSession>,
    snapshot: Option<ListSnapshot>,
    tx: UnboundedSender<PipelineEvent>,
    runtime: Handle,
    status: String,
    diagnostics: VecDeque<String>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("session", &self.session.as_ref().map(SearchSession::token))
            .field("has_snapshot", &self.snapshot.is_some())
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        store: Arc<Store>,
        backends: Backends,
        corpus: Arc<SharedCorpus>,
        config: &Config,
        runtime: Handle,
    ) -> (Self, UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let orchestrator = Self {
            cache: SearchCache::new(Arc::clone(&store), config.cache.clone()),
            store,
            backends,
            corpus,
            rrf: RrfConfig::from(&config.search),
            lexical_limit: config.search.lexical_limit as usize,
            semantic_limit: config.search.semantic_limit as usize,
            min_cosine: config.search.min_cosine,
            rerank_candidates: config.search.rerank_candidates as usize,
            max_unpinned: config.history.max_unpinned as usize,
            issuer: TokenIssuer::new(),
            session: None,
            snapshot: None,
            tx,
            runtime,
            status: String::new(),
            diagnostics: VecDeque::with_capacity(DIAGNOSTIC_LINES),
        };
        (orchestrator, rx)
    }

    // ------------------------------------------------------------------
    // Read side
    // ------------------------------------------------------------------

    pub const fn session(&self) -> Option<&SearchSession> {
        self.session.as_ref()
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn diagnostics(&self) -> impl Iterator<Item = &str> {
        self.diagnostics.iter().map(String::as_str)
    }

    pub fn in_flight(&self) -> bool {
        self.session.as_ref().is_some_and(SearchSession::in_flight)
    }

    pub fn rerank_available(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.stages().rerank == StageStatus::Available)
    }

    pub const fn has_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Current ordered results. Falls back to a cached placeholder until a
    /// live stage produced scored results.
    pub fn visible(&self) -> Vec<ResultRow<'_>> {
        let Some(session) = &self.session else {
            return Vec::new();
        };

        if let Some(placeholder) = session.placeholder() {
            return placeholder
                .order
                .iter()
                .filter_map(|id| {
                    session.item(*id).map(|item| ResultRow {
                        item,
                        score: placeholder.records.get(id),
                        cached: true,
                    })
                })
                .collect();
        }

        session
            .order()
            .iter()
            .filter_map(|id| {
                session.item(*id).map(|item| ResultRow {
                    item,
                    score: session.record(*id),
                    cached: false,
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Start a search for `raw`. Invalidates any current session.
    ///
    /// Returns an error only when the synchronous stages cannot run at all;
    /// the caller should then leave the results view.
    pub fn submit(&mut self, raw: &str, current: &ListSnapshot) -> Result<SessionToken> {
        let raw = raw.trim();
        let normalized = normalize_query(raw);
        if normalized.is_empty() {
            return Err(FerretError::QueryParse("empty query".to_string()));
        }

        let token = self.open_session(
            SessionOrigin::Query {
                raw: raw.to_string(),
                normalized: normalized.clone(),
            },
            raw.to_string(),
            current,
        );
        tracing::info!(%token, query = %normalized, "search submitted");

        let mut store_failed = false;
        match self.cache.probe_exact(&normalized) {
            Ok(Some(entry)) => {
                self.install_placeholder(&entry);
                self.status = format!("cached results for \"{}\"", entry.raw_query);
            }
            Ok(None) => {}
            Err(err) => {
                store_failed = err.class() == ErrorClass::Storage;
                tracing::warn!(error = %err, "cache probe failed");
            }
        }

        let lexical = self.backends.lexical.search_lexical(raw, self.lexical_limit);
        let Some(session) = self.session.as_mut() else {
            return Ok(token);
        };
        match lexical {
            Ok(hits) => {
                let count = hits.len();
                for hit in hits {
                    session.record_lexical(hit.item.id, hit.score);
                    session.remember_item(hit.item);
                }
                session.reorder(&self.rrf);
                session.stages_mut().lexical = StageStatus::Ready;
                if count > 0 || session.placeholder().is_none() {
                    self.status = format!("{count} lexical matches");
                }
                push_diagnostic(&mut self.diagnostics, token, &format!("lexical: {count} hits"));
            }
            Err(err) if store_failed && err.class() == ErrorClass::Storage => {
                tracing::error!(%token, error = %err, "store unavailable, abandoning search");
                if let Some(session) = self.session.take() {
                    session.abort();
                }
                self.status = format!("search failed: {err}");
                return Err(err);
            }
            Err(err) => {
                tracing::warn!(%token, error = %err, "lexical stage failed");
                session.stages_mut().lexical = StageStatus::Failed;
                self.status = format!("lexical search failed: {err}");
                push_diagnostic(&mut self.diagnostics, token, &format!("lexical failed: {err}"));
            }
        }

        self.dispatch_embedding(raw.to_string());
        self.dispatch_corpus();
        Ok(token)
    }

    /// Search for items like `seed`, using its stored embedding when present.
    pub fn pivot(&mut self, seed: &ItemRecord, current: &ListSnapshot) -> SessionToken {
        let token = self.open_session(
            SessionOrigin::Pivot { seed: seed.id },
            seed.document_text(),
            current,
        );
        tracing::info!(%token, seed = seed.id, "pivot submitted");

        let stored = self.store.read(|db| db.get_item_embedding(seed.id));
        let Some(session) = self.session.as_mut() else {
            return token;
        };
        session.stages_mut().lexical = StageStatus::Skipped;
        self.status = format!("items like \"{}\"", seed.title);

        match stored {
            Ok(Some(embedding)) => {
                session.query_embedding = Some(embedding);
                session.stages_mut().embedding = StageStatus::Ready;
                push_diagnostic(&mut self.diagnostics, token, "pivot: stored seed embedding");
            }
            Ok(None) => {
                push_diagnostic(&mut self.diagnostics, token, "pivot: seed has no embedding");
                self.dispatch_embedding(seed.document_text());
            }
            Err(err) => {
                tracing::warn!(seed = seed.id, error = %err, "seed embedding lookup failed");
                self.dispatch_embedding(seed.document_text());
            }
        }
        self.dispatch_corpus();
        token
    }

    /// Stop in-flight work, keep the results. Returns false when nothing was
    /// in flight.
    pub fn cancel(&mut self) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if !session.in_flight() {
            return false;
        }

        let old = session.token();
        let fresh = self.issuer.issue();
        session.rekey(fresh);
        if session.stages().rerank == StageStatus::Cancelled {
            session.stages_mut().rerank = StageStatus::Available;
        }
        tracing::info!(%old, %fresh, "search cancelled");
        push_diagnostic(&mut self.diagnostics, old, "cancelled");
        self.status = "cancelled; press Esc again to exit".to_string();
        self.maybe_persist();
        true
    }

    /// Start a user-gated rerank, or apply the scores gathered so far when
    /// one is already running.
    pub fn start_rerank(&mut self) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };

        match session.stages().rerank {
            StageStatus::Pending => {
                let partial = session.take_rerank_buffer();
                if partial.is_empty() {
                    self.status = "no rerank scores yet".to_string();
                    return false;
                }
                let count = partial.len();
                self.apply_rerank_scores(partial);
                self.status = format!("applied {count} partial rerank scores");
                true
            }
            StageStatus::Available | StageStatus::Failed => {
                if session.rerank_candidates.is_none() || self.backends.reranker.is_none() {
                    return false;
                }
                self.spawn_rerank();
                true
            }
            _ => false,
        }
    }

    /// Drop the session and hand back the pre-search list.
    pub fn leave_results(&mut self) -> Option<ListSnapshot> {
        if let Some(session) = self.session.take() {
            session.abort();
            tracing::debug!(token = %session.token(), "session closed");
        }
        self.status.clear();
        self.snapshot.take()
    }

    /// Remember the pre-search list. Only the first call before
    /// [`leave_results`](Self::leave_results) stores anything.
    pub fn snapshot_list(&mut self, current: &ListSnapshot) -> bool {
        if self.snapshot.is_some() {
            return false;
        }
        self.snapshot = Some(current.clone());
        true
    }

    /// Ingestion notification: cached corpus snapshots are stale.
    pub fn items_changed(&self) {
        self.corpus.invalidate();
        tracing::debug!("items changed, corpus snapshot dropped");
    }

    /// Replace the session's copy of an item after its flags changed.
    pub fn refresh_item(&mut self, item: ItemRecord) {
        if let Some(session) = self.session.as_mut() {
            if session.item(item.id).is_some() {
                session.remember_item(item);
            }
        }
    }

    // ------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------

    /// Apply one task result. Returns false for stale events.
    pub fn apply(&mut self, event: PipelineEvent) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let token = event.token();
        if !session.is_current(token) {
            tracing::debug!(%token, current = %session.token(), stage = event.stage(), "dropping stale event");
            return false;
        }

        match event {
            PipelineEvent::QueryEmbedded { result, .. } => self.on_query_embedded(result),
            PipelineEvent::CorpusLoaded { result, .. } => self.on_corpus_loaded(result),
            PipelineEvent::RerankProgress {
                item_id,
                score,
                done,
                total,
                ..
            } => session.buffer_rerank(item_id, score, done, total),
            PipelineEvent::RerankFinished { result, .. } => self.on_rerank_finished(result),
        }

        self.maybe_persist();
        true
    }

    /// Apply everything currently queued without waiting.
    pub fn drain(&mut self, rx: &mut UnboundedReceiver<PipelineEvent>) -> usize {
        let mut applied = 0;
        while let Ok(event) = rx.try_recv() {
            if self.apply(event) {
                applied += 1;
            }
        }
        applied
    }

    /// Apply events until no stage is in flight.
    pub async fn drive_until_idle(
        &mut self,
        rx: &mut UnboundedReceiver<PipelineEvent>,
        limit: Duration,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + limit;
        while self.in_flight() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(event)) => {
                    self.apply(event);
                }
                Ok(None) => break,
                Err(_) => {
                    return Err(FerretError::Timeout(
                        "pipeline did not settle in time".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn on_query_embedded(&mut self, result: Result<Vec<f32>>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let token = session.token();
        match result {
            Ok(embedding) => {
                session.query_embedding = Some(embedding);
                session.stages_mut().embedding = StageStatus::Ready;
                push_diagnostic(&mut self.diagnostics, token, "query embedded");
                if let SessionOrigin::Query { normalized, .. } = session.origin().clone() {
                    self.probe_similar(&normalized);
                }
                self.try_semantic();
            }
            Err(err) => {
                tracing::warn!(%token, error = %err, "embedding stage failed");
                session.stages_mut().embedding = StageStatus::Failed;
                self.status = format!("semantic ranking unavailable: {err}");
                push_diagnostic(&mut self.diagnostics, token, &format!("embedding failed: {err}"));
            }
        }
    }

    fn on_corpus_loaded(&mut self, result: Result<Arc<Corpus>>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let token = session.token();
        match result {
            Ok(corpus) => {
                push_diagnostic(
                    &mut self.diagnostics,
                    token,
                    &format!("corpus: {} embedded items", corpus.len()),
                );
                session.corpus = Some(corpus);
                session.stages_mut().corpus = StageStatus::Ready;
                self.try_semantic();
            }
            Err(err) => {
                tracing::warn!(%token, error = %err, "corpus stage failed");
                session.stages_mut().corpus = StageStatus::Failed;
                self.status = format!("corpus unavailable: {err}");
                push_diagnostic(&mut self.diagnostics, token, &format!("corpus failed: {err}"));
            }
        }
    }

    fn on_rerank_finished(&mut self, result: Result<Vec<(ItemId, f32)>>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let token = session.token();
        session.set_rerank_progress(None);
        session.rerank_buffer.clear();
        match result {
            Ok(scores) => {
                let count = scores.len();
                session.stages_mut().rerank = StageStatus::Ready;
                self.apply_rerank_scores(scores);
                self.status = format!("reranked {count} results");
                push_diagnostic(&mut self.diagnostics, token, &format!("rerank: {count} scores"));
            }
            Err(err) => {
                tracing::warn!(%token, error = %err, "rerank stage failed");
                session.stages_mut().rerank = StageStatus::Failed;
                self.status = format!("rerank failed, keeping similarity order: {err}");
                push_diagnostic(&mut self.diagnostics, token, &format!("rerank failed: {err}"));
            }
        }
    }

    /// Shared completion path for batch results, finished sequential runs and
    /// partially applied sequential runs.
    fn apply_rerank_scores(&mut self, scores: Vec<(ItemId, f32)>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        for (id, score) in scores {
            session.record_rerank(id, score);
        }
        session.reorder(&self.rrf);
    }

    // ------------------------------------------------------------------
    // Stage plumbing
    // ------------------------------------------------------------------

    fn open_session(
        &mut self,
        origin: SessionOrigin,
        rerank_text: String,
        current: &ListSnapshot,
    ) -> SessionToken {
        if let Some(old) = self.session.take() {
            old.abort();
            tracing::debug!(token = %old.token(), "superseded session");
        }
        self.snapshot_list(current);
        let token = self.issuer.issue();
        self.session = Some(SearchSession::new(token, origin, rerank_text));
        self.status.clear();
        token
    }

    fn dispatch_embedding(&mut self, text: String) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.stages_mut().embedding = StageStatus::Pending;

        let token = session.token();
        let cancel = session.cancel_token().clone();
        let embedder = Arc::clone(&self.backends.embedder);
        let limit = self.backends.timeouts.embed;
        let tx = self.tx.clone();
        self.runtime.spawn(async move {
            let result = guarded("embed", &cancel, limit, embedder.embed_query(&text)).await;
            let _ = tx.send(PipelineEvent::QueryEmbedded { token, result });
        });
    }

    fn dispatch_corpus(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.stages_mut().corpus = StageStatus::Pending;
        let token = session.token();

        let (generation, cached) = self.corpus.get();
        if let Some(corpus) = cached {
            let _ = self.tx.send(PipelineEvent::CorpusLoaded {
                token,
                result: Ok(corpus),
            });
            return;
        }

        let cancel = session.cancel_token().clone();
        let source = Arc::clone(&self.backends.corpus);
        let shared = Arc::clone(&self.corpus);
        let limit = self.backends.timeouts.corpus;
        let tx = self.tx.clone();
        self.runtime.spawn(async move {
            let result = guarded("corpus", &cancel, limit, source.load_corpus())
                .await
                .map(|corpus| {
                    let corpus = Arc::new(corpus);
                    shared.put(generation, Arc::clone(&corpus));
                    corpus
                });
            let _ = tx.send(PipelineEvent::CorpusLoaded { token, result });
        });
    }

    fn probe_similar(&mut self, normalized: &str) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let Some(embedding) = session.query_embedding.as_deref() else {
            return;
        };

        let outcome = match self.cache.classify(embedding, normalized) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(error = %err, "similarity cache probe failed");
                return;
            }
        };

        match outcome {
            CacheOutcome::Hit { entry, similarity } => {
                let empty = session.order().is_empty() && session.placeholder().is_none();
                if empty {
                    self.install_placeholder(&entry);
                    self.status = format!(
                        "cached results for similar search \"{}\" ({similarity:.2})",
                        entry.raw_query
                    );
                }
            }
            CacheOutcome::Suggestion { entry, similarity } => {
                self.status = format!(
                    "similar prior search: \"{}\" ({similarity:.2})",
                    entry.raw_query
                );
            }
            CacheOutcome::Miss => {}
        }
    }

    fn install_placeholder(&mut self, entry: &HistoryEntry) {
        let rows = match self.cache.snapshot(entry) {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(history = entry.id, error = %err, "cached snapshot unreadable");
                return;
            }
        };
        let ids: Vec<ItemId> = rows.iter().map(|row| row.item_id).collect();
        let items = match self.store.read(|db| db.get_items(&ids)) {
            Ok(items) => items,
            Err(err) => {
                tracing::warn!(history = entry.id, error = %err, "cached items unreadable");
                return;
            }
        };

        let Some(session) = self.session.as_mut() else {
            return;
        };
        let mut placeholder = Placeholder {
            source_query: entry.normalized_query.clone(),
            ..Placeholder::default()
        };
        for row in rows {
            placeholder.order.push(row.item_id);
            placeholder.records.insert(
                row.item_id,
                ScoreRecord::restore(
                    row.item_id,
                    row.lexical_score,
                    row.cosine_score,
                    row.rerank_score,
                    crate::search::Provenance::from_bits(row.provenance),
                ),
            );
        }
        for item in items {
            session.remember_item(item);
        }
        push_diagnostic(
            &mut self.diagnostics,
            session.token(),
            &format!("cache placeholder: {} rows", placeholder.order.len()),
        );
        session.set_placeholder(placeholder);
    }

    fn try_semantic(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.semantic_done
            || session.stages().embedding != StageStatus::Ready
            || session.stages().corpus != StageStatus::Ready
        {
            return;
        }
        let (Some(query), Some(corpus)) = (session.query_embedding.clone(), session.corpus.clone())
        else {
            return;
        };

        let seed = session.seed();
        let known: Vec<ItemId> = session.records().keys().copied().collect();
        let scored = semantic_scores(
            &query,
            known,
            |id| corpus.embedding(id),
            corpus
                .entries()
                .iter()
                .filter(|entry| Some(entry.item.id) != seed)
                .map(|entry| (entry.item.id, entry.embedding.as_slice())),
            self.min_cosine,
            self.semantic_limit,
        );

        for (id, score) in scored {
            session.record_cosine(id, score);
            if session.item(id).is_none() {
                if let Some(entry) = corpus.get(id) {
                    session.remember_item(entry.item.clone());
                }
            }
        }
        session.semantic_done = true;
        session.reorder(&self.rrf);

        let count = session.order().len();
        push_diagnostic(
            &mut self.diagnostics,
            session.token(),
            &format!("semantic: {count} ranked"),
        );
        if self.status.is_empty() || self.status.ends_with("lexical matches") {
            self.status = format!("{count} results");
        }
        self.trigger_rerank();
    }

    /// Runs at most once per session, after the semantic stage.
    fn trigger_rerank(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.semantic_done || session.rerank_candidates.is_some() {
            return;
        }

        let candidates: Vec<ItemId> = session
            .order()
            .iter()
            .take(self.rerank_candidates)
            .copied()
            .collect();
        let empty = candidates.is_empty();
        session.rerank_candidates = Some(candidates);

        let Some(reranker) = &self.backends.reranker else {
            session.stages_mut().rerank = StageStatus::Skipped;
            return;
        };
        if empty {
            session.stages_mut().rerank = StageStatus::Skipped;
            return;
        }

        match reranker.policy() {
            RerankPolicy::Batch => self.spawn_rerank(),
            RerankPolicy::Sequential => {
                session.stages_mut().rerank = StageStatus::Available;
                self.status = "rerank available: press r to start".to_string();
            }
        }
    }

    fn spawn_rerank(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(reranker) = self.backends.reranker.clone() else {
            return;
        };
        let Some(candidates) = session.rerank_candidates.clone() else {
            return;
        };

        let docs: Vec<(ItemId, String)> = candidates
            .iter()
            .filter_map(|id| session.item(*id).map(|item| (*id, item.document_text())))
            .collect();
        let total = docs.len();
        let token = session.token();
        let cancel = session.cancel_token().child_token();
        let query = session.rerank_text.clone();
        let limit = self.backends.timeouts.rerank;
        let tx = self.tx.clone();
        let policy = reranker.policy();

        session.stages_mut().rerank = StageStatus::Pending;
        session.rerank_buffer.clear();
        push_diagnostic(
            &mut self.diagnostics,
            token,
            &format!("rerank started: {total} candidates ({policy:?})"),
        );

        match policy {
            RerankPolicy::Batch => {
                self.runtime.spawn(async move {
                    let texts: Vec<String> = docs.iter().map(|(_, text)| text.clone()).collect();
                    let result = guarded("rerank", &cancel, limit, reranker.rerank(&query, &texts))
                        .await
                        .and_then(|scores| {
                            if scores.len() == docs.len() {
                                Ok(docs.iter().map(|(id, _)| *id).zip(scores).collect())
                            } else {
                                Err(FerretError::backend(
                                    reranker.name(),
                                    format!("expected {} scores, got {}", docs.len(), scores.len()),
                                ))
                            }
                        });
                    let _ = tx.send(PipelineEvent::RerankFinished { token, result });
                });
            }
            RerankPolicy::Sequential => {
                session.set_rerank_progress(Some(RerankProgress { done: 0, total }));
                self.status = format!("reranking 0/{total}");
                self.runtime.spawn(async move {
                    let mut scores = Vec::with_capacity(total);
                    for (done, (item_id, text)) in docs.iter().enumerate() {
                        match guarded("rerank", &cancel, limit, reranker.score(&query, text)).await {
                            Ok(score) => {
                                scores.push((*item_id, score));
                                let progress = PipelineEvent::RerankProgress {
                                    token,
                                    item_id: *item_id,
                                    score,
                                    done: done + 1,
                                    total,
                                };
                                if tx.send(progress).is_err() {
                                    return;
                                }
                            }
                            Err(err) => {
                                let _ = tx.send(PipelineEvent::RerankFinished {
                                    token,
                                    result: Err(err),
                                });
                                return;
                            }
                        }
                    }
                    let _ = tx.send(PipelineEvent::RerankFinished {
                        token,
                        result: Ok(scores),
                    });
                });
            }
        }
    }

    /// Write the result snapshot once nothing is in flight. The first write
    /// of a session upserts the history row; later ones only replace its
    /// snapshot. Failures are logged and never block results.
    fn maybe_persist(&mut self) {
        let backend_label = self.backend_label();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.in_flight() || !session.dirty {
            return;
        }
        session.dirty = false;
        let SessionOrigin::Query { raw, normalized } = session.origin().clone() else {
            return;
        };

        let token = session.token();
        let results: Vec<HistoryResult> = session
            .order()
            .iter()
            .enumerate()
            .filter_map(|(rank, id)| {
                session.record(*id).map(|record| HistoryResult {
                    session_id: token.get(),
                    rank: u32::try_from(rank).unwrap_or(u32::MAX),
                    item_id: *id,
                    lexical_score: record.lexical(),
                    cosine_score: record.cosine(),
                    rerank_score: record.rerank(),
                    provenance: record.provenance().bits(),
                })
            })
            .collect();

        let outcome = match session.history_id {
            Some(id) => self
                .store
                .write(|db| db.replace_history_results(id, token.get(), &results))
                .map(|()| id),
            None => {
                let entry = NewHistory {
                    normalized_query: &normalized,
                    raw_query: &raw,
                    backend: &backend_label,
                    duration_ms: session.elapsed_ms(),
                    query_embedding: session.query_embedding.as_deref(),
                    used_at: Utc::now(),
                };
                self.store
                    .write(|db| db.upsert_history(&entry, token.get(), &results, self.max_unpinned))
            }
        };

        match outcome {
            Ok(id) => {
                session.history_id = Some(id);
                self.cache.invalidate(&normalized);
                tracing::debug!(%token, history = id, rows = results.len(), "history saved");
            }
            Err(err) => {
                tracing::warn!(%token, error = %err, "failed to save search history");
                push_diagnostic(&mut self.diagnostics, token, &format!("history not saved: {err}"));
            }
        }
    }

    fn backend_label(&self) -> String {
        match &self.backends.reranker {
            Some(reranker) => format!("{}+{}", self.backends.embedder.name(), reranker.name()),
            None => self.backends.embedder.name().to_string(),
        }
    }
}

fn push_diagnostic(lines: &mut VecDeque<String>, token: SessionToken, message: &str) {
    if lines.len() == DIAGNOSTIC_LINES {
        lines.pop_front();
    }
    lines.push_back(format!(
        "{} {token} {message}",
        Utc::now().format("%H:%M:%S%.3f")
    ));
}

#[cfg(test)]
mod tests;
