//! Search session state
//!
//! A session is the unit one committed query (or pivot) lives in. It owns the
//! per-item score records, the current ordering and the stage flags. It never
//! touches the store or the network; the orchestrator feeds it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::backend::Corpus;
use crate::search::{RrfConfig, ScoreRecord, order_records};
use crate::storage::{ItemId, ItemRecord};

/// Monotonically issued id correlating async results with their session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SessionToken(u64);

impl SessionToken {
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct TokenIssuer {
    last: u64,
}

impl TokenIssuer {
    pub const fn new() -> Self {
        Self { last: 0 }
    }

    pub const fn issue(&mut self) -> SessionToken {
        self.last += 1;
        SessionToken(self.last)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Idle,
    Pending,
    Ready,
    Failed,
    Skipped,
    Cancelled,
    /// Prerequisites met, waiting for the user to start it.
    Available,
}

impl StageStatus {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pending => "running",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
            Self::Available => "available",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StageFlags {
    pub lexical: StageStatus,
    pub embedding: StageStatus,
    pub corpus: StageStatus,
    pub rerank: StageStatus,
}

impl StageFlags {
    pub fn any_pending(&self) -> bool {
        [self.lexical, self.embedding, self.corpus, self.rerank].contains(&StageStatus::Pending)
    }

    /// Blank every in-flight flag.
    pub fn cancel_pending(&mut self) {
        for stage in [
            &mut self.lexical,
            &mut self.embedding,
            &mut self.corpus,
            &mut self.rerank,
        ] {
            if *stage == StageStatus::Pending {
                *stage = StageStatus::Cancelled;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOrigin {
    Query { raw: String, normalized: String },
    Pivot { seed: ItemId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RerankProgress {
    pub done: usize,
    pub total: usize,
}

/// Result list shown until a live stage produces scored results.
#[derive(Debug, Clone, Default)]
pub struct Placeholder {
    pub source_query: String,
    pub order: Vec<ItemId>,
    pub records: HashMap<ItemId, ScoreRecord>,
}

#[derive(Debug)]
pub struct SearchSession {
    token: SessionToken,
    origin: SessionOrigin,
    cancel: CancellationToken,
    stages: StageFlags,
    records: HashMap<ItemId, ScoreRecord>,
    order: Vec<ItemId>,
    items: HashMap<ItemId, ItemRecord>,
    placeholder: Option<Placeholder>,
    pub(crate) query_embedding: Option<Vec<f32>>,
    pub(crate) corpus: Option<Arc<Corpus>>,
    pub(crate) rerank_text: String,
    pub(crate) semantic_done: bool,
    pub(crate) rerank_candidates: Option<Vec<ItemId>>,
    pub(crate) rerank_buffer: HashMap<ItemId, f32>,
    rerank_progress: Option<RerankProgress>,
    pub(crate) history_id: Option<i64>,
    pub(crate) dirty: bool,
    started: Instant,
}

impl SearchSession {
    pub fn new(token: SessionToken, origin: SessionOrigin, rerank_text: String) -> Self {
        Self {
            token,
            origin,
            cancel: CancellationToken::new(),
            stages: StageFlags::default(),
            records: HashMap::new(),
            order: Vec::new(),
            items: HashMap::new(),
            placeholder: None,
            query_embedding: None,
            corpus: None,
            rerank_text,
            semantic_done: false,
            rerank_candidates: None,
            rerank_buffer: HashMap::new(),
            rerank_progress: None,
            history_id: None,
            dirty: false,
            started: Instant::now(),
        }
    }

    pub const fn token(&self) -> SessionToken {
        self.token
    }

    pub fn is_current(&self, token: SessionToken) -> bool {
        self.token == token
    }

    pub const fn origin(&self) -> &SessionOrigin {
        &self.origin
    }

    /// Committed query text; empty for pivots.
    pub fn query_text(&self) -> &str {
        match &self.origin {
            SessionOrigin::Query { raw, .. } => raw,
            SessionOrigin::Pivot { .. } => "",
        }
    }

    pub const fn seed(&self) -> Option<ItemId> {
        match self.origin {
            SessionOrigin::Pivot { seed } => Some(seed),
            SessionOrigin::Query { .. } => None,
        }
    }

    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub const fn stages(&self) -> &StageFlags {
        &self.stages
    }

    pub const fn stages_mut(&mut self) -> &mut StageFlags {
        &mut self.stages
    }

    pub fn in_flight(&self) -> bool {
        self.stages.any_pending()
    }

    pub const fn rerank_progress(&self) -> Option<RerankProgress> {
        self.rerank_progress
    }

    pub fn elapsed_ms(&self) -> i64 {
        i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    /// Invalidate this session's token and signal its tasks. In-flight flags
    /// are blanked, results stay. Returns whether anything was in flight.
    pub fn rekey(&mut self, token: SessionToken) -> bool {
        let was_in_flight = self.in_flight();
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.token = token;
        self.stages.cancel_pending();
        self.rerank_buffer.clear();
        self.rerank_progress = None;
        was_in_flight
    }

    /// Stop all tasks for good.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn remember_item(&mut self, item: ItemRecord) {
        self.items.insert(item.id, item);
    }

    pub fn item(&self, id: ItemId) -> Option<&ItemRecord> {
        self.items.get(&id)
    }

    pub fn record(&self, id: ItemId) -> Option<&ScoreRecord> {
        self.records.get(&id)
    }

    pub const fn records(&self) -> &HashMap<ItemId, ScoreRecord> {
        &self.records
    }

    fn record_mut(&mut self, id: ItemId) -> &mut ScoreRecord {
        self.dirty = true;
        self.records.entry(id).or_insert_with(|| ScoreRecord::new(id))
    }

    pub fn record_lexical(&mut self, id: ItemId, score: f32) {
        if Some(id) == self.seed() {
            return;
        }
        self.record_mut(id).record_lexical(score);
    }

    pub fn record_cosine(&mut self, id: ItemId, score: f32) {
        if Some(id) == self.seed() {
            return;
        }
        self.record_mut(id).record_cosine(score);
    }

    pub fn record_rerank(&mut self, id: ItemId, score: f32) {
        if Some(id) == self.seed() || !self.records.contains_key(&id) {
            return;
        }
        self.record_mut(id).record_rerank(score);
    }

    pub fn reorder(&mut self, rrf: &RrfConfig) {
        self.order = order_records(&self.records, rrf);
    }

    /// Current best-known ordering of live results.
    pub fn order(&self) -> &[ItemId] {
        &self.order
    }

    pub fn set_placeholder(&mut self, placeholder: Placeholder) {
        self.placeholder = Some(placeholder);
    }

    /// The placeholder is visible only while no live stage has produced
    /// scored results.
    pub fn placeholder(&self) -> Option<&Placeholder> {
        if self.order.is_empty() {
            self.placeholder.as_ref()
        } else {
            None
        }
    }

    pub fn buffer_rerank(&mut self, id: ItemId, score: f32, done: usize, total: usize) {
        self.rerank_buffer.insert(id, score);
        self.rerank_progress = Some(RerankProgress { done, total });
    }

    pub fn take_rerank_buffer(&mut self) -> Vec<(ItemId, f32)> {
        let mut scores: Vec<(ItemId, f32)> = self.rerank_buffer.drain().collect();
        scores.sort_by_key(|(id, _)| *id);
        scores
    }

    pub const fn set_rerank_progress(&mut self, progress: Option<RerankProgress>) {
        self.rerank_progress = progress;
    }
}
