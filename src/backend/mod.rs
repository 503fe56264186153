//! Backend adapters
//!
//! Uniform async wrappers around the services the pipeline calls: a query
//! embedder, a corpus loader and an optional reranker. Lexical search is the
//! one synchronous adapter. The orchestrator wraps every async call in
//! [`guarded`] so cancellation and timeouts behave the same for all of them.

pub mod http;
pub mod local;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::BackendConfig;
use crate::error::{FerretError, Result};
use crate::storage::{EmbeddedItem, ItemId, LexicalHit, Store};

pub use http::{HttpReranker, OllamaEmbedder};
pub use local::{OverlapReranker, StoreCorpus};

/// Loaded item embeddings, indexed by item id.
#[derive(Debug, Default)]
pub struct Corpus {
    entries: Vec<EmbeddedItem>,
    index: HashMap<ItemId, usize>,
}

impl Corpus {
    pub fn new(entries: Vec<EmbeddedItem>) -> Self {
        let index = entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| (entry.item.id, idx))
            .collect();
        Self { entries, index }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[EmbeddedItem] {
        &self.entries
    }

    pub fn get(&self, id: ItemId) -> Option<&EmbeddedItem> {
        self.index.get(&id).map(|idx| &self.entries[*idx])
    }

    pub fn embedding(&self, id: ItemId) -> Option<&[f32]> {
        self.get(id).map(|entry| entry.embedding.as_slice())
    }
}

/// Corpus snapshot shared by the orchestrator and saved views.
///
/// Loads started before an invalidation carry a stale generation and are not
/// cached when they land.
#[derive(Debug, Default)]
pub struct SharedCorpus {
    inner: parking_lot::Mutex<(u64, Option<Arc<Corpus>>)>,
}

impl SharedCorpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation and cached snapshot, if any.
    pub fn get(&self) -> (u64, Option<Arc<Corpus>>) {
        let guard = self.inner.lock();
        (guard.0, guard.1.clone())
    }

    /// Cache `corpus` if no invalidation happened since `generation`.
    pub fn put(&self, generation: u64, corpus: Arc<Corpus>) -> bool {
        let mut guard = self.inner.lock();
        if guard.0 != generation {
            return false;
        }
        guard.1 = Some(corpus);
        true
    }

    pub fn invalidate(&self) {
        let mut guard = self.inner.lock();
        guard.0 += 1;
        guard.1 = None;
    }

    /// Cached snapshot, or a fresh load through `source`.
    pub async fn load(&self, source: &dyn CorpusSource) -> Result<Arc<Corpus>> {
        let (generation, cached) = self.get();
        if let Some(corpus) = cached {
            return Ok(corpus);
        }
        let corpus = Arc::new(source.load_corpus().await?);
        self.put(generation, Arc::clone(&corpus));
        Ok(corpus)
    }
}

#[async_trait]
pub trait QueryEmbedder: Send + Sync {
    fn name(&self) -> &str;

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several documents. Adapters with a batch endpoint override this.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed_query(text).await?);
        }
        Ok(out)
    }
}

#[async_trait]
pub trait CorpusSource: Send + Sync {
    async fn load_corpus(&self) -> Result<Corpus>;
}

/// Reranker capability flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankPolicy {
    /// Fast batch backend: applied automatically.
    Batch,
    /// Slow per-item backend: user-gated, progress reported per candidate.
    Sequential,
}

impl RerankPolicy {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "" | "batch" | "fast" => Ok(Self::Batch),
            "sequential" | "slow" => Ok(Self::Sequential),
            other => Err(FerretError::Config(format!("unknown rerank policy: {other}"))),
        }
    }
}

#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    fn policy(&self) -> RerankPolicy;

    /// Score every candidate in one call. Output is index-aligned with input.
    async fn rerank(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>>;

    /// Score one candidate, for sequential progress reporting.
    async fn score(&self, query: &str, candidate: &str) -> Result<f32> {
        let scores = self.rerank(query, &[candidate.to_string()]).await?;
        scores
            .first()
            .copied()
            .ok_or_else(|| FerretError::backend(self.name(), "empty rerank response"))
    }
}

pub trait LexicalSearch: Send + Sync {
    fn search_lexical(&self, text: &str, limit: usize) -> Result<Vec<LexicalHit>>;
}

impl LexicalSearch for Store {
    fn search_lexical(&self, text: &str, limit: usize) -> Result<Vec<LexicalHit>> {
        self.read(|db| db.search_lexical(text, limit))
    }
}

/// The adapter set one orchestrator works with.
#[derive(Clone)]
pub struct Backends {
    pub embedder: Arc<dyn QueryEmbedder>,
    pub corpus: Arc<dyn CorpusSource>,
    pub reranker: Option<Arc<dyn Reranker>>,
    pub lexical: Arc<dyn LexicalSearch>,
    pub timeouts: StageTimeouts,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends")
            .field("embedder", &self.embedder.name())
            .field("reranker", &self.reranker.as_ref().map(|r| r.name().to_string()))
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub embed: Duration,
    pub corpus: Duration,
    pub rerank: Duration,
}

impl From<&BackendConfig> for StageTimeouts {
    fn from(config: &BackendConfig) -> Self {
        Self {
            embed: config.embed_timeout(),
            corpus: config.corpus_timeout(),
            rerank: config.rerank_timeout(),
        }
    }
}

/// Build the configured adapters.
pub fn build_backends(config: &BackendConfig, store: Arc<Store>) -> Result<Backends> {
    let dims = config.embedding_dims as usize;
    if dims == 0 {
        return Err(FerretError::Config(
            "backend.embedding_dims must be greater than 0".to_string(),
        ));
    }

    let embedder: Arc<dyn QueryEmbedder> = match config.embedder.trim().to_lowercase().as_str() {
        "" | "hash" => Arc::new(crate::search::HashEmbedder::new(dims)),
        "ollama" => Arc::new(OllamaEmbedder::new(
            &config.embedding_url,
            &config.embedding_model,
            config.embed_timeout(),
        )?),
        other => {
            return Err(FerretError::Config(format!("unknown embedder: {other}")));
        }
    };

    let policy = RerankPolicy::parse(&config.rerank_policy)?;
    let reranker: Option<Arc<dyn Reranker>> = match config.reranker.trim().to_lowercase().as_str()
    {
        "" | "none" | "off" => None,
        "overlap" => Some(Arc::new(
            OverlapReranker::new(policy).with_delay(Duration::from_millis(config.rerank_delay_ms)),
        )),
        "http" => Some(Arc::new(HttpReranker::new(
            &config.rerank_url,
            &config.rerank_model,
            policy,
            config.rerank_timeout(),
        )?)),
        other => {
            return Err(FerretError::Config(format!("unknown reranker: {other}")));
        }
    };

    tracing::debug!(
        embedder = embedder.name(),
        reranker = reranker.as_ref().map(|r| r.name()),
        "backends ready"
    );

    Ok(Backends {
        embedder,
        corpus: Arc::new(StoreCorpus::new(Arc::clone(&store))),
        reranker,
        lexical: store,
        timeouts: StageTimeouts::from(config),
    })
}

/// Run an adapter call under the session's cancellation token and a timeout.
pub async fn guarded<T>(
    stage: &'static str,
    cancel: &CancellationToken,
    limit: Duration,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(FerretError::Cancelled(stage.to_string())),
        outcome = tokio::time::timeout(limit, call) => match outcome {
            Ok(result) => result,
            Err(_) => Err(FerretError::Timeout(format!(
                "{stage} exceeded {}ms",
                limit.as_millis()
            ))),
        },
    }
}
