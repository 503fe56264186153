use std::sync::Arc;

use crate::backend::Corpus;
use crate::error::Result;
use crate::pipeline::session::SessionToken;
use crate::storage::ItemId;

/// Completion messages sent by pipeline tasks back to the core.
///
/// Every variant carries the token of the session that spawned the task;
/// the orchestrator drops the message when that session is no longer current.
#[derive(Debug)]
pub enum PipelineEvent {
    QueryEmbedded {
        token: SessionToken,
        result: Result<Vec<f32>>,
    },
    CorpusLoaded {
        token: SessionToken,
        result: Result<Arc<Corpus>>,
    },
    RerankProgress {
        token: SessionToken,
        item_id: ItemId,
        score: f32,
        done: usize,
        total: usize,
    },
    RerankFinished {
        token: SessionToken,
        result: Result<Vec<(ItemId, f32)>>,
    },
}

impl PipelineEvent {
    pub const fn token(&self) -> SessionToken {
        match self {
            Self::QueryEmbedded { token, .. }
            | Self::CorpusLoaded { token, .. }
            | Self::RerankProgress { token, .. }
            | Self::RerankFinished { token, .. } => *token,
        }
    }

    pub const fn stage(&self) -> &'static str {
        match self {
            Self::QueryEmbedded { .. } => "embedding",
            Self::CorpusLoaded { .. } => "corpus",
            Self::RerankProgress { .. } => "rerank-progress",
            Self::RerankFinished { .. } => "rerank",
        }
    }
}
