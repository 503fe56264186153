//! Ranking primitives for the search pipeline
//!
//! ```text
//!   lexical (FTS5 bm25)      cosine (query vs corpus)       rerank (backend)
//!          │                          │                          │
//!          └──────── RRF fusion ──────┘                          │
//!                         │                                      │
//!                         └──── reranked items first ────────────┘
//! ```

pub mod embeddings;
pub mod fusion;
pub mod normalize;
pub mod score;

pub use embeddings::{HashEmbedder, cosine_similarity, rank_by_similarity, semantic_scores};
pub use fusion::{FusedResult, RrfConfig, fuse};
pub use normalize::normalize_query;
pub use score::{Provenance, ScoreKind, ScoreRecord, order_records};
