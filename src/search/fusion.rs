//! RRF (Reciprocal Rank Fusion) of lexical and cosine rankings
//!
//! ```text
//! RRF(d) = Σ weight_i / (k + rank_i(d))
//! ```
//!
//! `rank_i(d)` is the 1-indexed position of d in list i; documents missing
//! from a list contribute nothing for it.

use std::collections::HashMap;

use crate::config::SearchConfig;
use crate::storage::ItemId;

#[derive(Debug, Clone, PartialEq)]
pub struct RrfConfig {
    /// Smoothing constant. Higher values flatten rank differences.
    pub k: f32,
    pub lexical_weight: f32,
    pub semantic_weight: f32,
}

impl Default for RrfConfig {
    fn default() -> Self {
        Self {
            k: 60.0,
            lexical_weight: 1.0,
            semantic_weight: 1.0,
        }
    }
}

impl From<&SearchConfig> for RrfConfig {
    fn from(config: &SearchConfig) -> Self {
        Self {
            k: config.rrf_k,
            lexical_weight: config.lexical_weight,
            semantic_weight: config.semantic_weight,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusedResult {
    pub item_id: ItemId,
    pub score: f32,
    pub lexical_rank: Option<usize>,
    pub semantic_rank: Option<usize>,
}

/// Fuse two rankings. Inputs are item ids best first; the output is sorted by
/// fused score, ties broken on item id.
pub fn fuse(lexical: &[ItemId], semantic: &[ItemId], config: &RrfConfig) -> Vec<FusedResult> {
    let mut scores: HashMap<ItemId, FusedResult> = HashMap::new();

    for (rank, item_id) in lexical.iter().enumerate() {
        let rank = rank + 1;
        let contribution = config.lexical_weight / (config.k + rank as f32);
        let entry = scores.entry(*item_id).or_insert(FusedResult {
            item_id: *item_id,
            score: 0.0,
            lexical_rank: None,
            semantic_rank: None,
        });
        entry.score += contribution;
        entry.lexical_rank = Some(rank);
    }

    for (rank, item_id) in semantic.iter().enumerate() {
        let rank = rank + 1;
        let contribution = config.semantic_weight / (config.k + rank as f32);
        let entry = scores.entry(*item_id).or_insert(FusedResult {
            item_id: *item_id,
            score: 0.0,
            lexical_rank: None,
            semantic_rank: None,
        });
        entry.score += contribution;
        entry.semantic_rank = Some(rank);
    }

    let mut results: Vec<FusedResult> = scores.into_values().collect();
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.item_id.cmp(&b.item_id))
    });
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_inputs() {
        assert!(fuse(&[], &[], &RrfConfig::default()).is_empty());
    }

    #[test]
    fn lexical_only_preserves_order() {
        let fused = fuse(&[3, 1, 2], &[], &RrfConfig::default());
        let ids: Vec<ItemId> = fused.iter().map(|r| r.item_id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert_eq!(fused[0].lexical_rank, Some(1));
        assert_eq!(fused[0].semantic_rank, None);
    }

    #[test]
    fn overlap_ranks_first() {
        let fused = fuse(&[1, 2], &[3, 2], &RrfConfig::default());
        assert_eq!(fused[0].item_id, 2);
        let expected = 1.0 / 62.0 + 1.0 / 62.0;
        assert!((fused[0].score - expected).abs() < 1e-6);
    }

    #[test]
    fn ties_break_on_item_id() {
        let fused = fuse(&[7], &[4], &RrfConfig::default());
        assert_eq!(fused[0].item_id, 4);
        assert_eq!(fused[1].item_id, 7);
    }

    #[test]
    fn weights_shift_the_balance() {
        let config = RrfConfig {
            semantic_weight: 3.0,
            ..RrfConfig::default()
        };
        let fused = fuse(&[1], &[2], &config);
        assert_eq!(fused[0].item_id, 2);
    }
}
