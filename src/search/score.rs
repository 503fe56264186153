//! Per-item score records and result ordering

use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;

use serde::Serialize;

use crate::search::fusion::{RrfConfig, fuse};
use crate::storage::ItemId;

/// Which stages contributed a score. Bits are only ever added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Provenance(u8);

impl Provenance {
    pub const LEXICAL: Self = Self(1);
    pub const COSINE: Self = Self(2);
    pub const RERANKED: Self = Self(4);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Unknown bits are dropped.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0b111)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when every bit of `self` is also set in `later`.
    pub const fn is_subset_of(self, later: Self) -> bool {
        later.contains(self)
    }

    const fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl BitOr for Provenance {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(Self::LEXICAL) {
            parts.push("L");
        }
        if self.contains(Self::COSINE) {
            parts.push("C");
        }
        if self.contains(Self::RERANKED) {
            parts.push("R");
        }
        if parts.is_empty() {
            write!(f, "-")
        } else {
            write!(f, "{}", parts.join("+"))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreKind {
    Lexical,
    Cosine,
    Reranked,
}

impl ScoreKind {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Lexical => "lexical",
            Self::Cosine => "cosine",
            Self::Reranked => "rerank",
        }
    }
}

/// Scores one item has accumulated in one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreRecord {
    item_id: ItemId,
    lexical: Option<f32>,
    cosine: Option<f32>,
    rerank: Option<f32>,
    provenance: Provenance,
}

impl ScoreRecord {
    pub const fn new(item_id: ItemId) -> Self {
        Self {
            item_id,
            lexical: None,
            cosine: None,
            rerank: None,
            provenance: Provenance::empty(),
        }
    }

    /// Rebuild a record from a stored snapshot row.
    pub fn restore(
        item_id: ItemId,
        lexical: Option<f32>,
        cosine: Option<f32>,
        rerank: Option<f32>,
        provenance: Provenance,
    ) -> Self {
        let mut record = Self::new(item_id);
        if let Some(score) = lexical {
            record.record_lexical(score);
        }
        if let Some(score) = cosine {
            record.record_cosine(score);
        }
        if let Some(score) = rerank {
            record.record_rerank(score);
        }
        record.provenance.insert(provenance);
        record
    }

    pub const fn item_id(&self) -> ItemId {
        self.item_id
    }

    pub const fn lexical(&self) -> Option<f32> {
        self.lexical
    }

    pub const fn cosine(&self) -> Option<f32> {
        self.cosine
    }

    pub const fn rerank(&self) -> Option<f32> {
        self.rerank
    }

    pub const fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub const fn record_lexical(&mut self, score: f32) {
        self.lexical = Some(score);
        self.provenance.insert(Provenance::LEXICAL);
    }

    pub const fn record_cosine(&mut self, score: f32) {
        self.cosine = Some(score);
        self.provenance.insert(Provenance::COSINE);
    }

    pub const fn record_rerank(&mut self, score: f32) {
        self.rerank = Some(score);
        self.provenance.insert(Provenance::RERANKED);
    }

    /// Highest-fidelity score present: reranked, then cosine, then lexical.
    pub fn display_score(&self) -> Option<(ScoreKind, f32)> {
        self.rerank
            .map(|s| (ScoreKind::Reranked, s))
            .or_else(|| self.cosine.map(|s| (ScoreKind::Cosine, s)))
            .or_else(|| self.lexical.map(|s| (ScoreKind::Lexical, s)))
    }
}

/// Order items by best available evidence.
///
/// Reranked items lead, by rerank score. The rest follow the RRF fusion of
/// the lexical and cosine rankings, or plain lexical order when no cosine
/// score exists yet. Ties break on item id.
pub fn order_records(records: &HashMap<ItemId, ScoreRecord>, rrf: &RrfConfig) -> Vec<ItemId> {
    let lexical = ranked_by(records, ScoreRecord::lexical);
    let cosine = ranked_by(records, ScoreRecord::cosine);

    let base: Vec<ItemId> = if cosine.is_empty() {
        lexical
    } else {
        fuse(&lexical, &cosine, rrf)
            .into_iter()
            .map(|result| result.item_id)
            .collect()
    };

    let reranked = ranked_by(records, ScoreRecord::rerank);
    if reranked.is_empty() {
        return base;
    }

    let mut ordered = reranked;
    ordered.extend(
        base.into_iter()
            .filter(|id| records.get(id).is_some_and(|r| r.rerank.is_none())),
    );
    ordered
}

fn ranked_by(
    records: &HashMap<ItemId, ScoreRecord>,
    score: impl Fn(&ScoreRecord) -> Option<f32>,
) -> Vec<ItemId> {
    let mut scored: Vec<(ItemId, f32)> = records
        .values()
        .filter_map(|record| score(record).map(|s| (record.item_id, s)))
        .collect();
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored.into_iter().map(|(id, _)| id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board(entries: &[(ItemId, Option<f32>, Option<f32>, Option<f32>)]) -> HashMap<ItemId, ScoreRecord> {
        entries
            .iter()
            .map(|(id, lexical, cosine, rerank)| {
                (
                    *id,
                    ScoreRecord::restore(*id, *lexical, *cosine, *rerank, Provenance::empty()),
                )
            })
            .collect()
    }

    #[test]
    fn provenance_accumulates() {
        let mut record = ScoreRecord::new(1);
        record.record_cosine(0.4);
        record.record_lexical(2.0);
        assert_eq!(record.provenance(), Provenance::LEXICAL | Provenance::COSINE);
        record.record_lexical(1.0);
        assert!(record.provenance().contains(Provenance::COSINE));
        assert_eq!(record.provenance().to_string(), "L+C");
    }

    #[test]
    fn display_score_prefers_highest_fidelity() {
        let mut record = ScoreRecord::new(1);
        assert_eq!(record.display_score(), None);
        record.record_lexical(3.0);
        assert_eq!(record.display_score(), Some((ScoreKind::Lexical, 3.0)));
        record.record_cosine(0.7);
        assert_eq!(record.display_score(), Some((ScoreKind::Cosine, 0.7)));
        record.record_rerank(0.1);
        assert_eq!(record.display_score(), Some((ScoreKind::Reranked, 0.1)));
    }

    #[test]
    fn lexical_only_order() {
        let records = board(&[(1, Some(1.0), None, None), (2, Some(3.0), None, None), (3, Some(3.0), None, None)]);
        assert_eq!(order_records(&records, &RrfConfig::default()), vec![2, 3, 1]);
    }

    #[test]
    fn cosine_fuses_with_lexical() {
        let records = board(&[
            (1, Some(5.0), None, None),
            (2, Some(4.0), Some(0.9), None),
            (3, None, Some(0.8), None),
        ]);
        let order = order_records(&records, &RrfConfig::default());
        assert_eq!(order[0], 2);
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn reranked_items_lead() {
        let records = board(&[
            (1, Some(5.0), Some(0.9), None),
            (2, Some(4.0), Some(0.5), Some(0.2)),
            (3, None, Some(0.4), Some(0.8)),
        ]);
        assert_eq!(order_records(&records, &RrfConfig::default()), vec![3, 2, 1]);
    }

    #[test]
    fn from_bits_masks_unknown() {
        assert_eq!(Provenance::from_bits(0xff).bits(), 7);
        assert!(Provenance::LEXICAL.is_subset_of(Provenance::from_bits(3)));
    }
}
