//! Hash embeddings and vector similarity
//!
//! FNV-1a feature hashing gives a deterministic, dependency-free embedder for
//! offline use and tests. Model-backed embedders live in `backend::http`.

use std::cmp::Ordering;

/// Deterministic hash embedder using FNV-1a
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dim: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self { dim: 384 }
    }
}

impl HashEmbedder {
    pub const fn new(dim: usize) -> Self {
        Self { dim }
    }

    pub const fn dims(&self) -> usize {
        self.dim
    }

    /// Embed text into an L2-normalized vector (all zeros when no token
    /// survives tokenization).
    pub fn embed(&self, text: &str) -> Vec<f32> {
        if self.dim == 0 {
            return Vec::new();
        }

        let tokens = tokenize(text);
        let mut embedding = vec![0.0; self.dim];
        if tokens.is_empty() {
            return embedding;
        }

        for token in &tokens {
            accumulate(&mut embedding, token, 1.0);
        }
        for window in tokens.windows(2) {
            let bigram = format!("{} {}", window[0], window[1]);
            accumulate(&mut embedding, &bigram, 0.5);
        }

        l2_normalize(&mut embedding);
        embedding
    }
}

/// Cosine similarity; 0.0 for mismatched lengths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot = dot_product(a, b);
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Score `candidates` against `query`, keep those at or above `min_score`,
/// best first, at most `limit`. Ties break on the key.
pub fn rank_by_similarity<'a, K, I>(
    query: &[f32],
    candidates: I,
    min_score: f32,
    limit: usize,
) -> Vec<(K, f32)>
where
    K: Ord + Copy + 'a,
    I: IntoIterator<Item = (K, &'a [f32])>,
{
    let mut scored: Vec<(K, f32)> = candidates
        .into_iter()
        .map(|(key, vector)| (key, cosine_similarity(query, vector)))
        .filter(|(_, score)| *score >= min_score)
        .collect();

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored.truncate(limit);
    scored
}

/// Cosine scores for a semantic stage. Every `known` key that has a vector is
/// scored regardless of `min_score`; the best `limit` of `candidates` follow.
/// A key found both ways appears twice with the same score.
pub fn semantic_scores<'a, K, L, I>(
    query: &[f32],
    known: impl IntoIterator<Item = K>,
    lookup: L,
    candidates: I,
    min_score: f32,
    limit: usize,
) -> Vec<(K, f32)>
where
    K: Ord + Copy + 'a,
    L: Fn(K) -> Option<&'a [f32]>,
    I: IntoIterator<Item = (K, &'a [f32])>,
{
    let mut scored: Vec<(K, f32)> = known
        .into_iter()
        .filter_map(|key| lookup(key).map(|vector| (key, cosine_similarity(query, vector))))
        .collect();
    scored.extend(rank_by_similarity(query, candidates, min_score, limit));
    scored
}

pub fn l2_normalize(vec: &mut [f32]) {
    let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vec.iter_mut() {
            *value /= norm;
        }
    }
}

pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() >= 2)
        .map(str::to_string)
        .collect()
}

fn accumulate(embedding: &mut [f32], token: &str, weight: f32) {
    let token_hash = fnv1a_hash(token.as_bytes());
    let len = embedding.len();

    for i in 0..len {
        let dim_hash = fnv1a_hash_with_salt(token_hash, i as u64);
        let sign = if dim_hash & 1 == 0 { weight } else { -weight };
        let dim = ((dim_hash >> 1) as usize) % len;
        embedding[dim] += sign;
    }
}

fn fnv1a_hash_with_salt(seed: u64, salt: u64) -> u64 {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&seed.to_le_bytes());
    bytes[8..].copy_from_slice(&salt.to_le_bytes());
    fnv1a_hash(&bytes)
}

fn fnv1a_hash(data: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for byte in data {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
