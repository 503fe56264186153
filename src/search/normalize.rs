use unicode_normalization::UnicodeNormalization;

/// Canonical form used as the history key: NFKC, lowercased, whitespace
/// collapsed to single spaces.
pub fn normalize_query(raw: &str) -> String {
    let folded: String = raw.nfkc().collect::<String>().to_lowercase();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}
