//! Bag-of-words text similarity used by the cache and by approved-query
//! suggestions. Everything here is pure and deterministic.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityMetric {
    #[default]
    Cosine,
    Jaccard,
}

impl SimilarityMetric {
    pub fn score(self, a: &str, b: &str) -> f64 {
        match self {
            SimilarityMetric::Cosine => score(a, b),
            SimilarityMetric::Jaccard => jaccard(a, b),
        }
    }
}

/// A candidate that passed the threshold, with its position in the input.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarityMatch {
    pub index: usize,
    pub text: String,
    pub score: f64,
}

/// Lowercases, turns punctuation into whitespace and splits.
pub fn tokenize(text: &str) -> Vec<String> {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();

    cleaned.split_whitespace().map(str::to_string).collect()
}

fn bag_of_words(text: &str) -> HashMap<String, u64> {
    let mut bag = HashMap::new();
    for token in tokenize(text) {
        *bag.entry(token).or_insert(0) += 1;
    }
    bag
}

/// Cosine similarity of the two term-frequency vectors, in `[0, 1]`.
/// Returns 0 when either side has no tokens.
pub fn score(a: &str, b: &str) -> f64 {
    let bag_a = bag_of_words(a);
    let bag_b = bag_of_words(b);
    if bag_a.is_empty() || bag_b.is_empty() {
        return 0.0;
    }

    // Integer arithmetic keeps score(a, b) == score(b, a) bit for bit.
    let dot: u64 = bag_a
        .iter()
        .filter_map(|(term, fa)| bag_b.get(term).map(|fb| fa * fb))
        .sum();
    let mag_a: u64 = bag_a.values().map(|f| f * f).sum();
    let mag_b: u64 = bag_b.values().map(|f| f * f).sum();

    let similarity = dot as f64 / ((mag_a as f64) * (mag_b as f64)).sqrt();
    similarity.clamp(0.0, 1.0)
}

/// Token-set overlap divided by token-set union.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let set_a: HashSet<String> = tokenize(a).into_iter().collect();
    let set_b: HashSet<String> = tokenize(b).into_iter().collect();

    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 0.0;
    }
    set_a.intersection(&set_b).count() as f64 / union as f64
}

/// Scores every candidate against `query` with cosine similarity, drops
/// those under `threshold`, and returns the best `k` in descending order.
/// Equal scores keep their input order.
pub fn find_top_k<S: AsRef<str>>(
    query: &str,
    candidates: &[S],
    threshold: f64,
    k: usize,
) -> Vec<SimilarityMatch> {
    find_top_k_with(SimilarityMetric::Cosine, query, candidates, threshold, k)
}

pub fn find_top_k_jaccard<S: AsRef<str>>(
    query: &str,
    candidates: &[S],
    threshold: f64,
    k: usize,
) -> Vec<SimilarityMatch> {
    find_top_k_with(SimilarityMetric::Jaccard, query, candidates, threshold, k)
}

pub fn find_top_k_with<S: AsRef<str>>(
    metric: SimilarityMetric,
    query: &str,
    candidates: &[S],
    threshold: f64,
    k: usize,
) -> Vec<SimilarityMatch> {
    let mut matches: Vec<SimilarityMatch> = candidates
        .iter()
        .enumerate()
        .filter_map(|(index, candidate)| {
            let text = candidate.as_ref();
            let score = metric.score(query, text);
            (score >= threshold).then(|| SimilarityMatch {
                index,
                text: text.to_string(),
                score,
            })
        })
        .collect();

    // sort_by is stable, so ties stay in candidate order
    matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    matches.truncate(k);
    matches
}
