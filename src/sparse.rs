//! Sparse term vectors for hybrid (dense + keyword) queries.
//!
//! Terms are hashed into a 32-bit index space, so no vocabulary has to be
//! fitted or shipped. Document weights use BM25 term-frequency saturation
//! against a fixed average length; query weights are uniform over the
//! distinct query terms.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

const K1: f32 = 1.2;
const B: f32 = 0.75;
const AVG_DOC_TERMS: f32 = 256.0;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of",
    "on", "or", "that", "the", "this", "to", "was", "with",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1)
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
}

fn term_index(term: &str) -> u32 {
    let digest = Sha256::digest(term.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

fn term_counts(text: &str) -> (BTreeMap<u32, f32>, usize) {
    let mut counts = BTreeMap::new();
    let mut total = 0;
    for token in tokens(text) {
        *counts.entry(term_index(&token)).or_insert(0.0) += 1.0;
        total += 1;
    }
    (counts, total)
}

/// BM25-weighted vector for a document.
pub fn encode_document(text: &str) -> SparseVector {
    let (counts, total) = term_counts(text);
    let norm = K1 * (1.0 - B + B * total as f32 / AVG_DOC_TERMS);
    let mut vector = SparseVector::default();
    for (idx, tf) in counts {
        vector.indices.push(idx);
        vector.values.push(tf * (K1 + 1.0) / (tf + norm));
    }
    vector
}

/// Uniform weights over the distinct terms of a query.
pub fn encode_query(text: &str) -> SparseVector {
    let (counts, _) = term_counts(text);
    let weight = if counts.is_empty() {
        0.0
    } else {
        1.0 / counts.len() as f32
    };
    SparseVector {
        indices: counts.keys().copied().collect(),
        values: vec![weight; counts.len()],
    }
}
