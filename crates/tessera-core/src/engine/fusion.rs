//! Weighted-sum fusion of text and vector rankings.

use super::types::Document;
use std::collections::HashMap;

/// A document with its higher-is-better score.
pub(crate) type Scored = (Document, f64);

/// Merges two ranked lists by `text_weight * text + vector_weight * vector`.
///
/// Documents are keyed by id; one missing from a list contributes zero for
/// that side. The result is sorted by fused score descending, then by id.
pub(crate) fn fuse(
    text: Vec<Scored>,
    vector: Vec<Scored>,
    text_weight: f64,
    vector_weight: f64,
) -> Vec<Scored> {
    let mut merged: HashMap<String, Scored> = HashMap::with_capacity(text.len() + vector.len());

    let weighted = text
        .into_iter()
        .map(|(doc, score)| (doc, score * text_weight))
        .chain(
            vector
                .into_iter()
                .map(|(doc, score)| (doc, score * vector_weight)),
        );
    for (doc, score) in weighted {
        merged
            .entry(doc.id.clone())
            .and_modify(|entry| entry.1 += score)
            .or_insert((doc, score));
    }

    let mut ranked: Vec<Scored> = merged.into_values().collect();
    sort_ranked(&mut ranked);
    ranked
}

/// Sorts by score descending, ties broken by id ascending.
pub(crate) fn sort_ranked(ranked: &mut [Scored]) {
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id)));
}
