use rayon::prelude::*;
use shared::TagMap;

use crate::error::TaggerError;
use crate::model::Vocabulary;

/// Turn one raw score row into a ranked tag map.
///
/// Keeps scores at or above `threshold`, orders them highest first (ties keep
/// vocabulary order) and returns at most `limit` entries. A row whose length
/// differs from the vocabulary means the model and tag list do not belong
/// together, which is a configuration error.
pub fn rank(
    scores: &[f32],
    vocabulary: &Vocabulary,
    threshold: f32,
    limit: usize,
) -> Result<TagMap, TaggerError> {
    if scores.len() != vocabulary.len() {
        return Err(TaggerError::Config(format!(
            "model produced {} scores but the vocabulary has {} tags",
            scores.len(),
            vocabulary.len()
        )));
    }

    let mut kept: Vec<(&String, f32)> = vocabulary
        .tags()
        .iter()
        .zip(scores.iter().copied())
        .filter(|(_, score)| *score >= threshold)
        .collect();
    kept.sort_by(|a, b| b.1.total_cmp(&a.1));
    kept.truncate(limit);

    Ok(kept
        .into_iter()
        .map(|(tag, score)| (tag.clone(), score))
        .collect())
}

/// Rank every row of a batch in parallel, preserving batch order.
pub fn rank_batch(
    rows: &[Vec<f32>],
    vocabulary: &Vocabulary,
    threshold: f32,
    limit: usize,
) -> Result<Vec<TagMap>, TaggerError> {
    rows.par_iter()
        .map(|row| rank(row, vocabulary, threshold, limit))
        .collect()
}
