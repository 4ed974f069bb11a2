//! Hybrid fusion of dense vector and text result lists (spec.md §4.11).

use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use std::collections::HashMap;

/// Fusion strategy for combining a dense (vector) ranked list with a text
/// ranked list over the same universe of ids.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HybridFusion {
    /// Min-max normalize each list to `[0, 1]`, then
    /// `w_v * n_v + w_t * n_t`.
    Linear { vector_weight: f32, text_weight: f32 },
    /// Reciprocal Rank Fusion: `Σ 1/(k + rank)` over lists the id appears
    /// in.
    Rrf { k: u32 },
    /// Weighted Reciprocal Rank Fusion:
    /// `w_v * 1/(k+rank_v) + w_t * 1/(k+rank_t)`.
    WeightedRrf { k: u32, vector_weight: f32, text_weight: f32 },
}

impl HybridFusion {
    /// Constructs [`HybridFusion::Linear`], validating weights per
    /// spec.md §4.11.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if either weight is negative, or both are zero.
    pub fn linear(vector_weight: f32, text_weight: f32) -> Result<Self> {
        Self::validate_weights(vector_weight, text_weight)?;
        Ok(Self::Linear { vector_weight, text_weight })
    }

    /// Constructs [`HybridFusion::WeightedRrf`], validating weights.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if either weight is negative, or both are zero.
    pub fn weighted_rrf(k: u32, vector_weight: f32, text_weight: f32) -> Result<Self> {
        Self::validate_weights(vector_weight, text_weight)?;
        Ok(Self::WeightedRrf { k, vector_weight, text_weight })
    }

    fn validate_weights(vector_weight: f32, text_weight: f32) -> Result<()> {
        if vector_weight < 0.0 || text_weight < 0.0 {
            return Err(Error::InvalidArgument(format!(
                "weights must be non-negative, got vector={vector_weight}, text={text_weight}"
            )));
        }
        if vector_weight == 0.0 && text_weight == 0.0 {
            return Err(Error::InvalidArgument("at least one weight must be non-zero".into()));
        }
        Ok(())
    }

    /// Fuses dense-vector hits (as `(id, distance)` under `metric`,
    /// converted to `[0,1]` similarity via
    /// [`DistanceMetric::to_similarity`]) with a text ranked list
    /// (`(id, score)`, already a similarity-style score, higher is
    /// better). Returns ids sorted descending by fused score.
    #[must_use]
    pub fn fuse(&self, metric: DistanceMetric, dense: &[(u64, f32)], text: &[(u64, f32)]) -> Vec<(u64, f32)> {
        let dense_sim: Vec<(u64, f32)> = dense
            .iter()
            .map(|&(id, distance)| (id, metric.to_similarity(distance)))
            .collect();

        match self {
            Self::Linear { vector_weight, text_weight } => {
                Self::fuse_linear(&dense_sim, text, *vector_weight, *text_weight)
            }
            Self::Rrf { k } => Self::fuse_rrf(&dense_sim, text, *k),
            Self::WeightedRrf { k, vector_weight, text_weight } => {
                Self::fuse_weighted_rrf(&dense_sim, text, *k, *vector_weight, *text_weight)
            }
        }
    }

    fn fuse_linear(dense: &[(u64, f32)], text: &[(u64, f32)], vector_weight: f32, text_weight: f32) -> Vec<(u64, f32)> {
        let dense_norm = min_max_normalize(dense);
        let text_norm = min_max_normalize(text);

        let mut scores: HashMap<u64, f32> = HashMap::new();
        for (id, n) in dense_norm {
            *scores.entry(id).or_insert(0.0) += vector_weight * n;
        }
        for (id, n) in text_norm {
            *scores.entry(id).or_insert(0.0) += text_weight * n;
        }

        sorted_descending(scores)
    }

    fn fuse_rrf(dense: &[(u64, f32)], text: &[(u64, f32)], k: u32) -> Vec<(u64, f32)> {
        let mut scores: HashMap<u64, f32> = HashMap::new();
        for (rank, &(id, _)) in dense.iter().enumerate() {
            *scores.entry(id).or_insert(0.0) += 1.0 / (k as f32 + rank as f32 + 1.0);
        }
        for (rank, &(id, _)) in text.iter().enumerate() {
            *scores.entry(id).or_insert(0.0) += 1.0 / (k as f32 + rank as f32 + 1.0);
        }
        sorted_descending(scores)
    }

    fn fuse_weighted_rrf(
        dense: &[(u64, f32)],
        text: &[(u64, f32)],
        k: u32,
        vector_weight: f32,
        text_weight: f32,
    ) -> Vec<(u64, f32)> {
        let mut scores: HashMap<u64, f32> = HashMap::new();
        for (rank, &(id, _)) in dense.iter().enumerate() {
            *scores.entry(id).or_insert(0.0) += vector_weight / (k as f32 + rank as f32 + 1.0);
        }
        for (rank, &(id, _)) in text.iter().enumerate() {
            *scores.entry(id).or_insert(0.0) += text_weight / (k as f32 + rank as f32 + 1.0);
        }
        sorted_descending(scores)
    }
}

fn min_max_normalize(list: &[(u64, f32)]) -> Vec<(u64, f32)> {
    if list.is_empty() {
        return Vec::new();
    }
    let min = list.iter().map(|(_, s)| *s).fold(f32::INFINITY, f32::min);
    let max = list.iter().map(|(_, s)| *s).fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    list.iter()
        .map(|&(id, s)| (id, if range > 0.0 { (s - min) / range } else { 1.0 }))
        .collect()
}

fn sorted_descending(scores: HashMap<u64, f32>) -> Vec<(u64, f32)> {
    let mut fused: Vec<(u64, f32)> = scores.into_iter().collect();
    fused.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_negative_weight() {
        assert!(HybridFusion::linear(-0.1, 1.0).is_err());
    }

    #[test]
    fn rejects_both_zero_weights() {
        assert!(HybridFusion::linear(0.0, 0.0).is_err());
    }

    #[test]
    fn linear_fusion_favors_doc_strong_in_both_lists() {
        let fusion = HybridFusion::linear(0.5, 0.5).unwrap();
        // Lower distance = more similar; id 1 is close in both.
        let dense = vec![(1, 0.1), (2, 0.9)];
        let text = vec![(1, 1.0), (2, 0.2)];
        let fused = fusion.fuse(DistanceMetric::Euclidean, &dense, &text);
        assert_eq!(fused[0].0, 1);
    }

    #[test]
    fn rrf_combines_rank_positions() {
        let fusion = HybridFusion::Rrf { k: 60 };
        let dense = vec![(1, 0.0), (2, 0.1)];
        let text = vec![(2, 1.0), (1, 0.5)];
        let fused = fusion.fuse(DistanceMetric::Euclidean, &dense, &text);
        // Both ids rank 0 and 1 once each; scores should tie by symmetry,
        // so the ascending-id tiebreak picks id 1 first.
        assert_eq!(fused.len(), 2);
        assert!((fused[0].1 - fused[1].1).abs() < 1e-6);
        assert_eq!(fused[0].0, 1);
    }

    #[test]
    fn weighted_rrf_zero_text_weight_matches_dense_only_ranking() {
        let fusion = HybridFusion::weighted_rrf(60, 1.0, 0.0).unwrap();
        let dense = vec![(1, 0.0), (2, 0.5), (3, 1.0)];
        let text = vec![(3, 1.0), (2, 0.5), (1, 0.0)];
        let fused = fusion.fuse(DistanceMetric::Euclidean, &dense, &text);
        assert_eq!(fused.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn empty_lists_fuse_to_empty() {
        let fusion = HybridFusion::Rrf { k: 60 };
        assert!(fusion.fuse(DistanceMetric::Euclidean, &[], &[]).is_empty());
    }
}
