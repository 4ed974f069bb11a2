//! Maximal Marginal Relevance re-ranking (spec.md §4.12).

use crate::distance::DistanceMetric;

/// A search candidate eligible for MMR re-ranking.
#[derive(Debug, Clone)]
pub struct MmrCandidate {
    pub id: u64,
    pub embedding: Vec<f32>,
    /// Raw distance from the original query, under the ranking metric.
    pub base_distance: f32,
}

/// One re-ranked result: relevance and diversity are reported separately so
/// callers can audit the tradeoff the greedy selection made.
#[derive(Debug, Clone, PartialEq)]
pub struct MmrResult {
    pub id: u64,
    pub score: f32,
    pub relevance: f32,
    /// `1 - max_sim(c, S)`, i.e. how dissimilar `c` is from everything
    /// already selected.
    pub diversity: f32,
}

/// Stateless greedy diversity/relevance re-ranker.
pub struct MmrReranker {
    metric: DistanceMetric,
}

impl MmrReranker {
    #[must_use]
    pub fn new(metric: DistanceMetric) -> Self {
        Self { metric }
    }

    /// Greedily selects up to `k` candidates maximizing
    /// `lambda * rel(c) - (1 - lambda) * max_sim(c, selected)` at each step.
    /// `lambda` is clamped to `[0, 1]`.
    #[must_use]
    pub fn rerank(&self, candidates: &[MmrCandidate], k: usize, lambda: f32) -> Vec<MmrResult> {
        let lambda = lambda.clamp(0.0, 1.0);
        let mut remaining: Vec<&MmrCandidate> = candidates.iter().collect();
        let mut selected: Vec<&MmrCandidate> = Vec::with_capacity(k);
        let mut results = Vec::with_capacity(k.min(candidates.len()));

        while !remaining.is_empty() && results.len() < k {
            let mut best_idx = 0;
            let mut best_score = f32::NEG_INFINITY;
            let mut best_relevance = 0.0;
            let mut best_max_sim = 0.0;

            for (idx, candidate) in remaining.iter().enumerate() {
                let relevance = self.metric.to_similarity(candidate.base_distance);
                let max_sim = selected
                    .iter()
                    .map(|s| {
                        self.metric
                            .distance(&candidate.embedding, &s.embedding)
                            .map(|d| self.metric.to_similarity(d))
                            .unwrap_or(0.0)
                    })
                    .fold(0.0f32, f32::max);

                let score = lambda * relevance - (1.0 - lambda) * max_sim;
                if score > best_score {
                    best_score = score;
                    best_idx = idx;
                    best_relevance = relevance;
                    best_max_sim = max_sim;
                }
            }

            let chosen = remaining.remove(best_idx);
            results.push(MmrResult {
                id: chosen.id,
                score: best_score,
                relevance: best_relevance,
                diversity: 1.0 - best_max_sim,
            });
            selected.push(chosen);
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: u64, embedding: Vec<f32>, base_distance: f32) -> MmrCandidate {
        MmrCandidate { id, embedding, base_distance }
    }

    #[test]
    fn lambda_one_reduces_to_pure_relevance_ranking() {
        let reranker = MmrReranker::new(DistanceMetric::Euclidean);
        let candidates = vec![
            candidate(1, vec![0.0, 0.0], 0.1),
            candidate(2, vec![10.0, 0.0], 0.5),
        ];
        let out = reranker.rerank(&candidates, 2, 1.0);
        assert_eq!(out[0].id, 1);
        assert_eq!(out[1].id, 2);
    }

    #[test]
    fn lambda_zero_maximizes_diversity_after_first_pick() {
        let reranker = MmrReranker::new(DistanceMetric::Euclidean);
        let candidates = vec![
            candidate(1, vec![0.0, 0.0], 0.0),
            candidate(2, vec![0.01, 0.0], 0.01),
            candidate(3, vec![10.0, 0.0], 5.0),
        ];
        let out = reranker.rerank(&candidates, 2, 0.0);
        assert_eq!(out.len(), 2);
        // First pick is whichever has highest relevance tie under lambda=0
        // score = -(1-0)*max_sim, which for the first pick is 0 for all
        // (empty selected set), so the first candidate in input order wins.
        assert_eq!(out[0].id, 1);
        // Second pick should favor the most dissimilar remaining candidate.
        assert_eq!(out[1].id, 3);
    }

    #[test]
    fn k_larger_than_candidates_returns_all() {
        let reranker = MmrReranker::new(DistanceMetric::Euclidean);
        let candidates = vec![candidate(1, vec![0.0], 0.0)];
        let out = reranker.rerank(&candidates, 5, 0.5);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn first_selection_has_full_diversity() {
        let reranker = MmrReranker::new(DistanceMetric::Euclidean);
        let candidates = vec![candidate(1, vec![0.0, 0.0], 0.0)];
        let out = reranker.rerank(&candidates, 1, 0.5);
        assert!((out[0].diversity - 1.0).abs() < 1e-6);
    }
}
