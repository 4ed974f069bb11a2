//! Query dispatch: cache lookup, filter routing, index search, range search,
//! and top-k ordering (spec.md §4.9).

use crate::cache::ResultCache;
use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::fusion::HybridFusion;
use crate::index::flat::FlatIndex;
use crate::index::hnsw::HnswIndex;
use crate::index::ivfpq::IvfPqIndex;
use crate::index::Hit;
use crate::metadata::{Expr, MetadataIndex};
use crate::mmr::{MmrCandidate, MmrReranker};
use crate::vector::VectorStore;
use std::collections::HashSet;

/// A metadata filter is considered selective enough for a direct
/// exact-scan pre-filter when its candidate set is under this fraction of
/// the store's live vectors (spec.md §4.7/§4.9's "selectivity below a
/// threshold" routing rule).
const SELECTIVITY_THRESHOLD: f64 = 0.05;

/// When a filter can't be resolved to a candidate id set (it needs a full
/// per-id evaluation — `NOT`, ranges, `CONTAINS`/`PREFIX`), the index is
/// over-fetched by this multiple of `k` before post-filtering.
const POST_FILTER_OVERFETCH: usize = 4;

/// One of the three `VectorIndex` implementations, dispatched by enum
/// rather than a trait object so filtered search can use each backend's
/// own specialized path.
pub enum IndexBackend {
    Flat(FlatIndex),
    Hnsw(HnswIndex),
    IvfPq(IvfPqIndex),
}

impl IndexBackend {
    /// Inserts `id` with vector `data`.
    ///
    /// # Errors
    ///
    /// Implementation-specific (`DimensionMismatch`, `NotTrained`, ...).
    pub fn insert(&self, id: u64, data: &[f32]) -> Result<()> {
        match self {
            Self::Flat(i) => i.insert(id, data),
            Self::Hnsw(i) => i.insert(id, data),
            Self::IvfPq(i) => i.insert(id, data),
        }
    }

    /// Marks `id` as no longer searchable.
    pub fn remove(&self, id: u64) {
        match self {
            Self::Flat(i) => i.remove(id),
            Self::Hnsw(i) => i.remove(id),
            Self::IvfPq(i) => i.remove(id),
        }
    }

    /// Number of ids the index believes are live.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Flat(i) => i.len(),
            Self::Hnsw(i) => i.len(),
            Self::IvfPq(i) => i.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unrestricted top-k search.
    ///
    /// # Errors
    ///
    /// Implementation-specific (`DimensionMismatch`, `NotTrained`, ...).
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Hit>> {
        match self {
            Self::Flat(i) => i.search(query, k),
            Self::Hnsw(i) => i.search(query, k),
            Self::IvfPq(i) => i.search(query, k),
        }
    }

    /// Top-k search restricted to `allowed` ids. `FlatIndex` and
    /// `IvfPqIndex` scan (or probe) only the allowed set directly.
    /// `HnswIndex` has no native filtered traversal, so it over-fetches a
    /// wider candidate pool and filters in place — a reasonable
    /// approximation as long as `allowed` isn't a tiny fraction of the
    /// graph, which is exactly the case the caller should have routed to
    /// the exact-scan pre-filter path instead (see [`QueryEngine`]).
    ///
    /// # Errors
    ///
    /// Implementation-specific (`DimensionMismatch`, `NotTrained`, ...).
    pub fn search_filtered(&self, query: &[f32], k: usize, allowed: &HashSet<u64>) -> Result<Vec<Hit>> {
        match self {
            Self::Flat(i) => i.search_filtered(query, k, allowed),
            Self::IvfPq(i) => i.search_filtered(query, k, allowed),
            Self::Hnsw(i) => {
                let overfetch = k.saturating_mul(POST_FILTER_OVERFETCH).max(k).max(allowed.len().min(k * 16));
                let hits = i.search_with_ef(query, overfetch, overfetch.max(64))?;
                let mut filtered: Vec<Hit> = hits.into_iter().filter(|h| allowed.contains(&h.id)).collect();
                filtered.truncate(k);
                Ok(filtered)
            }
        }
    }
}

/// Ties together a vector store, metadata index, chosen ANN backend, and
/// result cache into the single query-execution entry point (spec.md
/// §4.9).
pub struct QueryEngine {
    metric: DistanceMetric,
    cache: ResultCache,
}

impl QueryEngine {
    #[must_use]
    pub fn new(metric: DistanceMetric, cache: ResultCache) -> Self {
        Self { metric, cache }
    }

    /// Notifies the cache of a mutation (insert/update/delete), per
    /// spec.md §4.10's mutation-count invalidation.
    pub fn notify_mutation(&self) {
        self.cache.notify_mutation();
    }

    #[must_use]
    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Unfiltered top-k search, cache-backed.
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` if `query.len() != store.dimension()`; otherwise
    /// whatever `index.search` returns.
    pub fn search(&self, store: &VectorStore, index: &IndexBackend, query: &[f32], k: usize) -> Result<Vec<Hit>> {
        self.validate(store, query)?;
        Self::validate_k(k)?;
        if let Some((ids, distances)) = self.cache.get(store.dimension(), k, self.metric, query) {
            return Ok(zip_hits(ids, distances));
        }
        let hits = index.search(query, k)?;
        self.cache.put(
            store.dimension(),
            k,
            self.metric,
            query,
            hits.iter().map(|h| h.id).collect(),
            hits.iter().map(|h| h.distance).collect(),
        );
        Ok(hits)
    }

    /// Filtered top-k search: resolves `expr` against `metadata`, routes to
    /// an exact-scan pre-filter when the candidate set is small and
    /// resolvable purely from postings, to the index's own
    /// `search_filtered` when it's larger, or to an over-fetch
    /// post-filter when `expr` needs per-id evaluation (spec.md §4.9).
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` if `query.len() != store.dimension()`; otherwise
    /// whatever the chosen search path returns.
    pub fn filtered_search(
        &self,
        store: &VectorStore,
        index: &IndexBackend,
        metadata: &MetadataIndex,
        query: &[f32],
        k: usize,
        expr: &Expr,
    ) -> Result<Vec<Hit>> {
        self.validate(store, query)?;
        Self::validate_k(k)?;

        match metadata.candidate_ids(expr) {
            Some(allowed) => {
                let total = store.len().max(1);
                let selectivity = allowed.len() as f64 / total as f64;
                if selectivity < SELECTIVITY_THRESHOLD {
                    exact_scan(store, self.metric, query, k, &allowed)
                } else {
                    index.search_filtered(query, k, &allowed)
                }
            }
            None => {
                let overfetch = k.saturating_mul(POST_FILTER_OVERFETCH).max(k);
                let candidates = index.search(query, overfetch)?;
                let mut out = Vec::with_capacity(k);
                for hit in candidates {
                    let Ok(meta) = store.get_metadata(hit.id) else {
                        continue;
                    };
                    let lookup = |key: &str| meta.get(key).cloned();
                    if expr.evaluate(&lookup).is_true() {
                        out.push(hit);
                        if out.len() == k {
                            break;
                        }
                    }
                }
                Ok(out)
            }
        }
    }

    /// Range search: all hits with distance `<= threshold`, ascending,
    /// capped at `max_results` (spec.md §4.9).
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` if `query.len() != store.dimension()`; otherwise
    /// whatever `index.search` returns.
    pub fn range_search(
        &self,
        store: &VectorStore,
        index: &IndexBackend,
        query: &[f32],
        threshold: f32,
        max_results: usize,
    ) -> Result<Vec<Hit>> {
        self.validate(store, query)?;
        let candidates = index.search(query, max_results)?;
        Ok(candidates.into_iter().filter(|h| h.distance <= threshold).collect())
    }

    /// Hybrid dense+text search: fuses `index`'s dense hits with a
    /// caller-supplied text ranked list under `fusion`, then returns the
    /// fused ranking truncated to `k` (spec.md §4.11).
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` if `query.len() != store.dimension()`; otherwise
    /// whatever `index.search` returns.
    pub fn hybrid_search(
        &self,
        store: &VectorStore,
        index: &IndexBackend,
        query: &[f32],
        k: usize,
        text_results: &[(u64, f32)],
        fusion: HybridFusion,
    ) -> Result<Vec<(u64, f32)>> {
        self.validate(store, query)?;
        Self::validate_k(k)?;
        let dense = index.search(query, k.max(text_results.len()))?;
        let dense_pairs: Vec<(u64, f32)> = dense.into_iter().map(|h| (h.id, h.distance)).collect();
        let mut fused = fusion.fuse(self.metric, &dense_pairs, text_results);
        fused.truncate(k);
        Ok(fused)
    }

    /// Re-ranks `candidates` for diversity via MMR, after fetching each
    /// candidate's embedding from `store` (spec.md §4.12).
    ///
    /// # Errors
    ///
    /// `NotFound` if any candidate id is no longer live in `store`.
    pub fn mmr_search(
        &self,
        store: &VectorStore,
        index: &IndexBackend,
        query: &[f32],
        k: usize,
        fetch_k: usize,
        lambda: f32,
    ) -> Result<Vec<crate::mmr::MmrResult>> {
        self.validate(store, query)?;
        Self::validate_k(k)?;
        let hits = index.search(query, fetch_k.max(k))?;
        let mut candidates = Vec::with_capacity(hits.len());
        for hit in hits {
            let embedding = store.get(hit.id)?;
            candidates.push(MmrCandidate { id: hit.id, embedding, base_distance: hit.distance });
        }
        let reranker = MmrReranker::new(self.metric);
        Ok(reranker.rerank(&candidates, k, lambda))
    }

    fn validate(&self, store: &VectorStore, query: &[f32]) -> Result<()> {
        if query.len() != store.dimension() {
            return Err(Error::DimensionMismatch {
                expected: store.dimension(),
                actual: query.len(),
            });
        }
        Ok(())
    }

    /// `k=0` is rejected outright (spec.md §8: "`k=0` ⇒ `InvalidArgument`");
    /// `k > count` is not an error here — callers simply get back fewer
    /// than `k` hits, per the same boundary-behavior list.
    fn validate_k(k: usize) -> Result<()> {
        if k == 0 {
            return Err(Error::InvalidArgument("k must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Exact-scan pre-filter: distances computed directly against
/// `VectorStore`, restricted to `allowed`, without touching the ANN
/// backend at all — the "switch to FlatIndex over the filtered set"
/// routing spec.md §4.7 calls for when a filter is highly selective.
fn exact_scan(store: &VectorStore, metric: DistanceMetric, query: &[f32], k: usize, allowed: &HashSet<u64>) -> Result<Vec<Hit>> {
    let mut hits = Vec::with_capacity(allowed.len());
    for &id in allowed {
        if !store.is_live(id) {
            continue;
        }
        let data = store.get(id)?;
        let distance = metric.distance(query, &data)?;
        hits.push(Hit { id, distance });
    }
    hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.id.cmp(&b.id)));
    hits.truncate(k);
    Ok(hits)
}

fn zip_hits(ids: Vec<u64>, distances: Vec<f32>) -> Vec<Hit> {
    ids.into_iter().zip(distances).map(|(id, distance)| Hit { id, distance }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EvictionPolicy;
    use crate::metadata::Expr;

    fn engine() -> QueryEngine {
        QueryEngine::new(DistanceMetric::Euclidean, ResultCache::new(100, 1 << 20, 0, 0, EvictionPolicy::Lru))
    }

    fn populated_flat() -> (VectorStore, IndexBackend) {
        let store = VectorStore::new(2);
        let index = IndexBackend::Flat(FlatIndex::new(DistanceMetric::Euclidean));
        for (i, v) in [[0.0, 0.0], [1.0, 0.0], [5.0, 0.0]].iter().enumerate() {
            let id = store.add(v.to_vec(), crate::vector::Metadata::new()).unwrap();
            assert_eq!(id, i as u64);
            index.insert(id, v).unwrap();
        }
        (store, index)
    }

    #[test]
    fn search_rejects_dimension_mismatch() {
        let (store, index) = populated_flat();
        let engine = engine();
        assert!(engine.search(&store, &index, &[0.0], 1).is_err());
    }

    #[test]
    fn search_rejects_zero_k() {
        let (store, index) = populated_flat();
        let engine = engine();
        assert!(matches!(
            engine.search(&store, &index, &[0.0, 0.0], 0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn search_caps_k_above_count_at_available_count() {
        let (store, index) = populated_flat();
        let engine = engine();
        let hits = engine.search(&store, &index, &[0.0, 0.0], 100).unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn search_is_cached_on_second_call() {
        let (store, index) = populated_flat();
        let engine = engine();
        let first = engine.search(&store, &index, &[0.0, 0.0], 2).unwrap();
        let second = engine.search(&store, &index, &[0.0, 0.0], 2).unwrap();
        assert_eq!(first, second);
        assert_eq!(engine.cache().stats().hits, 1);
    }

    #[test]
    fn range_search_caps_by_threshold() {
        let (store, index) = populated_flat();
        let engine = engine();
        let hits = engine.range_search(&store, &index, &[0.0, 0.0], 2.0, 10).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.distance <= 2.0));
    }

    #[test]
    fn filtered_search_with_selective_filter_uses_exact_scan() {
        let (store, index) = populated_flat();
        let metadata = MetadataIndex::new();
        metadata.add(1, [("tag".to_string(), "keep".to_string())]);
        let engine = engine();
        let expr = Expr::parse("tag == \"keep\"").unwrap();
        let hits = engine.filtered_search(&store, &index, &metadata, &[0.0, 0.0], 5, &expr).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 1);
    }

    #[test]
    fn filtered_search_falls_back_to_post_filter_for_not() {
        let (store, index) = populated_flat();
        let metadata = MetadataIndex::new();
        metadata.add(0, [("tag".to_string(), "drop".to_string())]);
        let engine = engine();
        let expr = Expr::parse("NOT tag == \"drop\"").unwrap();
        let hits = engine.filtered_search(&store, &index, &metadata, &[0.0, 0.0], 5, &expr).unwrap();
        assert!(hits.iter().all(|h| h.id != 0));
    }

    #[test]
    fn hybrid_search_fuses_dense_and_text() {
        let (store, index) = populated_flat();
        let engine = engine();
        let text = vec![(1, 1.0), (0, 0.2)];
        let fused = engine
            .hybrid_search(&store, &index, &[0.0, 0.0], 2, &text, HybridFusion::Rrf { k: 60 })
            .unwrap();
        assert!(!fused.is_empty());
    }

    #[test]
    fn mmr_search_returns_reranked_candidates() {
        let (store, index) = populated_flat();
        let engine = engine();
        let out = engine.mmr_search(&store, &index, &[0.0, 0.0], 2, 3, 0.5).unwrap();
        assert_eq!(out.len(), 2);
    }
}
