//! Exact brute-force k-NN index (spec.md §4.5).

use super::{Hit, VectorIndex};
use crate::distance::DistanceMetric;
use crate::error::Result;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::HashSet;

struct Candidate {
    distance: f32,
    id: u64,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance && self.id == other.id
    }
}
impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    // Max-heap by distance (so the worst candidate is on top and gets
    // evicted first), ties broken by ascending id to match the top-k
    // ordering rule in spec.md §4.9.
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Exact k-NN over a fixed set of `(id, vector)` rows, maintained online.
pub struct FlatIndex {
    metric: DistanceMetric,
    rows: RwLock<Vec<(u64, Vec<f32>)>>,
    removed: RwLock<HashSet<u64>>,
}

impl FlatIndex {
    #[must_use]
    pub fn new(metric: DistanceMetric) -> Self {
        Self {
            metric,
            rows: RwLock::new(Vec::new()),
            removed: RwLock::new(HashSet::new()),
        }
    }

    /// Exact k-NN restricted to `allowed` ids (the pre-filter fast path,
    /// spec.md §4.5 and §4.7's filtered-search routing).
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` if `query`'s length disagrees with a stored row.
    pub fn search_filtered(
        &self,
        query: &[f32],
        k: usize,
        allowed: &HashSet<u64>,
    ) -> Result<Vec<Hit>> {
        let rows = self.rows.read();
        let removed = self.removed.read();
        self.scan(query, k, rows.iter().filter(|(id, _)| {
            !removed.contains(id) && allowed.contains(id)
        }))
    }

    fn scan<'a>(
        &self,
        query: &[f32],
        k: usize,
        rows: impl Iterator<Item = &'a (u64, Vec<f32>)>,
    ) -> Result<Vec<Hit>> {
        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k + 1);
        for (id, data) in rows {
            let distance = self.metric.distance(query, data)?;
            if heap.len() < k {
                heap.push(Candidate { distance, id: *id });
            } else if let Some(top) = heap.peek() {
                if distance < top.distance || (distance == top.distance && *id < top.id) {
                    heap.pop();
                    heap.push(Candidate { distance, id: *id });
                }
            }
        }
        let mut hits: Vec<Hit> = heap
            .into_iter()
            .map(|c| Hit {
                id: c.id,
                distance: c.distance,
            })
            .collect();
        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(hits)
    }
}

impl VectorIndex for FlatIndex {
    fn insert(&self, id: u64, data: &[f32]) -> Result<()> {
        self.rows.write().push((id, data.to_vec()));
        self.removed.write().remove(&id);
        Ok(())
    }

    fn remove(&self, id: u64) {
        self.removed.write().insert(id);
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Hit>> {
        let rows = self.rows.read();
        let removed = self.removed.read();
        self.scan(query, k, rows.iter().filter(|(id, _)| !removed.contains(id)))
    }

    fn len(&self) -> usize {
        let removed = self.removed.read();
        self.rows.read().iter().filter(|(id, _)| !removed.contains(id)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_top_k_ascending_by_distance() {
        let index = FlatIndex::new(DistanceMetric::Euclidean);
        index.insert(0, &[0.0, 0.0]).unwrap();
        index.insert(1, &[1.0, 0.0]).unwrap();
        index.insert(2, &[5.0, 0.0]).unwrap();

        let hits = index.search(&[0.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, 0);
        assert_eq!(hits[1].id, 1);
        assert!(hits[0].distance <= hits[1].distance);
    }

    #[test]
    fn removed_ids_are_skipped() {
        let index = FlatIndex::new(DistanceMetric::Euclidean);
        index.insert(0, &[0.0, 0.0]).unwrap();
        index.insert(1, &[1.0, 0.0]).unwrap();
        index.remove(0);
        let hits = index.search(&[0.0, 0.0], 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 1);
    }

    #[test]
    fn empty_index_returns_empty_result() {
        let index = FlatIndex::new(DistanceMetric::Euclidean);
        let hits = index.search(&[0.0, 0.0], 5).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn ties_broken_by_ascending_id() {
        let index = FlatIndex::new(DistanceMetric::Euclidean);
        index.insert(5, &[1.0, 0.0]).unwrap();
        index.insert(2, &[1.0, 0.0]).unwrap();
        let hits = index.search(&[0.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].id, 2);
        assert_eq!(hits[1].id, 5);
    }

    #[test]
    fn eviction_among_ties_drops_the_largest_id() {
        let index = FlatIndex::new(DistanceMetric::Euclidean);
        // Three rows tied at the same distance, pushed in an order where the
        // heap fills before the smallest id arrives.
        index.insert(2, &[1.0, 0.0]).unwrap();
        index.insert(5, &[1.0, 0.0]).unwrap();
        index.insert(3, &[1.0, 0.0]).unwrap();
        let hits = index.search(&[0.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, 2);
        assert_eq!(hits[1].id, 3);

        // A new tied id smaller than both retained ids must evict the worst
        // (largest) retained id, not the best.
        let index = FlatIndex::new(DistanceMetric::Euclidean);
        index.insert(2, &[1.0, 0.0]).unwrap();
        index.insert(5, &[1.0, 0.0]).unwrap();
        index.insert(1, &[1.0, 0.0]).unwrap();
        let hits = index.search(&[0.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, 1);
        assert_eq!(hits[1].id, 2);
    }

    #[test]
    fn filtered_search_restricts_to_allowed_ids() {
        let index = FlatIndex::new(DistanceMetric::Euclidean);
        index.insert(0, &[0.0, 0.0]).unwrap();
        index.insert(1, &[0.1, 0.0]).unwrap();
        index.insert(2, &[10.0, 0.0]).unwrap();
        let allowed: HashSet<u64> = [0, 2].into_iter().collect();
        let hits = index.search_filtered(&[0.0, 0.0], 5, &allowed).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.id != 1));
    }
}
