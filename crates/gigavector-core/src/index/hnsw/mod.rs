//! Hierarchical Navigable Small World index (spec.md §4.6).

mod graph;
mod layer;
mod ordered_float;

pub use graph::{HnswParams, NativeHnsw};

use super::{Hit, VectorIndex};
use crate::distance::DistanceMetric;
use crate::error::Result;
use std::path::Path;

/// `VectorIndex` adapter over [`NativeHnsw`].
pub struct HnswIndex {
    graph: NativeHnsw,
}

impl HnswIndex {
    #[must_use]
    pub fn new(metric: DistanceMetric, params: HnswParams) -> Self {
        Self {
            graph: NativeHnsw::new(metric, params),
        }
    }

    /// Searches with an explicit `ef_search`, overriding the index's
    /// configured default for this call (spec.md §4.6's per-query knob).
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` if `query`'s length disagrees with the index.
    pub fn search_with_ef(&self, query: &[f32], k: usize, ef_search: usize) -> Result<Vec<Hit>> {
        let hits = self.graph.search_with_ef(query, k, ef_search)?;
        Ok(hits.into_iter().map(|(id, distance)| Hit { id, distance }).collect())
    }

    /// Persists the underlying graph. See [`NativeHnsw::save_to_path`].
    ///
    /// # Errors
    ///
    /// `Io` on filesystem failure; `Serialization` if encoding fails.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        self.graph.save_to_path(path)
    }

    /// Rebuilds an index previously written by [`HnswIndex::save_to_path`].
    ///
    /// # Errors
    ///
    /// `Io`/`Protocol`/`Serialization` from [`NativeHnsw::load_from_path`].
    pub fn load_from_path(path: &Path) -> Result<Self> {
        Ok(Self {
            graph: NativeHnsw::load_from_path(path)?,
        })
    }
}

impl VectorIndex for HnswIndex {
    fn insert(&self, id: u64, data: &[f32]) -> Result<()> {
        self.graph.insert(id, data)
    }

    fn remove(&self, id: u64) {
        self.graph.remove(id);
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Hit>> {
        let hits = self.graph.search(query, k)?;
        Ok(hits.into_iter().map(|(id, distance)| Hit { id, distance }).collect())
    }

    fn len(&self) -> usize {
        self.graph.live_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_round_trips_through_vector_index_trait() {
        let index = HnswIndex::new(DistanceMetric::Euclidean, HnswParams::default());
        index.insert(1, &[1.0, 0.0]).unwrap();
        index.insert(2, &[0.0, 1.0]).unwrap();
        let hits = index.search(&[1.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].id, 1);
        assert_eq!(index.len(), 2);

        index.remove(1);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn save_then_load_preserves_search_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hnsw_index.bin");

        let index = HnswIndex::new(DistanceMetric::Euclidean, HnswParams::default());
        index.insert(1, &[1.0, 0.0]).unwrap();
        index.insert(2, &[0.0, 1.0]).unwrap();

        index.save_to_path(&path).unwrap();
        let loaded = HnswIndex::load_from_path(&path).unwrap();

        assert_eq!(loaded.len(), index.len());
        let hits = loaded.search(&[1.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].id, 1);
    }
}
