//! Vector index family: a shared trait plus three implementations
//! (exact flat scan, HNSW, IVF+PQ), per spec.md §2, §4.5-§4.7.

pub mod flat;
pub mod hnsw;
pub mod ivfpq;

/// A single search hit: internal id and its distance under the index's
/// configured metric (ascending = more similar, per spec.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub id: u64,
    pub distance: f32,
}

/// Common contract for the three ANN index families.
///
/// Implementations are expected to skip tombstoned ids transparently;
/// `VectorIndex` itself never consults a `VectorStore` directly, leaving
/// liveness checks to whichever caller holds the shared store (per
/// spec.md §3's ownership rule that indexes hold only a read-only view).
pub trait VectorIndex {
    /// Inserts `id` with vector `data` into the index.
    ///
    /// # Errors
    ///
    /// Implementation-specific (`DimensionMismatch`, `NotTrained`, ...).
    fn insert(&self, id: u64, data: &[f32]) -> crate::error::Result<()>;

    /// Marks `id` as no longer searchable. Implementations differ in
    /// whether this is immediate removal or a soft tombstone.
    fn remove(&self, id: u64);

    /// Returns up to `k` nearest hits to `query`, ascending by distance.
    ///
    /// # Errors
    ///
    /// Implementation-specific (`DimensionMismatch`, ...).
    fn search(&self, query: &[f32], k: usize) -> crate::error::Result<Vec<Hit>>;

    /// Number of ids the index believes are live.
    fn len(&self) -> usize;

    /// True if the index holds no live ids.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
