//! IVF+PQ index: coarse quantizer over inverted lists of product-quantized
//! residuals, searched via asymmetric distance computation (spec.md §4.7).

use super::{Hit, VectorIndex};
use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::persistence;
use crate::pq::PQCodebook;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

const MAGIC: &[u8; 4] = b"GVIV";
const VERSION: u32 = 1;

/// A deterministic xorshift64 PRNG for coarse-centroid k-means, seeded the
/// same way as `pq::PQCodebook`'s subspace training so that two trainings
/// over the same sample reproduce identical centroids.
struct Xorshift64(u64);

impl Xorshift64 {
    fn seeded(count: usize, nlist: usize) -> Self {
        let mut seed = (count as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ (nlist as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        if seed == 0 {
            seed = 0x2545_F491_4F6C_DD1D;
        }
        Self(seed)
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn next_usize(&mut self, bound: usize) -> usize {
        if bound == 0 {
            return 0;
        }
        (self.next_u64() % bound as u64) as usize
    }
}

/// Tuning knobs for [`IvfPqIndex`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IvfPqParams {
    /// Number of coarse (Voronoi-cell) centroids.
    pub nlist: usize,
    /// Number of coarse lists probed per query.
    pub nprobe: usize,
    /// Number of PQ subspaces (must divide the vector dimension).
    pub m: usize,
    /// Bits per PQ code (1..=8).
    pub nbits: u8,
    /// Lloyd's k-means iterations for both the coarse quantizer and the
    /// residual codebook.
    pub kmeans_iters: usize,
}

impl Default for IvfPqParams {
    fn default() -> Self {
        Self {
            nlist: 100,
            nprobe: 8,
            m: 8,
            nbits: 8,
            kmeans_iters: 10,
        }
    }
}

struct PostingList {
    entries: Vec<(u64, Vec<u8>)>,
}

impl PostingList {
    fn new() -> Self {
        Self { entries: Vec::new() }
    }
}

struct Inner {
    coarse_centroids: Vec<Vec<f32>>,
    codebook: Option<PQCodebook>,
    lists: Vec<PostingList>,
    removed: HashSet<u64>,
    trained: bool,
}

/// Coarse quantizer + product-quantized residual inverted lists
/// (spec.md §4.7).
///
/// Unlike [`super::flat::FlatIndex`] and [`super::hnsw::HnswIndex`],
/// `IvfPqIndex` requires an explicit [`IvfPqIndex::train`] call before any
/// vector can be inserted — `insert` returns `NotTrained` until then, the
/// same way `pq::PQCodebook::encode` does.
pub struct IvfPqIndex {
    metric: DistanceMetric,
    dimension: usize,
    params: IvfPqParams,
    inner: RwLock<Inner>,
}

impl IvfPqIndex {
    /// Creates an untrained index over `dimension`-length vectors.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `dimension % params.m != 0`, propagated from the
    /// eventual `PQCodebook::new` at train time is instead checked eagerly
    /// here so construction fails fast.
    pub fn new(metric: DistanceMetric, dimension: usize, params: IvfPqParams) -> Result<Self> {
        if params.m == 0 || dimension % params.m != 0 {
            return Err(Error::InvalidArgument(format!(
                "dimension {dimension} not divisible by m {}",
                params.m
            )));
        }
        if params.nlist == 0 {
            return Err(Error::InvalidArgument("nlist must be > 0".into()));
        }
        Ok(Self {
            metric,
            dimension,
            params,
            inner: RwLock::new(Inner {
                coarse_centroids: Vec::new(),
                codebook: None,
                lists: Vec::new(),
                removed: HashSet::new(),
                trained: false,
            }),
        })
    }

    #[must_use]
    pub fn is_trained(&self) -> bool {
        self.inner.read().trained
    }

    /// The distance metric this index was configured with. Search always
    /// scores candidates via squared-L2 asymmetric distance on PQ-encoded
    /// residuals (the standard IVF+PQ formulation); this is reported for
    /// interface parity with [`super::flat::FlatIndex`] and
    /// [`super::hnsw::HnswIndex`] and is exact only when `metric` is
    /// [`DistanceMetric::Euclidean`].
    #[must_use]
    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Trains the coarse quantizer (k-means over `training_vectors`, capped
    /// at `nlist` centroids) and then a [`PQCodebook`] over the residuals
    /// `v - centroid(v)`, per spec.md §4.7.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if any training vector's length disagrees with the
    /// index's dimension, or if `training_vectors` is empty.
    pub fn train(&self, training_vectors: &[Vec<f32>]) -> Result<()> {
        if training_vectors.is_empty() {
            return Err(Error::InvalidArgument("training set must be non-empty".into()));
        }
        for v in training_vectors {
            if v.len() != self.dimension {
                return Err(Error::DimensionMismatch {
                    expected: self.dimension,
                    actual: v.len(),
                });
            }
        }

        let nlist = self.params.nlist.min(training_vectors.len());
        let mut rng = Xorshift64::seeded(training_vectors.len(), self.params.nlist);
        let refs: Vec<&[f32]> = training_vectors.iter().map(Vec::as_slice).collect();
        let coarse_centroids = Self::train_coarse(&refs, nlist, self.dimension, self.params.kmeans_iters, &mut rng);

        let residuals: Vec<Vec<f32>> = training_vectors
            .iter()
            .map(|v| {
                let c = Self::nearest_centroid(v, &coarse_centroids);
                Self::residual(v, &coarse_centroids[c])
            })
            .collect();

        let mut codebook = PQCodebook::new(self.dimension, self.params.m, self.params.nbits)?;
        codebook.train(&residuals, self.params.kmeans_iters)?;

        let mut inner = self.inner.write();
        inner.lists = (0..coarse_centroids.len()).map(|_| PostingList::new()).collect();
        inner.coarse_centroids = coarse_centroids;
        inner.codebook = Some(codebook);
        inner.trained = true;
        Ok(())
    }

    fn train_coarse(vectors: &[&[f32]], nlist: usize, dim: usize, iters: usize, rng: &mut Xorshift64) -> Vec<Vec<f32>> {
        let mut indices: Vec<usize> = (0..vectors.len()).collect();
        let take = nlist.min(indices.len());
        let mut centroids = Vec::with_capacity(take);
        for i in 0..take {
            let remaining = indices.len() - i;
            let j = i + rng.next_usize(remaining);
            indices.swap(i, j);
            centroids.push(vectors[indices[i]].to_vec());
        }

        let mut assignments = vec![0usize; vectors.len()];
        for _ in 0..iters {
            for (i, v) in vectors.iter().enumerate() {
                assignments[i] = Self::nearest_centroid(v, &centroids);
            }

            let mut sums = vec![vec![0.0f32; dim]; centroids.len()];
            let mut counts = vec![0usize; centroids.len()];
            for (i, v) in vectors.iter().enumerate() {
                let c = assignments[i];
                counts[c] += 1;
                for d in 0..dim {
                    sums[c][d] += v[d];
                }
            }

            for c in 0..centroids.len() {
                if counts[c] == 0 {
                    let pick = rng.next_usize(vectors.len());
                    centroids[c] = vectors[pick].to_vec();
                } else {
                    let n = counts[c] as f32;
                    for d in 0..dim {
                        centroids[c][d] = sums[c][d] / n;
                    }
                }
            }
        }
        centroids
    }

    fn nearest_centroid(v: &[f32], centroids: &[Vec<f32>]) -> usize {
        let mut best = 0;
        let mut best_dist = f32::MAX;
        for (c, centroid) in centroids.iter().enumerate() {
            let dist: f32 = v.iter().zip(centroid).map(|(a, b)| (a - b) * (a - b)).sum();
            if dist < best_dist {
                best_dist = dist;
                best = c;
            }
        }
        best
    }

    fn residual(v: &[f32], centroid: &[f32]) -> Vec<f32> {
        v.iter().zip(centroid).map(|(a, b)| a - b).collect()
    }

    fn nearest_lists(query: &[f32], centroids: &[Vec<f32>], nprobe: usize) -> Vec<usize> {
        let mut dists: Vec<(usize, f32)> = centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, query.iter().zip(c).map(|(a, b)| (a - b) * (a - b)).sum()))
            .collect();
        dists.sort_by(|a, b| a.1.total_cmp(&b.1));
        dists.into_iter().take(nprobe.max(1)).map(|(i, _)| i).collect()
    }

    /// Search restricted to `allowed` ids (the post-filter path,
    /// spec.md §4.7 / §4.9's filter routing).
    ///
    /// # Errors
    ///
    /// `NotTrained` if `train` hasn't been called; `DimensionMismatch` if
    /// `query`'s length disagrees with the index.
    pub fn search_filtered(&self, query: &[f32], k: usize, allowed: &HashSet<u64>) -> Result<Vec<Hit>> {
        self.search_internal(query, k, Some(allowed))
    }

    fn search_internal(&self, query: &[f32], k: usize, allowed: Option<&HashSet<u64>>) -> Result<Vec<Hit>> {
        let inner = self.inner.read();
        if !inner.trained {
            return Err(Error::NotTrained);
        }
        if query.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        let codebook = inner.codebook.as_ref().expect("trained implies codebook present");

        let probed = Self::nearest_lists(query, &inner.coarse_centroids, self.params.nprobe);
        let mut heap: Vec<Hit> = Vec::with_capacity(k);

        for list_idx in probed {
            let residual_query = Self::residual(query, &inner.coarse_centroids[list_idx]);
            let table = codebook.build_adc_table(&residual_query)?;
            for (id, code) in &inner.lists[list_idx].entries {
                if inner.removed.contains(id) {
                    continue;
                }
                if let Some(allowed) = allowed {
                    if !allowed.contains(id) {
                        continue;
                    }
                }
                let distance = PQCodebook::distance_adc(&table, codebook.ksub(), code);
                heap.push(Hit { id: *id, distance });
            }
        }

        heap.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.id.cmp(&b.id)));
        heap.truncate(k);
        Ok(heap)
    }

    /// Persists the index under the `GVIV` magic (spec.md §4.15): coarse
    /// centroids, the trained codebook (via `PQCodebook::to_bytes`), every
    /// posting list's PQ-encoded entries, and the tombstone set, `bincode`-
    /// encoded, matching the teacher's choice of `bincode` for bodies the
    /// spec leaves byte-layout-free.
    ///
    /// # Errors
    ///
    /// `Io` on filesystem failure; `Serialization` if encoding fails.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let inner = self.inner.read();
        let snapshot = Snapshot {
            metric: self.metric.wire_code(),
            dimension: self.dimension,
            params: self.params,
            coarse_centroids: inner.coarse_centroids.clone(),
            codebook_bytes: inner.codebook.as_ref().map(PQCodebook::to_bytes),
            lists: inner.lists.iter().map(|l| l.entries.clone()).collect(),
            removed: inner.removed.iter().copied().collect(),
            trained: inner.trained,
        };
        let body = bincode::serialize(&snapshot).map_err(|e| Error::Serialization(e.to_string()))?;
        persistence::save(path, MAGIC, VERSION, &body)
    }

    /// Loads an index previously written by [`IvfPqIndex::save_to_path`].
    ///
    /// # Errors
    ///
    /// `Io`/`Protocol` from [`crate::persistence::load`]; `Serialization` if
    /// the body is malformed; `InvalidArgument` if the stored codebook's
    /// dimensions are mutually inconsistent.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let body = persistence::load(path, MAGIC, VERSION)?;
        let snapshot: Snapshot = bincode::deserialize(&body).map_err(|e| Error::Serialization(e.to_string()))?;

        let metric = DistanceMetric::from_wire_code(snapshot.metric)?;
        let codebook = snapshot.codebook_bytes.as_deref().map(PQCodebook::from_bytes).transpose()?;
        let lists = snapshot
            .lists
            .into_iter()
            .map(|entries| PostingList { entries })
            .collect();

        Ok(Self {
            metric,
            dimension: snapshot.dimension,
            params: snapshot.params,
            inner: RwLock::new(Inner {
                coarse_centroids: snapshot.coarse_centroids,
                codebook,
                lists,
                removed: snapshot.removed.into_iter().collect(),
                trained: snapshot.trained,
            }),
        })
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    metric: u8,
    dimension: usize,
    params: IvfPqParams,
    coarse_centroids: Vec<Vec<f32>>,
    codebook_bytes: Option<Vec<u8>>,
    lists: Vec<Vec<(u64, Vec<u8>)>>,
    removed: Vec<u64>,
    trained: bool,
}

impl VectorIndex for IvfPqIndex {
    fn insert(&self, id: u64, data: &[f32]) -> Result<()> {
        if data.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: data.len(),
            });
        }
        let mut inner = self.inner.write();
        if !inner.trained {
            return Err(Error::NotTrained);
        }
        let list_idx = Self::nearest_centroid(data, &inner.coarse_centroids);
        let residual = Self::residual(data, &inner.coarse_centroids[list_idx]);
        let code = inner
            .codebook
            .as_ref()
            .expect("trained implies codebook present")
            .encode(&residual)?;
        inner.removed.remove(&id);
        inner.lists[list_idx].entries.push((id, code));
        Ok(())
    }

    fn remove(&self, id: u64) {
        self.inner.write().removed.insert(id);
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Hit>> {
        self.search_internal(query, k, None)
    }

    fn len(&self) -> usize {
        let inner = self.inner.read();
        inner
            .lists
            .iter()
            .flat_map(|l| l.entries.iter())
            .filter(|(id, _)| !inner.removed.contains(id))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clustered_training_set() -> Vec<Vec<f32>> {
        let mut data = Vec::new();
        for cluster in 0..4u32 {
            let base = cluster as f32 * 20.0;
            for i in 0..32u32 {
                let jitter = (i % 3) as f32 * 0.1;
                data.push(vec![base + jitter, base + 1.0 + jitter, base + 2.0, base + 3.0]);
            }
        }
        data
    }

    #[test]
    fn rejects_non_divisible_dimension() {
        assert!(IvfPqIndex::new(DistanceMetric::Euclidean, 5, IvfPqParams { m: 2, ..IvfPqParams::default() }).is_err());
    }

    #[test]
    fn insert_before_train_is_not_trained() {
        let index = IvfPqIndex::new(DistanceMetric::Euclidean, 4, IvfPqParams::default()).unwrap();
        assert!(matches!(index.insert(0, &[0.0; 4]), Err(Error::NotTrained)));
    }

    #[test]
    fn trains_and_finds_nearest_cluster_member() {
        let data = clustered_training_set();
        let index = IvfPqIndex::new(
            DistanceMetric::Euclidean,
            4,
            IvfPqParams {
                nlist: 4,
                nprobe: 2,
                m: 2,
                nbits: 4,
                kmeans_iters: 10,
            },
        )
        .unwrap();
        index.train(&data).unwrap();
        assert!(index.is_trained());

        for (i, v) in data.iter().enumerate() {
            index.insert(i as u64, v).unwrap();
        }
        assert_eq!(index.len(), data.len());

        let query = &data[0];
        let hits = index.search(query, 5).unwrap();
        assert!(!hits.is_empty());
        // The query's own cluster (ids 0..32) should dominate the top-5.
        assert!(hits.iter().filter(|h| h.id < 32).count() >= 3);
    }

    #[test]
    fn removed_ids_excluded_from_results() {
        let data = clustered_training_set();
        let index = IvfPqIndex::new(
            DistanceMetric::Euclidean,
            4,
            IvfPqParams {
                nlist: 4,
                nprobe: 4,
                m: 2,
                nbits: 4,
                kmeans_iters: 5,
            },
        )
        .unwrap();
        index.train(&data).unwrap();
        for (i, v) in data.iter().enumerate() {
            index.insert(i as u64, v).unwrap();
        }
        index.remove(0);
        let hits = index.search(&data[0], data.len()).unwrap();
        assert!(hits.iter().all(|h| h.id != 0));
    }

    #[test]
    fn filtered_search_restricts_to_allowed_ids() {
        let data = clustered_training_set();
        let index = IvfPqIndex::new(
            DistanceMetric::Euclidean,
            4,
            IvfPqParams {
                nlist: 4,
                nprobe: 4,
                m: 2,
                nbits: 4,
                kmeans_iters: 5,
            },
        )
        .unwrap();
        index.train(&data).unwrap();
        for (i, v) in data.iter().enumerate() {
            index.insert(i as u64, v).unwrap();
        }
        let allowed: HashSet<u64> = [1, 2, 3].into_iter().collect();
        let hits = index.search_filtered(&data[0], 10, &allowed).unwrap();
        assert!(hits.iter().all(|h| allowed.contains(&h.id)));
    }

    #[test]
    fn save_then_load_round_trips_search_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ivfpq.bin");

        let data = clustered_training_set();
        let index = IvfPqIndex::new(
            DistanceMetric::Euclidean,
            4,
            IvfPqParams {
                nlist: 4,
                nprobe: 2,
                m: 2,
                nbits: 4,
                kmeans_iters: 5,
            },
        )
        .unwrap();
        index.train(&data).unwrap();
        for (i, v) in data.iter().enumerate() {
            index.insert(i as u64, v).unwrap();
        }
        index.remove(5);

        index.save_to_path(&path).unwrap();
        let loaded = IvfPqIndex::load_from_path(&path).unwrap();

        assert!(loaded.is_trained());
        assert_eq!(loaded.len(), index.len());
        let before = index.search(&data[0], 5).unwrap();
        let after = loaded.search(&data[0], 5).unwrap();
        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(after.iter()) {
            assert_eq!(a.id, b.id);
            assert!((a.distance - b.distance).abs() < 1e-6);
        }
        assert!(after.iter().all(|h| h.id != 5));
    }

    #[test]
    fn load_rejects_wrong_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ivfpq.bin");
        crate::persistence::save(&path, b"NOPE", 1, &[]).unwrap();
        assert!(IvfPqIndex::load_from_path(&path).is_err());
    }
}
