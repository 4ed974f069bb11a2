//! Hierarchical Navigable Small World graph: layered proximity graph with
//! concurrent insert and queryable search (spec.md §4.6).

use super::layer::{Layer, NodeId};
use super::ordered_float::OrderedFloat;
use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::persistence;
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const MAGIC: &[u8; 4] = b"GVHN";
const VERSION: u32 = 1;

/// Flattened, serializable snapshot of a [`NativeHnsw`] graph, used by
/// [`NativeHnsw::save_to_path`]/[`NativeHnsw::load_from_path`].
#[derive(Serialize, Deserialize)]
struct Snapshot {
    metric: u8,
    m: usize,
    ef_construction: usize,
    ef_search: usize,
    dimension: usize,
    vectors: Vec<Vec<f32>>,
    external_ids: Vec<u64>,
    removed: Vec<u64>,
    layers: Vec<Vec<Vec<NodeId>>>,
    entry_point: Option<NodeId>,
    max_layer: usize,
    count: usize,
    rng_state: u64,
}

/// Construction/search tuning knobs for [`NativeHnsw`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HnswParams {
    /// Max neighbours per node above layer 0 (`M` in spec.md §4.6).
    pub m: usize,
    /// Candidate pool size during insertion.
    pub ef_construction: usize,
    /// Default candidate pool size for `search()` when the caller doesn't
    /// override it via [`NativeHnsw::search_with_ef`].
    pub ef_search: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 64,
        }
    }
}

/// Hierarchical Navigable Small World graph index (spec.md §4.6).
///
/// Internally nodes are addressed by a dense [`NodeId`]; the mapping to the
/// external `u64` vector id is maintained alongside so that `VectorIndex`
/// callers never see node ids. Soft-deleted ids remain traversable (they can
/// still appear as stepping stones during greedy search) but are excluded
/// from the final top-k, per spec.md §4.6's failure-mode note.
pub struct NativeHnsw {
    metric: DistanceMetric,
    vectors: RwLock<Vec<Vec<f32>>>,
    external_ids: RwLock<Vec<u64>>,
    id_to_node: RwLock<HashMap<u64, NodeId>>,
    removed: RwLock<HashSet<u64>>,
    layers: RwLock<Vec<Layer>>,
    entry_point: RwLock<Option<NodeId>>,
    max_layer: AtomicUsize,
    count: AtomicUsize,
    rng_state: AtomicU64,
    m: usize,
    m_max0: usize,
    ef_construction: usize,
    ef_search: usize,
    level_mult: f64,
    dimension: AtomicUsize,
}

impl NativeHnsw {
    /// Creates an empty graph under the given metric and parameters.
    #[must_use]
    pub fn new(metric: DistanceMetric, params: HnswParams) -> Self {
        let m = params.m.max(1);
        Self {
            metric,
            vectors: RwLock::new(Vec::new()),
            external_ids: RwLock::new(Vec::new()),
            id_to_node: RwLock::new(HashMap::new()),
            removed: RwLock::new(HashSet::new()),
            layers: RwLock::new(vec![Layer::new()]),
            entry_point: RwLock::new(None),
            max_layer: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
            rng_state: AtomicU64::new(0x5DEE_CE66_D1A4_B5B5),
            m,
            m_max0: m * 2,
            ef_construction: params.ef_construction.max(1),
            ef_search: params.ef_search.max(1),
            level_mult: 1.0 / (m as f64).ln(),
            dimension: AtomicUsize::new(0),
        }
    }

    fn check_dimension(&self, data: &[f32]) -> Result<()> {
        let current = self.dimension.load(Ordering::Relaxed);
        if current == 0 {
            self.dimension.store(data.len(), Ordering::Relaxed);
            return Ok(());
        }
        if data.len() != current {
            return Err(Error::DimensionMismatch {
                expected: current,
                actual: data.len(),
            });
        }
        Ok(())
    }

    /// Number of ids ever inserted, including tombstoned ones (graph nodes
    /// are never physically removed, only marked).
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Number of live (non-tombstoned) ids.
    #[must_use]
    pub fn live_count(&self) -> usize {
        let removed = self.removed.read();
        self.external_ids
            .read()
            .iter()
            .filter(|id| !removed.contains(id))
            .count()
    }

    /// Inserts `id` with vector `data`, per spec.md §4.6's five-step
    /// procedure.
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` if `data`'s length disagrees with the graph's
    /// established dimension.
    pub fn insert(&self, id: u64, data: &[f32]) -> Result<()> {
        self.check_dimension(data)?;
        let node_id = {
            let mut vectors = self.vectors.write();
            let mut external_ids = self.external_ids.write();
            let node_id = vectors.len();
            vectors.push(data.to_vec());
            external_ids.push(id);
            self.id_to_node.write().insert(id, node_id);
            node_id
        };
        self.removed.write().remove(&id);

        let node_level = self.random_level();

        {
            let mut layers = self.layers.write();
            while layers.len() <= node_level {
                layers.push(Layer::new());
            }
            for layer in layers.iter_mut() {
                layer.ensure_capacity(node_id);
            }
        }

        let entry_point = *self.entry_point.read();
        let Some(ep) = entry_point else {
            *self.entry_point.write() = Some(node_id);
            self.max_layer.store(node_level, Ordering::Relaxed);
            self.count.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };

        let top_layer = self.max_layer.load(Ordering::Relaxed);
        let mut current_ep = ep;
        for layer_idx in (node_level + 1..=top_layer).rev() {
            current_ep = self.search_layer_single(data, current_ep, layer_idx);
        }

        for layer_idx in (0..=node_level.min(top_layer)).rev() {
            let candidates = self.search_layer(data, vec![current_ep], self.ef_construction, layer_idx);
            let max_conn = if layer_idx == 0 { self.m_max0 } else { self.m };
            let selected = self.select_neighbors(data, &candidates, max_conn);

            self.layers.read()[layer_idx].set_neighbors(node_id, selected.clone());
            for &neighbor in &selected {
                self.connect_and_prune(node_id, neighbor, layer_idx, max_conn);
            }

            if let Some(&(best, _)) = candidates.first() {
                current_ep = best;
            }
        }

        if node_level > top_layer {
            self.max_layer.store(node_level, Ordering::Relaxed);
            *self.entry_point.write() = Some(node_id);
        }

        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Soft-deletes `id`: excluded from future top-k results but remains a
    /// traversable stepping stone in the graph.
    pub fn remove(&self, id: u64) {
        self.removed.write().insert(id);
    }

    /// Searches with the configured default `ef_search`.
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` if `query`'s length disagrees with the graph's
    /// established dimension.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(u64, f32)>> {
        self.search_with_ef(query, k, self.ef_search)
    }

    /// Searches with an explicit `ef_search`, per spec.md §4.6: greedy
    /// descent to level 1, then `search_layer(ef=max(ef_search, k))` at
    /// level 0, filtering tombstoned ids from the final top-k.
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` if `query`'s length disagrees with the graph's
    /// established dimension.
    pub fn search_with_ef(&self, query: &[f32], k: usize, ef_search: usize) -> Result<Vec<(u64, f32)>> {
        let entry_point = *self.entry_point.read();
        let Some(ep) = entry_point else {
            return Ok(Vec::new());
        };
        self.check_dimension(query)?;

        let top_layer = self.max_layer.load(Ordering::Relaxed);
        let mut current_ep = ep;
        for layer_idx in (1..=top_layer).rev() {
            current_ep = self.search_layer_single(query, current_ep, layer_idx);
        }

        let ef = ef_search.max(k);
        let candidates = self.search_layer(query, vec![current_ep], ef, 0);

        let external_ids = self.external_ids.read();
        let removed = self.removed.read();
        let hits = candidates
            .into_iter()
            .map(|(node, dist)| (external_ids[node], dist))
            .filter(|(id, _)| !removed.contains(id))
            .take(k)
            .collect();
        Ok(hits)
    }

    fn get_vector(&self, node_id: NodeId) -> Vec<f32> {
        self.vectors.read()[node_id].clone()
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        self.metric
            .distance(a, b)
            .expect("node vectors share the graph's fixed dimension")
    }

    /// Exponential-decay level assignment with mean `1/ln(M)`, driven by a
    /// deterministic xorshift64 PRNG (spec.md §4.6 step 1).
    fn random_level(&self) -> usize {
        let mut state = self.rng_state.load(Ordering::Relaxed);
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        self.rng_state.store(state, Ordering::Relaxed);

        let uniform = ((state >> 11) as f64) / ((1u64 << 53) as f64);
        let uniform = uniform.max(f64::MIN_POSITIVE);
        let level = (-uniform.ln() * self.level_mult).floor();
        (level as usize).min(31)
    }

    fn search_layer_single(&self, query: &[f32], entry: NodeId, layer: usize) -> NodeId {
        let mut best = entry;
        let mut best_dist = self.distance(query, &self.get_vector(entry));
        loop {
            let neighbors = self.layers.read()[layer].get_neighbors(best);
            let mut improved = false;
            for neighbor in neighbors {
                let dist = self.distance(query, &self.get_vector(neighbor));
                if dist < best_dist {
                    best = neighbor;
                    best_dist = dist;
                    improved = true;
                }
            }
            if !improved {
                break;
            }
        }
        best
    }

    /// Beam search over one layer, returning up to `ef` candidates sorted
    /// ascending by distance.
    fn search_layer(
        &self,
        query: &[f32],
        entry_points: Vec<NodeId>,
        ef: usize,
        layer: usize,
    ) -> Vec<(NodeId, f32)> {
        let mut visited: FxHashSet<NodeId> = FxHashSet::default();
        let mut candidates: BinaryHeap<Reverse<(OrderedFloat, NodeId)>> = BinaryHeap::new();
        let mut results: BinaryHeap<(OrderedFloat, NodeId)> = BinaryHeap::new();

        let vectors = self.vectors.read();
        for ep in entry_points {
            let dist = self.distance(query, &vectors[ep]);
            candidates.push(Reverse((OrderedFloat(dist), ep)));
            results.push((OrderedFloat(dist), ep));
            visited.insert(ep);
        }

        while let Some(Reverse((OrderedFloat(c_dist), c_node))) = candidates.pop() {
            let furthest = results.peek().map_or(f32::MAX, |r| r.0 .0);
            if c_dist > furthest && results.len() >= ef {
                break;
            }

            let neighbors = self.layers.read()[layer].get_neighbors(c_node);
            for neighbor in neighbors {
                if visited.insert(neighbor) {
                    let dist = self.distance(query, &vectors[neighbor]);
                    let furthest = results.peek().map_or(f32::MAX, |r| r.0 .0);
                    if dist < furthest || results.len() < ef {
                        candidates.push(Reverse((OrderedFloat(dist), neighbor)));
                        results.push((OrderedFloat(dist), neighbor));
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        let mut out: Vec<(NodeId, f32)> = results.into_iter().map(|(d, n)| (n, d.0)).collect();
        out.sort_by(|a, b| a.1.total_cmp(&b.1));
        out
    }

    /// Diversity-heuristic neighbour selection (spec.md §4.6 step 3): a
    /// candidate is preferred when it is closer to `target` than to any
    /// already-selected neighbour. Falls back to filling remaining slots
    /// with the closest leftover candidates.
    fn select_neighbors(&self, target: &[f32], candidates: &[(NodeId, f32)], max: usize) -> Vec<NodeId> {
        if candidates.len() <= max {
            return candidates.iter().map(|(id, _)| *id).collect();
        }

        let mut selected: Vec<NodeId> = Vec::with_capacity(max);
        let mut selected_vecs: Vec<Vec<f32>> = Vec::with_capacity(max);

        for &(id, dist_to_target) in candidates {
            if selected.len() >= max {
                break;
            }
            let candidate_vec = self.get_vector(id);
            let is_diverse = selected_vecs
                .iter()
                .all(|s| dist_to_target <= self.distance(&candidate_vec, s));
            if is_diverse || selected.is_empty() {
                selected.push(id);
                selected_vecs.push(candidate_vec);
            }
        }

        if selected.len() < max {
            for &(id, _) in candidates {
                if selected.len() >= max {
                    break;
                }
                if !selected.contains(&id) {
                    selected.push(id);
                }
            }
        }

        let _ = target;
        selected
    }

    /// Adds the `new_node -> neighbor` edge and, if `neighbor` now exceeds
    /// its per-level cap, prunes it back down via the same diversity
    /// heuristic (spec.md §4.6 step 4).
    fn connect_and_prune(&self, new_node: NodeId, neighbor: NodeId, layer: usize, max_conn: usize) {
        let neighbor_vec = self.get_vector(neighbor);
        let mut current = self.layers.read()[layer].get_neighbors(neighbor);
        if !current.contains(&new_node) {
            current.push(new_node);
        }

        if current.len() <= max_conn {
            self.layers.read()[layer].set_neighbors(neighbor, current);
            return;
        }

        let with_dist: Vec<(NodeId, f32)> = current
            .iter()
            .map(|&n| (n, self.distance(&neighbor_vec, &self.get_vector(n))))
            .collect();
        let mut sorted = with_dist.clone();
        sorted.sort_by(|a, b| a.1.total_cmp(&b.1));
        let pruned = self.select_neighbors(&neighbor_vec, &sorted, max_conn);
        self.layers.read()[layer].set_neighbors(neighbor, pruned);
    }

    /// Persists the full graph under the `GVHN` magic (spec.md §4.15): all
    /// node vectors, external ids, tombstones, per-level neighbour lists,
    /// and the entry-point/level bookkeeping needed to resume search and
    /// insertion exactly where they left off.
    ///
    /// Requires quiescence (no concurrent writers), per spec.md §4.15.
    ///
    /// # Errors
    ///
    /// `Io` on filesystem failure; `Serialization` if encoding fails.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let snapshot = Snapshot {
            metric: self.metric.wire_code(),
            m: self.m,
            ef_construction: self.ef_construction,
            ef_search: self.ef_search,
            dimension: self.dimension.load(Ordering::Relaxed),
            vectors: self.vectors.read().clone(),
            external_ids: self.external_ids.read().clone(),
            removed: self.removed.read().iter().copied().collect(),
            layers: self.layers.read().iter().map(Layer::to_vecs).collect(),
            entry_point: *self.entry_point.read(),
            max_layer: self.max_layer.load(Ordering::Relaxed),
            count: self.count.load(Ordering::Relaxed),
            rng_state: self.rng_state.load(Ordering::Relaxed),
        };
        let body = bincode::serialize(&snapshot).map_err(|e| Error::Serialization(e.to_string()))?;
        persistence::save(path, MAGIC, VERSION, &body)
    }

    /// Loads a graph previously written by [`NativeHnsw::save_to_path`].
    ///
    /// # Errors
    ///
    /// `Io`/`Protocol` from [`crate::persistence::load`]; `Serialization`
    /// if the body is malformed.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let body = persistence::load(path, MAGIC, VERSION)?;
        let snapshot: Snapshot = bincode::deserialize(&body).map_err(|e| Error::Serialization(e.to_string()))?;

        let metric = DistanceMetric::from_wire_code(snapshot.metric)?;
        let m = snapshot.m.max(1);
        let id_to_node: HashMap<u64, NodeId> =
            snapshot.external_ids.iter().enumerate().map(|(node, &id)| (id, node)).collect();
        Ok(Self {
            metric,
            vectors: RwLock::new(snapshot.vectors),
            external_ids: RwLock::new(snapshot.external_ids),
            id_to_node: RwLock::new(id_to_node),
            removed: RwLock::new(snapshot.removed.into_iter().collect()),
            layers: RwLock::new(snapshot.layers.into_iter().map(Layer::from_vecs).collect()),
            entry_point: RwLock::new(snapshot.entry_point),
            max_layer: AtomicUsize::new(snapshot.max_layer),
            count: AtomicUsize::new(snapshot.count),
            rng_state: AtomicU64::new(snapshot.rng_state),
            m,
            m_max0: m * 2,
            ef_construction: snapshot.ef_construction.max(1),
            ef_search: snapshot.ef_search.max(1),
            level_mult: 1.0 / (m as f64).ln(),
            dimension: AtomicUsize::new(snapshot.dimension),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_index_returns_empty_result() {
        let graph = NativeHnsw::new(DistanceMetric::Euclidean, HnswParams::default());
        assert!(graph.search(&[0.0, 0.0], 5).unwrap().is_empty());
    }

    #[test]
    fn finds_nearest_of_three() {
        let graph = NativeHnsw::new(DistanceMetric::Euclidean, HnswParams::default());
        graph.insert(0, &[1.0, 0.0, 0.0]).unwrap();
        graph.insert(1, &[0.0, 1.0, 0.0]).unwrap();
        graph.insert(2, &[0.0, 0.0, 1.0]).unwrap();

        let hits = graph.search(&[1.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 0);
        assert!(hits[0].1.abs() < 1e-6);
    }

    #[test]
    fn removed_ids_excluded_from_results_but_traversable() {
        let graph = NativeHnsw::new(DistanceMetric::Euclidean, HnswParams::default());
        for i in 0..20u64 {
            graph.insert(i, &[i as f32, 0.0]).unwrap();
        }
        graph.remove(0);
        let hits = graph.search(&[0.0, 0.0], 3).unwrap();
        assert!(hits.iter().all(|(id, _)| *id != 0));
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let graph = NativeHnsw::new(DistanceMetric::Euclidean, HnswParams::default());
        graph.insert(0, &[1.0, 0.0]).unwrap();
        assert!(graph.insert(1, &[1.0, 0.0, 0.0]).is_err());
        assert!(graph.search(&[1.0, 0.0, 0.0], 1).is_err());
    }

    #[test]
    fn recall_against_brute_force_on_random_data() {
        let dim = 16;
        let n = 500;
        let graph = NativeHnsw::new(
            DistanceMetric::Euclidean,
            HnswParams {
                m: 16,
                ef_construction: 100,
                ef_search: 64,
            },
        );

        let mut state: u64 = 0x2545_F491_4F6C_DD1D;
        let mut next_f32 = || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            ((state >> 40) as f32) / (1u64 << 24) as f32
        };

        let mut data = Vec::with_capacity(n);
        for i in 0..n as u64 {
            let v: Vec<f32> = (0..dim).map(|_| next_f32()).collect();
            graph.insert(i, &v).unwrap();
            data.push(v);
        }

        let query = &data[0];
        let hnsw_hits = graph.search(query, 10).unwrap();
        assert!(!hnsw_hits.is_empty());

        let mut brute: Vec<(u64, f32)> = data
            .iter()
            .enumerate()
            .map(|(i, v)| (i as u64, DistanceMetric::Euclidean.distance(query, v).unwrap()))
            .collect();
        brute.sort_by(|a, b| a.1.total_cmp(&b.1));
        let exact_top10: HashSet<u64> = brute.iter().take(10).map(|(id, _)| *id).collect();

        let overlap = hnsw_hits.iter().filter(|(id, _)| exact_top10.contains(id)).count();
        assert!(overlap >= 7, "overlap {overlap} too low for a smoke test");
    }

    #[test]
    fn save_then_load_round_trips_search_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hnsw.bin");

        let graph = NativeHnsw::new(DistanceMetric::Euclidean, HnswParams::default());
        for i in 0..50u64 {
            graph.insert(i, &[i as f32, (i * 2) as f32]).unwrap();
        }
        graph.remove(3);

        graph.save_to_path(&path).unwrap();
        let loaded = NativeHnsw::load_from_path(&path).unwrap();

        assert_eq!(loaded.node_count(), graph.node_count());
        assert_eq!(loaded.live_count(), graph.live_count());
        let before = graph.search(&[10.0, 20.0], 5).unwrap();
        let after = loaded.search(&[10.0, 20.0], 5).unwrap();
        assert_eq!(before, after);
        assert!(after.iter().all(|(id, _)| *id != 3));
    }

    #[test]
    fn load_rejects_wrong_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hnsw.bin");
        crate::persistence::save(&path, b"NOPE", 1, &[]).unwrap();
        assert!(NativeHnsw::load_from_path(&path).is_err());
    }
}
