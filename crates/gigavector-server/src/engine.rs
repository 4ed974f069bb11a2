//! The single vector collection a server process exposes over the wire
//! protocol (spec.md §4.13/§4.14). Unlike [`gigavector_core::Collection`],
//! ids are raw `u64`s assigned by [`gigavector_core::VectorStore`] in
//! insertion order — the wire protocol has no notion of a string point key,
//! so there's no [`gigavector_core::PointIDMap`] layer here.

use gigavector_core::{
    DistanceMetric, Error, FlatIndex, GigaConfig, Hit, HnswIndex, IndexBackend, IvfPqIndex,
    Metadata, QueryEngine, Result, ResultCache, VectorStore,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const VECTORS_FILE: &str = "vectors.bin";
const INDEX_FILE: &str = "index.bin";

/// Which ANN backend a freshly started server builds, chosen at startup
/// from [`GigaConfig`] (the wire protocol itself carries no index-kind
/// field, per spec.md §4.13).
#[derive(Debug, Clone, Copy)]
pub enum EngineIndexKind {
    Flat,
    Hnsw,
    IvfPq,
}

/// Atomic request/byte/error counters behind the `STATS` message
/// (spec.md §4.14). Read snapshot is consistent per field, not across
/// fields, matching the spec's explicit relaxation.
#[derive(Default)]
pub struct Stats {
    pub total_requests: AtomicU64,
    pub active_connections: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub errors: AtomicU64,
}

impl Stats {
    fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.total_requests.load(Ordering::Relaxed),
            self.active_connections.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
            self.bytes_received.load(Ordering::Relaxed),
        )
    }
}

/// Vector storage, chosen ANN index, and query engine shared across every
/// worker thread (spec.md §5: "Shared resources" — every component here
/// takes its own lock internally; `Engine` itself holds no lock of its
/// own).
pub struct Engine {
    data_dir: PathBuf,
    dimension: usize,
    metric: DistanceMetric,
    max_message_bytes: usize,
    store: VectorStore,
    index: IndexBackend,
    query: QueryEngine,
    pub stats: Stats,
}

impl Engine {
    /// Builds a fresh, empty engine. If `data_dir` already holds a prior
    /// snapshot (`vectors.bin`/`index.bin`), it's loaded instead of
    /// starting empty.
    ///
    /// # Errors
    ///
    /// `Io`/`Protocol`/`Serialization` if a present snapshot file is
    /// malformed.
    pub fn open(data_dir: PathBuf, dimension: usize, metric: DistanceMetric, index_kind: EngineIndexKind, config: &GigaConfig) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;

        let vectors_path = data_dir.join(VECTORS_FILE);
        let store = if vectors_path.exists() {
            VectorStore::load_from_path(&vectors_path)?
        } else {
            VectorStore::new(dimension)
        };

        let index_path = data_dir.join(INDEX_FILE);
        let index = if index_path.exists() {
            load_index(index_kind, &index_path)?
        } else {
            let fresh = build_index(index_kind, metric, dimension, config)?;
            if !matches!(index_kind, EngineIndexKind::IvfPq) {
                for (id, data) in store.iter_live() {
                    fresh.insert(id, &data)?;
                }
            }
            fresh
        };

        let cache = ResultCache::new(
            config.cache.max_entries,
            config.cache.max_memory_bytes,
            config.cache.ttl_seconds,
            config.cache.invalidate_after_mutations,
            config.cache.eviction_policy,
        );

        Ok(Self {
            data_dir,
            dimension,
            metric,
            max_message_bytes: config.server.max_message_bytes,
            store,
            index,
            query: QueryEngine::new(metric, cache),
            stats: Stats::default(),
        })
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Frame-size cap enforced by [`crate::handlers::handle_connection`]
    /// (spec.md §4.13: "messages exceeding `max_message_bytes` fail with a
    /// framing error and the connection is closed").
    #[must_use]
    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    /// `ADD`: appends `data`, returning the assigned id. The wire response
    /// itself (`i32 status`) doesn't echo the id back (spec.md §4.13's ADD
    /// row): since ids are handed out in strictly increasing insertion
    /// order starting at 0, a caller that counts its own successful ADDs
    /// can always reconstruct the id it was given.
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` if `data.len() != self.dimension()`.
    pub fn add(&self, data: Vec<f32>) -> Result<u64> {
        let id = self.store.add(data.clone(), Metadata::new())?;
        if let Err(err) = self.index.insert(id, &data) {
            self.store.delete(id);
            return Err(err);
        }
        self.query.notify_mutation();
        Ok(id)
    }

    /// `BATCH_ADD`: inserts every vector in order, returning their assigned
    /// ids. Stops at the first failure, leaving prior insertions in this
    /// call committed (partial success), matching `VectorStore`'s own
    /// append-only semantics.
    ///
    /// # Errors
    ///
    /// See [`Engine::add`].
    pub fn batch_add(&self, vectors: Vec<Vec<f32>>) -> Result<Vec<u64>> {
        vectors.into_iter().map(|v| self.add(v)).collect()
    }

    /// `SEARCH`: top-k search under `metric`, which must match the engine's
    /// configured metric — neither HNSW nor IVF+PQ can answer an arbitrary
    /// per-query metric against a graph/codebook built for a different one
    /// (spec.md §4.6/§4.7 build the index under one fixed metric).
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `metric` disagrees with this engine's
    /// configured metric; `DimensionMismatch` if `data.len()` disagrees
    /// with the engine's dimension.
    pub fn search(&self, metric: DistanceMetric, data: &[f32], k: usize) -> Result<Vec<Hit>> {
        if metric != self.metric {
            return Err(Error::InvalidArgument(format!(
                "engine is configured for {:?}, not {metric:?}",
                self.metric
            )));
        }
        self.query.search(&self.store, &self.index, data, k)
    }

    /// `BATCH_SEARCH`: runs [`Engine::search`] once per query vector.
    ///
    /// # Errors
    ///
    /// See [`Engine::search`].
    pub fn batch_search(&self, metric: DistanceMetric, queries: &[Vec<f32>], k: usize) -> Result<Vec<Vec<Hit>>> {
        queries.iter().map(|q| self.search(metric, q, k)).collect()
    }

    /// `DELETE`: tombstones `id`. Idempotent.
    pub fn delete(&self, id: u64) {
        self.store.delete(id);
        self.index.remove(id);
        self.query.notify_mutation();
    }

    /// `UPDATE`: retires `id`'s old vector and reinserts `data` under a
    /// freshly assigned id, mirroring [`gigavector_core::Collection::upsert`]'s
    /// reasoning that none of the three ANN backends support in-place
    /// vector mutation.
    ///
    /// # Errors
    ///
    /// `NotFound` if `id` isn't live; `DimensionMismatch` if `data.len()`
    /// disagrees with the engine's dimension — checked before `id` is
    /// retired so a rejected update leaves the prior vector intact.
    pub fn update(&self, id: u64, data: Vec<f32>) -> Result<u64> {
        if !self.store.is_live(id) {
            return Err(Error::NotFound(id));
        }
        if data.len() != self.dimension {
            return Err(Error::DimensionMismatch { expected: self.dimension, actual: data.len() });
        }
        self.delete(id);
        self.add(data)
    }

    /// `GET`: the live vector for `id`.
    ///
    /// # Errors
    ///
    /// `NotFound` if `id` is absent or tombstoned.
    pub fn get(&self, id: u64) -> Result<Vec<f32>> {
        self.store.get(id)
    }

    /// `HEALTH`: always `0` (healthy) once the engine is constructed —
    /// there is currently no condition that downgrades a running engine.
    #[must_use]
    pub fn health(&self) -> i32 {
        0
    }

    /// `STATS`: a field-wise-consistent snapshot of request/connection/byte
    /// counters (spec.md §4.14).
    #[must_use]
    pub fn stats(&self) -> (u64, u64, u64, u64) {
        self.stats.snapshot()
    }

    /// `SAVE`: persists `vectors.bin` and, for `Hnsw`/`IvfPq` backends,
    /// `index.bin`, under `path` (or this engine's own data directory if
    /// `path` is `None`). Requires quiescence: no concurrent writer, per
    /// spec.md §4.15.
    ///
    /// # Errors
    ///
    /// `Io` on filesystem failure; `Serialization` if a component fails to
    /// encode.
    pub fn save(&self, path: Option<&str>) -> Result<()> {
        let dir = path.map_or_else(|| self.data_dir.clone(), PathBuf::from);
        std::fs::create_dir_all(&dir)?;
        self.store.save_to_path(&dir.join(VECTORS_FILE))?;
        match &self.index {
            IndexBackend::Flat(_) => {}
            IndexBackend::Hnsw(i) => i.save_to_path(&dir.join(INDEX_FILE))?,
            IndexBackend::IvfPq(i) => i.save_to_path(&dir.join(INDEX_FILE))?,
        }
        Ok(())
    }
}

fn build_index(kind: EngineIndexKind, metric: DistanceMetric, dimension: usize, config: &GigaConfig) -> Result<IndexBackend> {
    Ok(match kind {
        EngineIndexKind::Flat => IndexBackend::Flat(FlatIndex::new(metric)),
        EngineIndexKind::Hnsw => {
            let params = gigavector_core::HnswParams {
                m: config.hnsw.m,
                ef_construction: config.hnsw.ef_construction,
                ef_search: config.hnsw.ef_search,
            };
            IndexBackend::Hnsw(HnswIndex::new(metric, params))
        }
        EngineIndexKind::IvfPq => {
            let params = gigavector_core::IvfPqParams {
                nlist: config.ivfpq.nlist,
                nprobe: config.ivfpq.nprobe,
                m: config.ivfpq.m,
                nbits: config.ivfpq.nbits,
                kmeans_iters: config.ivfpq.kmeans_iters,
            };
            IndexBackend::IvfPq(IvfPqIndex::new(metric, dimension, params)?)
        }
    })
}

fn load_index(kind: EngineIndexKind, path: &Path) -> Result<IndexBackend> {
    Ok(match kind {
        EngineIndexKind::Flat => unreachable!("Flat indexes never write an index.bin snapshot"),
        EngineIndexKind::Hnsw => IndexBackend::Hnsw(HnswIndex::load_from_path(path)?),
        EngineIndexKind::IvfPq => IndexBackend::IvfPq(IvfPqIndex::load_from_path(path)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(dir: &Path) -> Engine {
        Engine::open(dir.to_path_buf(), 3, DistanceMetric::Euclidean, EngineIndexKind::Flat, &GigaConfig::default()).unwrap()
    }

    #[test]
    fn add_search_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        let id = engine.add(vec![1.0, 0.0, 0.0]).unwrap();
        assert_eq!(id, 0);

        let hits = engine.search(DistanceMetric::Euclidean, &[1.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].id, 0);

        assert_eq!(engine.get(0).unwrap(), vec![1.0, 0.0, 0.0]);

        engine.delete(0);
        assert!(engine.get(0).is_err());
    }

    #[test]
    fn search_rejects_mismatched_metric() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.add(vec![1.0, 0.0, 0.0]).unwrap();

        assert!(matches!(
            engine.search(DistanceMetric::Cosine, &[1.0, 0.0, 0.0], 1),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn update_reassigns_id() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let id = engine.add(vec![1.0, 0.0, 0.0]).unwrap();
        let new_id = engine.update(id, vec![0.0, 1.0, 0.0]).unwrap();

        assert_ne!(id, new_id);
        assert!(engine.get(id).is_err());
        assert_eq!(engine.get(new_id).unwrap(), vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn rejected_update_leaves_prior_vector_intact() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let id = engine.add(vec![1.0, 0.0, 0.0]).unwrap();

        assert!(matches!(
            engine.update(id, vec![0.0, 1.0]),
            Err(Error::DimensionMismatch { .. })
        ));

        assert_eq!(engine.get(id).unwrap(), vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn save_then_reopen_restores_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        {
            let engine = engine(&path);
            engine.add(vec![1.0, 2.0, 3.0]).unwrap();
            engine.save(None).unwrap();
        }

        let reopened = Engine::open(path, 3, DistanceMetric::Euclidean, EngineIndexKind::Flat, &GigaConfig::default()).unwrap();
        assert_eq!(reopened.get(0).unwrap(), vec![1.0, 2.0, 3.0]);
    }
}
