//! # `GigaVector` Core
//!
//! Embeddable vector-search engine: dense vector storage, the ANN index
//! family (exact scan, HNSW, IVF+PQ), metadata filtering, and query
//! execution (k-NN, range, filtered, hybrid, MMR), with a result cache and
//! magic-tagged binary persistence for every component.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use gigavector_core::{Database, DistanceMetric, IndexKind};
//!
//! let db = Database::open("./data")?;
//! let collection = db.create_collection(
//!     "documents",
//!     768,
//!     DistanceMetric::Cosine,
//!     IndexKind::Flat,
//! )?;
//!
//! let key = collection.upsert(None, vec![0.1; 768], Default::default())?;
//! let hits = collection.search(&vec![0.1; 768], 10)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod config;
pub mod distance;
pub mod error;
pub mod fusion;
pub mod index;
pub mod metadata;
pub mod mmr;
pub mod persistence;
pub mod point_id_map;
pub mod pq;
pub mod query;
pub mod vector;
pub mod wire;

pub use cache::{CacheStats, EvictionPolicy, ResultCache};
pub use config::GigaConfig;
pub use distance::DistanceMetric;
pub use error::{Error, Result};
pub use fusion::HybridFusion;
pub use index::hnsw::HnswParams;
pub use index::ivfpq::IvfPqParams;
pub use index::{flat::FlatIndex, hnsw::HnswIndex, ivfpq::IvfPqIndex, Hit, VectorIndex};
pub use metadata::{Expr, MetadataIndex};
pub use mmr::MmrResult;
pub use point_id_map::PointIDMap;
pub use pq::PQCodebook;
pub use query::{IndexBackend, QueryEngine};
pub use vector::{Metadata, VectorStore};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const VECTORS_FILE: &str = "vectors.bin";
const METADATA_FILE: &str = "metadata.bin";
const POINTS_FILE: &str = "points.bin";
const INDEX_FILE: &str = "index.bin";
const CONFIG_FILE: &str = "config.json";

/// Chosen ANN backend for a collection, persisted alongside its config so
/// [`Collection::open`] can reconstruct the right index type (spec.md
/// §2.5-§2.7).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum IndexKind {
    /// Exact brute-force scan (spec.md §4.5).
    Flat,
    /// Hierarchical Navigable Small World graph (spec.md §4.6).
    Hnsw(HnswParams),
    /// Coarse quantizer + product-quantized inverted lists (spec.md §4.7).
    IvfPq(IvfPqParams),
}

/// Persisted collection metadata: name, vector dimension, distance metric,
/// chosen index backend, and cache tuning (spec.md §3's `Vector`/index
/// configuration, bundled the way the teacher's `CollectionConfig` bundles
/// name/dimension/metric).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Collection name.
    pub name: String,
    /// Vector dimension, fixed at creation.
    pub dimension: usize,
    /// Distance metric used for ranking.
    pub metric: DistanceMetric,
    /// Chosen ANN backend.
    pub index_kind: IndexKind,
    /// Result cache tuning for this collection's query engine.
    pub cache: config::CacheConfig,
}

/// A named collection of vectors: storage, metadata index, point-id
/// mapping, chosen ANN backend, and query engine bundled together (spec.md
/// §2's full component list applied to one logical dataset).
///
/// Cheaply `Clone`-able: every field is `Arc`-wrapped, matching the
/// teacher's `Collection` which hands out cloned handles to the same
/// underlying state rather than references with a lifetime.
#[derive(Clone)]
pub struct Collection {
    path: PathBuf,
    config: Arc<RwLock<CollectionConfig>>,
    store: Arc<VectorStore>,
    metadata: Arc<MetadataIndex>,
    point_ids: Arc<PointIDMap>,
    index: Arc<IndexBackend>,
    engine: Arc<QueryEngine>,
}

impl Collection {
    /// Creates a new collection on disk at `path`.
    ///
    /// # Errors
    ///
    /// `Io` if `path` cannot be created or the config cannot be written;
    /// `InvalidArgument` if `index_kind` is inconsistent with `dimension`
    /// (e.g. IVF+PQ's `m` not dividing `dimension`).
    pub fn create(path: PathBuf, name: &str, dimension: usize, metric: DistanceMetric, index_kind: IndexKind) -> Result<Self> {
        Self::create_with_cache(path, name, dimension, metric, index_kind, config::CacheConfig::default())
    }

    /// As [`Collection::create`], with explicit result-cache tuning.
    ///
    /// # Errors
    ///
    /// See [`Collection::create`].
    pub fn create_with_cache(
        path: PathBuf,
        name: &str,
        dimension: usize,
        metric: DistanceMetric,
        index_kind: IndexKind,
        cache: config::CacheConfig,
    ) -> Result<Self> {
        fs::create_dir_all(&path)?;
        let config = CollectionConfig { name: name.to_string(), dimension, metric, index_kind, cache };
        let index = build_index(index_kind, metric, dimension)?;

        let collection = Self {
            path,
            config: Arc::new(RwLock::new(config.clone())),
            store: Arc::new(VectorStore::new(dimension)),
            metadata: Arc::new(MetadataIndex::new()),
            point_ids: Arc::new(PointIDMap::new()),
            index: Arc::new(index),
            engine: Arc::new(QueryEngine::new(metric, cache_from(&config.cache))),
        };
        collection.save_config()?;
        Ok(collection)
    }

    /// Opens a collection previously written by [`Collection::create`] and
    /// [`Collection::save`].
    ///
    /// A component whose snapshot file is absent (e.g. `index.bin` for a
    /// freshly created, never-saved collection) is rebuilt from scratch:
    /// `Flat` and `Hnsw` backends are cheaply rebuilt by replaying
    /// `VectorStore::iter_live`; an untrained `IvfPq` backend comes back
    /// untrained and must be retrained by the caller.
    ///
    /// # Errors
    ///
    /// `Io`/`Protocol` if `config.json` or any present snapshot file is
    /// missing or malformed.
    pub fn open(path: PathBuf) -> Result<Self> {
        let config_data = fs::read_to_string(path.join(CONFIG_FILE))?;
        let config: CollectionConfig =
            serde_json::from_str(&config_data).map_err(|e| Error::Serialization(e.to_string()))?;

        let vectors_path = path.join(VECTORS_FILE);
        let store = if vectors_path.exists() {
            VectorStore::load_from_path(&vectors_path)?
        } else {
            VectorStore::new(config.dimension)
        };

        let metadata_path = path.join(METADATA_FILE);
        let metadata = if metadata_path.exists() {
            MetadataIndex::load_from_path(&metadata_path)?
        } else {
            MetadataIndex::new()
        };

        let points_path = path.join(POINTS_FILE);
        let point_ids = if points_path.exists() {
            PointIDMap::load(fs::File::open(&points_path)?)?
        } else {
            PointIDMap::new()
        };

        let index_path = path.join(INDEX_FILE);
        let index = if index_path.exists() {
            load_index(config.index_kind, &index_path)?
        } else {
            let fresh = build_index(config.index_kind, config.metric, config.dimension)?;
            if !matches!(config.index_kind, IndexKind::IvfPq(_)) {
                for (id, data) in store.iter_live() {
                    fresh.insert(id, &data)?;
                }
            }
            fresh
        };

        let engine = QueryEngine::new(config.metric, cache_from(&config.cache));
        Ok(Self {
            path,
            config: Arc::new(RwLock::new(config)),
            store: Arc::new(store),
            metadata: Arc::new(metadata),
            point_ids: Arc::new(point_ids),
            index: Arc::new(index),
            engine: Arc::new(engine),
        })
    }

    /// Returns a snapshot of this collection's configuration.
    #[must_use]
    pub fn config(&self) -> CollectionConfig {
        self.config.read().clone()
    }

    /// Number of live (non-tombstoned) vectors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.point_ids.len()
    }

    /// True if the collection holds no live vectors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.point_ids.is_empty()
    }

    /// Inserts a new vector, or overwrites the vector/metadata already
    /// mapped to `key`, returning the external key used (a fresh UUIDv4 if
    /// `key` is `None`).
    ///
    /// Overwriting re-indexes under a new internal id and tombstones the
    /// old one in [`VectorStore`] and the ANN backend: none of the three
    /// backends support true in-place vector mutation, so "update" is
    /// modeled as retire-and-reinsert, matching the append-only growth
    /// [`VectorStore`] already requires (spec.md §4.2).
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` if `vector.len()` disagrees with the
    /// collection's dimension; otherwise whatever the chosen index's
    /// `insert` returns (e.g. `NotTrained` for an untrained IVF+PQ backend).
    pub fn upsert(&self, key: Option<String>, vector: Vec<f32>, metadata: Metadata) -> Result<String> {
        let key = key.unwrap_or_else(PointIDMap::generate_uuid_v4);

        // Validate before retiring any existing entry: a rejected upsert
        // must leave a prior key's vector/metadata/index entry untouched.
        if vector.len() != self.store.dimension() {
            return Err(Error::DimensionMismatch { expected: self.store.dimension(), actual: vector.len() });
        }

        if let Some(old_id) = self.point_ids.get(&key) {
            self.store.delete(old_id);
            self.index.remove(old_id);
            self.metadata.remove(old_id);
        }

        let id = self.store.add(vector.clone(), metadata.clone())?;
        if let Err(err) = self.index.insert(id, &vector) {
            self.store.delete(id);
            return Err(err);
        }
        self.metadata.add(id, metadata);
        self.point_ids.set(&key, id);
        self.engine.notify_mutation();
        Ok(key)
    }

    /// Retrieves the vector and metadata for `key`, if live.
    ///
    /// # Errors
    ///
    /// `PointIdNotFound` if `key` was never assigned or has since been
    /// deleted; `NotFound` if the mapped internal id is no longer live.
    pub fn get(&self, key: &str) -> Result<(Vec<f32>, Metadata)> {
        let id = self.point_ids.get(key).ok_or_else(|| Error::PointIdNotFound(key.to_string()))?;
        let data = self.store.get(id)?;
        let metadata = self.store.get_metadata(id)?;
        Ok((data, metadata))
    }

    /// Deletes `key`, if present. Idempotent.
    pub fn delete(&self, key: &str) {
        if let Some(id) = self.point_ids.remove(key) {
            self.store.delete(id);
            self.index.remove(id);
            self.metadata.remove(id);
            self.engine.notify_mutation();
        }
    }

    /// Trains the IVF+PQ backend on `training_vectors`. A no-op precondition
    /// failure (`InvalidArgument`) for any other index kind.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if this collection's index isn't `IvfPq`;
    /// otherwise whatever [`crate::index::ivfpq::IvfPqIndex::train`]
    /// returns.
    pub fn train_ivfpq(&self, training_vectors: &[Vec<f32>]) -> Result<()> {
        match self.index.as_ref() {
            IndexBackend::IvfPq(ivfpq) => ivfpq.train(training_vectors),
            _ => Err(Error::InvalidArgument("collection's index is not IvfPq".to_string())),
        }
    }

    /// Unfiltered top-k search (spec.md §4.9).
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` if `query.len()` disagrees with the collection's
    /// dimension.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Hit>> {
        self.engine.search(&self.store, &self.index, query, k)
    }

    /// Metadata-filtered top-k search (spec.md §4.9).
    ///
    /// # Errors
    ///
    /// See [`Collection::search`].
    pub fn filtered_search(&self, query: &[f32], k: usize, expr: &Expr) -> Result<Vec<Hit>> {
        self.engine.filtered_search(&self.store, &self.index, &self.metadata, query, k, expr)
    }

    /// Range search: every hit within `threshold`, ascending, capped at
    /// `max_results` (spec.md §4.9).
    ///
    /// # Errors
    ///
    /// See [`Collection::search`].
    pub fn range_search(&self, query: &[f32], threshold: f32, max_results: usize) -> Result<Vec<Hit>> {
        self.engine.range_search(&self.store, &self.index, query, threshold, max_results)
    }

    /// Hybrid dense+text search fused under `fusion` (spec.md §4.11).
    ///
    /// # Errors
    ///
    /// See [`Collection::search`].
    pub fn hybrid_search(&self, query: &[f32], k: usize, text_results: &[(u64, f32)], fusion: HybridFusion) -> Result<Vec<(u64, f32)>> {
        self.engine.hybrid_search(&self.store, &self.index, query, k, text_results, fusion)
    }

    /// MMR-diversified search (spec.md §4.12).
    ///
    /// # Errors
    ///
    /// See [`Collection::search`].
    pub fn mmr_search(&self, query: &[f32], k: usize, fetch_k: usize, lambda: f32) -> Result<Vec<MmrResult>> {
        self.engine.mmr_search(&self.store, &self.index, query, k, fetch_k, lambda)
    }

    /// Persists every component to its own snapshot file under this
    /// collection's directory (spec.md §4.15/§6's "concatenation of
    /// VectorStore | MetadataIndex | chosen Index", realized here as
    /// sibling files rather than one concatenated blob since each already
    /// owns a magic-tagged framing). Requires quiescence: no concurrent
    /// mutation, per spec.md §4.15.
    ///
    /// `Flat` indexes have no snapshot file: they're cheap to rebuild from
    /// `VectorStore` on [`Collection::open`], so only `vectors.bin`,
    /// `metadata.bin`, `points.bin`, and `config.json` are written.
    ///
    /// # Errors
    ///
    /// `Io` on filesystem failure; `Serialization` if any component fails
    /// to encode.
    pub fn save(&self) -> Result<()> {
        self.save_config()?;
        self.store.save_to_path(&self.path.join(VECTORS_FILE))?;
        self.metadata.save_to_path(&self.path.join(METADATA_FILE))?;
        self.point_ids.save(fs::File::create(self.path.join(POINTS_FILE))?)?;
        match self.index.as_ref() {
            IndexBackend::Flat(_) => {}
            IndexBackend::Hnsw(i) => i.save_to_path(&self.path.join(INDEX_FILE))?,
            IndexBackend::IvfPq(i) => i.save_to_path(&self.path.join(INDEX_FILE))?,
        }
        Ok(())
    }

    fn save_config(&self) -> Result<()> {
        let config = self.config.read();
        let data = serde_json::to_string_pretty(&*config).map_err(|e| Error::Serialization(e.to_string()))?;
        fs::write(self.path.join(CONFIG_FILE), data)?;
        Ok(())
    }
}

fn cache_from(cfg: &config::CacheConfig) -> ResultCache {
    ResultCache::new(cfg.max_entries, cfg.max_memory_bytes, cfg.ttl_seconds, cfg.invalidate_after_mutations, cfg.eviction_policy)
}

fn build_index(kind: IndexKind, metric: DistanceMetric, dimension: usize) -> Result<IndexBackend> {
    Ok(match kind {
        IndexKind::Flat => IndexBackend::Flat(FlatIndex::new(metric)),
        IndexKind::Hnsw(params) => IndexBackend::Hnsw(HnswIndex::new(metric, params)),
        IndexKind::IvfPq(params) => IndexBackend::IvfPq(IvfPqIndex::new(metric, dimension, params)?),
    })
}

fn load_index(kind: IndexKind, path: &Path) -> Result<IndexBackend> {
    Ok(match kind {
        IndexKind::Flat => unreachable!("Flat indexes never write an index.bin snapshot"),
        IndexKind::Hnsw(_) => IndexBackend::Hnsw(HnswIndex::load_from_path(path)?),
        IndexKind::IvfPq(_) => IndexBackend::IvfPq(IvfPqIndex::load_from_path(path)?),
    })
}

/// Database instance managing named collections under a common data
/// directory (spec.md §1's "embeddable vector-search engine" framing: one
/// process, many collections, each independently indexed).
pub struct Database {
    data_dir: PathBuf,
    collections: RwLock<HashMap<String, Collection>>,
}

impl Database {
    /// Opens or creates a database rooted at `path`, creating the directory
    /// if needed. Existing collection subdirectories are not eagerly
    /// loaded; callers call [`Database::open_collection`] (or
    /// [`Database::create_collection`] for a new one) as needed.
    ///
    /// # Errors
    ///
    /// `Io` if `path` cannot be created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data_dir = path.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir, collections: RwLock::new(HashMap::new()) })
    }

    /// Creates a new collection and registers it in this database's
    /// in-memory table.
    ///
    /// # Errors
    ///
    /// `CollectionExists` if `name` is already registered; otherwise
    /// whatever [`Collection::create`] returns.
    pub fn create_collection(&self, name: &str, dimension: usize, metric: DistanceMetric, index_kind: IndexKind) -> Result<Collection> {
        let mut collections = self.collections.write();
        if collections.contains_key(name) {
            return Err(Error::CollectionExists(name.to_string()));
        }
        let collection = Collection::create(self.data_dir.join(name), name, dimension, metric, index_kind)?;
        collections.insert(name.to_string(), collection.clone());
        Ok(collection)
    }

    /// Opens an existing on-disk collection and registers it in this
    /// database's in-memory table, replacing any prior registration under
    /// the same name.
    ///
    /// # Errors
    ///
    /// Whatever [`Collection::open`] returns.
    pub fn open_collection(&self, name: &str) -> Result<Collection> {
        let collection = Collection::open(self.data_dir.join(name))?;
        self.collections.write().insert(name.to_string(), collection.clone());
        Ok(collection)
    }

    /// Returns a handle to a previously created/opened collection.
    #[must_use]
    pub fn get_collection(&self, name: &str) -> Option<Collection> {
        self.collections.read().get(name).cloned()
    }

    /// Lists the names of every registered collection.
    #[must_use]
    pub fn list_collections(&self) -> Vec<String> {
        self.collections.read().keys().cloned().collect()
    }

    /// Deletes a registered collection, removing its on-disk directory.
    ///
    /// # Errors
    ///
    /// `CollectionNotFound` if `name` isn't registered; otherwise `Io` if
    /// the directory can't be removed.
    pub fn delete_collection(&self, name: &str) -> Result<()> {
        let mut collections = self.collections.write();
        if collections.remove(name).is_none() {
            return Err(Error::CollectionNotFound(name.to_string()));
        }
        let path = self.data_dir.join(name);
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }
}
