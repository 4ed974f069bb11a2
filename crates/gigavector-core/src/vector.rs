//! Dense vector storage in a struct-of-arrays layout (spec.md §3, §4.2).

use crate::error::{Error, Result};
use crate::persistence;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;

const MAGIC: &[u8; 4] = b"GVVS";
const VERSION: u32 = 1;

/// Ordered metadata attached to a vector: an insertion-ordered collection of
/// `(key, value)` string pairs, per spec.md §3. `BTreeMap` gives stable,
/// deterministic iteration order for persistence without a separate ordering
/// vector.
pub type Metadata = BTreeMap<String, String>;

/// A single stored vector plus its metadata and tombstone flag.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    /// Internal, dense id. Stable until compaction.
    pub id: u64,
    /// The raw embedding, length always equal to the store's `dimension`.
    pub data: Vec<f32>,
    /// Optional key/value metadata.
    pub metadata: Metadata,
    /// Soft-delete flag.
    pub tombstone: bool,
}

/// Struct-of-arrays dense vector storage with append-only growth and
/// soft-delete (spec.md §4.2).
///
/// Reads may proceed concurrently with appends as long as they snapshot
/// `count` before scanning, per spec.md §4.2's concurrency note; callers
/// that need a point-in-time view should read `len()` once and bound their
/// scan to it.
pub struct VectorStore {
    dimension: usize,
    inner: RwLock<Inner>,
}

struct Inner {
    data: Vec<f32>,
    metadata: Vec<Metadata>,
    tombstones: Vec<bool>,
}

impl VectorStore {
    /// Creates an empty store with a fixed, immutable dimension.
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            inner: RwLock::new(Inner {
                data: Vec::new(),
                metadata: Vec::new(),
                tombstones: Vec::new(),
            }),
        }
    }

    /// The store-wide vector dimension, fixed at creation.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Total number of slots (including tombstoned), i.e. the next id that
    /// would be assigned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().tombstones.len()
    }

    /// True if no vectors have ever been inserted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a single vector, returning its freshly assigned id.
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` if `data.len() != dimension()`.
    pub fn add(&self, data: Vec<f32>, metadata: Metadata) -> Result<u64> {
        if data.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: data.len(),
            });
        }
        let mut inner = self.inner.write();
        let id = inner.tombstones.len() as u64;
        inner.data.extend_from_slice(&data);
        inner.metadata.push(metadata);
        inner.tombstones.push(false);
        Ok(id)
    }

    /// Appends `N` vectors in a single write-lock acquisition, atomic from a
    /// reader's perspective: `count` only ever advances by the full batch.
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` if any row does not match `dimension()`.
    pub fn batch_add(
        &self,
        rows: impl IntoIterator<Item = (Vec<f32>, Metadata)>,
    ) -> Result<Vec<u64>> {
        let rows: Vec<_> = rows.into_iter().collect();
        for (data, _) in &rows {
            if data.len() != self.dimension {
                return Err(Error::DimensionMismatch {
                    expected: self.dimension,
                    actual: data.len(),
                });
            }
        }
        let mut inner = self.inner.write();
        let mut ids = Vec::with_capacity(rows.len());
        for (data, metadata) in rows {
            let id = inner.tombstones.len() as u64;
            inner.data.extend_from_slice(&data);
            inner.metadata.push(metadata);
            inner.tombstones.push(false);
            ids.push(id);
        }
        Ok(ids)
    }

    /// Reads a live vector's data by id.
    ///
    /// # Errors
    ///
    /// `NotFound` if `id` is out of range or tombstoned.
    pub fn get(&self, id: u64) -> Result<Vec<f32>> {
        let inner = self.inner.read();
        let idx = id as usize;
        if idx >= inner.tombstones.len() || inner.tombstones[idx] {
            return Err(Error::NotFound(id));
        }
        let start = idx * self.dimension;
        Ok(inner.data[start..start + self.dimension].to_vec())
    }

    /// Reads a live vector's metadata by id.
    ///
    /// # Errors
    ///
    /// `NotFound` if `id` is out of range or tombstoned.
    pub fn get_metadata(&self, id: u64) -> Result<Metadata> {
        let inner = self.inner.read();
        let idx = id as usize;
        if idx >= inner.tombstones.len() || inner.tombstones[idx] {
            return Err(Error::NotFound(id));
        }
        Ok(inner.metadata[idx].clone())
    }

    /// True if `id` is in range and not tombstoned.
    #[must_use]
    pub fn is_live(&self, id: u64) -> bool {
        let inner = self.inner.read();
        let idx = id as usize;
        idx < inner.tombstones.len() && !inner.tombstones[idx]
    }

    /// Overwrites a live vector's data and/or metadata in place.
    ///
    /// # Errors
    ///
    /// `NotFound` if tombstoned or out of range; `DimensionMismatch` if
    /// `new_data` is provided with the wrong length.
    pub fn update(
        &self,
        id: u64,
        new_data: Option<Vec<f32>>,
        new_metadata: Option<Metadata>,
    ) -> Result<()> {
        if let Some(ref d) = new_data {
            if d.len() != self.dimension {
                return Err(Error::DimensionMismatch {
                    expected: self.dimension,
                    actual: d.len(),
                });
            }
        }
        let mut inner = self.inner.write();
        let idx = id as usize;
        if idx >= inner.tombstones.len() || inner.tombstones[idx] {
            return Err(Error::NotFound(id));
        }
        if let Some(data) = new_data {
            let start = idx * self.dimension;
            inner.data[start..start + self.dimension].copy_from_slice(&data);
        }
        if let Some(metadata) = new_metadata {
            inner.metadata[idx] = metadata;
        }
        Ok(())
    }

    /// Soft-deletes `id`. Idempotent: deleting an already-tombstoned or
    /// out-of-range id is a no-op, never an error.
    pub fn delete(&self, id: u64) {
        let mut inner = self.inner.write();
        let idx = id as usize;
        if idx < inner.tombstones.len() {
            inner.tombstones[idx] = true;
        }
    }

    /// Rewrites the store dropping tombstoned rows, returning the
    /// `old_id -> new_id` remap table for index rebuild.
    pub fn compact(&self) -> std::collections::HashMap<u64, u64> {
        let mut inner = self.inner.write();
        let mut remap = std::collections::HashMap::new();
        let mut new_data = Vec::new();
        let mut new_metadata = Vec::new();
        let mut new_tombstones = Vec::new();

        for old_id in 0..inner.tombstones.len() {
            if inner.tombstones[old_id] {
                continue;
            }
            let new_id = new_tombstones.len() as u64;
            remap.insert(old_id as u64, new_id);
            let start = old_id * self.dimension;
            new_data.extend_from_slice(&inner.data[start..start + self.dimension]);
            new_metadata.push(inner.metadata[old_id].clone());
            new_tombstones.push(false);
        }

        inner.data = new_data;
        inner.metadata = new_metadata;
        inner.tombstones = new_tombstones;
        remap
    }

    /// Iterates over all live `(id, data)` pairs. Used by `FlatIndex` and by
    /// index bulk-rebuild.
    pub fn iter_live(&self) -> Vec<(u64, Vec<f32>)> {
        let inner = self.inner.read();
        (0..inner.tombstones.len())
            .filter(|&i| !inner.tombstones[i])
            .map(|i| {
                let start = i * self.dimension;
                (i as u64, inner.data[start..start + self.dimension].to_vec())
            })
            .collect()
    }

    /// Persists the whole store (dimension, data, tombstones, metadata) to
    /// `path` via the `GVVS`-magic framing from [`crate::persistence`].
    /// Requires quiescence: no concurrent writers (spec.md §4.15).
    ///
    /// # Errors
    ///
    /// `Io` on filesystem failure; `Serialization` if metadata encoding
    /// fails.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let inner = self.inner.read();
        let count = inner.tombstones.len();
        let mut body = Vec::with_capacity(8 + count * (self.dimension * 4 + 1));
        body.extend_from_slice(&(self.dimension as u32).to_be_bytes());
        body.extend_from_slice(&(count as u32).to_be_bytes());
        for &f in &inner.data {
            body.extend_from_slice(&f.to_be_bytes());
        }
        for &t in &inner.tombstones {
            body.push(u8::from(t));
        }
        let metadata_bytes =
            bincode::serialize(&inner.metadata).map_err(|e| Error::Serialization(e.to_string()))?;
        body.extend_from_slice(&(metadata_bytes.len() as u32).to_be_bytes());
        body.extend_from_slice(&metadata_bytes);
        persistence::save(path, MAGIC, VERSION, &body)
    }

    /// Loads a store previously written by [`VectorStore::save_to_path`].
    ///
    /// # Errors
    ///
    /// `Io`/`Protocol` from [`crate::persistence::load`]; `Serialization`
    /// if the metadata section is malformed.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let body = persistence::load(path, MAGIC, VERSION)?;
        let mut pos = 0usize;
        let dimension = read_u32(&body, &mut pos)? as usize;
        let count = read_u32(&body, &mut pos)? as usize;

        let data_len = count * dimension;
        let mut data = Vec::with_capacity(data_len);
        for _ in 0..data_len {
            data.push(read_f32(&body, &mut pos)?);
        }

        let mut tombstones = Vec::with_capacity(count);
        for _ in 0..count {
            tombstones.push(read_u8(&body, &mut pos)? != 0);
        }

        let metadata_len = read_u32(&body, &mut pos)? as usize;
        let metadata_bytes = body
            .get(pos..pos + metadata_len)
            .ok_or_else(|| Error::Protocol("VectorStore snapshot truncated in metadata section".into()))?;
        let metadata: Vec<Metadata> =
            bincode::deserialize(metadata_bytes).map_err(|e| Error::Serialization(e.to_string()))?;

        Ok(Self {
            dimension,
            inner: RwLock::new(Inner { data, metadata, tombstones }),
        })
    }
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32> {
    let bytes = buf
        .get(*pos..*pos + 4)
        .ok_or_else(|| Error::Protocol("VectorStore snapshot truncated".into()))?;
    *pos += 4;
    Ok(u32::from_be_bytes(bytes.try_into().expect("length checked")))
}

fn read_u8(buf: &[u8], pos: &mut usize) -> Result<u8> {
    let byte = *buf
        .get(*pos)
        .ok_or_else(|| Error::Protocol("VectorStore snapshot truncated".into()))?;
    *pos += 1;
    Ok(byte)
}

fn read_f32(buf: &[u8], pos: &mut usize) -> Result<f32> {
    let bytes = buf
        .get(*pos..*pos + 4)
        .ok_or_else(|| Error::Protocol("VectorStore snapshot truncated".into()))?;
    *pos += 4;
    Ok(f32::from_be_bytes(bytes.try_into().expect("length checked")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> Metadata {
        Metadata::new()
    }

    #[test]
    fn add_and_get_round_trips() {
        let store = VectorStore::new(3);
        let id = store.add(vec![1.0, 2.0, 3.0], meta()).unwrap();
        assert_eq!(id, 0);
        assert_eq!(store.get(id).unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn n_inserts_yields_count_n_and_stable_reads() {
        let store = VectorStore::new(2);
        for i in 0..10u32 {
            let id = store.add(vec![i as f32, i as f32], meta()).unwrap();
            assert_eq!(id, u64::from(i));
        }
        assert_eq!(store.len(), 10);
        for i in 0..10u64 {
            assert_eq!(store.get(i).unwrap(), vec![i as f32, i as f32]);
        }
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let store = VectorStore::new(3);
        assert!(store.add(vec![1.0, 2.0], meta()).is_err());
    }

    #[test]
    fn delete_is_idempotent_and_tombstones() {
        let store = VectorStore::new(1);
        let id = store.add(vec![1.0], meta()).unwrap();
        store.delete(id);
        store.delete(id);
        assert!(store.get(id).is_err());
        assert!(!store.is_live(id));
    }

    #[test]
    fn update_requires_live_vector() {
        let store = VectorStore::new(1);
        let id = store.add(vec![1.0], meta()).unwrap();
        store.delete(id);
        assert!(store.update(id, Some(vec![2.0]), None).is_err());
    }

    #[test]
    fn compact_remaps_ids_and_drops_tombstones() {
        let store = VectorStore::new(1);
        let a = store.add(vec![1.0], meta()).unwrap();
        let b = store.add(vec![2.0], meta()).unwrap();
        let c = store.add(vec![3.0], meta()).unwrap();
        store.delete(b);
        let remap = store.compact();
        assert_eq!(remap.len(), 2);
        let new_a = remap[&a];
        let new_c = remap[&c];
        assert_eq!(store.get(new_a).unwrap(), vec![1.0]);
        assert_eq!(store.get(new_c).unwrap(), vec![3.0]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn duplicate_inserts_yield_distinct_ids() {
        let store = VectorStore::new(1);
        let a = store.add(vec![1.0], meta()).unwrap();
        let b = store.add(vec![1.0], meta()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn save_then_load_round_trips_data_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");

        let store = VectorStore::new(2);
        let mut m = meta();
        m.insert("tag".into(), "alpha".into());
        store.add(vec![1.0, 2.0], m).unwrap();
        store.add(vec![3.0, 4.0], meta()).unwrap();
        store.delete(1);

        store.save_to_path(&path).unwrap();
        let loaded = VectorStore::load_from_path(&path).unwrap();

        assert_eq!(loaded.dimension(), 2);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get(0).unwrap(), vec![1.0, 2.0]);
        assert!(!loaded.is_live(1));
        assert_eq!(loaded.get_metadata(0).unwrap().get("tag").unwrap(), "alpha");
    }

    #[test]
    fn load_rejects_wrong_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");
        persistence::save(&path, b"NOPE", VERSION, &[]).unwrap();
        assert!(VectorStore::load_from_path(&path).is_err());
    }

    #[test]
    fn load_rejects_truncated_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");
        persistence::save(&path, MAGIC, VERSION, &[0, 0, 0, 2]).unwrap();
        assert!(VectorStore::load_from_path(&path).is_err());
    }
}
