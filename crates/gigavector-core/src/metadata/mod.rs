//! Metadata inverted index and filter-expression evaluation (spec.md §4.3).

pub mod expr;
mod posting_list;

pub use expr::{CompareOp, Expr, Literal, Ternary};
pub use posting_list::PostingList;

use crate::error::{Error, Result};
use crate::persistence;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::path::Path;

const MAGIC: &[u8; 4] = b"GVMI";
const VERSION: u32 = 1;

/// Inverted index over `(key, value)` metadata pairs.
///
/// Internal ids are truncated to `u32` for posting-list storage (matching
/// the teacher's `RoaringBitmap`-backed posting lists, which are natively
/// `u32`); collections are expected to stay well under four billion live
/// vectors, consistent with `spec.md`'s other in-memory structures.
pub struct MetadataIndex {
    inner: RwLock<Inner>,
}

struct Inner {
    postings: HashMap<(String, String), PostingList>,
    /// Reverse map so `remove(id)` doesn't require a metadata dictionary
    /// lookup: every `(key, value)` pair ever asserted for `id`.
    by_id: HashMap<u32, HashSet<(String, String)>>,
}

impl MetadataIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                postings: HashMap::new(),
                by_id: HashMap::new(),
            }),
        }
    }

    /// Indexes `pairs` against `id`, additive: calling twice with different
    /// pairs asserts both.
    pub fn add(&self, id: u64, pairs: impl IntoIterator<Item = (String, String)>) {
        let id = id as u32;
        let mut inner = self.inner.write();
        for (key, value) in pairs {
            inner
                .postings
                .entry((key.clone(), value.clone()))
                .or_default()
                .insert(id);
            inner.by_id.entry(id).or_default().insert((key, value));
        }
    }

    /// Removes `id` from every posting list it appears in.
    pub fn remove(&self, id: u64) {
        let id = id as u32;
        let mut inner = self.inner.write();
        let Some(pairs) = inner.by_id.remove(&id) else {
            return;
        };
        for pair in pairs {
            if let Some(list) = inner.postings.get_mut(&pair) {
                list.remove(id);
                if list.is_empty() {
                    inner.postings.remove(&pair);
                }
            }
        }
    }

    /// Returns up to `max` ids asserting `(key, value)`, or all of them if
    /// `max` is `None`.
    #[must_use]
    pub fn query(&self, key: &str, value: &str, max: Option<usize>) -> Vec<u64> {
        let inner = self.inner.read();
        let Some(list) = inner.postings.get(&(key.to_string(), value.to_string())) else {
            return Vec::new();
        };
        let iter = list.iter().map(u64::from);
        match max {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        }
    }

    /// Number of ids asserting `(key, value)`.
    #[must_use]
    pub fn count(&self, key: &str, value: &str) -> usize {
        self.inner
            .read()
            .postings
            .get(&(key.to_string(), value.to_string()))
            .map_or(0, PostingList::len)
    }

    /// Attempts to resolve `expr` purely from posting lists (pre-filter
    /// path). Returns `None` if any subtree needs data the index doesn't
    /// hold (inequality, `CONTAINS`/`PREFIX`, or `NOT`), in which case the
    /// caller should fall back to a per-id post-filter scan via
    /// [`Expr::evaluate`].
    #[must_use]
    pub fn candidate_ids(&self, expr: &Expr) -> Option<HashSet<u64>> {
        match expr {
            Expr::Compare { .. } => {
                let (key, value) = expr.as_equality()?;
                Some(self.query(key, value, None).into_iter().collect())
            }
            Expr::And(a, b) => {
                let left = self.candidate_ids(a)?;
                let right = self.candidate_ids(b)?;
                Some(left.intersection(&right).copied().collect())
            }
            Expr::Or(a, b) => {
                let left = self.candidate_ids(a)?;
                let right = self.candidate_ids(b)?;
                Some(left.union(&right).copied().collect())
            }
            Expr::Not(_) => None,
        }
    }

    /// Total number of distinct `(key, value)` postings, for diagnostics.
    #[must_use]
    pub fn posting_count(&self) -> usize {
        self.inner.read().postings.len()
    }

    /// Persists the index under the `GVMI` magic (spec.md §4.15/§6): the
    /// postings are flattened to `(key, value, ids)` triples and the body
    /// is `bincode`-encoded, matching the teacher's choice of `bincode` for
    /// formats the spec leaves byte-layout-free.
    ///
    /// # Errors
    ///
    /// `Io` on filesystem failure; `Serialization` if encoding fails.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let inner = self.inner.read();
        let entries: Vec<(String, String, Vec<u32>)> = inner
            .postings
            .iter()
            .map(|((k, v), list)| (k.clone(), v.clone(), list.iter().collect()))
            .collect();
        let body = bincode::serialize(&entries).map_err(|e| Error::Serialization(e.to_string()))?;
        persistence::save(path, MAGIC, VERSION, &body)
    }

    /// Loads an index previously written by
    /// [`MetadataIndex::save_to_path`], rebuilding both the postings map
    /// and the `by_id` reverse map from the flattened entries.
    ///
    /// # Errors
    ///
    /// `Io`/`Protocol` from [`crate::persistence::load`]; `Serialization`
    /// if the body is malformed.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let body = persistence::load(path, MAGIC, VERSION)?;
        let entries: Vec<(String, String, Vec<u32>)> =
            bincode::deserialize(&body).map_err(|e| Error::Serialization(e.to_string()))?;

        let index = Self::new();
        {
            let mut inner = index.inner.write();
            for (key, value, ids) in entries {
                let mut list = PostingList::new();
                for id in &ids {
                    list.insert(*id);
                }
                for &id in &ids {
                    inner.by_id.entry(id).or_default().insert((key.clone(), value.clone()));
                }
                inner.postings.insert((key, value), list);
            }
        }
        Ok(index)
    }
}

impl Default for MetadataIndex {
    fn default() -> Self {
        Self::new()
    }
}
