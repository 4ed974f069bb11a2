//! Adaptive posting list: a small hash set that is promoted to a
//! `RoaringBitmap` once it crosses a cardinality threshold, exactly as the
//! teacher's BM25 posting lists do.

use roaring::RoaringBitmap;
use rustc_hash::FxHashSet;

/// Ids above this count are stored as a compressed `RoaringBitmap` instead
/// of a plain hash set.
const PROMOTION_THRESHOLD: usize = 1000;

/// A posting list for one `(key, value)` pair.
#[derive(Debug, Clone)]
pub enum PostingList {
    /// Cheap for small, frequently-mutated lists.
    Small(FxHashSet<u32>),
    /// Compressed representation for large, mostly-read lists.
    Large(RoaringBitmap),
}

impl PostingList {
    /// Creates an empty, small-variant posting list.
    #[must_use]
    pub fn new() -> Self {
        Self::Small(FxHashSet::default())
    }

    /// Inserts `id`, promoting to `Large` if this crosses the threshold.
    pub fn insert(&mut self, id: u32) {
        match self {
            Self::Small(set) => {
                set.insert(id);
                if set.len() > PROMOTION_THRESHOLD {
                    let bitmap: RoaringBitmap = set.iter().copied().collect();
                    *self = Self::Large(bitmap);
                }
            }
            Self::Large(bitmap) => {
                bitmap.insert(id);
            }
        }
    }

    /// Removes `id`. No-op if absent.
    pub fn remove(&mut self, id: u32) {
        match self {
            Self::Small(set) => {
                set.remove(&id);
            }
            Self::Large(bitmap) => {
                bitmap.remove(id);
            }
        }
    }

    /// True if `id` is present.
    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        match self {
            Self::Small(set) => set.contains(&id),
            Self::Large(bitmap) => bitmap.contains(id),
        }
    }

    /// Number of ids in the list.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Small(set) => set.len(),
            Self::Large(bitmap) => bitmap.len() as usize,
        }
    }

    /// True if the list has no ids.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Collects all ids, in no particular order for `Small`, ascending for
    /// `Large`.
    pub fn iter(&self) -> Box<dyn Iterator<Item = u32> + '_> {
        match self {
            Self::Small(set) => Box::new(set.iter().copied()),
            Self::Large(bitmap) => Box::new(bitmap.iter()),
        }
    }

    /// Set union, choosing the cheaper strategy per variant pairing.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Small(a), Self::Small(b)) => {
                let mut out = a.clone();
                out.extend(b.iter().copied());
                Self::Small(out)
            }
            (Self::Large(a), Self::Large(b)) => Self::Large(a | b),
            (Self::Small(small), Self::Large(large)) | (Self::Large(large), Self::Small(small)) => {
                let mut out = large.clone();
                for id in small {
                    out.insert(*id);
                }
                Self::Large(out)
            }
        }
    }

    /// Set intersection, choosing the cheaper strategy per variant pairing.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Small(a), Self::Small(b)) => {
                Self::Small(a.intersection(b).copied().collect())
            }
            (Self::Large(a), Self::Large(b)) => Self::Large(a & b),
            (Self::Small(small), Self::Large(large)) | (Self::Large(large), Self::Small(small)) => {
                Self::Small(small.iter().copied().filter(|id| large.contains(*id)).collect())
            }
        }
    }
}

impl Default for PostingList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_contains_remove() {
        let mut list = PostingList::new();
        list.insert(1);
        list.insert(2);
        assert!(list.contains(1));
        assert_eq!(list.len(), 2);
        list.remove(1);
        assert!(!list.contains(1));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn promotes_past_threshold() {
        let mut list = PostingList::new();
        for i in 0..=PROMOTION_THRESHOLD as u32 {
            list.insert(i);
        }
        assert!(matches!(list, PostingList::Large(_)));
        assert_eq!(list.len(), PROMOTION_THRESHOLD + 1);
    }

    #[test]
    fn union_and_intersection_cross_variant() {
        let mut small = PostingList::new();
        small.insert(1);
        small.insert(2);
        let mut large = PostingList::new();
        for i in 0..=PROMOTION_THRESHOLD as u32 {
            large.insert(i);
        }
        let union = small.union(&large);
        assert_eq!(union.len(), large.len());
        let intersection = small.intersection(&large);
        assert_eq!(intersection.len(), 2);
    }
}
