//! Total-order wrapper for `f32` distances, so they can sit in a
//! `BinaryHeap` alongside node ids.

use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderedFloat(pub f32);

impl Eq for OrderedFloat {}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> Ordering {
        // NaN never appears in distance computation for finite inputs; if
        // it somehow did, treating it as the largest value keeps the heap
        // from panicking.
        self.0.partial_cmp(&other.0).unwrap_or(Ordering::Greater)
    }
}
