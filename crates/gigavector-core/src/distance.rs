//! Distance metrics for vector similarity calculations.
//!
//! All five kernels from spec.md §4.1 rank ascending: lower is always more
//! similar. `DotProduct` is therefore returned negated, and `Cosine` is
//! returned as `1 - cos` so callers never need to branch on metric when
//! building a top-k heap.

use serde::{Deserialize, Serialize};

/// Distance metric for vector similarity calculations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// Euclidean (L2) distance: `sqrt(sum((a-b)^2))`.
    Euclidean,
    /// Cosine distance: `1 - cos(a, b)`, range `[0, 2]`.
    Cosine,
    /// Negated dot product, so ascending order means "most similar".
    Dot,
    /// Manhattan (L1) distance: `sum(|a-b|)`.
    Manhattan,
    /// Hamming distance after per-dimension zero-thresholding.
    Hamming,
}

impl DistanceMetric {
    /// Computes the distance between `a` and `b` under this metric.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `a.len() != b.len()`.
    pub fn distance(self, a: &[f32], b: &[f32]) -> crate::error::Result<f32> {
        if a.len() != b.len() {
            return Err(crate::error::Error::DimensionMismatch {
                expected: a.len(),
                actual: b.len(),
            });
        }
        Ok(match self {
            Self::Euclidean => Self::euclidean(a, b).sqrt(),
            Self::Cosine => Self::cosine_distance(a, b),
            Self::Dot => -Self::dot(a, b),
            Self::Manhattan => Self::manhattan(a, b),
            Self::Hamming => Self::hamming(a, b),
        })
    }

    /// Squared Euclidean distance, used internally by HNSW/flat candidate
    /// ranking to avoid the `sqrt` call (spec.md §4.1).
    #[must_use]
    pub fn euclidean_squared(a: &[f32], b: &[f32]) -> f32 {
        Self::euclidean(a, b)
    }

    fn euclidean(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
    }

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }

    fn manhattan(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum()
    }

    fn hamming(a: &[f32], b: &[f32]) -> f32 {
        a.iter()
            .zip(b.iter())
            .filter(|(x, y)| (**x > 0.0) != (**y > 0.0))
            .count() as f32
    }

    /// `1 - cosine_similarity`. A zero-norm vector yields `1.0` (maximum
    /// distance) per spec.md §4.1's numerical policy.
    fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
        let dot = Self::dot(a, b);
        let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return 1.0;
        }
        1.0 - dot / (norm_a * norm_b)
    }

    /// Converts a raw metric distance into a `[0, 1]` similarity score,
    /// used by `HybridFusion` (spec.md §4.11) when combining with text
    /// scores.
    ///
    /// spec.md §4.11 states the conversion in terms of the underlying raw
    /// score rather than the ascending `distance` this module returns:
    /// cosine similarity `(cos+1)/2` and a logistic over the raw dot
    /// product. Since `distance() `negates/complements those raw scores
    /// (`Cosine` returns `1-cos`, `Dot` returns `-dot`), the formulas below
    /// substitute back (`cos = 1-distance`, `dot = -distance`) to reach the
    /// same result in terms of `distance`.
    #[must_use]
    pub fn to_similarity(self, distance: f32) -> f32 {
        match self {
            Self::Cosine => 1.0 - distance / 2.0,
            Self::Dot => 1.0 / (1.0 + distance.exp()),
            Self::Euclidean | Self::Manhattan | Self::Hamming => 1.0 / (1.0 + distance),
        }
    }

    /// Wire-protocol metric code used in SEARCH/BATCH_SEARCH payloads
    /// (spec.md §4.13).
    #[must_use]
    pub const fn wire_code(self) -> u8 {
        match self {
            Self::Euclidean => 0,
            Self::Cosine => 1,
            Self::Dot => 2,
            Self::Manhattan => 3,
            Self::Hamming => 4,
        }
    }

    /// Parses a wire-protocol metric code.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for any code outside `0..=4`.
    pub fn from_wire_code(code: u8) -> crate::error::Result<Self> {
        match code {
            0 => Ok(Self::Euclidean),
            1 => Ok(Self::Cosine),
            2 => Ok(Self::Dot),
            3 => Ok(Self::Manhattan),
            4 => Ok(Self::Hamming),
            other => Err(crate::error::Error::InvalidArgument(format!(
                "unknown metric code {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn euclidean_basic() {
        let a = [0.0, 0.0, 0.0];
        let b = [3.0, 4.0, 0.0];
        let d = DistanceMetric::Euclidean.distance(&a, &b).unwrap();
        assert!((d - 5.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_identical_is_zero() {
        let a = [1.0, 0.0, 0.0];
        let d = DistanceMetric::Cosine.distance(&a, &a).unwrap();
        assert!(d.abs() < 1e-6);
    }

    #[test]
    fn cosine_zero_norm_is_max_distance() {
        let a = [0.0, 0.0, 0.0];
        let b = [1.0, 2.0, 3.0];
        let d = DistanceMetric::Cosine.distance(&a, &b).unwrap();
        assert!((d - 1.0).abs() < 1e-6);
    }

    #[test]
    fn dot_product_lower_is_more_similar() {
        let a = [1.0, 2.0, 3.0];
        let b = [4.0, 5.0, 6.0];
        let d = DistanceMetric::Dot.distance(&a, &b).unwrap();
        assert!((d + 32.0).abs() < 1e-6);
    }

    #[test]
    fn manhattan_basic() {
        let a = [0.0, 0.0];
        let b = [3.0, -4.0];
        let d = DistanceMetric::Manhattan.distance(&a, &b).unwrap();
        assert!((d - 7.0).abs() < 1e-6);
    }

    #[test]
    fn hamming_counts_sign_flips() {
        let a = [1.0, -1.0, 1.0, -1.0];
        let b = [1.0, 1.0, -1.0, -1.0];
        let d = DistanceMetric::Hamming.distance(&a, &b).unwrap();
        assert!((d - 2.0).abs() < 1e-6);
    }

    #[test]
    fn dimension_mismatch_is_invalid_argument() {
        let a = [1.0, 2.0];
        let b = [1.0, 2.0, 3.0];
        assert!(DistanceMetric::Euclidean.distance(&a, &b).is_err());
    }

    #[test]
    fn wire_code_round_trip() {
        for m in [
            DistanceMetric::Euclidean,
            DistanceMetric::Cosine,
            DistanceMetric::Dot,
            DistanceMetric::Manhattan,
            DistanceMetric::Hamming,
        ] {
            assert_eq!(DistanceMetric::from_wire_code(m.wire_code()).unwrap(), m);
        }
    }
}
