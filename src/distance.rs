//! Distance metrics used by the search objective.
//!
//! The branch-and-bound objective charges a document `x` joining a cluster of
//! `c` members with centroid `μ` the amount `c / (c + 1) * d(x, μ)`. With
//! [`SquaredEuclidean`] this is exactly the increase in within-cluster sum of
//! squared errors, which is what makes bound pruning sound.
//!
//! ## Important nuance
//!
//! Any type implementing [`Metric`] is accepted, including plain closures, but
//! pruning is only correct for metrics with the *monotone clustering
//! property*: adding a point to a cluster and recomputing its centroid must
//! never lower the cost already charged. [`Euclidean`] does not have it and is
//! provided for heuristics and diagnostics. Results with such metrics are the
//! caller's responsibility.

/// Pairwise distance between two feature vectors.
///
/// Implementations must be pure: the same inputs always give the same value.
pub trait Metric: Send + Sync {
    /// Distance between `a` and `b`.
    fn distance(&self, a: &[f64], b: &[f64]) -> f64;
}

impl<F> Metric for F
where
    F: Fn(&[f64], &[f64]) -> f64 + Send + Sync,
{
    #[inline]
    fn distance(&self, a: &[f64], b: &[f64]) -> f64 {
        self(a, b)
    }
}

/// Squared Euclidean distance (the k-means objective).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SquaredEuclidean;

impl Metric for SquaredEuclidean {
    #[inline]
    fn distance(&self, a: &[f64], b: &[f64]) -> f64 {
        l2_distance_squared(a, b)
    }
}

/// Euclidean (L2) distance.
///
/// Not monotone under centroid updates; see the module docs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Euclidean;

impl Metric for Euclidean {
    #[inline]
    fn distance(&self, a: &[f64], b: &[f64]) -> f64 {
        l2_distance_squared(a, b).sqrt()
    }
}

/// L2 distance squared.
///
/// If dimensions mismatch, this returns `f64::INFINITY`.
#[inline]
#[must_use]
pub fn l2_distance_squared(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() {
        return f64::INFINITY;
    }
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}
