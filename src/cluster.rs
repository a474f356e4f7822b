//! Per-cluster bookkeeping and the incremental objective.
//!
//! A cluster is tracked as `(cardinality, centroid, cost)`. Documents join
//! one at a time in document order:
//!
//! ```text
//! δ        = c / (c + 1) * d(x, μ)
//! μ'       = (x + c·μ) / (c + 1)
//! cost'    = cost + δ
//! ```
//!
//! [`evaluate`] replays exactly these steps, so its value for an assignment is
//! bit-identical to the cost of the search leaf that realises it.

use crate::distance::Metric;
use crate::error::{ClusterError, Result};

/// State of one open cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterState {
    cardinality: usize,
    centroid: Vec<f64>,
    cost: f64,
}

impl ClusterState {
    /// A cluster holding only `document`.
    pub fn singleton(document: &[f64]) -> Self {
        Self {
            cardinality: 1,
            centroid: document.to_vec(),
            cost: 0.0,
        }
    }

    /// Number of documents in the cluster.
    #[inline]
    pub fn cardinality(&self) -> usize {
        self.cardinality
    }

    /// Running mean of the cluster's documents.
    #[inline]
    pub fn centroid(&self) -> &[f64] {
        &self.centroid
    }

    /// Objective accumulated by this cluster.
    #[inline]
    pub fn cost(&self) -> f64 {
        self.cost
    }

    /// Cost increase if `document` joined this cluster.
    #[inline]
    pub fn join_cost<M: Metric + ?Sized>(&self, document: &[f64], metric: &M) -> f64 {
        let c = self.cardinality as f64;
        c / (c + 1.0) * metric.distance(document, &self.centroid)
    }

    /// Add `document` to the cluster, charging `delta` (from [`Self::join_cost`]).
    pub fn absorb(&mut self, document: &[f64], delta: f64) {
        let old = self.cardinality as f64;
        let new = old + 1.0;
        for (m, &x) in self.centroid.iter_mut().zip(document) {
            *m = (x + old * *m) / new;
        }
        self.cardinality += 1;
        self.cost += delta;
    }
}

/// Relabel an assignment by order of first appearance.
///
/// `[7, 7, 2, 7, 5]` becomes `[0, 0, 1, 0, 2]`. Returns the relabelled
/// assignment and the number of distinct clusters.
pub fn canonicalize(assignment: &[usize]) -> (Vec<usize>, usize) {
    let mut mapping: Vec<(usize, usize)> = Vec::new();
    let mut out = Vec::with_capacity(assignment.len());
    for &label in assignment {
        let canonical = match mapping.iter().find(|(from, _)| *from == label) {
            Some(&(_, to)) => to,
            None => {
                let to = mapping.len();
                mapping.push((label, to));
                to
            }
        };
        out.push(canonical);
    }
    (out, mapping.len())
}

/// Objective value of a complete assignment.
///
/// Labels may be arbitrary; only the induced partition matters. Documents are
/// folded into their clusters in index order, the same order the search uses.
pub fn evaluate<M: Metric + ?Sized>(
    documents: &[Vec<f64>],
    assignment: &[usize],
    metric: &M,
) -> Result<f64> {
    if documents.is_empty() {
        return Err(ClusterError::EmptyInput);
    }
    if assignment.len() != documents.len() {
        return Err(ClusterError::AssignmentMismatch {
            expected: documents.len(),
            found: assignment.len(),
        });
    }

    let (labels, _) = canonicalize(assignment);
    let mut clusters: Vec<ClusterState> = Vec::new();
    for (document, &label) in documents.iter().zip(&labels) {
        if label == clusters.len() {
            clusters.push(ClusterState::singleton(document));
        } else {
            let delta = clusters[label].join_cost(document, metric);
            clusters[label].absorb(document, delta);
        }
    }

    Ok(clusters.iter().map(ClusterState::cost).sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::SquaredEuclidean;
    use proptest::prelude::*;

    fn points(xs: &[f64]) -> Vec<Vec<f64>> {
        xs.iter().map(|&x| vec![x]).collect()
    }

    #[test]
    fn absorb_updates_weighted_mean() {
        let mut c = ClusterState::singleton(&[1.0, 2.0]);
        let delta = c.join_cost(&[3.0, 4.0], &SquaredEuclidean);
        assert!((delta - 4.0).abs() < 1e-12);
        c.absorb(&[3.0, 4.0], delta);
        assert_eq!(c.cardinality(), 2);
        assert_eq!(c.centroid(), &[2.0, 3.0]);
        assert!((c.cost() - 4.0).abs() < 1e-12);
    }

    #[test]
    fn evaluate_matches_sum_of_squared_errors() {
        let docs = points(&[1.0, 2.0, 3.0, 10.0, 11.0]);
        let cost = evaluate(&docs, &[0, 0, 0, 1, 1], &SquaredEuclidean).unwrap();
        assert!((cost - 2.5).abs() < 1e-12);
    }

    #[test]
    fn evaluate_ignores_label_names() {
        let docs = points(&[1.0, 2.0, 3.0, 10.0, 11.0]);
        let a = evaluate(&docs, &[0, 0, 0, 1, 1], &SquaredEuclidean).unwrap();
        let b = evaluate(&docs, &[9, 9, 9, 4, 4], &SquaredEuclidean).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn evaluate_rejects_length_mismatch() {
        let docs = points(&[1.0, 2.0]);
        assert_eq!(
            evaluate(&docs, &[0], &SquaredEuclidean),
            Err(ClusterError::AssignmentMismatch {
                expected: 2,
                found: 1
            })
        );
    }

    #[test]
    fn canonicalize_orders_by_first_appearance() {
        assert_eq!(canonicalize(&[7, 7, 2, 7, 5]), (vec![0, 0, 1, 0, 2], 3));
    }

    proptest! {
        #[test]
        fn prop_evaluate_is_deterministic(
            raw in proptest::collection::vec((-50.0f64..50.0, 0usize..4), 1..24),
        ) {
            let docs: Vec<Vec<f64>> = raw.iter().map(|(x, _)| vec![*x, x * 0.5]).collect();
            let labels: Vec<usize> = raw.iter().map(|(_, l)| *l).collect();
            let first = evaluate(&docs, &labels, &SquaredEuclidean).unwrap();
            let second = evaluate(&docs, &labels, &SquaredEuclidean).unwrap();
            prop_assert_eq!(first, second);
            prop_assert!(first >= 0.0);
        }
    }
}
