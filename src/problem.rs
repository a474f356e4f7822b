//! Validated, immutable inputs of one search.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::cluster::{canonicalize, evaluate};
use crate::distance::Metric;
use crate::error::{ClusterError, Result};
use crate::executor::panic_message;

/// A warm-start assignment after canonical relabelling.
///
/// Always uses exactly `min(k, n)` clusters, so it is a valid answer in its
/// own right.
#[derive(Debug, Clone, PartialEq)]
pub struct WarmStart {
    /// Cluster index per document, numbered by first appearance.
    pub labels: Vec<usize>,
    /// Objective value of `labels`.
    pub cost: f64,
}

/// Documents, `k`, metric and optional warm start, checked once up front.
///
/// Everything here is read-only for the duration of a run and shared by
/// every node task.
pub struct Problem<M> {
    documents: Vec<Vec<f64>>,
    k: usize,
    metric: M,
    warm_start: Option<WarmStart>,
}

impl<M: Metric> Problem<M> {
    /// Validate inputs.
    ///
    /// Rejects `k == 0`, an empty document set, ragged dimensions, and a warm
    /// start whose length differs from the document count or which uses more
    /// than `k` distinct labels. A warm start with fewer than `min(k, n)`
    /// labels is completed by splitting documents off into new clusters.
    ///
    /// The warm start is costed here with `metric`; a panic while doing so is
    /// returned as [`ClusterError::InvalidParameter`].
    pub fn new(
        documents: Vec<Vec<f64>>,
        k: usize,
        metric: M,
        warm_start: Option<Vec<usize>>,
    ) -> Result<Self> {
        if k == 0 {
            return Err(ClusterError::InvalidParameter(
                "k must be greater than 0".to_string(),
            ));
        }
        let Some(first) = documents.first() else {
            return Err(ClusterError::EmptyInput);
        };
        let dim = first.len();
        if let Some((index, doc)) = documents.iter().enumerate().find(|(_, d)| d.len() != dim) {
            return Err(ClusterError::DimensionMismatch {
                index,
                expected: dim,
                found: doc.len(),
            });
        }

        let warm_start = match warm_start {
            None => None,
            Some(raw) => {
                if raw.len() != documents.len() {
                    return Err(ClusterError::AssignmentMismatch {
                        expected: documents.len(),
                        found: raw.len(),
                    });
                }
                let (labels, distinct) = canonicalize(&raw);
                if distinct > k {
                    return Err(ClusterError::InvalidParameter(format!(
                        "warm start uses {distinct} clusters but k = {k}"
                    )));
                }
                let target = k.min(documents.len());
                let costed = catch_unwind(AssertUnwindSafe(|| {
                    let labels =
                        open_missing_clusters(&documents, labels, distinct, target, &metric);
                    let cost = evaluate(&documents, &labels, &metric)?;
                    Ok::<_, ClusterError>(WarmStart { labels, cost })
                }));
                match costed {
                    Ok(warm) => Some(warm?),
                    Err(payload) => {
                        return Err(ClusterError::InvalidParameter(format!(
                            "metric panicked while costing the warm start: {}",
                            panic_message(&*payload)
                        )))
                    }
                }
            }
        };

        Ok(Self {
            documents,
            k,
            metric,
            warm_start,
        })
    }
}

/// Split documents off into fresh clusters until `target` clusters are used.
///
/// Each step moves the document farthest from its cluster mean, taken from a
/// cluster with at least two members, into a new cluster. For squared
/// Euclidean distance this never raises the cost. Returns canonical labels.
fn open_missing_clusters<M: Metric>(
    documents: &[Vec<f64>],
    mut labels: Vec<usize>,
    mut distinct: usize,
    target: usize,
    metric: &M,
) -> Vec<usize> {
    if distinct >= target {
        return labels;
    }
    let dim = documents.first().map_or(0, Vec::len);
    while distinct < target {
        let mut means = vec![vec![0.0f64; dim]; distinct];
        let mut counts = vec![0usize; distinct];
        for (doc, &label) in documents.iter().zip(&labels) {
            counts[label] += 1;
            for (m, &x) in means[label].iter_mut().zip(doc) {
                *m += x;
            }
        }
        for (mean, &count) in means.iter_mut().zip(&counts) {
            for m in mean.iter_mut() {
                *m /= count as f64;
            }
        }

        let mut farthest: Option<(usize, f64)> = None;
        for (i, (doc, &label)) in documents.iter().zip(&labels).enumerate() {
            if counts[label] < 2 {
                continue;
            }
            let d = metric.distance(doc, &means[label]);
            if farthest.map_or(true, |(_, best)| d > best) {
                farthest = Some((i, d));
            }
        }
        // distinct < target <= n guarantees a cluster with two members
        let Some((index, _)) = farthest else {
            break;
        };
        labels[index] = distinct;
        distinct += 1;
    }
    canonicalize(&labels).0
}

impl<M> Problem<M> {
    /// All documents.
    #[inline]
    pub fn documents(&self) -> &[Vec<f64>] {
        &self.documents
    }

    /// Document at `index`.
    #[inline]
    pub fn document(&self, index: usize) -> &[f64] {
        &self.documents[index]
    }

    /// Number of documents.
    #[inline]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Always false for a validated problem.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Requested cluster count.
    #[inline]
    pub fn k(&self) -> usize {
        self.k
    }

    /// Number of clusters a complete assignment must use: `min(k, n)`.
    #[inline]
    pub fn target_clusters(&self) -> usize {
        self.k.min(self.documents.len())
    }

    #[inline]
    pub fn metric(&self) -> &M {
        &self.metric
    }

    #[inline]
    pub fn warm_start(&self) -> Option<&WarmStart> {
        self.warm_start.as_ref()
    }
}
