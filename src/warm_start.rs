//! k-means heuristic for warm-starting the exact search.
//!
//! A good feasible assignment makes the initial bound tight, which is where
//! most of the pruning comes from. This is plain Lloyd's algorithm with
//! k-means++ seeding over squared Euclidean distance; its result is a label
//! per document and carries no optimality claim.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::distance::l2_distance_squared;
use crate::error::{ClusterError, Result};

/// k-means clustering used to produce a warm-start assignment.
#[derive(Debug, Clone)]
pub struct KMeans {
    k: usize,
    seed: Option<u64>,
    max_iterations: usize,
    centroids: Vec<Vec<f64>>,
}

impl KMeans {
    /// Create new k-means with k clusters.
    pub fn new(k: usize) -> Result<Self> {
        if k == 0 {
            return Err(ClusterError::InvalidParameter(
                "k must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            k,
            seed: None,
            max_iterations: 100,
            centroids: Vec::new(),
        })
    }

    /// Configure a deterministic seed for k-means++ initialization.
    ///
    /// When set, repeated `fit(...)` calls on the same inputs produce identical results.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Fit on `documents` and return one label per document.
    ///
    /// Labels are in `0..k` but not every label need be used.
    pub fn fit(&mut self, documents: &[Vec<f64>]) -> Result<Vec<usize>> {
        if documents.len() < self.k {
            return Err(ClusterError::InvalidParameter(format!(
                "k-means needs at least k = {} documents, got {}",
                self.k,
                documents.len()
            )));
        }

        self.centroids = self.kmeans_plus_plus(documents);
        let mut assignments = self.assign_clusters(documents);

        for _ in 0..self.max_iterations {
            self.centroids = self.update_centroids(documents, &assignments);
            let next = self.assign_clusters(documents);
            if next == assignments {
                break;
            }
            assignments = next;
        }

        Ok(assignments)
    }

    fn kmeans_plus_plus(&self, documents: &[Vec<f64>]) -> Vec<Vec<f64>> {
        // Use an explicit seed when configured; otherwise derive one from entropy.
        let seed = self.seed.unwrap_or_else(|| rand::rng().random());
        let mut rng = StdRng::seed_from_u64(seed);

        let mut centroids = Vec::with_capacity(self.k);
        centroids.push(documents[rng.random_range(0..documents.len())].clone());

        // Subsequent centroids: weighted by squared distance to the nearest one so far
        while centroids.len() < self.k {
            let distances: Vec<f64> = documents
                .iter()
                .map(|d| nearest(d, &centroids).1)
                .collect();
            let total: f64 = distances.iter().sum();
            if total <= 0.0 {
                // every document coincides with a centroid
                centroids.push(documents[centroids.len() % documents.len()].clone());
                continue;
            }

            let threshold = rng.random::<f64>() * total;
            let mut cumulative = 0.0;
            let mut chosen = documents.len() - 1;
            for (i, &dist) in distances.iter().enumerate() {
                cumulative += dist;
                if cumulative >= threshold && dist > 0.0 {
                    chosen = i;
                    break;
                }
            }
            centroids.push(documents[chosen].clone());
        }

        centroids
    }

    /// Assign documents to their nearest centroid.
    pub fn assign_clusters(&self, documents: &[Vec<f64>]) -> Vec<usize> {
        documents
            .iter()
            .map(|d| nearest(d, &self.centroids).0)
            .collect()
    }

    fn update_centroids(&self, documents: &[Vec<f64>], assignments: &[usize]) -> Vec<Vec<f64>> {
        let dim = documents.first().map_or(0, Vec::len);
        let mut sums = vec![vec![0.0f64; dim]; self.k];
        let mut counts = vec![0usize; self.k];

        for (doc, &cluster) in documents.iter().zip(assignments) {
            counts[cluster] += 1;
            for (s, &x) in sums[cluster].iter_mut().zip(doc) {
                *s += x;
            }
        }

        sums.into_iter()
            .zip(counts)
            .zip(&self.centroids)
            .map(|((sum, count), old)| {
                if count > 0 {
                    sum.into_iter().map(|s| s / count as f64).collect()
                } else {
                    // Empty cluster: keep old centroid
                    old.clone()
                }
            })
            .collect()
    }

    pub fn centroids(&self) -> &[Vec<f64>] {
        &self.centroids
    }
}

fn nearest(document: &[f64], centroids: &[Vec<f64>]) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (i, c) in centroids.iter().enumerate() {
        let d = l2_distance_squared(document, c);
        if d < best.1 {
            best = (i, d);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn separates_obvious_groups() {
        let docs: Vec<Vec<f64>> = [1.0, 2.0, 3.0, 10.0, 11.0].iter().map(|&x| vec![x]).collect();
        let labels = KMeans::new(2).unwrap().with_seed(7).fit(&docs).unwrap();
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[1], labels[2]);
        assert_eq!(labels[3], labels[4]);
        assert_ne!(labels[0], labels[3]);
    }

    #[test]
    fn rejects_too_few_documents() {
        let docs = vec![vec![1.0]];
        assert!(KMeans::new(2).unwrap().fit(&docs).is_err());
    }

    #[test]
    fn duplicate_documents_do_not_stall() {
        let docs = vec![vec![1.0, 1.0]; 6];
        let labels = KMeans::new(3).unwrap().with_seed(1).fit(&docs).unwrap();
        assert_eq!(labels.len(), 6);
        assert!(labels.iter().all(|&l| l < 3));
    }

    proptest! {
        #[test]
        fn prop_fit_is_deterministic_given_seed(
            seed in any::<u64>(),
            k in 1usize..5,
            raw in proptest::collection::vec((-10.0f64..10.0, -10.0f64..10.0), 5..40),
        ) {
            let docs: Vec<Vec<f64>> = raw.iter().map(|&(x, y)| vec![x, y]).collect();
            let a = KMeans::new(k).unwrap().with_seed(seed).fit(&docs).unwrap();
            let b = KMeans::new(k).unwrap().with_seed(seed).fit(&docs).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
