//! exactk: provably optimal k-partitions by parallel branch-and-bound.
//!
//! Given an ordered set of feature vectors and a cluster count `k`, exactk
//! finds a partition into `min(k, n)` clusters minimising an additive
//! objective (the k-means sum of squared errors with [`SquaredEuclidean`]).
//! The search is exact: when a run finishes without hitting its node budget
//! the answer is a proof of optimality, and the report says so.
//!
//! - `node`: partial assignments, expansion order, and the done cascade
//! - `tree`: shared bound/incumbent/node budget and the run loop
//! - `executor`: bounded worker pool that runs work inline when saturated
//! - `warm_start`: k-means heuristic used to seed the bound
//!
//! # Critical Nuances
//!
//! ## The Monotone Clustering Property
//!
//! Pruning discards a partial assignment as soon as its cost exceeds the best
//! complete one. That is only sound if later documents can never make an
//! existing partial cost smaller. Squared Euclidean distance to a running
//! centroid has this property; arbitrary metrics do not. The [`Metric`] trait
//! accepts any distance, and results for non-monotone ones are undefined.
//!
//! ## Exponential Worst Case
//!
//! The tree has up to `S(n, k)` leaves (Stirling numbers of the second kind).
//! A tight warm start and a sensible document order keep real searches small,
//! but exact clustering stays a tool for tens of points, not thousands. Use a
//! node budget to cap the work; a budget-limited result is flagged
//! [`SearchStatus::BudgetExhausted`] and must not be read as optimal.
//!
//! ## Ties
//!
//! A complete assignment only replaces the incumbent when strictly cheaper.
//! Among equally good partitions, which one is reported depends on thread
//! timing; the optimal value does not.

pub mod cluster;
pub mod distance;
pub mod error;
pub mod executor;
pub mod node;
pub mod problem;
pub mod solution;
pub mod tree;
pub mod warm_start;

// Re-exports
pub use cluster::evaluate;
pub use distance::{Euclidean, Metric, SquaredEuclidean};
pub use error::{ClusterError, Result};
pub use executor::{AdaptiveExecutor, ExecutorConfig, ExecutorStats, Placement};
pub use solution::{BoundUpdate, SearchReport, SearchStatus, Solution, TaskFault};
pub use tree::{optimal_partition, Incumbent, SearchConfig, SearchTree, SearchTreeBuilder};
pub use warm_start::KMeans;
