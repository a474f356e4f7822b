//! A failing metric must not take the process down.
//!
//! Panics inside node tasks are caught, the affected subtree is fathomed, and
//! the run finishes with the faults listed in its report.

mod common;

use common::{init_tracing, line};
use exactk::{ClusterError, Metric, SearchStatus, SearchTree, SquaredEuclidean};

fn poisoned(a: &[f64], b: &[f64]) -> f64 {
    if a[0] == 99.0 {
        panic!("poisoned document");
    }
    SquaredEuclidean.distance(a, b)
}

#[test]
fn panicking_metric_is_reported_not_fatal() {
    init_tracing();
    let tree = SearchTree::builder(line(&[1.0, 2.0, 3.0, 99.0, 100.0]), 2, poisoned)
        .workers(2)
        .parallel_depth(0)
        .build()
        .unwrap();
    let report = tree.run().expect("run completes despite faults");

    assert_eq!(report.status, SearchStatus::Faulted);
    assert!(!report.proved_optimal());
    assert!(!report.faults.is_empty());
    assert!(report.faults.iter().all(|f| f.position == 2));
    assert!(report
        .faults
        .iter()
        .all(|f| f.message.contains("poisoned document")));
    assert!(tree.is_finished());
    assert_eq!(tree.solution(), Err(ClusterError::NoSolutionFound));
}

#[test]
fn faults_in_one_branch_leave_others_searchable() {
    // Only joining the poisoned document to an existing cluster panics, so the
    // branch that opens a fresh cluster for it still reaches complete
    // assignments.
    let tree = SearchTree::builder(line(&[1.0, 2.0, 99.0]), 2, poisoned)
        .workers(1)
        .build()
        .unwrap();
    let report = tree.run().unwrap();
    assert_eq!(report.status, SearchStatus::Faulted);

    let s = tree.solution().unwrap();
    assert_eq!(s.labels, vec![1, 1, 2]);
    assert_eq!(s.status, SearchStatus::Faulted);
    assert!(!s.proved_optimal());
}
