//! Shared helpers for integration tests.

#![allow(dead_code)]

use exactk::{evaluate, Metric};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Install a test-writer subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn line(xs: &[f64]) -> Vec<Vec<f64>> {
    xs.iter().map(|&x| vec![x]).collect()
}

pub fn random_points(n: usize, dim: usize, seed: u64) -> Vec<Vec<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..dim).map(|_| rng.random_range(-10.0..10.0)).collect())
        .collect()
}

/// Minimum objective over every partition into exactly `min(k, n)` clusters.
pub fn brute_force<M: Metric>(documents: &[Vec<f64>], k: usize, metric: &M) -> f64 {
    let n = documents.len();
    let target = k.min(n);
    let mut labels = vec![0usize; n];
    let mut best = f64::INFINITY;
    enumerate(documents, metric, target, &mut labels, 1, 1, &mut best);
    best
}

/// Restricted growth strings: label `i` may be at most `max label so far + 1`.
fn enumerate<M: Metric>(
    documents: &[Vec<f64>],
    metric: &M,
    target: usize,
    labels: &mut Vec<usize>,
    position: usize,
    used: usize,
    best: &mut f64,
) {
    if position == labels.len() {
        if used == target {
            let cost = evaluate(documents, labels, metric).unwrap();
            if cost < *best {
                *best = cost;
            }
        }
        return;
    }
    for label in 0..=used.min(target - 1) {
        labels[position] = label;
        let next_used = if label == used { used + 1 } else { used };
        enumerate(documents, metric, target, labels, position + 1, next_used, best);
    }
}

pub fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * (1.0 + a.abs().max(b.abs()))
}
