//! Search outcomes.

use crate::executor::ExecutorStats;
use crate::node::NodeId;

/// How a finished search ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SearchStatus {
    /// The tree was exhausted: the incumbent (if any) is optimal, and when
    /// there is none nothing beats the initial bound.
    Optimal,
    /// At least one node was fathomed by the node budget. The incumbent is
    /// the best found, not necessarily the best.
    BudgetExhausted,
    /// At least one subtree was abandoned because its task failed.
    Faulted,
}

/// A node task that failed and was fathomed with error.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TaskFault {
    /// Arena index of the failed node.
    pub node: u32,
    /// Last document the node had assigned.
    pub position: usize,
    /// Panic text or error message.
    pub message: String,
}

impl TaskFault {
    pub(crate) fn new(node: NodeId, position: usize, message: String) -> Self {
        Self {
            node: node.0,
            position,
            message,
        }
    }
}

/// One accepted tightening of the global bound.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BoundUpdate {
    /// New bound.
    pub objective: f64,
    /// Nodes constructed when the update was accepted.
    pub nodes: u64,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SearchReport {
    pub status: SearchStatus,
    /// Final bound, if an incumbent realises it.
    pub objective: Option<f64>,
    /// Total nodes constructed.
    pub nodes_constructed: u64,
    /// Initial bound followed by every improvement, in acceptance order.
    pub bound_history: Vec<BoundUpdate>,
    pub faults: Vec<TaskFault>,
    pub executor: ExecutorStats,
}

impl SearchReport {
    /// True only for an exhausted search with no faults.
    pub fn proved_optimal(&self) -> bool {
        self.status == SearchStatus::Optimal
    }
}

/// Best assignment found by a run.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Solution {
    /// Cluster id per document, in `1..=k`, numbered by first appearance.
    pub labels: Vec<usize>,
    /// Objective value of `labels`.
    pub objective: f64,
    pub status: SearchStatus,
}

impl Solution {
    pub fn proved_optimal(&self) -> bool {
        self.status == SearchStatus::Optimal
    }

    /// Number of clusters used.
    pub fn num_clusters(&self) -> usize {
        self.labels.iter().copied().max().unwrap_or(0)
    }

    /// Document indices grouped by cluster; entry `i` holds cluster `i + 1`.
    ///
    /// Documents labelled `0` belong to no cluster and are left out.
    pub fn clusters(&self) -> Vec<Vec<usize>> {
        let mut groups = vec![Vec::new(); self.num_clusters()];
        for (doc, &label) in self.labels.iter().enumerate() {
            let Some(index) = label.checked_sub(1) else {
                continue;
            };
            if let Some(group) = groups.get_mut(index) {
                group.push(doc);
            }
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clusters_group_documents() {
        let s = Solution {
            labels: vec![1, 1, 2, 1, 3],
            objective: 0.0,
            status: SearchStatus::Optimal,
        };
        assert_eq!(s.num_clusters(), 3);
        assert_eq!(s.clusters(), vec![vec![0, 1, 3], vec![2], vec![4]]);
        assert!(s.proved_optimal());
    }

    #[test]
    fn clusters_skip_unlabelled_documents() {
        let s = Solution {
            labels: vec![0, 2, 1, 0],
            objective: 0.0,
            status: SearchStatus::BudgetExhausted,
        };
        assert_eq!(s.num_clusters(), 2);
        assert_eq!(s.clusters(), vec![vec![2], vec![1]]);
        assert!(!s.proved_optimal());
    }
}
