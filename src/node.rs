//! Search-tree nodes.
//!
//! A node is split in two:
//!
//! - [`SearchNode`]: the heavy partial assignment (cluster states, cost). It is
//!   built once by its parent's expansion, moved into the task that runs it,
//!   and dropped as soon as that task has expanded or fathomed it.
//! - [`NodeLink`]: a small record in the shared [`NodeArena`], addressed by
//!   [`NodeId`]. It keeps the parent index, the `(position, cluster)` decision
//!   and the completion state. Solution reconstruction and the done cascade
//!   walk these records iteratively.
//!
//! # Done cascade
//!
//! Each link carries `done` and a `pending` counter of children not yet done.
//! A node becomes done exactly once (`done.swap(true)` wins). The winning
//! thread decrements the parent's `pending`; whichever thread moves it to zero
//! continues the cascade upward. When the cascade reaches the root,
//! [`NodeArena::mark_done`] reports it so the tree can wake its waiter.
//!
//! A done node with no pending children is no longer referenced by anyone,
//! so its slot goes on a free list and is handed to the next allocation.
//! The arena therefore holds at most as many links as were live at once,
//! not one per node ever built. [`NodeArena::path`] must be taken while the
//! leaf is still live.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::cluster::ClusterState;
use crate::distance::Metric;
use crate::error::{ClusterError, Result};
use crate::problem::Problem;

/// Slot of a live node in the [`NodeArena`]. Slots are recycled once done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Arena record of one node.
#[derive(Debug)]
pub struct NodeLink {
    parent: Option<NodeId>,
    position: u32,
    cluster: u32,
    done: AtomicBool,
    pending: AtomicUsize,
}

impl NodeLink {
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn position(&self) -> usize {
        self.position as usize
    }

    pub fn cluster(&self) -> usize {
        self.cluster as usize
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Slab of node links, shared by all tasks of one search.
///
/// The number of allocations (not of slots) is the global node counter
/// compared against the node budget.
#[derive(Debug, Default)]
pub struct NodeArena {
    links: RwLock<Vec<NodeLink>>,
    free: Mutex<Vec<NodeId>>,
    allocated: AtomicU64,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nodes constructed so far.
    #[inline]
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    pub(crate) fn alloc(
        &self,
        parent: Option<NodeId>,
        position: usize,
        cluster: usize,
    ) -> Result<NodeId> {
        let link = NodeLink {
            parent,
            position: position as u32,
            cluster: cluster as u32,
            done: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
        };
        let recycled = self.free.lock().pop();
        let mut links = self.links.write();
        let id = match recycled {
            Some(id) => {
                links[id.index()] = link;
                id
            }
            None => {
                let id = u32::try_from(links.len()).map_err(|_| {
                    ClusterError::InvalidState(
                        "node arena exhausted the u32 index space".to_string(),
                    )
                })?;
                links.push(link);
                NodeId(id)
            }
        };
        self.allocated.fetch_add(1, Ordering::AcqRel);
        Ok(id)
    }

    /// Record how many children `id` has before any of them runs.
    pub(crate) fn set_pending(&self, id: NodeId, children: usize) {
        let links = self.links.read();
        links[id.index()].pending.store(children, Ordering::Release);
    }

    /// Whether `id` has been marked done.
    pub fn is_done(&self, id: NodeId) -> bool {
        self.links.read()[id.index()].is_done()
    }

    /// Parent of `id`, `None` for the root.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.links.read()[id.index()].parent
    }

    /// Mark `id` done and cascade to ancestors whose children are all done.
    ///
    /// Returns `true` when this call completed the root. Marking an already
    /// done node is a no-op. Every node this call completes is released.
    pub fn mark_done(&self, id: NodeId) -> bool {
        let mut released: SmallVec<[NodeId; 8]> = SmallVec::new();
        let completed_root = {
            let links = self.links.read();
            let mut current = id;
            loop {
                let link = &links[current.index()];
                if link.done.swap(true, Ordering::AcqRel) {
                    break false;
                }
                // a node abandoned with children still running keeps its slot
                if link.pending.load(Ordering::Acquire) == 0 {
                    released.push(current);
                }
                let Some(parent) = link.parent else {
                    break true;
                };
                let parent_link = &links[parent.index()];
                if parent_link.pending.fetch_sub(1, Ordering::AcqRel) != 1 {
                    break false;
                }
                current = parent;
            }
        };
        if !released.is_empty() {
            self.free.lock().extend(released);
        }
        completed_root
    }

    /// Links currently held by live nodes.
    pub fn retained(&self) -> usize {
        let slots = self.links.read().len();
        slots.saturating_sub(self.free.lock().len())
    }

    /// Slots ever created: the peak number of simultaneously live nodes.
    pub fn slots(&self) -> usize {
        self.links.read().len()
    }

    /// `(position, cluster)` decisions from `leaf` up to the root.
    ///
    /// `leaf` must not be done yet; its ancestors are live until it is.
    pub fn path(&self, leaf: NodeId) -> Vec<(usize, usize)> {
        let links = self.links.read();
        let mut out = Vec::new();
        let mut current = Some(leaf);
        while let Some(id) = current {
            let link = &links[id.index()];
            out.push((link.position(), link.cluster()));
            current = link.parent;
        }
        out
    }
}

/// A partial assignment of documents `0..=position` to clusters.
#[derive(Debug, Clone)]
pub struct SearchNode {
    id: NodeId,
    position: usize,
    cluster: usize,
    clusters: SmallVec<[ClusterState; 4]>,
    total_cost: f64,
    leftmost: bool,
}

impl SearchNode {
    /// Root: document 0 alone in cluster 0, cost 0, on the leftmost path.
    pub fn root<M>(problem: &Problem<M>, arena: &NodeArena) -> Result<Self> {
        let id = arena.alloc(None, 0, 0)?;
        let mut clusters = SmallVec::new();
        clusters.push(ClusterState::singleton(problem.document(0)));
        Ok(Self {
            id,
            position: 0,
            cluster: 0,
            clusters,
            total_cost: 0.0,
            leftmost: true,
        })
    }

    /// Assign document `parent.position + 1` to `cluster`.
    ///
    /// `cluster == parent.open_clusters()` opens a new cluster. `cost` is the
    /// child's total cost, precomputed by the caller.
    pub fn child<M>(
        problem: &Problem<M>,
        arena: &NodeArena,
        parent: &SearchNode,
        cluster: usize,
        cost: f64,
    ) -> Result<Self> {
        let open = parent.open_clusters();
        if cluster > open {
            return Err(ClusterError::InvalidAssignment { cluster, open });
        }
        if cluster == open && open == problem.k() {
            return Err(ClusterError::CapacityExceeded { k: problem.k() });
        }
        let position = parent.position + 1;
        if position >= problem.len() {
            return Err(ClusterError::InvalidState(format!(
                "position {position} past the last document"
            )));
        }
        let document = problem.document(position);

        let mut clusters = parent.clusters.clone();
        if cluster == open {
            clusters.push(ClusterState::singleton(document));
        } else {
            let delta = cost - parent.total_cost;
            clusters[cluster].absorb(document, delta);
        }

        let id = arena.alloc(Some(parent.id), position, cluster)?;
        let node = Self {
            id,
            position,
            cluster,
            clusters,
            total_cost: cost,
            leftmost: false,
        };
        debug_assert_eq!(node.cardinality_sum(), position + 1);
        debug_assert!(node.total_cost >= parent.total_cost);
        Ok(node)
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Index of the last assigned document.
    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Cluster that document `position` was assigned to.
    #[inline]
    pub fn cluster(&self) -> usize {
        self.cluster
    }

    #[inline]
    pub fn total_cost(&self) -> f64 {
        self.total_cost
    }

    #[inline]
    pub fn is_leftmost(&self) -> bool {
        self.leftmost
    }

    #[inline]
    pub fn open_clusters(&self) -> usize {
        self.clusters.len()
    }

    pub fn clusters(&self) -> &[ClusterState] {
        &self.clusters
    }

    /// True when every document has been assigned.
    #[inline]
    pub fn is_complete<M>(&self, problem: &Problem<M>) -> bool {
        self.position + 1 == problem.len()
    }

    fn cardinality_sum(&self) -> usize {
        self.clusters.iter().map(ClusterState::cardinality).sum()
    }

    /// Build this node's children, sorted by exploration priority.
    ///
    /// Children that could no longer reach `min(k, n)` clusters are skipped.
    /// The number of returned children is registered as this node's pending
    /// count before returning.
    pub fn expand<M: Metric>(
        &self,
        problem: &Problem<M>,
        arena: &NodeArena,
    ) -> Result<Vec<SearchNode>> {
        let next = self.position + 1;
        let document = problem.document(next);
        let remaining_after = problem.len() - 1 - next;
        let target = problem.target_clusters();
        let open = self.open_clusters();
        let num_child_clusters = (open + 1).min(problem.k());

        let favoured = problem
            .warm_start()
            .filter(|_| self.leftmost)
            .map(|ws| ws.labels[next]);

        let mut ranked: Vec<(f64, SearchNode)> = Vec::with_capacity(num_child_clusters);
        for cluster in 0..num_child_clusters {
            let opened = if cluster == open { open + 1 } else { open };
            if opened + remaining_after < target {
                continue;
            }
            let cost = if cluster < open {
                self.total_cost + self.clusters[cluster].join_cost(document, problem.metric())
            } else {
                self.total_cost
            };
            let child = SearchNode::child(problem, arena, self, cluster, cost)?;
            let priority = if favoured == Some(cluster) {
                f64::NEG_INFINITY
            } else {
                cost
            };
            ranked.push((priority, child));
        }

        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
        let mut children: Vec<SearchNode> = ranked.into_iter().map(|(_, c)| c).collect();
        if let Some(first) = children.first_mut() {
            first.leftmost = self.leftmost;
        }

        arena.set_pending(self.id, children.len());
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::SquaredEuclidean;
    use std::sync::Arc;
    use std::thread;

    fn line(xs: &[f64], k: usize, warm: Option<Vec<usize>>) -> Problem<SquaredEuclidean> {
        let docs = xs.iter().map(|&x| vec![x]).collect();
        Problem::new(docs, k, SquaredEuclidean, warm).unwrap()
    }

    #[test]
    fn root_holds_first_document() {
        let p = line(&[1.0, 2.0, 3.0], 2, None);
        let arena = NodeArena::new();
        let root = SearchNode::root(&p, &arena).unwrap();
        assert_eq!(root.position(), 0);
        assert_eq!(root.cluster(), 0);
        assert_eq!(root.open_clusters(), 1);
        assert_eq!(root.total_cost(), 0.0);
        assert!(root.is_leftmost());
        assert_eq!(arena.allocated(), 1);
        assert_eq!(arena.parent(root.id()), None);
    }

    #[test]
    fn child_rejects_skipped_cluster() {
        let p = line(&[1.0, 2.0, 3.0], 3, None);
        let arena = NodeArena::new();
        let root = SearchNode::root(&p, &arena).unwrap();
        let err = SearchNode::child(&p, &arena, &root, 2, 0.0).unwrap_err();
        assert_eq!(err, ClusterError::InvalidAssignment { cluster: 2, open: 1 });
    }

    #[test]
    fn child_rejects_cluster_beyond_k() {
        let p = line(&[1.0, 2.0, 3.0], 1, None);
        let arena = NodeArena::new();
        let root = SearchNode::root(&p, &arena).unwrap();
        let err = SearchNode::child(&p, &arena, &root, 1, 0.0).unwrap_err();
        assert_eq!(err, ClusterError::CapacityExceeded { k: 1 });
    }

    #[test]
    fn child_copies_untouched_clusters() {
        let p = line(&[0.0, 10.0, 2.0], 2, None);
        let arena = NodeArena::new();
        let root = SearchNode::root(&p, &arena).unwrap();
        let opened = SearchNode::child(&p, &arena, &root, 1, 0.0).unwrap();
        let delta = opened.clusters()[0].join_cost(&[2.0], &SquaredEuclidean);
        let joined = SearchNode::child(&p, &arena, &opened, 0, delta).unwrap();

        assert_eq!(joined.clusters()[0].cardinality(), 2);
        assert_eq!(joined.clusters()[0].centroid(), &[1.0]);
        assert_eq!(joined.clusters()[1], opened.clusters()[1]);
        // parent untouched
        assert_eq!(opened.clusters()[0].cardinality(), 1);
        assert!((joined.total_cost() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn expand_sorts_by_cost_and_marks_leftmost() {
        let p = line(&[0.0, 1.0, 50.0, 51.0], 2, None);
        let arena = NodeArena::new();
        let root = SearchNode::root(&p, &arena).unwrap();
        let children = root.expand(&p, &arena).unwrap();
        assert_eq!(children.len(), 2);
        // opening a new cluster costs nothing, so it sorts first
        assert_eq!(children[0].cluster(), 1);
        assert!(children[0].is_leftmost());
        assert!(!children[1].is_leftmost());
        assert!(children[0].total_cost() <= children[1].total_cost());
    }

    #[test]
    fn expand_prefers_warm_start_on_leftmost_path() {
        let p = line(&[0.0, 1.0, 50.0, 51.0], 2, Some(vec![0, 0, 1, 1]));
        let arena = NodeArena::new();
        let root = SearchNode::root(&p, &arena).unwrap();
        let children = root.expand(&p, &arena).unwrap();
        assert_eq!(children[0].cluster(), 0);
        assert!(children[0].is_leftmost());

        // off the leftmost path the override does not apply
        let off_path = &children[1];
        let grandchildren = off_path.expand(&p, &arena).unwrap();
        assert!(grandchildren.iter().all(|c| !c.is_leftmost()));
        assert!(grandchildren
            .windows(2)
            .all(|w| w[0].total_cost() <= w[1].total_cost()));
    }

    #[test]
    fn expand_skips_children_that_cannot_reach_k() {
        let p = line(&[0.0, 1.0, 2.0], 3, None);
        let arena = NodeArena::new();
        let root = SearchNode::root(&p, &arena).unwrap();
        let children = root.expand(&p, &arena).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].cluster(), 1);
    }

    #[test]
    fn path_walks_to_root() {
        let p = line(&[0.0, 1.0, 2.0], 2, None);
        let arena = NodeArena::new();
        let root = SearchNode::root(&p, &arena).unwrap();
        let a = SearchNode::child(&p, &arena, &root, 1, 0.0).unwrap();
        let b = SearchNode::child(&p, &arena, &a, 1, 0.5).unwrap();
        assert_eq!(arena.path(b.id()), vec![(2, 1), (1, 1), (0, 0)]);
    }

    #[test]
    fn cascade_completes_root_once() {
        let p = line(&[0.0, 1.0, 2.0, 3.0], 4, None);
        let arena = NodeArena::new();
        let root = SearchNode::root(&p, &arena).unwrap();
        let children = root.expand(&p, &arena).unwrap();
        assert_eq!(children.len(), 1);

        assert!(arena.mark_done(children[0].id()));
        assert!(arena.is_done(root.id()));
        assert!(!arena.mark_done(root.id()));
    }

    #[test]
    fn done_slots_are_recycled() {
        let p = line(&[0.0, 1.0, 2.0], 2, None);
        let arena = NodeArena::new();
        let root = SearchNode::root(&p, &arena).unwrap();
        let children = root.expand(&p, &arena).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(arena.retained(), 3);

        assert!(!arena.mark_done(children[0].id()));
        assert_eq!(arena.retained(), 2);
        assert!(arena.mark_done(children[1].id()));
        assert_eq!(arena.retained(), 0);

        let reused = arena.alloc(None, 0, 0).unwrap();
        assert!(reused.0 < 3);
        assert!(!arena.is_done(reused));
        assert_eq!(arena.slots(), 3);
        assert_eq!(arena.allocated(), 4);
    }

    #[test]
    fn abandoned_parent_keeps_its_slot() {
        let p = line(&[0.0, 1.0, 2.0], 2, None);
        let arena = NodeArena::new();
        let root = SearchNode::root(&p, &arena).unwrap();
        let children = root.expand(&p, &arena).unwrap();

        // parent finished early (a fault) while both children are pending
        assert!(arena.mark_done(root.id()));
        assert_eq!(arena.retained(), 3);
        assert!(!arena.mark_done(children[0].id()));
        assert!(!arena.mark_done(children[1].id()));
        assert_eq!(arena.retained(), 1);
    }

    #[test]
    fn concurrent_cascade_fires_exactly_once() {
        let p = line(&[0.0, 1.0], 2, None);
        let arena = Arc::new(NodeArena::new());
        let root = SearchNode::root(&p, &arena).unwrap();
        let ids: Vec<NodeId> = (0..64)
            .map(|_| arena.alloc(Some(root.id()), 1, 0).unwrap())
            .collect();
        arena.set_pending(root.id(), ids.len());

        let handles: Vec<_> = ids
            .chunks(8)
            .map(|chunk| {
                let arena = Arc::clone(&arena);
                let chunk = chunk.to_vec();
                thread::spawn(move || chunk.into_iter().filter(|&id| arena.mark_done(id)).count())
            })
            .collect();
        let completions: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(completions, 1);
        assert!(arena.is_done(root.id()));
    }
}
