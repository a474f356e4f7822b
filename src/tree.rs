//! Search tree: shared bound, incumbent and node budget, and the run loop.
//!
//! # Protocol
//!
//! ```text
//! run ─> root task ─> executor
//!          │
//!          ├─ budget exceeded?        ─> done (budget-fathomed)
//!          ├─ cost > bound?           ─> done (bound-fathomed)
//!          ├─ complete assignment?    ─> offer to incumbent, done
//!          └─ expand ─> children ─> executor (deep, capacity) or inline
//! ```
//!
//! Results travel back only through the bound/incumbent pair (one lock), the
//! node counter (the arena's allocation count) and the done cascade. The
//! thread whose cascade completes the root signals the waiting `run` call.
//!
//! An accepted leaf's labels are copied out of the arena while the leaf is
//! still live, so done nodes can give their arena slots back.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, info_span, warn};

use crate::distance::Metric;
use crate::error::{ClusterError, Result};
use crate::executor::{panic_message, AdaptiveExecutor, ExecutorConfig};
use crate::node::{NodeArena, NodeId, SearchNode};
use crate::problem::Problem;
use crate::solution::{BoundUpdate, SearchReport, SearchStatus, Solution, TaskFault};
use crate::warm_start::KMeans;

/// Tuning knobs for one search.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SearchConfig {
    /// Cap on nodes constructed. `None` searches to completion.
    pub node_budget: Option<u64>,
    /// Children deeper than this may be offloaded to workers. Defaults to `k`.
    pub parallel_depth: Option<usize>,
    /// Known upper bound on the optimum. Defaults to `+inf`.
    pub initial_bound: Option<f64>,
}

impl SearchConfig {
    #[must_use]
    pub fn with_node_budget(mut self, budget: u64) -> Self {
        self.node_budget = Some(budget);
        self
    }

    #[must_use]
    pub fn with_parallel_depth(mut self, depth: usize) -> Self {
        self.parallel_depth = Some(depth);
        self
    }

    #[must_use]
    pub fn with_initial_bound(mut self, bound: f64) -> Self {
        self.initial_bound = Some(bound);
        self
    }
}

/// What currently realises the bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Incumbent {
    /// The supplied warm-start assignment.
    WarmStart,
    /// A complete assignment found by the search.
    Leaf,
}

#[derive(Debug)]
struct Incumbency {
    bound: f64,
    incumbent: Option<Incumbent>,
    /// Cluster index per document of the `Leaf` incumbent.
    labels: Vec<usize>,
    history: Vec<BoundUpdate>,
}

struct Shared<M> {
    problem: Problem<M>,
    arena: NodeArena,
    executor: Arc<AdaptiveExecutor>,
    node_budget: Option<u64>,
    parallel_depth: usize,
    incumbency: Mutex<Incumbency>,
    budget_hit: AtomicBool,
    faults: Mutex<Vec<TaskFault>>,
    finished: Mutex<bool>,
    finished_cv: Condvar,
}

impl<M: Metric + 'static> Shared<M> {
    /// Task body for one node; failures fathom the node and are recorded.
    fn run_guarded(self: &Arc<Self>, node: SearchNode) {
        let id = node.id();
        let position = node.position();
        let message = match catch_unwind(AssertUnwindSafe(|| self.run_node(node))) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(payload) => panic_message(&*payload),
        };
        error!(node = id.0, position, "node task failed: {message}");
        self.faults.lock().push(TaskFault::new(id, position, message));
        self.finish(id);
    }

    fn run_node(self: &Arc<Self>, node: SearchNode) -> Result<()> {
        if let Some(budget) = self.node_budget {
            if self.arena.allocated() > budget {
                if !self.budget_hit.swap(true, Ordering::AcqRel) {
                    warn!(budget, "node budget exhausted; result is not proven optimal");
                }
                self.finish(node.id());
                return Ok(());
            }
        }

        if node.total_cost() > self.bound() {
            self.finish(node.id());
            return Ok(());
        }

        if node.is_complete(&self.problem) {
            self.offer(&node);
            self.finish(node.id());
            return Ok(());
        }

        let children = node.expand(&self.problem, &self.arena)?;
        if children.is_empty() {
            self.finish(node.id());
            return Ok(());
        }
        drop(node);

        for child in children {
            self.dispatch(child);
        }
        Ok(())
    }

    fn dispatch(self: &Arc<Self>, child: SearchNode) {
        if child.position() > self.parallel_depth && self.executor.available_capacity() > 0 {
            let shared = Arc::clone(self);
            match self.executor.try_dispatch(move || shared.run_guarded(child)) {
                Ok(()) => {}
                Err(task) => {
                    self.executor.record_inline();
                    task();
                }
            }
            return;
        }
        self.run_guarded(child);
    }

    /// Accept `leaf` as incumbent if it strictly beats the bound.
    fn offer(&self, leaf: &SearchNode) {
        let cost = leaf.total_cost();
        if cost >= self.bound() {
            return;
        }
        let mut labels = vec![0; self.problem.len()];
        for (position, cluster) in self.arena.path(leaf.id()) {
            labels[position] = cluster;
        }

        let mut state = self.incumbency.lock();
        if cost < state.bound {
            let nodes = self.arena.allocated();
            state.bound = cost;
            state.incumbent = Some(Incumbent::Leaf);
            state.labels = labels;
            state.history.push(BoundUpdate {
                objective: cost,
                nodes,
            });
            debug!(objective = cost, nodes, "bound improved");
        }
    }

    fn bound(&self) -> f64 {
        self.incumbency.lock().bound
    }

    fn finish(&self, id: NodeId) {
        if self.arena.mark_done(id) {
            let mut finished = self.finished.lock();
            *finished = true;
            self.finished_cv.notify_all();
        }
    }
}

/// Builder for [`SearchTree`].
pub struct SearchTreeBuilder<M> {
    documents: Vec<Vec<f64>>,
    k: usize,
    metric: M,
    config: SearchConfig,
    warm_start: Option<Vec<usize>>,
    executor: Option<Arc<AdaptiveExecutor>>,
    executor_config: ExecutorConfig,
}

impl<M: Metric + 'static> SearchTreeBuilder<M> {
    #[must_use]
    pub fn config(mut self, config: SearchConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn node_budget(mut self, budget: u64) -> Self {
        self.config.node_budget = Some(budget);
        self
    }

    #[must_use]
    pub fn parallel_depth(mut self, depth: usize) -> Self {
        self.config.parallel_depth = Some(depth);
        self
    }

    #[must_use]
    pub fn initial_bound(mut self, bound: f64) -> Self {
        self.config.initial_bound = Some(bound);
        self
    }

    /// Feasible assignment (any labelling) used to seed the bound and bias
    /// the leftmost path.
    ///
    /// An assignment with fewer than `min(k, n)` clusters is completed by
    /// splitting the farthest documents off into new clusters. The metric is
    /// called while costing it in [`Self::build`]; a panic there is returned
    /// as [`ClusterError::InvalidParameter`].
    #[must_use]
    pub fn warm_start(mut self, assignment: Vec<usize>) -> Self {
        self.warm_start = Some(assignment);
        self
    }

    /// Use an existing executor. Its lifecycle stays with the caller.
    #[must_use]
    pub fn executor(mut self, executor: Arc<AdaptiveExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Size of the executor the tree creates (ignored with [`Self::executor`]).
    #[must_use]
    pub fn workers(mut self, max_workers: usize) -> Self {
        self.executor_config.max_workers = max_workers;
        self
    }

    #[must_use]
    pub fn executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor_config = config;
        self
    }

    /// Validate inputs and build the tree.
    pub fn build(self) -> Result<SearchTree<M>> {
        if let Some(bound) = self.config.initial_bound {
            if bound.is_nan() {
                return Err(ClusterError::InvalidParameter(
                    "initial bound is NaN".to_string(),
                ));
            }
        }
        let problem = Problem::new(self.documents, self.k, self.metric, self.warm_start)?;

        let mut bound = self.config.initial_bound.unwrap_or(f64::INFINITY);
        let mut incumbent = None;
        if let Some(ws) = problem.warm_start() {
            if ws.cost <= bound {
                bound = ws.cost;
                incumbent = Some(Incumbent::WarmStart);
            }
        }

        let owns_executor = self.executor.is_none();
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(AdaptiveExecutor::new(self.executor_config)));
        let parallel_depth = self.config.parallel_depth.unwrap_or(problem.k());

        let shared = Shared {
            problem,
            arena: NodeArena::new(),
            executor,
            node_budget: self.config.node_budget,
            parallel_depth,
            incumbency: Mutex::new(Incumbency {
                bound,
                incumbent,
                labels: Vec::new(),
                history: vec![BoundUpdate {
                    objective: bound,
                    nodes: 0,
                }],
            }),
            budget_hit: AtomicBool::new(false),
            faults: Mutex::new(Vec::new()),
            finished: Mutex::new(false),
            finished_cv: Condvar::new(),
        };

        Ok(SearchTree {
            shared: Arc::new(shared),
            owns_executor,
            started: AtomicBool::new(false),
        })
    }
}

/// Branch-and-bound search for an optimal k-partition.
///
/// # Example
///
/// ```rust
/// use exactk::{SearchTree, SquaredEuclidean};
///
/// # fn main() -> Result<(), exactk::ClusterError> {
/// let points = vec![vec![1.0], vec![2.0], vec![3.0], vec![10.0], vec![11.0]];
/// let tree = SearchTree::builder(points, 2, SquaredEuclidean)
///     .workers(2)
///     .build()?;
/// let report = tree.run()?;
/// assert!(report.proved_optimal());
///
/// let solution = tree.solution()?;
/// assert_eq!(solution.labels, vec![1, 1, 1, 2, 2]);
/// assert!((solution.objective - 2.5).abs() < 1e-9);
/// # Ok(())
/// # }
/// ```
pub struct SearchTree<M> {
    shared: Arc<Shared<M>>,
    owns_executor: bool,
    started: AtomicBool,
}

impl<M: Metric + 'static> SearchTree<M> {
    /// Start building a search over `documents` for `k` clusters.
    pub fn builder(documents: Vec<Vec<f64>>, k: usize, metric: M) -> SearchTreeBuilder<M> {
        SearchTreeBuilder {
            documents,
            k,
            metric,
            config: SearchConfig::default(),
            warm_start: None,
            executor: None,
            executor_config: ExecutorConfig::default(),
        }
    }

    /// Run the search to completion or budget exhaustion.
    ///
    /// Blocks until the root is done. A tree runs once; a second call fails
    /// with [`ClusterError::InvalidState`]. A run refused with
    /// [`ClusterError::ExecutorClosed`] did not start and does not count.
    pub fn run(&self) -> Result<SearchReport> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ClusterError::InvalidState(
                "search tree has already run".to_string(),
            ));
        }
        let shared = &self.shared;
        if shared.executor.is_closed() {
            self.started.store(false, Ordering::Release);
            return Err(ClusterError::ExecutorClosed);
        }
        let span = info_span!("search", n = shared.problem.len(), k = shared.problem.k());
        let _enter = span.enter();
        info!(
            workers = shared.executor.max_workers(),
            parallel_depth = shared.parallel_depth,
            bound = shared.bound(),
            "starting search"
        );

        let root = SearchNode::root(&shared.problem, &shared.arena)?;
        let root_id = root.id();
        let task_shared = Arc::clone(shared);
        if let Err(e) = shared
            .executor
            .execute(move || task_shared.run_guarded(root))
        {
            // closed between the check and the submit
            shared.arena.mark_done(root_id);
            self.started.store(false, Ordering::Release);
            return Err(e);
        }

        {
            let mut finished = shared.finished.lock();
            while !*finished {
                shared.finished_cv.wait(&mut finished);
            }
        }
        if self.owns_executor {
            shared.executor.shutdown();
        }

        let report = self.report();
        info!(
            status = ?report.status,
            objective = ?report.objective,
            nodes = report.nodes_constructed,
            faults = report.faults.len(),
            "search finished"
        );
        Ok(report)
    }

    /// True once the root has been marked done.
    pub fn is_finished(&self) -> bool {
        *self.shared.finished.lock()
    }

    /// Current bound.
    pub fn bound(&self) -> f64 {
        self.shared.bound()
    }

    /// Current incumbent.
    pub fn incumbent(&self) -> Option<Incumbent> {
        self.shared.incumbency.lock().incumbent
    }

    /// Nodes constructed so far.
    pub fn nodes_constructed(&self) -> u64 {
        self.shared.arena.allocated()
    }

    fn status(&self) -> SearchStatus {
        if !self.shared.faults.lock().is_empty() {
            SearchStatus::Faulted
        } else if self.shared.budget_hit.load(Ordering::Acquire) {
            SearchStatus::BudgetExhausted
        } else {
            SearchStatus::Optimal
        }
    }

    /// Summary of the run so far.
    pub fn report(&self) -> SearchReport {
        let (objective, bound_history) = {
            let state = self.shared.incumbency.lock();
            (
                state.incumbent.map(|_| state.bound),
                state.history.clone(),
            )
        };
        SearchReport {
            status: self.status(),
            objective,
            nodes_constructed: self.shared.arena.allocated(),
            bound_history,
            faults: self.shared.faults.lock().clone(),
            executor: self.shared.executor.stats(),
        }
    }

    /// The incumbent as a per-document labelling in `1..=k`.
    ///
    /// Fails with [`ClusterError::NoSolutionFound`] before the run has
    /// finished, or when no complete assignment beat the initial bound.
    pub fn solution(&self) -> Result<Solution> {
        if !self.is_finished() {
            return Err(ClusterError::NoSolutionFound);
        }
        let (incumbent, objective, leaf_labels) = {
            let state = self.shared.incumbency.lock();
            (state.incumbent, state.bound, state.labels.clone())
        };
        let labels = match incumbent {
            None => return Err(ClusterError::NoSolutionFound),
            Some(Incumbent::WarmStart) => self
                .shared
                .problem
                .warm_start()
                .map(|ws| ws.labels.iter().map(|&l| l + 1).collect::<Vec<usize>>())
                .ok_or(ClusterError::NoSolutionFound)?,
            Some(Incumbent::Leaf) => leaf_labels.into_iter().map(|l| l + 1).collect(),
        };
        Ok(Solution {
            labels,
            objective,
            status: self.status(),
        })
    }
}

/// Solve with a k-means warm start and a default executor.
///
/// Convenience for the common case; use [`SearchTree::builder`] for budgets,
/// custom executors or an externally computed warm start.
pub fn optimal_partition<M: Metric + 'static>(
    documents: Vec<Vec<f64>>,
    k: usize,
    metric: M,
) -> Result<Solution> {
    if k == 0 {
        return Err(ClusterError::InvalidParameter(
            "k must be greater than 0".to_string(),
        ));
    }
    if documents.is_empty() {
        return Err(ClusterError::EmptyInput);
    }
    let seeds = k.min(documents.len());
    let warm = KMeans::new(seeds)?.with_seed(0).fit(&documents)?;
    let tree = SearchTree::builder(documents, k, metric)
        .warm_start(warm)
        .build()?;
    tree.run()?;
    tree.solution()
}
