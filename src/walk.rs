//! Generic iterative depth-first traversal with cycle detection.
//!
//! The walker is direction-agnostic: the caller supplies the "next nodes"
//! function, so the same machinery backs forward walks over dependents
//! (dirty-set discovery) and walks over the in-flight read graph
//! (calculation-cycle extraction).

use std::hash::Hash;

use ahash::AHashMap;

/// What to do when the walk re-encounters a node that is still on the
/// traversal stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnCycleAction {
    /// Abort the walk immediately; the caller inspects the preserved stack
    /// to extract the cycle.
    Cancel,
    /// Treat the back-edge as absent and continue. Used when detection is
    /// advisory.
    Resume,
}

/// One entry of the traversal stack: a node and the node it was reached from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkStep<N> {
    /// The node to visit.
    pub node: N,
    /// The node this step was collected from, or `None` for a start node.
    pub from: Option<N>,
}

/// Outcome of a depth-first walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkResult {
    /// Every reachable node was visited to completion.
    Completed,
    /// A cycle handler answered [`OnCycleAction::Cancel`]; the stack is left
    /// intact for inspection.
    Canceled,
}

#[derive(Debug)]
struct VisitInfo {
    visited_at: usize,
    topological: bool,
}

/// Iterative depth-first walker over an arbitrary node type.
///
/// `on_topological(node)` fires exactly once per node, only after all of the
/// node's next-nodes have finished, which yields a valid topological order on
/// acyclic subgraphs.
#[derive(Debug)]
pub struct DepthWalk<N> {
    visited: AHashMap<N, VisitInfo>,
    to_visit: Vec<WalkStep<N>>,
    collected: Vec<N>,
}

impl<N: Copy + Eq + Hash> Default for DepthWalk<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: Copy + Eq + Hash> DepthWalk<N> {
    /// Create a walker with empty state.
    pub fn new() -> Self {
        Self {
            visited: AHashMap::new(),
            to_visit: Vec::new(),
            collected: Vec::new(),
        }
    }

    /// The traversal stack; meaningful after a canceled walk, where it holds
    /// the path that closed the cycle (see [`cycle_info`]).
    pub fn stack(&self) -> &[WalkStep<N>] {
        &self.to_visit
    }

    /// Walk depth-first from `start`, collecting next-nodes through `next`.
    ///
    /// Nodes are visited to completion at most once even when pushed from
    /// several predecessors.
    pub fn run(
        &mut self,
        start: impl IntoIterator<Item = N>,
        mut next: impl FnMut(N, &mut Vec<N>),
        mut on_topological: impl FnMut(N),
        mut on_cycle: impl FnMut(N, &[WalkStep<N>]) -> OnCycleAction,
    ) -> WalkResult {
        self.to_visit
            .extend(start.into_iter().map(|node| WalkStep { node, from: None }));

        loop {
            let depth = self.to_visit.len();
            if depth == 0 {
                return WalkResult::Completed;
            }
            let node = self.to_visit[depth - 1].node;

            match self.visited.get_mut(&node) {
                Some(info) if info.topological => {
                    self.to_visit.pop();
                }
                Some(info) => {
                    if info.visited_at < depth {
                        // Re-encountered while a shallower stack entry is
                        // still pending: a back-edge.
                        if on_cycle(node, &self.to_visit) != OnCycleAction::Resume {
                            return WalkResult::Canceled;
                        }
                        self.to_visit.pop();
                    } else {
                        // Stack unwinding reached the node's own entry; all
                        // next-nodes are finished.
                        info.topological = true;
                        on_topological(node);
                        self.to_visit.pop();
                    }
                }
                None => {
                    self.collected.clear();
                    next(node, &mut self.collected);
                    let leaf = self.collected.is_empty();
                    self.visited.insert(
                        node,
                        VisitInfo {
                            visited_at: depth,
                            topological: leaf,
                        },
                    );
                    if leaf {
                        // No outgoing edges: the node is already at its
                        // topological position.
                        on_topological(node);
                        self.to_visit.pop();
                    } else {
                        let from = Some(node);
                        for &collected in &self.collected {
                            self.to_visit.push(WalkStep {
                                node: collected,
                                from,
                            });
                        }
                    }
                }
            }
        }
    }
}

/// Extract the minimal cycle path from the stack of a canceled walk.
///
/// Walks the stack backward, collapsing consecutive entries that share the
/// same predecessor, to find the shortest path from the revisited node back
/// to itself. Returns the ordered node list with `first == last`, or an
/// empty vector if the stack does not close a cycle.
pub fn cycle_info<N: Copy + PartialEq>(stack: &[WalkStep<N>]) -> Vec<N> {
    let len = stack.len();
    if len == 0 {
        return Vec::new();
    }

    let source = stack[len - 1].node;
    let mut cycle = vec![source];

    let mut current = len as isize - 1;
    let mut cursor = current;

    while current >= 0 && stack[current as usize].from != Some(source) {
        // Going backward in steps, skipping the entries with an identical
        // predecessor.
        while current >= 0 && stack[current as usize].from == stack[cursor as usize].from {
            current -= 1;
        }

        if current >= 0 {
            cycle.push(stack[current as usize].node);
            cursor = current;
        }
    }

    if current < 0 {
        return Vec::new();
    }

    cycle.push(source);
    cycle.reverse();
    cycle
}
