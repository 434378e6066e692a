//! Iterative graph walks shared by re-export resolution and dependency closures.
use std::collections::HashSet;
use std::hash::Hash;
use std::ops::ControlFlow;

/// Default upper bound of nodes a single walk may expand.
pub const DEFAULT_NODE_BUDGET: usize = 0x10000;

/// An explicit stack of pending nodes with a visited set.
///
/// A node is queued at most once, and at most `budget` nodes are ever popped.
#[derive(Debug)]
pub struct Worklist<N> {
    stack: Vec<N>,
    visited: HashSet<N>,
    budget: usize,
}

impl<N: Clone + Eq + Hash> Worklist<N> {
    pub fn new<I: IntoIterator<Item = N>>(roots: I) -> Self {
        let mut worklist = Worklist {
            stack: Vec::new(),
            visited: HashSet::new(),
            budget: DEFAULT_NODE_BUDGET,
        };

        for root in roots {
            worklist.push(root);
        }

        worklist
    }

    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = budget;
        self
    }

    /// Queue `node` unless it was seen before.
    pub fn push(&mut self, node: N) -> bool {
        if self.visited.contains(&node) {
            false
        } else {
            self.visited.insert(node.clone());
            self.stack.push(node);
            true
        }
    }

    pub fn pop(&mut self) -> Option<N> {
        if self.budget == 0 {
            if !self.stack.is_empty() {
                warn!("graph walk stopped with {} pending nodes", self.stack.len());

                self.stack.clear();
            }

            return None;
        }

        let node = self.stack.pop()?;

        self.budget -= 1;

        Some(node)
    }

    pub fn is_visited(&self, node: &N) -> bool {
        self.visited.contains(node)
    }

    pub fn seen(&self) -> usize {
        self.visited.len()
    }
}

/// Walk from `roots` until `visit` breaks with a value.
///
/// `visit` queues further nodes through the worklist it is given.
pub fn search<N, T, I, F>(roots: I, mut visit: F) -> Option<T>
where
    N: Clone + Eq + Hash,
    I: IntoIterator<Item = N>,
    F: FnMut(N, &mut Worklist<N>) -> ControlFlow<T>,
{
    let mut worklist = Worklist::new(roots);

    while let Some(node) = worklist.pop() {
        if let ControlFlow::Break(found) = visit(node, &mut worklist) {
            return Some(found);
        }
    }

    None
}

/// Every node reachable from `roots`, the roots excluded, in discovery order.
pub fn closure<N, I, S, F>(roots: I, mut successors: F) -> Vec<N>
where
    N: Clone + Eq + Hash,
    I: IntoIterator<Item = N>,
    S: IntoIterator<Item = N>,
    F: FnMut(&N) -> S,
{
    let mut worklist = Worklist::new(roots);
    let mut reached = Vec::new();

    while let Some(node) = worklist.pop() {
        for next in successors(&node) {
            if worklist.push(next.clone()) {
                reached.push(next);
            }
        }
    }

    reached
}
