//! Control-flow graph analyses over the blocks of one function.
//!
//! Vertices are block indices in program order, block 0 is the entry.

use crate::error::{Error, Location, Result};
use crate::ir::Function;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeSet;

//
// Public Interface
//

#[derive(Clone, Debug)]
pub struct Cfg {
    labels: Vec<String>,
    successors: Vec<Vec<usize>>,
    predecessors: Vec<Vec<usize>>,
}

/// Immediate dominator tree of the blocks reachable from the entry.
#[derive(Clone, Debug)]
pub struct Dominators {
    idom: Vec<Option<usize>>,
    rpo_index: Vec<usize>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Loop {
    header: usize,
    nodes: BTreeSet<usize>,
    latches: BTreeSet<usize>,
}

impl Cfg {
    pub fn new(function: &Function) -> Result<Cfg> {
        let labels: Vec<String> = function.blocks.iter().map(|b| b.label.clone()).collect();
        let index: FxHashMap<&str, usize> = labels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.as_str(), i))
            .collect();

        let mut edges = Vec::new();
        for (from, block) in function.blocks.iter().enumerate() {
            for target in block.terminator.successors() {
                let to = index.get(target).copied().ok_or_else(|| {
                    Error::ssa(
                        format!("branch to undefined block %{}", target),
                        Location {
                            function: Some(function.name.clone()),
                            block: Some(block.label.clone()),
                            index: None,
                            line: Some(block.terminator_line),
                        },
                    )
                })?;
                edges.push((from, to));
            }
        }
        Ok(Cfg::from_edges(labels, &edges))
    }

    /// Builds a graph from explicit edges, duplicate edges are merged.
    pub fn from_edges(labels: Vec<String>, edges: &[(usize, usize)]) -> Cfg {
        let mut successors = vec![Vec::new(); labels.len()];
        let mut predecessors = vec![Vec::new(); labels.len()];
        for &(from, to) in edges {
            if !successors[from].contains(&to) {
                successors[from].push(to);
                predecessors[to].push(from);
            }
        }
        Cfg {
            labels,
            successors,
            predecessors,
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn label(&self, node: usize) -> &str {
        &self.labels[node]
    }

    pub fn successors(&self, node: usize) -> &[usize] {
        &self.successors[node]
    }

    pub fn predecessors(&self, node: usize) -> &[usize] {
        &self.predecessors[node]
    }

    pub fn reachable(&self) -> FxHashSet<usize> {
        self.post_order().into_iter().collect()
    }

    // Compute the post order of all vertices reachable from the entry
    pub fn post_order(&self) -> Vec<usize> {
        let mut visited: FxHashSet<usize> = FxHashSet::default();
        let mut order: Vec<usize> = Vec::new();
        if self.is_empty() {
            return order;
        }

        // explicit stack of (node, next successor) to survive deep graphs
        let mut stack: Vec<(usize, usize)> = vec![(0, 0)];
        visited.insert(0);
        while let Some((node, next)) = stack.pop() {
            if let Some(&successor) = self.successors[node].get(next) {
                stack.push((node, next + 1));
                if visited.insert(successor) {
                    stack.push((successor, 0));
                }
            } else {
                order.push(node);
            }
        }
        order
    }

    pub fn reverse_post_order(&self) -> Vec<usize> {
        let mut order = self.post_order();
        order.reverse();
        order
    }

    /// Computes immediate dominators with the iterative algorithm of
    /// Cooper, Harvey and Kennedy.
    pub fn dominators(&self) -> Dominators {
        let rpo = self.reverse_post_order();
        let mut rpo_index = vec![usize::MAX; self.len()];
        for (i, &node) in rpo.iter().enumerate() {
            rpo_index[node] = i;
        }

        let mut idom: Vec<Option<usize>> = vec![None; self.len()];
        if let Some(&entry) = rpo.first() {
            idom[entry] = Some(entry);
        }

        let intersect = |idom: &[Option<usize>], mut a: usize, mut b: usize| -> usize {
            while a != b {
                while rpo_index[a] > rpo_index[b] {
                    a = idom[a].unwrap_or(0);
                }
                while rpo_index[b] > rpo_index[a] {
                    b = idom[b].unwrap_or(0);
                }
            }
            a
        };

        let mut changed = true;
        while changed {
            changed = false;
            for &node in rpo.iter().skip(1) {
                let mut new_idom: Option<usize> = None;
                for &predecessor in &self.predecessors[node] {
                    if idom[predecessor].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => predecessor,
                        Some(current) => intersect(&idom, predecessor, current),
                    });
                }
                if new_idom.is_some() && idom[node] != new_idom {
                    idom[node] = new_idom;
                    changed = true;
                }
            }
        }

        Dominators { idom, rpo_index }
    }

    /// Computes the set of back edges as `(latch, header)` pairs
    ///
    /// Back edges are edges whose heads dominate their tails.
    pub fn back_edges(&self, dominators: &Dominators) -> Vec<(usize, usize)> {
        let mut back_edges = Vec::new();
        for node in self.reverse_post_order() {
            for &successor in &self.successors[node] {
                if dominators.dominates(successor, node) {
                    back_edges.push((node, successor));
                }
            }
        }
        back_edges.sort_unstable();
        back_edges
    }

    /// Reducible iff the graph without back edges is acyclic.
    pub fn is_reducible(&self, dominators: &Dominators) -> bool {
        let back_edges: FxHashSet<(usize, usize)> =
            self.back_edges(dominators).into_iter().collect();
        let mut permanent_marks: FxHashSet<usize> = FxHashSet::default();
        let mut temporary_marks: FxHashSet<usize> = FxHashSet::default();

        fn dfs_is_acyclic(
            cfg: &Cfg,
            node: usize,
            back_edges: &FxHashSet<(usize, usize)>,
            permanent_marks: &mut FxHashSet<usize>,
            temporary_marks: &mut FxHashSet<usize>,
        ) -> bool {
            if permanent_marks.contains(&node) {
                return true;
            }
            if temporary_marks.contains(&node) {
                return false;
            }

            temporary_marks.insert(node);
            let successors_are_acyclic = cfg.successors[node]
                .iter()
                .filter(|&&successor| !back_edges.contains(&(node, successor)))
                .all(|&successor| {
                    dfs_is_acyclic(cfg, successor, back_edges, permanent_marks, temporary_marks)
                });
            if !successors_are_acyclic {
                return false;
            }
            temporary_marks.remove(&node);

            permanent_marks.insert(node);
            true
        }

        self.is_empty()
            || dfs_is_acyclic(
                self,
                0,
                &back_edges,
                &mut permanent_marks,
                &mut temporary_marks,
            )
    }

    /// Computes the natural loops, one per header, ordered by header.
    pub fn loops(&self, dominators: &Dominators) -> Vec<Loop> {
        let mut loops: Vec<Loop> = Vec::new();

        for (latch, header) in self.back_edges(dominators) {
            let position = match loops.iter().position(|l| l.header == header) {
                Some(position) => position,
                None => {
                    loops.push(Loop {
                        header,
                        nodes: BTreeSet::new(),
                        latches: BTreeSet::new(),
                    });
                    loops.len() - 1
                }
            };
            let l = &mut loops[position];
            l.latches.insert(latch);
            l.nodes.insert(header);

            let mut queue: Vec<usize> = Vec::new();
            if l.nodes.insert(latch) {
                queue.push(latch);
            }
            while let Some(node) = queue.pop() {
                for &predecessor in &self.predecessors[node] {
                    if dominators.is_reachable(predecessor) && l.nodes.insert(predecessor) {
                        queue.push(predecessor);
                    }
                }
            }
        }

        loops.sort_by_key(|l| l.header);
        loops
    }
}

impl Dominators {
    pub fn is_reachable(&self, node: usize) -> bool {
        self.idom[node].is_some()
    }

    pub fn immediate_dominator(&self, node: usize) -> Option<usize> {
        match self.idom[node] {
            Some(parent) if parent != node => Some(parent),
            _ => None,
        }
    }

    /// Returns `true` if every path from the entry to `b` passes `a`.
    pub fn dominates(&self, a: usize, b: usize) -> bool {
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        let mut current = b;
        loop {
            if current == a {
                return true;
            }
            match self.immediate_dominator(current) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    pub fn nearest_common_dominator(&self, mut a: usize, mut b: usize) -> Option<usize> {
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return None;
        }
        while a != b {
            if self.rpo_index[a] > self.rpo_index[b] {
                a = self.immediate_dominator(a)?;
            } else {
                b = self.immediate_dominator(b)?;
            }
        }
        Some(a)
    }
}

impl Loop {
    /// The loop header node
    pub fn header(&self) -> usize {
        self.header
    }

    pub fn nodes(&self) -> &BTreeSet<usize> {
        &self.nodes
    }

    /// Sources of the back edges into the header.
    pub fn latches(&self) -> &BTreeSet<usize> {
        &self.latches
    }

    pub fn contains(&self, node: usize) -> bool {
        self.nodes.contains(&node)
    }

    /// Returns `true` if this loop is nesting another loop.
    pub fn is_nesting(&self, other: &Self) -> bool {
        self.header != other.header && self.nodes.contains(&other.header)
    }

    /// Edges leaving the loop as `(inside, outside)` pairs.
    pub fn exits(&self, cfg: &Cfg) -> Vec<(usize, usize)> {
        self.nodes
            .iter()
            .flat_map(|&node| {
                cfg.successors(node)
                    .iter()
                    .filter(|s| !self.nodes.contains(s))
                    .map(move |&s| (node, s))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(n: usize, edges: &[(usize, usize)]) -> Cfg {
        Cfg::from_edges((0..n).map(|i| format!("b{}", i)).collect(), edges)
    }

    #[test]
    fn diamond_dominators() {
        // 0 -> 1 -> 3, 0 -> 2 -> 3
        let cfg = graph(4, &[(0, 1), (0, 2), (1, 3), (2, 3)]);
        let doms = cfg.dominators();
        assert_eq!(doms.immediate_dominator(3), Some(0));
        assert!(doms.dominates(0, 3));
        assert!(!doms.dominates(1, 3));
        assert_eq!(doms.nearest_common_dominator(1, 2), Some(0));
        assert!(cfg.back_edges(&doms).is_empty());
        assert!(cfg.is_reducible(&doms));
    }

    #[test]
    fn natural_loop_with_exit() {
        // 0 -> 1 <-> 2, 1 -> 3
        let cfg = graph(4, &[(0, 1), (1, 2), (2, 1), (1, 3)]);
        let doms = cfg.dominators();
        assert_eq!(cfg.back_edges(&doms), vec![(2, 1)]);
        let loops = cfg.loops(&doms);
        assert_eq!(loops.len(), 1);
        assert_eq!(loops[0].header(), 1);
        assert_eq!(loops[0].nodes().iter().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(loops[0].exits(&cfg), vec![(1, 3)]);
    }

    #[test]
    fn two_entry_cycle_is_irreducible() {
        // Loop 1-2 with two loop entries 1 & 2 -> irreducible
        let cfg = graph(3, &[(0, 1), (0, 2), (1, 2), (2, 1)]);
        let doms = cfg.dominators();
        assert!(cfg.back_edges(&doms).is_empty());
        assert!(!cfg.is_reducible(&doms));
    }

    #[test]
    fn unreachable_blocks_have_no_dominator() {
        let cfg = graph(3, &[(0, 1)]);
        let doms = cfg.dominators();
        assert!(!doms.is_reachable(2));
        assert!(!cfg.reachable().contains(&2));
        assert_eq!(cfg.post_order(), vec![1, 0]);
    }
}
