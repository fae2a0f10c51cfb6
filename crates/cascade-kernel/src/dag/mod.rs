//! Dependency graph of tables.
//!
//! Edges point from upstream to downstream. The graph is kept acyclic at all
//! times: an edge that would close a cycle is rolled back and rejected.

use crate::types::TableId;
use parking_lot::RwLock;
use petgraph::algo::has_path_connecting;
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use std::collections::{BTreeSet, HashSet, VecDeque};
use thiserror::Error;

/// Structural graph errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Edge would create a cycle
    #[error("cycle detected")]
    CycleDetected,
    /// Node is not part of the graph
    #[error("node not found")]
    NodeNotFound,
    /// Edge from a node to itself
    #[error("self loop")]
    SelfLoop,
}

#[derive(Debug, Default)]
pub struct Dag {
    inner: RwLock<DiGraphMap<TableId, ()>>,
    suspended: RwLock<BTreeSet<TableId>>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, node: TableId) {
        self.inner.write().add_node(node);
    }

    pub fn contains(&self, node: TableId) -> bool {
        self.inner.read().contains_node(node)
    }

    /// Add `upstream -> downstream`, rejecting self loops and cycles
    pub fn add_edge(&self, upstream: TableId, downstream: TableId) -> Result<(), GraphError> {
        if upstream == downstream {
            return Err(GraphError::SelfLoop);
        }

        let mut g = self.inner.write();
        if !g.contains_node(upstream) || !g.contains_node(downstream) {
            return Err(GraphError::NodeNotFound);
        }
        if g.contains_edge(upstream, downstream) {
            return Ok(());
        }
        // A path downstream ~> upstream means the new edge closes a loop.
        if has_path_connecting(&*g, downstream, upstream, None) {
            return Err(GraphError::CycleDetected);
        }
        g.add_edge(upstream, downstream, ());

        if petgraph::algo::is_cyclic_directed(&*g) {
            g.remove_edge(upstream, downstream);
            return Err(GraphError::CycleDetected);
        }

        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.read().edge_count()
    }

    pub fn suspend(&self, node: TableId) -> Result<(), GraphError> {
        if !self.contains(node) {
            return Err(GraphError::NodeNotFound);
        }
        self.suspended.write().insert(node);
        Ok(())
    }

    /// Returns whether the node was suspended
    pub fn resume(&self, node: TableId) -> Result<bool, GraphError> {
        if !self.contains(node) {
            return Err(GraphError::NodeNotFound);
        }
        Ok(self.suspended.write().remove(&node))
    }

    pub fn is_suspended(&self, node: TableId) -> bool {
        self.suspended.read().contains(&node)
    }

    /// Direct upstreams, in id order
    pub fn upstreams(&self, node: TableId) -> Vec<TableId> {
        self.neighbors(node, Direction::Incoming)
    }

    /// Direct downstreams, in id order
    pub fn downstreams(&self, node: TableId) -> Vec<TableId> {
        self.neighbors(node, Direction::Outgoing)
    }

    fn neighbors(&self, node: TableId, dir: Direction) -> Vec<TableId> {
        let g = self.inner.read();
        if !g.contains_node(node) {
            return Vec::new();
        }
        let mut out: Vec<TableId> = g.neighbors_directed(node, dir).collect();
        out.sort_unstable();
        out
    }

    /// Every node reachable from `roots` (roots excluded unless reachable)
    pub fn descendants(&self, roots: &[TableId]) -> HashSet<TableId> {
        let g = self.inner.read();
        let mut seen = HashSet::new();
        let mut queue: VecDeque<TableId> = roots.iter().copied().collect();
        while let Some(node) = queue.pop_front() {
            if !g.contains_node(node) {
                continue;
            }
            for next in g.neighbors_directed(node, Direction::Outgoing) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }

    /// Topological order of the whole graph; ties broken by id for stable output
    pub fn topological_sort(&self) -> Result<Vec<TableId>, GraphError> {
        let g = self.inner.read();
        // Stable Kahn walk so repeated calls (and logs) agree.
        let mut indegree: std::collections::BTreeMap<TableId, usize> = g
            .nodes()
            .map(|n| (n, g.neighbors_directed(n, Direction::Incoming).count()))
            .collect();
        let mut ready: BTreeSet<TableId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut order = Vec::with_capacity(indegree.len());
        while let Some(node) = ready.pop_first() {
            order.push(node);
            for next in g.neighbors_directed(node, Direction::Outgoing) {
                if let Some(d) = indegree.get_mut(&next) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(next);
                    }
                }
            }
        }
        if order.len() != g.node_count() {
            return Err(GraphError::CycleDetected);
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(dag: &Dag, n: usize) -> Vec<TableId> {
        (0..n)
            .map(|_| {
                let id = TableId::next();
                dag.add_node(id);
                id
            })
            .collect()
    }

    #[test]
    fn rejects_cycle_and_keeps_graph_intact() {
        let dag = Dag::new();
        let t = nodes(&dag, 3);
        dag.add_edge(t[0], t[1]).unwrap();
        dag.add_edge(t[1], t[2]).unwrap();

        assert_eq!(dag.add_edge(t[2], t[0]), Err(GraphError::CycleDetected));
        assert_eq!(dag.edge_count(), 2);
        assert_eq!(dag.topological_sort().unwrap(), t);
    }

    #[test]
    fn rejects_self_loop_and_unknown_nodes() {
        let dag = Dag::new();
        let t = nodes(&dag, 1);
        assert_eq!(dag.add_edge(t[0], t[0]), Err(GraphError::SelfLoop));
        assert_eq!(
            dag.add_edge(t[0], TableId::next()),
            Err(GraphError::NodeNotFound)
        );
    }

    #[test]
    fn duplicate_edge_is_idempotent() {
        let dag = Dag::new();
        let t = nodes(&dag, 2);
        dag.add_edge(t[0], t[1]).unwrap();
        dag.add_edge(t[0], t[1]).unwrap();
        assert_eq!(dag.edge_count(), 1);
    }

    #[test]
    fn descendants_follow_all_paths() {
        let dag = Dag::new();
        let t = nodes(&dag, 5);
        dag.add_edge(t[0], t[1]).unwrap();
        dag.add_edge(t[0], t[2]).unwrap();
        dag.add_edge(t[2], t[3]).unwrap();

        let d = dag.descendants(&[t[0]]);
        assert_eq!(d.len(), 3);
        assert!(!d.contains(&t[4]));
    }

    #[test]
    fn suspend_and_resume() {
        let dag = Dag::new();
        let t = nodes(&dag, 1);
        dag.suspend(t[0]).unwrap();
        assert!(dag.is_suspended(t[0]));
        assert!(dag.resume(t[0]).unwrap());
        assert!(!dag.resume(t[0]).unwrap());
        assert_eq!(dag.suspend(TableId::next()), Err(GraphError::NodeNotFound));
    }
}
