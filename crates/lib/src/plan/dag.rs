//! Step dependency DAG.
//!
//! Nodes are concrete (matrix-expanded) step ids; edges point from a
//! dependency to its dependent. Waves are computed with Kahn's algorithm.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::project::DefinitionError;

/// A DAG of concrete step ids.
pub struct StepDag {
  graph: DiGraph<String, ()>,
  nodes: BTreeMap<String, NodeIndex>,
}

impl StepDag {
  /// Build the DAG from `id -> dependencies`.
  ///
  /// Every dependency must itself be a key of `edges`.
  pub fn new(edges: &BTreeMap<String, BTreeSet<String>>) -> Result<Self, DefinitionError> {
    let mut graph = DiGraph::new();
    let mut nodes = BTreeMap::new();

    for id in edges.keys() {
      let idx = graph.add_node(id.clone());
      nodes.insert(id.clone(), idx);
    }

    for (id, deps) in edges {
      let dependent_idx = nodes[id];
      for dep in deps {
        let Some(&dep_idx) = nodes.get(dep) else {
          return Err(DefinitionError::UnknownDependency {
            step: id.clone(),
            dependency: dep.clone(),
          });
        };
        graph.add_edge(dep_idx, dependent_idx, ());
      }
    }

    Ok(Self { graph, nodes })
  }

  /// Group steps into execution waves.
  ///
  /// Wave `n` holds the steps whose dependencies all lie in waves `0..n`.
  /// Ids inside a wave are sorted. A cycle fails with the ids that lie on it.
  pub fn waves(&self) -> Result<Vec<Vec<String>>, DefinitionError> {
    let mut in_degree: HashMap<NodeIndex, usize> = self
      .graph
      .node_indices()
      .map(|idx| (idx, self.graph.neighbors_directed(idx, Direction::Incoming).count()))
      .collect();

    // BTreeMap keyed by id keeps the scan order deterministic
    let mut remaining: BTreeMap<&str, NodeIndex> = self.nodes.iter().map(|(id, &idx)| (id.as_str(), idx)).collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
      let ready: Vec<(&str, NodeIndex)> = remaining
        .iter()
        .filter(|(_, idx)| in_degree[*idx] == 0)
        .map(|(id, idx)| (*id, *idx))
        .collect();

      if ready.is_empty() {
        return Err(DefinitionError::Cycle(self.cycle_members(remaining.values().copied())));
      }

      for (id, idx) in &ready {
        remaining.remove(id);
        for neighbor in self.graph.neighbors_directed(*idx, Direction::Outgoing) {
          if let Some(deg) = in_degree.get_mut(&neighbor) {
            *deg = deg.saturating_sub(1);
          }
        }
      }

      waves.push(ready.into_iter().map(|(id, _)| id.to_string()).collect());
    }

    Ok(waves)
  }

  /// Ids on a cycle among `stuck`. Nodes merely downstream of a cycle are
  /// left out.
  fn cycle_members(&self, stuck: impl Iterator<Item = NodeIndex>) -> Vec<String> {
    let stuck: BTreeSet<NodeIndex> = stuck.collect();
    let mut members: Vec<String> = tarjan_scc(&self.graph)
      .into_iter()
      .filter(|scc| scc.iter().all(|idx| stuck.contains(idx)))
      .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
      .flatten()
      .map(|idx| self.graph[idx].clone())
      .collect();
    members.sort();
    members
  }
}
