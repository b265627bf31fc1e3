//! # System Graph
//!
//! One node per system. An edge `A -> B` means every job of `A` (including
//! its hooks) finishes before any job of `B` starts.
//!
//! ## Construction
//!
//! 1. Explicit edges from ordering hints:
//!    - `A.runs_before(B)` adds `A -> B`
//!    - `B.runs_after(A)` and `B.requires(A)` add `A -> B`
//! 2. Cycles among explicit edges are broken by a DFS from every node in
//!    registration order: an edge whose target is still on the DFS path is
//!    deleted (output and paired input).
//! 3. Conflict edges: every pair of systems that could alias memory gets
//!    one edge, oriented along a topological order of the explicit graph.
//!    Conflict edges are never deleted, so conflicting systems can never
//!    run concurrently.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use super::system::SystemDescriptor;
use crate::error::{RuntimeError, RuntimeResult};

/// Why an edge exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeKind {
    /// Declared ordering hint.
    Explicit,
    /// Implicit data-conflict serialization.
    Conflict,
}

/// A surviving graph edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Edge {
    /// Node that runs first.
    pub from: usize,
    /// Node that runs second.
    pub to: usize,
    /// Edge origin.
    pub kind: EdgeKind,
}

/// DFS marks for cycle breaking.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnPath,
    Done,
}

/// Acyclic dependency graph of systems.
#[derive(Clone, Debug, Default)]
pub struct SystemGraph {
    names: Vec<String>,
    inputs: Vec<Vec<usize>>,
    outputs: Vec<Vec<usize>>,
    edges: Vec<Edge>,
    dropped: Vec<(usize, usize)>,
    order: Vec<usize>,
}

impl SystemGraph {
    /// Builds the graph for a system set.
    ///
    /// # Errors
    ///
    /// `DuplicateSystem` if two systems share a name,
    /// `MissingRequiredSystem` if a `requires` target is absent.
    pub fn build(descriptors: &[&SystemDescriptor]) -> RuntimeResult<Self> {
        let count = descriptors.len();
        let mut index = HashMap::with_capacity(count);
        for (i, descriptor) in descriptors.iter().enumerate() {
            if index.insert(descriptor.name(), i).is_some() {
                return Err(RuntimeError::DuplicateSystem(descriptor.name().to_string()));
            }
        }

        let mut explicit = BTreeSet::new();
        for (i, descriptor) in descriptors.iter().enumerate() {
            for target in descriptor.before() {
                match index.get(target.as_str()) {
                    Some(&j) => {
                        explicit.insert((i, j));
                    }
                    None => warn_unknown(descriptor.name(), target),
                }
            }
            for source in descriptor.after() {
                match index.get(source.as_str()) {
                    Some(&j) => {
                        explicit.insert((j, i));
                    }
                    None => warn_unknown(descriptor.name(), source),
                }
            }
            for source in descriptor.required() {
                let &j = index.get(source.as_str()).ok_or_else(|| {
                    RuntimeError::MissingRequiredSystem {
                        system: descriptor.name().to_string(),
                        requires: source.clone(),
                    }
                })?;
                explicit.insert((j, i));
            }
        }

        let mut adjacency = vec![Vec::new(); count];
        for &(from, to) in &explicit {
            adjacency[from].push(to);
        }
        let dropped = break_cycles(&mut adjacency);
        let order = topological_order(&adjacency);

        let mut position = vec![0; count];
        for (rank, &node) in order.iter().enumerate() {
            position[node] = rank;
        }

        let mut edges: Vec<Edge> = adjacency
            .iter()
            .enumerate()
            .flat_map(|(from, targets)| {
                targets.iter().map(move |&to| Edge {
                    from,
                    to,
                    kind: EdgeKind::Explicit,
                })
            })
            .collect();

        for a in 0..count {
            for b in (a + 1)..count {
                if !descriptors[a].conflicts_with(descriptors[b]) {
                    continue;
                }
                let (from, to) = if position[a] < position[b] { (a, b) } else { (b, a) };
                if adjacency[from].contains(&to) {
                    continue;
                }
                edges.push(Edge {
                    from,
                    to,
                    kind: EdgeKind::Conflict,
                });
            }
        }

        let mut inputs = vec![Vec::new(); count];
        let mut outputs = vec![Vec::new(); count];
        for edge in &edges {
            outputs[edge.from].push(edge.to);
            inputs[edge.to].push(edge.from);
        }

        let names: Vec<String> = descriptors.iter().map(|d| d.name().to_string()).collect();
        for &(from, to) in &dropped {
            tracing::warn!(
                from = names[from].as_str(),
                to = names[to].as_str(),
                "ordering cycle: dropped explicit edge"
            );
        }

        Ok(Self {
            names,
            inputs,
            outputs,
            edges,
            dropped,
            order,
        })
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Checks for an empty graph.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// System names in node order.
    #[must_use]
    pub fn node_names(&self) -> &[String] {
        &self.names
    }

    /// Node index of a system.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Predecessors of a node.
    #[must_use]
    pub fn inputs(&self, node: usize) -> &[usize] {
        &self.inputs[node]
    }

    /// Successors of a node.
    #[must_use]
    pub fn outputs(&self, node: usize) -> &[usize] {
        &self.outputs[node]
    }

    /// Surviving edges.
    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Explicit edges deleted to break cycles, as `(from, to)` names.
    #[must_use]
    pub fn dropped_edges(&self) -> Vec<(&str, &str)> {
        self.dropped
            .iter()
            .map(|&(from, to)| (self.names[from].as_str(), self.names[to].as_str()))
            .collect()
    }

    /// Checks for a surviving edge between two named systems.
    #[must_use]
    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        match (self.index_of(from), self.index_of(to)) {
            (Some(from), Some(to)) => self.outputs[from].contains(&to),
            _ => false,
        }
    }

    /// A topological order of the explicit graph, used to orient conflicts.
    #[must_use]
    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }
}

fn warn_unknown(system: &str, target: &str) {
    tracing::warn!(system, target, "ordering hint names an unknown system; ignored");
}

/// Deletes every DFS back edge. Returns the deleted `(from, to)` pairs.
fn break_cycles(adjacency: &mut [Vec<usize>]) -> Vec<(usize, usize)> {
    let mut marks = vec![Mark::Unvisited; adjacency.len()];
    let mut dropped = Vec::new();
    for start in 0..adjacency.len() {
        if marks[start] == Mark::Unvisited {
            visit(start, adjacency, &mut marks, &mut dropped);
        }
    }
    dropped
}

fn visit(
    node: usize,
    adjacency: &mut [Vec<usize>],
    marks: &mut [Mark],
    dropped: &mut Vec<(usize, usize)>,
) {
    marks[node] = Mark::OnPath;
    // Nodes on the path are never re-entered, so taking the list is safe.
    let targets = std::mem::take(&mut adjacency[node]);
    let mut kept = Vec::with_capacity(targets.len());
    for target in targets {
        match marks[target] {
            Mark::OnPath => dropped.push((node, target)),
            Mark::Unvisited => {
                visit(target, adjacency, marks, dropped);
                kept.push(target);
            }
            Mark::Done => kept.push(target),
        }
    }
    adjacency[node] = kept;
    marks[node] = Mark::Done;
}

/// Kahn's algorithm, lowest index first among ready nodes.
fn topological_order(adjacency: &[Vec<usize>]) -> Vec<usize> {
    let mut in_degree = vec![0usize; adjacency.len()];
    for targets in adjacency {
        for &to in targets {
            in_degree[to] += 1;
        }
    }
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(adjacency.len());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for &to in &adjacency[node] {
            in_degree[to] -= 1;
            if in_degree[to] == 0 {
                ready.push(Reverse(to));
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::ComponentTypeId;

    const POSITION: ComponentTypeId = ComponentTypeId::new(1);
    const VELOCITY: ComponentTypeId = ComponentTypeId::new(2);

    fn build(descriptors: &[SystemDescriptor]) -> RuntimeResult<SystemGraph> {
        let refs: Vec<&SystemDescriptor> = descriptors.iter().collect();
        SystemGraph::build(&refs)
    }

    #[test]
    fn test_explicit_hints() {
        let graph = build(&[
            SystemDescriptor::new("input").runs_before("physics"),
            SystemDescriptor::new("physics"),
            SystemDescriptor::new("render").runs_after("physics"),
        ])
        .unwrap();

        assert!(graph.has_edge("input", "physics"));
        assert!(graph.has_edge("physics", "render"));
        assert!(!graph.has_edge("input", "render"));
        assert!(graph.edges().iter().all(|e| e.kind == EdgeKind::Explicit));
    }

    #[test]
    fn test_conflict_edge_for_shared_write() {
        let graph = build(&[
            SystemDescriptor::new("a").writes(&[POSITION]),
            SystemDescriptor::new("b").writes(&[POSITION]),
            SystemDescriptor::new("c").reads(&[VELOCITY]),
        ])
        .unwrap();

        assert!(graph.has_edge("a", "b"));
        assert_eq!(graph.edges().len(), 1);
        assert_eq!(graph.edges()[0].kind, EdgeKind::Conflict);
        assert!(graph.inputs(2).is_empty() && graph.outputs(2).is_empty());
    }

    #[test]
    fn test_readers_do_not_conflict() {
        let graph = build(&[
            SystemDescriptor::new("a").reads(&[POSITION]),
            SystemDescriptor::new("b").reads(&[POSITION]),
            SystemDescriptor::new("c")
                .writes(&[POSITION])
                .read_only(&[POSITION]),
        ])
        .unwrap();
        assert!(graph.edges().is_empty());
    }

    #[test]
    fn test_conflict_follows_explicit_order() {
        // b is declared first but must run after a.
        let graph = build(&[
            SystemDescriptor::new("b").writes(&[POSITION]).runs_after("x"),
            SystemDescriptor::new("x"),
            SystemDescriptor::new("a").writes(&[POSITION]).runs_before("x"),
        ])
        .unwrap();
        assert!(graph.has_edge("a", "b"));
        assert!(!graph.has_edge("b", "a"));
    }

    #[test]
    fn test_cycle_breaks_explicit_edge_only() {
        let graph = build(&[
            SystemDescriptor::new("a").writes(&[POSITION]).runs_before("b"),
            SystemDescriptor::new("b").writes(&[POSITION]).runs_before("a"),
        ])
        .unwrap();

        assert_eq!(graph.dropped_edges(), vec![("b", "a")]);
        assert!(graph.has_edge("a", "b"));
        assert!(!graph.has_edge("b", "a"));
    }

    #[test]
    fn test_three_cycle_with_conflict_stays_serialized() {
        let graph = build(&[
            SystemDescriptor::new("a").runs_before("b"),
            SystemDescriptor::new("b").runs_before("c").writes(&[POSITION]),
            SystemDescriptor::new("c").runs_before("a").writes(&[POSITION]),
        ])
        .unwrap();

        assert_eq!(graph.dropped_edges(), vec![("c", "a")]);
        assert!(graph.has_edge("b", "c"));
        assert_eq!(graph.topological_order(), &[0, 1, 2]);
    }

    #[test]
    fn test_self_edge_is_dropped() {
        let graph = build(&[SystemDescriptor::new("a").runs_before("a")]).unwrap();
        assert_eq!(graph.dropped_edges(), vec![("a", "a")]);
        assert!(graph.edges().is_empty());
    }

    #[test]
    fn test_requires() {
        let err = build(&[SystemDescriptor::new("render").requires("camera")]).unwrap_err();
        assert_eq!(
            err,
            RuntimeError::MissingRequiredSystem {
                system: "render".into(),
                requires: "camera".into(),
            }
        );

        let graph = build(&[
            SystemDescriptor::new("render").requires("camera"),
            SystemDescriptor::new("camera"),
        ])
        .unwrap();
        assert!(graph.has_edge("camera", "render"));
    }

    #[test]
    fn test_unknown_hint_is_ignored() {
        let graph = build(&[SystemDescriptor::new("a").runs_after("ghost")]).unwrap();
        assert!(graph.edges().is_empty());
    }

    #[test]
    fn test_duplicate_names() {
        let err = build(&[SystemDescriptor::new("a"), SystemDescriptor::new("a")]).unwrap_err();
        assert_eq!(err, RuntimeError::DuplicateSystem("a".into()));
    }

    #[test]
    fn test_graph_is_acyclic() {
        // Dense random hints plus conflicts must still topologically sort.
        let mut state = 0x9E37_79B9_7F4A_7C15u64;
        let mut descriptors = Vec::new();
        for i in 0..12 {
            let mut d = SystemDescriptor::new(format!("s{i}"));
            for j in 0..12 {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                if state % 4 == 0 {
                    d = d.runs_before(format!("s{j}"));
                }
            }
            if state % 3 == 0 {
                d = d.writes(&[POSITION]);
            } else {
                d = d.reads(&[POSITION]);
            }
            descriptors.push(d);
        }
        let graph = build(&descriptors).unwrap();

        let mut in_degree: Vec<usize> = (0..graph.len()).map(|n| graph.inputs(n).len()).collect();
        let mut ready: Vec<usize> = (0..graph.len()).filter(|&n| in_degree[n] == 0).collect();
        let mut seen = 0;
        while let Some(n) = ready.pop() {
            seen += 1;
            for &m in graph.outputs(n) {
                in_degree[m] -= 1;
                if in_degree[m] == 0 {
                    ready.push(m);
                }
            }
        }
        assert_eq!(seen, graph.len());
    }
}
