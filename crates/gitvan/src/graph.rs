//! Dependency graph analysis: cycle enumeration, topological sort, strongly
//! connected components, complexity metrics, and the critical path.
//!
//! The graph is the same data the resolver walks, exposed as a separate
//! read-only view. Everything here is a pure function of the node and edge
//! sets: emitters produce text, DOT, and JSON without side effects, and the
//! structures iterate in BTree order so output is deterministic.
//!
//! An edge `a -> b` reads "a depends on b"; valid orderings therefore place
//! `b` before `a`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::manifest::PackManifest;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyGraph {
    nodes: BTreeSet<String>,
    /// Dependent -> its dependencies.
    edges: BTreeMap<String, BTreeSet<String>>,
}

/// Shape statistics for a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphMetrics {
    pub nodes: usize,
    pub edges: usize,
    /// Edge count over the possible edge count for a simple digraph.
    pub density: f64,
    pub max_in_degree: usize,
    pub max_out_degree: usize,
    /// Nodes nothing depends on.
    pub roots: Vec<String>,
    /// Nodes with no dependencies.
    pub leaves: Vec<String>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from manifests: one node per pack id, one edge per `dependsOn`
    /// and per `dependencies` key. Edges to packs outside the set still
    /// create nodes, so missing dependencies stay visible.
    pub fn from_manifests<'a>(manifests: impl IntoIterator<Item = &'a PackManifest>) -> Self {
        let mut graph = Self::new();
        for m in manifests {
            graph.add_node(&m.id);
            for dep in &m.compose.depends_on {
                graph.add_edge(&m.id, dep);
            }
            for dep in m.compose.dependencies.keys() {
                graph.add_edge(&m.id, dep);
            }
        }
        graph
    }

    pub fn add_node(&mut self, id: &str) {
        self.nodes.insert(id.to_string());
    }

    pub fn add_edge(&mut self, from: &str, to: &str) {
        self.nodes.insert(from.to_string());
        self.nodes.insert(to.to_string());
        self.edges
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }

    pub fn dependencies_of(&self, id: &str) -> impl Iterator<Item = &str> {
        self.edges
            .get(id)
            .into_iter()
            .flat_map(|deps| deps.iter().map(String::as_str))
    }

    fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum()
    }

    /// Enumerate cycles with a stack-coloring DFS. Each cycle is reported as
    /// the id path that closes it, starting and ending at the same node.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        fn visit(
            graph: &DependencyGraph,
            node: &str,
            colors: &mut HashMap<String, Color>,
            stack: &mut Vec<String>,
            cycles: &mut Vec<Vec<String>>,
        ) {
            colors.insert(node.to_string(), Color::Gray);
            stack.push(node.to_string());

            for dep in graph.dependencies_of(node) {
                match colors.get(dep).copied().unwrap_or(Color::White) {
                    Color::White => visit(graph, dep, colors, stack, cycles),
                    Color::Gray => {
                        // Close the loop from the in-stack occurrence.
                        let start = stack.iter().position(|n| n == dep).unwrap_or(0);
                        let mut cycle: Vec<String> = stack[start..].to_vec();
                        cycle.push(dep.to_string());
                        cycles.push(cycle);
                    }
                    Color::Black => {}
                }
            }

            stack.pop();
            colors.insert(node.to_string(), Color::Black);
        }

        let mut colors = HashMap::new();
        let mut stack = Vec::new();
        let mut cycles = Vec::new();
        for node in &self.nodes {
            if colors.get(node).is_none() {
                visit(self, node, &mut colors, &mut stack, &mut cycles);
            }
        }
        cycles
    }

    /// Kahn's algorithm, dependency-first. Returns `None` iff the graph has
    /// a cycle. Ties break by id so the order is total and stable.
    pub fn topological_sort(&self) -> Option<Vec<String>> {
        // In this orientation a node is ready once all of its dependencies
        // are emitted, so the working degree counts outgoing edges.
        let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for node in &self.nodes {
            pending.insert(node, 0);
        }
        for (from, deps) in &self.edges {
            *pending.entry(from).or_insert(0) += deps.len();
            for dep in deps {
                dependents.entry(dep).or_default().insert(from);
            }
        }

        let mut ready: BTreeSet<&str> = pending
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut out = Vec::with_capacity(self.nodes.len());

        while let Some(&node) = ready.iter().next() {
            ready.remove(node);
            out.push(node.to_string());
            if let Some(parents) = dependents.get(node) {
                for parent in parents {
                    let deg = pending.get_mut(parent).expect("known node");
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(parent);
                    }
                }
            }
        }

        (out.len() == self.nodes.len()).then_some(out)
    }

    /// Kosaraju's strongly connected components, each sorted, components
    /// ordered by their smallest member.
    pub fn strongly_connected_components(&self) -> Vec<Vec<String>> {
        // First pass: finish-time order on the forward graph.
        fn order_visit(
            graph: &DependencyGraph,
            node: &str,
            seen: &mut BTreeSet<String>,
            out: &mut Vec<String>,
        ) {
            seen.insert(node.to_string());
            for dep in graph.dependencies_of(node) {
                if !seen.contains(dep) {
                    order_visit(graph, dep, seen, out);
                }
            }
            out.push(node.to_string());
        }

        let mut seen = BTreeSet::new();
        let mut finish_order = Vec::new();
        for node in &self.nodes {
            if !seen.contains(node.as_str()) {
                order_visit(self, node, &mut seen, &mut finish_order);
            }
        }

        // Second pass: DFS on the transposed graph in reverse finish order.
        let mut reversed: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (from, deps) in &self.edges {
            for dep in deps {
                reversed.entry(dep).or_default().insert(from);
            }
        }

        let mut assigned = BTreeSet::new();
        let mut components = Vec::new();
        for node in finish_order.iter().rev() {
            if assigned.contains(node.as_str()) {
                continue;
            }
            let mut component = Vec::new();
            let mut stack = vec![node.as_str()];
            while let Some(n) = stack.pop() {
                if !assigned.insert(n.to_string()) {
                    continue;
                }
                component.push(n.to_string());
                for parent in reversed.get(n).into_iter().flatten() {
                    if !assigned.contains(*parent) {
                        stack.push(parent);
                    }
                }
            }
            component.sort();
            components.push(component);
        }
        components.sort();
        components
    }

    pub fn metrics(&self) -> GraphMetrics {
        let n = self.nodes.len();
        let e = self.edge_count();

        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        for deps in self.edges.values() {
            for dep in deps {
                *in_degree.entry(dep).or_insert(0) += 1;
            }
        }

        let roots = self
            .nodes
            .iter()
            .filter(|n| !in_degree.contains_key(n.as_str()))
            .cloned()
            .collect();
        let leaves = self
            .nodes
            .iter()
            .filter(|n| self.edges.get(*n).is_none_or(BTreeSet::is_empty))
            .cloned()
            .collect();

        GraphMetrics {
            nodes: n,
            edges: e,
            density: if n > 1 {
                e as f64 / (n * (n - 1)) as f64
            } else {
                0.0
            },
            max_in_degree: in_degree.values().copied().max().unwrap_or(0),
            max_out_degree: self.edges.values().map(BTreeSet::len).max().unwrap_or(0),
            roots,
            leaves,
        }
    }

    /// Longest dependency chain, dependency-first. Empty when the graph has
    /// cycles (longest path is only defined on a DAG).
    pub fn critical_path(&self) -> Vec<String> {
        let Some(order) = self.topological_sort() else {
            return Vec::new();
        };

        // Walk dependency-first; each node's chain extends its longest
        // dependency chain.
        let mut best: HashMap<&str, (usize, Option<&str>)> = HashMap::new();
        for node in order.iter() {
            let mut node_best: (usize, Option<&str>) = (1, None);
            for dep in self.dependencies_of(node) {
                if let Some((len, _)) = best.get(dep) {
                    if len + 1 > node_best.0 {
                        node_best = (len + 1, Some(dep));
                    }
                }
            }
            // Keys borrow from self.nodes, which outlives this map.
            let key = self.nodes.get(node.as_str()).expect("node known");
            best.insert(key.as_str(), node_best);
        }

        let Some((&end, _)) = best.iter().max_by_key(|(n, (len, _))| (*len, std::cmp::Reverse(*n)))
        else {
            return Vec::new();
        };

        let mut path = vec![end.to_string()];
        let mut cursor = end;
        while let Some((_, Some(prev))) = best.get(cursor) {
            path.push(prev.to_string());
            cursor = *prev;
        }
        path.reverse();
        path
    }

    /// Human-readable adjacency listing.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            match self.edges.get(node) {
                Some(deps) if !deps.is_empty() => {
                    let list: Vec<&str> = deps.iter().map(String::as_str).collect();
                    let _ = writeln!(out, "{node} -> {}", list.join(", "));
                }
                _ => {
                    let _ = writeln!(out, "{node}");
                }
            }
        }
        out
    }

    /// Graphviz DOT digraph.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph packs {\n");
        for node in &self.nodes {
            let _ = writeln!(out, "  \"{node}\";");
        }
        for (from, deps) in &self.edges {
            for dep in deps {
                let _ = writeln!(out, "  \"{from}\" -> \"{dep}\";");
            }
        }
        out.push('}');
        out.push('\n');
        out
    }

    /// JSON with nodes, edges, metrics, and cycles.
    pub fn to_json(&self) -> serde_json::Value {
        let edges: Vec<serde_json::Value> = self
            .edges
            .iter()
            .flat_map(|(from, deps)| {
                deps.iter().map(move |dep| json!({"from": from, "to": dep}))
            })
            .collect();
        json!({
            "nodes": self.nodes,
            "edges": edges,
            "metrics": self.metrics(),
            "cycles": self.detect_cycles(),
        })
    }
}
