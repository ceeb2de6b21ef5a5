use std::collections::{HashMap, VecDeque};

use flowforge_core::graph::Graph;

/// Execution order computed for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOrder {
    /// Node ids in a valid topological order.
    pub order: Vec<String>,
    /// Nodes that never reached in-degree zero (in or downstream of a cycle),
    /// in graph order.
    pub excluded: Vec<String>,
}

/// Compute a deterministic execution order using Kahn's algorithm.
///
/// Only edges whose source and target both exist count toward in-degree.
/// The queue is seeded in node insertion order and successors are enqueued
/// in edge order, so ties are always broken the same way.
pub fn build_order(graph: &Graph) -> ExecutionOrder {
    let nodes = graph.nodes();
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
    for (i, node) in nodes.iter().enumerate() {
        index.entry(node.id.as_str()).or_insert(i);
    }

    let mut in_degree = vec![0usize; nodes.len()];
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];

    for edge in graph.edges() {
        let (Some(&from), Some(&to)) = (
            index.get(edge.from_node_id.as_str()),
            index.get(edge.to_node_id.as_str()),
        ) else {
            continue;
        };
        adjacency[from].push(to);
        in_degree[to] += 1;
    }

    let mut queue: VecDeque<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut visited = vec![false; nodes.len()];
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(current) = queue.pop_front() {
        if visited[current] {
            continue;
        }
        visited[current] = true;
        order.push(nodes[current].id.clone());

        for &next in &adjacency[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    let excluded = nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| !visited[*i])
        .map(|(_, n)| n.id.clone())
        .collect();

    ExecutionOrder { order, excluded }
}
