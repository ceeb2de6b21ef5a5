use std::io::Write;

use flowforge_core::graph::{Edge, Graph, Node, NodeKind};

/// A chain `ids[0] -> ids[1] -> ...` of nodes of one kind.
pub fn linear_graph(kind: NodeKind, ids: &[&str]) -> Graph {
    let nodes = ids.iter().map(|id| Node::new(*id, kind.clone())).collect();
    let edges = ids
        .windows(2)
        .map(|pair| Edge::data(format!("{}-{}", pair[0], pair[1]), pair[0], pair[1]))
        .collect();
    Graph::new(nodes, edges)
}

/// Write TOML to a temp file that lives as long as the returned handle.
pub fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}
