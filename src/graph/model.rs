//! Immutable description of nodes and connections.
//!
//! The graph is supplied by the caller (typically an editor or API layer) as
//! plain values; the compiler and runtime never mutate it.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::errors::Result;

/// Coarse node type carried on connection endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Operation,
    Variable,
}

/// Tagged node payload. Operation nodes are either side-effecting actions
/// (generation) or triggers; variable nodes hold static or externally
/// sourced data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeContent {
    Action {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
    },
    Trigger {
        name: String,
    },
    Text {
        value: String,
    },
    File {
        name: String,
        locator: String,
    },
    Source {
        locator: String,
    },
}

impl NodeContent {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeContent::Action { .. } | NodeContent::Trigger { .. } => NodeKind::Operation,
            NodeContent::Text { .. } | NodeContent::File { .. } | NodeContent::Source { .. } => {
                NodeKind::Variable
            }
        }
    }

    pub fn is_action(&self) -> bool {
        matches!(self, NodeContent::Action { .. })
    }
}

/// A node in the graph, identified by an opaque id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(flatten)]
    pub content: NodeContent,
}

impl Node {
    pub fn new(id: impl Into<String>, content: NodeContent) -> Self {
        Self {
            id: id.into(),
            content,
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.content.kind()
    }

    pub fn is_action(&self) -> bool {
        self.content.is_action()
    }
}

/// A directed connection between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub source_node_id: String,
    pub source_node_type: NodeKind,
    pub target_node_id: String,
    pub target_node_type: NodeKind,
}

impl Connection {
    pub fn new(
        id: impl Into<String>,
        source_node_id: impl Into<String>,
        source_node_type: NodeKind,
        target_node_id: impl Into<String>,
        target_node_type: NodeKind,
    ) -> Self {
        Self {
            id: id.into(),
            source_node_id: source_node_id.into(),
            source_node_type,
            target_node_id: target_node_id.into(),
            target_node_type,
        }
    }

    pub fn is_self_loop(&self) -> bool {
        self.source_node_id == self.target_node_id
    }

    /// A connection is active when both endpoint nodes still exist.
    pub fn is_active(&self, nodes: &HashMap<&str, &Node>) -> bool {
        nodes.contains_key(self.source_node_id.as_str())
            && nodes.contains_key(self.target_node_id.as_str())
    }
}

/// An immutable node/connection set as supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub connections: Vec<Connection>,
}

impl Graph {
    pub fn new(nodes: Vec<Node>, connections: Vec<Connection>) -> Self {
        Self { nodes, connections }
    }

    /// Parses a graph definition from YAML.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Loads a graph definition from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut content = String::new();
        File::open(path.as_ref())
            .and_then(|mut f| f.read_to_string(&mut content))
            .map_err(|e| {
                crate::core::errors::FlowError::io(
                    format!("reading graph file {}", path.as_ref().display()),
                    e,
                )
            })?;
        Self::from_yaml_str(&content)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Read-only lookup index over one graph snapshot: id to node, plus inbound
/// active connections per target node.
pub struct GraphIndex<'a> {
    nodes: HashMap<&'a str, &'a Node>,
    inbound: HashMap<&'a str, Vec<&'a Connection>>,
}

impl<'a> GraphIndex<'a> {
    pub fn new(nodes: &'a [Node], connections: &'a [Connection]) -> Self {
        let node_map: HashMap<&str, &Node> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();
        let mut inbound: HashMap<&str, Vec<&Connection>> = HashMap::new();
        for conn in connections {
            if conn.is_active(&node_map) {
                inbound
                    .entry(conn.target_node_id.as_str())
                    .or_default()
                    .push(conn);
            }
        }
        Self {
            nodes: node_map,
            inbound,
        }
    }

    pub fn node(&self, id: &str) -> Option<&'a Node> {
        self.nodes.get(id).copied()
    }

    /// Active connections targeting the given node.
    pub fn inbound(&self, id: &str) -> &[&'a Connection] {
        self.inbound.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

/// Filters a connection set down to connections whose both endpoints are
/// present in the node set.
pub fn active_connections<'a>(
    nodes: &'a [Node],
    connections: &'a [Connection],
) -> Vec<&'a Connection> {
    let node_map: HashMap<&str, &Node> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    connections
        .iter()
        .filter(|c| c.is_active(&node_map))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn action(id: &str) -> Node {
        Node::new(
            id,
            NodeContent::Action {
                name: id.to_string(),
                prompt: None,
            },
        )
    }

    fn text(id: &str, value: &str) -> Node {
        Node::new(
            id,
            NodeContent::Text {
                value: value.to_string(),
            },
        )
    }

    #[test]
    fn test_node_kinds() {
        assert_eq!(action("a").kind(), NodeKind::Operation);
        assert!(action("a").is_action());
        assert_eq!(text("t", "v").kind(), NodeKind::Variable);
        assert!(!text("t", "v").is_action());
        let trigger = Node::new(
            "tr",
            NodeContent::Trigger {
                name: "manual".into(),
            },
        );
        assert_eq!(trigger.kind(), NodeKind::Operation);
        assert!(!trigger.is_action());
    }

    #[test]
    fn test_active_connections_ignore_deleted_endpoints() {
        let nodes = vec![action("a"), action("b")];
        let conns = vec![
            Connection::new("c1", "a", NodeKind::Operation, "b", NodeKind::Operation),
            Connection::new("c2", "a", NodeKind::Operation, "gone", NodeKind::Operation),
        ];
        let active = active_connections(&nodes, &conns);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "c1");
    }

    #[test]
    fn test_graph_index_inbound() {
        let nodes = vec![action("a"), action("b"), text("t", "hello")];
        let conns = vec![
            Connection::new("c1", "a", NodeKind::Operation, "b", NodeKind::Operation),
            Connection::new("c2", "t", NodeKind::Variable, "b", NodeKind::Operation),
            Connection::new("c3", "missing", NodeKind::Variable, "b", NodeKind::Operation),
        ];
        let index = GraphIndex::new(&nodes, &conns);
        let inbound: Vec<&str> = index.inbound("b").iter().map(|c| c.id.as_str()).collect();
        assert_eq!(inbound, vec!["c1", "c2"]);
        assert!(index.inbound("a").is_empty());
        assert!(index.node("t").is_some());
        assert!(index.node("missing").is_none());
    }

    #[test]
    fn test_yaml_graph_definition() {
        let yaml = r#"
nodes:
  - id: gen1
    type: action
    name: generate
    prompt: "write a story"
  - id: topic
    type: text
    value: "dragons"
connections:
  - id: c1
    sourceNodeId: topic
    sourceNodeType: variable
    targetNodeId: gen1
    targetNodeType: operation
"#;
        let graph = Graph::from_yaml_str(yaml).unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.connections.len(), 1);
        assert!(graph.node("gen1").unwrap().is_action());
        assert_eq!(graph.node("topic").unwrap().kind(), NodeKind::Variable);
    }

    #[test]
    fn test_missing_graph_file_is_io_error() {
        let err = Graph::from_yaml_file("/nonexistent/graph.yaml").unwrap_err();
        assert!(matches!(
            err,
            crate::core::errors::FlowError::Io { .. }
        ));
    }

    #[test]
    fn test_connection_json_shape() {
        let conn = Connection::new("c1", "a", NodeKind::Operation, "b", NodeKind::Variable);
        let json = serde_json::to_value(&conn).unwrap();
        assert_eq!(json["sourceNodeId"], "a");
        assert_eq!(json["sourceNodeType"], "operation");
        assert_eq!(json["targetNodeType"], "variable");
    }
}
