//! Structural validation of connection sets.
//!
//! Rejects self-referencing and cyclic connections before the compiler
//! derives any flow. Only active connections (both endpoints present) are
//! considered; a connection left dangling by a node deletion is ignored
//! rather than reported.

use std::collections::HashSet;

use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::model::{active_connections, Connection, Node};

/// Validation failure codes surfaced to the editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GraphErrorCode {
    SelfReference,
    CircularDependency,
}

/// A blocking graph validation error. `message` is user-facing; the
/// `system_message` carries the diagnostic detail for logs.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct GraphError {
    pub code: GraphErrorCode,
    pub message: String,
    pub system_message: String,
}

impl GraphError {
    pub fn self_reference(connection_id: &str, node_id: &str) -> Self {
        Self {
            code: GraphErrorCode::SelfReference,
            message: "A node cannot be connected to itself".to_string(),
            system_message: format!(
                "connection '{}' references node '{}' as both source and target",
                connection_id, node_id
            ),
        }
    }

    pub fn circular_dependency(node_id: &str) -> Self {
        Self {
            code: GraphErrorCode::CircularDependency,
            message: "This connection would create a circular dependency".to_string(),
            system_message: format!("cycle detected through node '{}'", node_id),
        }
    }
}

/// Validates a candidate connection against the existing connection set.
///
/// The cycle check builds a directed adjacency over the active connections
/// plus the candidate and runs an iterative depth-first search from the
/// candidate's source, tracking the nodes currently on the search stack.
pub fn validate_connection(
    candidate: &Connection,
    existing: &[Connection],
    nodes: &[Node],
) -> Result<(), GraphError> {
    if candidate.is_self_loop() {
        return Err(GraphError::self_reference(
            &candidate.id,
            &candidate.source_node_id,
        ));
    }
    for conn in existing {
        if conn.is_self_loop() {
            return Err(GraphError::self_reference(&conn.id, &conn.source_node_id));
        }
    }

    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for conn in active_connections(nodes, existing) {
        graph.add_edge(&conn.source_node_id, &conn.target_node_id, ());
    }
    graph.add_edge(&candidate.source_node_id, &candidate.target_node_id, ());

    dfs_cycle_check(&graph, &candidate.source_node_id)?;
    debug!(
        connection = %candidate.id,
        source = %candidate.source_node_id,
        target = %candidate.target_node_id,
        "connection validated"
    );
    Ok(())
}

/// Validates the full active connection set. Invoked by the flow compiler
/// before deriving flows; any error is fatal to compilation.
pub fn validate_graph(nodes: &[Node], connections: &[Connection]) -> Result<(), GraphError> {
    let active = active_connections(nodes, connections);
    for conn in &active {
        if conn.is_self_loop() {
            return Err(GraphError::self_reference(&conn.id, &conn.source_node_id));
        }
    }

    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for conn in &active {
        graph.add_edge(&conn.source_node_id, &conn.target_node_id, ());
    }
    for conn in &active {
        dfs_cycle_check(&graph, &conn.source_node_id)?;
    }
    Ok(())
}

/// Iterative (stack-based) DFS from `start`, failing if a node still on the
/// search stack is revisited.
fn dfs_cycle_check<'a>(graph: &DiGraphMap<&'a str, ()>, start: &'a str) -> Result<(), GraphError> {
    if !graph.contains_node(start) {
        return Ok(());
    }

    enum Frame<'s> {
        Enter(&'s str),
        Exit(&'s str),
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut on_stack: HashSet<&str> = HashSet::new();
    let mut stack = vec![Frame::Enter(start)];

    while let Some(frame) = stack.pop() {
        match frame {
            Frame::Enter(node) => {
                if on_stack.contains(node) {
                    return Err(GraphError::circular_dependency(node));
                }
                if !visited.insert(node) {
                    continue;
                }
                on_stack.insert(node);
                stack.push(Frame::Exit(node));
                for neighbor in graph.neighbors(node) {
                    if on_stack.contains(neighbor) {
                        return Err(GraphError::circular_dependency(neighbor));
                    }
                    if !visited.contains(neighbor) {
                        stack.push(Frame::Enter(neighbor));
                    }
                }
            }
            Frame::Exit(node) => {
                on_stack.remove(node);
            }
        }
    }
    Ok(())
}
