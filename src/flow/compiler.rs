//! Graph-to-flow compilation.
//!
//! Groups connected action nodes into flows and levels each flow's action
//! nodes into ordered jobs of parallel steps. Derivation is a pure function
//! of `(nodes, connections, previous_flows)`; flow ids are reused from
//! previous derivations where the flow's first step is unchanged so that
//! saved executions keep pointing at the same flow.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::graph::model::{Connection, Node, NodeKind};
use crate::graph::validate::{validate_graph, GraphError};

use super::model::{Flow, Job, Step};

/// Derives the complete flow set for one graph snapshot.
///
/// Fails with a [`GraphError`] if the active connection set is structurally
/// invalid; the caller must not start an execution on the offending graph.
pub fn derive_flows(
    nodes: &[Node],
    connections: &[Connection],
    previous_flows: &[Flow],
) -> Result<Vec<Flow>, GraphError> {
    validate_graph(nodes, connections)?;

    let node_map: HashMap<&str, &Node> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    let position: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), i))
        .collect();
    let active: Vec<&Connection> = connections
        .iter()
        .filter(|c| c.is_active(&node_map))
        .collect();

    // Undirected adjacency; parallel duplicate connections collapse here.
    let mut adjacency: HashMap<&str, HashSet<&str>> = HashMap::new();
    for conn in &active {
        adjacency
            .entry(conn.source_node_id.as_str())
            .or_default()
            .insert(conn.target_node_id.as_str());
        adjacency
            .entry(conn.target_node_id.as_str())
            .or_default()
            .insert(conn.source_node_id.as_str());
    }

    let mut assigned: HashSet<&str> = HashSet::new();
    let mut flows = Vec::new();
    let mut reused_ids: HashSet<&str> = HashSet::new();

    for node in nodes {
        if !node.is_action() || assigned.contains(node.id.as_str()) {
            continue;
        }

        let component = connected_component(node.id.as_str(), &adjacency, &position);
        for member in &component {
            assigned.insert(member);
        }

        let flow = compile_component(&component, &active, &node_map, &position);
        debug!(
            first_step = ?flow.first_step_node(),
            jobs = flow.jobs.len(),
            steps = flow.step_count(),
            "compiled flow component"
        );
        flows.push(flow);
    }

    // Reuse a previous flow id when the new flow's first step belonged to
    // that flow; first match wins, each previous id consumed at most once.
    for flow in &mut flows {
        let Some(anchor) = flow.first_step_node() else {
            continue;
        };
        let reuse = previous_flows.iter().find(|prev| {
            !reused_ids.contains(prev.id.as_str()) && prev.nodes.iter().any(|n| n == anchor)
        });
        if let Some(prev) = reuse {
            flow.id = prev.id.clone();
            reused_ids.insert(prev.id.as_str());
        }
    }

    info!(flows = flows.len(), "derived flows");
    Ok(flows)
}

/// Weakly-connected component containing `start`, via iterative DFS.
/// Members are returned in graph input order for deterministic output.
fn connected_component<'a>(
    start: &'a str,
    adjacency: &HashMap<&'a str, HashSet<&'a str>>,
    position: &HashMap<&'a str, usize>,
) -> Vec<&'a str> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut stack = vec![start];
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(neighbors) = adjacency.get(id) {
            for neighbor in neighbors {
                if !seen.contains(neighbor) {
                    stack.push(neighbor);
                }
            }
        }
    }
    let mut members: Vec<&str> = seen.into_iter().collect();
    members.sort_by_key(|id| position.get(id).copied().unwrap_or(usize::MAX));
    members
}

fn compile_component(
    component: &[&str],
    active: &[&Connection],
    node_map: &HashMap<&str, &Node>,
    position: &HashMap<&str, usize>,
) -> Flow {
    let members: HashSet<&str> = component.iter().copied().collect();

    let flow_connections: Vec<&Connection> = active
        .iter()
        .copied()
        .filter(|c| {
            members.contains(c.source_node_id.as_str()) && members.contains(c.target_node_id.as_str())
        })
        .collect();

    let is_action = |id: &str| node_map.get(id).map(|n| n.is_action()).unwrap_or(false);
    let action_nodes: Vec<&str> = component.iter().copied().filter(|id| is_action(id)).collect();

    // In-degrees over action-to-action edges only; duplicates collapse.
    let mut action_edges: HashSet<(&str, &str)> = HashSet::new();
    for conn in &flow_connections {
        let source = conn.source_node_id.as_str();
        let target = conn.target_node_id.as_str();
        if is_action(source) && is_action(target) {
            action_edges.insert((source, target));
        }
    }
    let mut in_degree: HashMap<&str, usize> = action_nodes.iter().map(|id| (*id, 0)).collect();
    for (_, target) in &action_edges {
        *in_degree.entry(target).or_insert(0) += 1;
    }

    // Kahn leveling: each peeled level becomes one job.
    let mut jobs = Vec::new();
    let mut remaining: HashSet<&str> = action_nodes.iter().copied().collect();
    while !remaining.is_empty() {
        let mut level: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|id| in_degree.get(id).copied().unwrap_or(0) == 0)
            .collect();
        // Validation guarantees acyclicity, so every round peels something.
        if level.is_empty() {
            break;
        }
        level.sort_by_key(|id| position.get(id).copied().unwrap_or(usize::MAX));

        let steps = level
            .iter()
            .map(|id| Step {
                id: cuid2::create_id(),
                node_id: (*id).to_string(),
                variable_node_ids: variable_inputs(id, &flow_connections, node_map),
            })
            .collect();
        jobs.push(Job {
            id: cuid2::create_id(),
            steps,
        });

        for id in &level {
            remaining.remove(id);
            for (source, target) in &action_edges {
                if source == id {
                    if let Some(degree) = in_degree.get_mut(target) {
                        *degree = degree.saturating_sub(1);
                    }
                }
            }
        }
    }

    Flow {
        id: cuid2::create_id(),
        nodes: component.iter().map(|id| (*id).to_string()).collect(),
        connections: flow_connections.iter().map(|c| c.id.clone()).collect(),
        jobs,
    }
}

/// Variable-type source nodes of connections targeting `node_id`.
fn variable_inputs(
    node_id: &str,
    flow_connections: &[&Connection],
    node_map: &HashMap<&str, &Node>,
) -> Vec<String> {
    let mut seen = HashSet::new();
    flow_connections
        .iter()
        .filter(|c| c.target_node_id == node_id)
        .filter(|c| {
            node_map
                .get(c.source_node_id.as_str())
                .map(|n| n.kind() == NodeKind::Variable)
                .unwrap_or(false)
        })
        .filter(|c| seen.insert(c.source_node_id.as_str()))
        .map(|c| c.source_node_id.clone())
        .collect()
}
