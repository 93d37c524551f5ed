//! Execution snapshots and snapshot stores.
//!
//! A snapshot is a point-in-time, self-contained serialization of one
//! execution plus the graph state it ran against. It is the sole unit of
//! durable state and the sole input to a later retry.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::errors::{FlowError, Result};
use crate::flow::model::Flow;
use crate::graph::model::{Connection, Graph, Node};
use crate::runtime::state::Execution;

/// Immutable capture of one execution and the graph it ran against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSnapshot {
    pub id: String,
    pub execution: Execution,
    pub nodes: Vec<Node>,
    pub connections: Vec<Connection>,
    pub flow: Flow,
}

/// Pure projection of `(graph, flow, execution)` into a snapshot.
pub fn snapshot(graph: &Graph, flow: &Flow, execution: &Execution) -> ExecutionSnapshot {
    ExecutionSnapshot {
        id: cuid2::create_id(),
        execution: execution.clone(),
        nodes: graph.nodes.clone(),
        connections: graph.connections.clone(),
        flow: flow.clone(),
    }
}

impl ExecutionSnapshot {
    pub fn graph(&self) -> Graph {
        Graph::new(self.nodes.clone(), self.connections.clone())
    }
}

/// Durable storage for execution snapshots. The locator returned by `put`
/// is opaque; the core never parses its format.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn put(&self, snapshot: &ExecutionSnapshot) -> Result<String>;

    /// Fails with [`FlowError::SnapshotNotFound`] for an unknown locator.
    async fn get(&self, locator: &str) -> Result<ExecutionSnapshot>;
}

/// In-memory snapshot store, mainly for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    data: DashMap<String, ExecutionSnapshot>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn put(&self, snapshot: &ExecutionSnapshot) -> Result<String> {
        self.data.insert(snapshot.id.clone(), snapshot.clone());
        debug!(locator = %snapshot.id, "snapshot stored in memory");
        Ok(snapshot.id.clone())
    }

    async fn get(&self, locator: &str) -> Result<ExecutionSnapshot> {
        self.data
            .get(locator)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| FlowError::SnapshotNotFound(locator.to_string()))
    }
}

const ZSTD_LEVEL: i32 = 3;

/// Sled-backed snapshot store. Snapshots are stored as zstd-compressed
/// JSON, keyed by snapshot id.
pub struct SledSnapshotStore {
    tree: sled::Tree,
    _db: sled::Db,
}

impl SledSnapshotStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = sled::open(path)?;
        let tree = db.open_tree("snapshots")?;
        info!("opened sled snapshot store");
        Ok(Self { tree, _db: db })
    }
}

#[async_trait]
impl SnapshotStore for SledSnapshotStore {
    async fn put(&self, snapshot: &ExecutionSnapshot) -> Result<String> {
        let json = serde_json::to_vec(snapshot)?;
        let compressed = zstd::encode_all(json.as_slice(), ZSTD_LEVEL)
            .map_err(|e| FlowError::store("zstd_encode", e))?;
        self.tree.insert(snapshot.id.as_bytes(), compressed)?;
        self.tree
            .flush_async()
            .await
            .map_err(|e| FlowError::store("sled_flush", e))?;
        debug!(locator = %snapshot.id, "snapshot persisted");
        Ok(snapshot.id.clone())
    }

    async fn get(&self, locator: &str) -> Result<ExecutionSnapshot> {
        let bytes = self
            .tree
            .get(locator.as_bytes())?
            .ok_or_else(|| FlowError::SnapshotNotFound(locator.to_string()))?;
        let json =
            zstd::decode_all(bytes.as_ref()).map_err(|e| FlowError::store("zstd_decode", e))?;
        Ok(serde_json::from_slice(&json)?)
    }
}
