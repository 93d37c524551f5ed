// Core infrastructure modules
pub mod core {
    pub mod errors;
}

pub mod artifact;
pub mod flow;
pub mod graph;
pub mod runtime;
pub mod snapshot;

// Re-exports for convenience
pub use core::errors::{FlowError, Result};

pub use artifact::{Artifact, ArtifactKind, ArtifactMessage, ArtifactObject, MessageStore};
pub use flow::{derive_flows, Flow, Job, Step};
pub use graph::{
    validate_connection, validate_graph, Connection, Graph, GraphError, GraphErrorCode, Node,
    NodeContent, NodeKind,
};
pub use runtime::{
    resolve_dependencies, Execution, ExecutionStatus, FlowRunner, NodeResolver, RunnerConfig,
    StepAction, StepCtx,
};
pub use snapshot::{snapshot, ExecutionSnapshot, MemorySnapshotStore, SledSnapshotStore, SnapshotStore};
