use thiserror::Error;

use crate::graph::validate::GraphError;
use crate::runtime::state::Execution;

/// Unified error type for the skein library.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Structural graph validation failure (self-loop, cycle). Fatal to
    /// compilation; never swallowed.
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Step execution not found: {0}")]
    StepNotFound(String),

    #[error("Job execution not found: {0}")]
    JobNotFound(String),

    /// Run-time dependency resolution failed for one node. Recoverable:
    /// the runner converts this into a failed step execution.
    #[error("Failed to resolve node '{node_id}': {message}")]
    Resolution { node_id: String, message: String },

    /// The resolver walked deeper than the configured bound. Indicates a
    /// structurally invalid graph slipped past validation; fatal.
    #[error("Dependency resolution exceeded depth {depth} at node '{node_id}'")]
    ResolveDepthExceeded { node_id: String, depth: usize },

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Snapshot store operation failed: {operation}")]
    Store {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("I/O failure while {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization failed")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML parse failed")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The run was cancelled. Carries the cancelled aggregate so the caller
    /// can still snapshot it and resume later.
    #[error("Execution was cancelled")]
    Cancelled { execution: Box<Execution> },
}

impl FlowError {
    pub fn store<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        operation: S,
        source: E,
    ) -> Self {
        Self::Store {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn resolution<N: Into<String>, M: Into<String>>(node_id: N, message: M) -> Self {
        Self::Resolution {
            node_id: node_id.into(),
            message: message.into(),
        }
    }

    /// Whether the runner may convert this error into a failed step
    /// execution instead of aborting the whole run.
    pub fn is_step_recoverable(&self) -> bool {
        matches!(self, Self::Resolution { .. })
    }

    /// Error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Graph(_) => "graph",
            Self::FlowNotFound(_) => "flow",
            Self::NodeNotFound(_) | Self::StepNotFound(_) | Self::JobNotFound(_) => "lookup",
            Self::Resolution { .. } | Self::ResolveDepthExceeded { .. } => "resolution",
            Self::SnapshotNotFound(_) | Self::Store { .. } => "store",
            Self::Io { .. } => "io",
            Self::Serialization(_) | Self::Yaml(_) => "serialization",
            Self::Configuration(_) => "configuration",
            Self::InvalidState(_) => "state",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

impl From<sled::Error> for FlowError {
    fn from(err: sled::Error) -> Self {
        Self::store("sled", err)
    }
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, FlowError>;
