//! Graph model and structural validation.

pub mod model;
pub mod validate;

pub use model::{active_connections, Connection, Graph, GraphIndex, Node, NodeContent, NodeKind};
pub use validate::{validate_connection, validate_graph, GraphError, GraphErrorCode};
