//! Run-time dependency resolution.
//!
//! The flow compiler orders action nodes against each other ahead of time;
//! this resolver additionally pulls in upstream outputs that are not
//! materialized until run time (variable nodes, upstream producers without
//! a recorded message). Resolution is strictly depth-first: by the time a
//! step's own action runs, every transitive input has a recorded message.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::debug;

use crate::artifact::MessageStore;
use crate::core::errors::{FlowError, Result};
use crate::graph::model::{GraphIndex, Node};

/// Produces the output message for one upstream node (variable lookup,
/// external fetch, ...). Implementations are externally provided.
#[async_trait]
pub trait NodeResolver: Send + Sync {
    async fn resolve(&self, node: &Node, messages: &MessageStore) -> anyhow::Result<Value>;
}

/// Ensures every upstream node feeding `node_id` has a recorded message,
/// resolving unmet dependencies deepest-first.
///
/// The depth bound guarantees termination even on a graph that slipped past
/// validation; exceeding it is a fatal error, never a silent truncation.
pub async fn resolve_dependencies(
    node_id: &str,
    index: &GraphIndex<'_>,
    messages: &MessageStore,
    resolver: &dyn NodeResolver,
    max_depth: usize,
) -> Result<()> {
    resolve_inbound(node_id, index, messages, resolver, 0, max_depth).await
}

fn resolve_inbound<'a>(
    node_id: &'a str,
    index: &'a GraphIndex<'a>,
    messages: &'a MessageStore,
    resolver: &'a dyn NodeResolver,
    depth: usize,
    max_depth: usize,
) -> BoxFuture<'a, Result<()>> {
    async move {
        if depth > max_depth {
            return Err(FlowError::ResolveDepthExceeded {
                node_id: node_id.to_string(),
                depth,
            });
        }

        for connection in index.inbound(node_id) {
            let source_id = connection.source_node_id.as_str();
            if messages.has_message(source_id) {
                continue;
            }
            let source = index
                .node(source_id)
                .ok_or_else(|| FlowError::NodeNotFound(source_id.to_string()))?;

            // Deepest unmet dependency first.
            resolve_inbound(source_id, index, messages, resolver, depth + 1, max_depth).await?;

            let value = resolver
                .resolve(source, messages)
                .await
                .map_err(|e| FlowError::resolution(source_id, e.to_string()))?;
            messages.record(source_id, &value)?;
            debug!(node = %source_id, depth, "resolved upstream node");
        }
        Ok(())
    }
    .boxed()
}
