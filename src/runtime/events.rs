//! Typed runtime events emitted during flow execution.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Runtime event types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FlowEvent {
    ExecutionStarted {
        flow_id: Option<String>,
    },
    JobStarted {
        job_execution_id: String,
    },
    StepStarted {
        step_id: String,
        node_id: String,
    },
    StepCompleted {
        step_id: String,
        duration_ms: u64,
    },
    StepFailed {
        step_id: String,
        error: String,
    },
    ExecutionCompleted {
        duration_ms: u64,
    },
    ExecutionFailed,
}

/// Event envelope with metadata. The run id is the id of the execution the
/// event belongs to, carried once here instead of on every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEventEnvelope {
    pub sequence: u64,
    pub run_id: String,
    pub timestamp: u64,
    pub event: FlowEvent,
}

/// Event sink trait for emitting events.
pub trait EventSink: Send + Sync {
    fn emit(&self, envelope: &FlowEventEnvelope);
}

/// A simple logging event sink.
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, envelope: &FlowEventEnvelope) {
        tracing::debug!("event: {:?}", envelope);
    }
}

/// A buffering event sink that collects events.
pub struct BufferingEventSink {
    events: Arc<parking_lot::RwLock<Vec<FlowEventEnvelope>>>,
}

impl BufferingEventSink {
    pub fn new() -> Self {
        Self {
            events: Arc::new(parking_lot::RwLock::new(Vec::new())),
        }
    }

    pub fn get_events(&self) -> Vec<FlowEventEnvelope> {
        self.events.read().clone()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl Default for BufferingEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for BufferingEventSink {
    fn emit(&self, envelope: &FlowEventEnvelope) {
        self.events.write().push(envelope.clone());
    }
}

/// Global sequence counter for events.
static EVENT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Get the next event sequence number.
pub fn next_sequence() -> u64 {
    EVENT_SEQUENCE.fetch_add(1, Ordering::SeqCst)
}

/// Current timestamp in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
