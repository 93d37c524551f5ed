//! Execution runtime: state machine, dependency resolution, events and the
//! job-at-a-time runner.

pub mod events;
pub mod resolver;
pub mod runner;
pub mod state;

pub use events::{BufferingEventSink, EventSink, FlowEvent, FlowEventEnvelope, LoggingEventSink};
pub use resolver::{resolve_dependencies, NodeResolver};
pub use runner::{FlowRunner, RunnerConfig, StepAction, StepCtx};
pub use state::{
    Execution, ExecutionStatus, JobExecution, JobStatus, StepExecution, StepStatus,
};
