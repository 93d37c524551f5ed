//! Flow execution runtime.
//!
//! A [`FlowRunner`] drives one execution at a time: jobs run in order with a
//! synchronous barrier between them, steps within a job run concurrently up
//! to a configured cap. Step actions are externally provided async
//! operations; their failures are caught at the step boundary and recorded
//! on the step execution instead of propagating, so one step's failure
//! cannot corrupt the orchestration loop.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{oneshot, Semaphore};
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, info, warn};

use crate::artifact::{Artifact, ArtifactObject, MessageStore};
use crate::core::errors::{FlowError, Result};
use crate::flow::compiler::derive_flows;
use crate::flow::model::{Flow, Step};
use crate::graph::model::{Graph, GraphIndex, Node};
use crate::snapshot::{ExecutionSnapshot, SnapshotStore};

use super::events::{now_ms, next_sequence, EventSink, FlowEvent, FlowEventEnvelope};
use super::resolver::{resolve_dependencies, NodeResolver};
use super::state::{Execution, JobStatus, StepStatus};

/// Immutable context handed to a step action.
#[derive(Clone)]
pub struct StepCtx {
    pub execution_id: String,
    pub flow_id: Option<String>,
    /// The action node this step executes.
    pub node: Node,
    /// Variable-type nodes directly feeding this step.
    pub variable_node_ids: Vec<String>,
    /// Recorded upstream outputs; every transitive input of this step has
    /// a message by the time the action runs.
    pub messages: MessageStore,
}

impl StepCtx {
    /// Recorded message of one of this step's variable inputs.
    pub fn variable_message(&self, node_id: &str) -> Option<serde_json::Value> {
        self.messages.get(node_id)
    }
}

/// Externally provided step action (e.g. a generation provider call).
#[async_trait]
pub trait StepAction: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &StepCtx) -> anyhow::Result<ArtifactObject>;
}

/// Configuration for flow execution behavior.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum number of steps of one job to run in parallel.
    pub max_parallel_steps: usize,
    /// Recursion bound for run-time dependency resolution.
    pub max_resolve_depth: usize,
    /// Optional per-step timeout.
    pub step_timeout: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: 3,
            max_resolve_depth: 32,
            step_timeout: None,
        }
    }
}

impl RunnerConfig {
    /// Validates configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_steps == 0 {
            return Err(FlowError::Configuration(
                "max_parallel_steps must be greater than 0".to_string(),
            ));
        }
        if self.max_resolve_depth == 0 {
            return Err(FlowError::Configuration(
                "max_resolve_depth must be greater than 0".to_string(),
            ));
        }
        if let Some(limit) = self.step_timeout {
            if limit.is_zero() {
                return Err(FlowError::Configuration(
                    "step_timeout must be greater than 0".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Outcome of one dispatched step, applied to the execution aggregate by
/// the single orchestrating task.
struct StepOutcome {
    step_execution_id: String,
    node_id: String,
    result: std::result::Result<ArtifactObject, String>,
    duration_ms: u64,
}

/// The flow execution runner.
pub struct FlowRunner {
    action: Arc<dyn StepAction>,
    resolver: Arc<dyn NodeResolver>,
    config: RunnerConfig,
    event_sink: Option<Arc<dyn EventSink>>,
}

impl FlowRunner {
    pub fn new(action: Arc<dyn StepAction>, resolver: Arc<dyn NodeResolver>) -> Self {
        Self {
            action,
            resolver,
            config: RunnerConfig::default(),
            event_sink: None,
        }
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Result<Self> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Derives flows for the graph and runs one of them: the flow with the
    /// given id, or the first derived flow when no id is given.
    pub async fn compile_and_run(
        &self,
        graph: &Graph,
        previous_flows: &[Flow],
        flow_id: Option<&str>,
        cancel_rx: oneshot::Receiver<()>,
    ) -> Result<(Flow, Execution)> {
        let flows = derive_flows(&graph.nodes, &graph.connections, previous_flows)?;
        let flow = match flow_id {
            Some(id) => flows
                .into_iter()
                .find(|f| f.id == id)
                .ok_or_else(|| FlowError::FlowNotFound(id.to_string()))?,
            None => flows
                .into_iter()
                .next()
                .ok_or_else(|| FlowError::FlowNotFound("graph contains no flows".to_string()))?,
        };
        let execution = self.run(graph, &flow, cancel_rx).await?;
        Ok((flow, execution))
    }

    /// Runs one compiled flow to a terminal state.
    ///
    /// Cancellation stops scheduling immediately: after the signal is
    /// observed no step transitions to running, in-flight steps are dropped
    /// and reset to pending, and the cancelled aggregate comes back inside
    /// [`FlowError::Cancelled`] so it can still be snapshotted and resumed.
    pub async fn run(
        &self,
        graph: &Graph,
        flow: &Flow,
        cancel_rx: oneshot::Receiver<()>,
    ) -> Result<Execution> {
        let execution = Execution::start(flow);
        let messages = MessageStore::new();
        self.drive(graph, flow, execution, messages, cancel_rx).await
    }

    /// Resumes an execution from a snapshot, optionally forcing one already
    /// completed step to re-run.
    pub async fn retry(
        &self,
        snapshot: &ExecutionSnapshot,
        force_retry_step_id: Option<&str>,
        cancel_rx: oneshot::Receiver<()>,
    ) -> Result<Execution> {
        let mut execution = Execution::build_retry_plan(snapshot, force_retry_step_id);
        execution.resume();
        let messages = MessageStore::new();
        messages.seed_from_artifacts(&execution.artifacts)?;
        info!(
            execution = %execution.id,
            forced = ?force_retry_step_id,
            "resuming execution from snapshot"
        );
        let graph = snapshot.graph();
        self.drive(&graph, &snapshot.flow, execution, messages, cancel_rx)
            .await
    }

    /// Loads a snapshot from the store and resumes it. A missing locator
    /// fails fast; no partial retry is attempted.
    pub async fn retry_from_store(
        &self,
        store: &dyn SnapshotStore,
        locator: &str,
        force_retry_step_id: Option<&str>,
        cancel_rx: oneshot::Receiver<()>,
    ) -> Result<Execution> {
        let snapshot = store.get(locator).await?;
        self.retry(&snapshot, force_retry_step_id, cancel_rx).await
    }

    /// The orchestration loop: one job at a time, steps of the current job
    /// in flight concurrently, a synchronous barrier before the next job.
    /// The execution aggregate is mutated only here, by this single task.
    async fn drive(
        &self,
        graph: &Graph,
        flow: &Flow,
        mut execution: Execution,
        messages: MessageStore,
        mut cancel_rx: oneshot::Receiver<()>,
    ) -> Result<Execution> {
        execution.resume();
        let execution_id = execution.id.clone();
        self.emit(
            &execution_id,
            FlowEvent::ExecutionStarted {
                flow_id: execution.flow_id.clone(),
            },
        );

        let index = GraphIndex::new(&graph.nodes, &graph.connections);
        let semaphore = Semaphore::new(self.config.max_parallel_steps);

        for job_index in 0..execution.job_executions.len() {
            if !matches!(
                cancel_rx.try_recv(),
                Err(oneshot::error::TryRecvError::Empty)
            ) {
                warn!(execution = %execution_id, "execution cancelled between jobs");
                execution.cancel();
                return Err(FlowError::Cancelled {
                    execution: Box::new(execution),
                });
            }

            let (job_execution_id, pending_steps) = {
                let job_execution = &execution.job_executions[job_index];
                if job_execution.status == JobStatus::Completed {
                    debug!(job_execution = %job_execution.id, "job carried over, skipping");
                    continue;
                }
                let pending: Vec<(String, Step)> = job_execution
                    .step_executions
                    .iter()
                    .filter(|se| se.status == StepStatus::Pending)
                    .map(|se| {
                        let step = flow
                            .step(&se.step_id)
                            .cloned()
                            .ok_or_else(|| FlowError::StepNotFound(se.step_id.clone()))?;
                        Ok((se.id.clone(), step))
                    })
                    .collect::<Result<_>>()?;
                (job_execution.id.clone(), pending)
            };

            execution.begin_job(&job_execution_id)?;
            self.emit(
                &execution_id,
                FlowEvent::JobStarted {
                    job_execution_id: job_execution_id.clone(),
                },
            );

            for (step_execution_id, step) in &pending_steps {
                execution.begin_step(step_execution_id)?;
                self.emit(
                    &execution_id,
                    FlowEvent::StepStarted {
                        step_id: step.id.clone(),
                        node_id: step.node_id.clone(),
                    },
                );
            }

            let mut in_flight: FuturesUnordered<_> = pending_steps
                .into_iter()
                .map(|(step_execution_id, step)| {
                    self.run_step(
                        step_execution_id,
                        step,
                        execution_id.clone(),
                        execution.flow_id.clone(),
                        &index,
                        &messages,
                        &semaphore,
                    )
                })
                .collect();

            let mut cancelled = false;
            loop {
                let outcome = tokio::select! {
                    biased;
                    _ = &mut cancel_rx => {
                        cancelled = true;
                        break;
                    }
                    next = in_flight.next() => match next {
                        Some(outcome) => outcome?,
                        None => break,
                    },
                };
                let step_id = execution
                    .step_execution(&outcome.step_execution_id)
                    .map(|se| se.step_id.clone())
                    .unwrap_or_default();
                match outcome.result {
                    Ok(object) => {
                        messages.record(&outcome.node_id, &object)?;
                        let artifact = Artifact::new(&outcome.node_id, object);
                        execution.complete_step(
                            &outcome.step_execution_id,
                            outcome.duration_ms,
                            Some(artifact),
                        )?;
                        self.emit(
                            &execution_id,
                            FlowEvent::StepCompleted {
                                step_id,
                                duration_ms: outcome.duration_ms,
                            },
                        );
                    }
                    Err(error) => {
                        warn!(node = %outcome.node_id, %error, "step failed");
                        self.emit(
                            &execution_id,
                            FlowEvent::StepFailed {
                                step_id,
                                error: error.clone(),
                            },
                        );
                        execution.fail_step(
                            &outcome.step_execution_id,
                            error,
                            outcome.duration_ms,
                        )?;
                    }
                }
            }
            drop(in_flight);

            if cancelled {
                warn!(execution = %execution_id, "execution cancelled, dropping in-flight steps");
                execution.cancel();
                return Err(FlowError::Cancelled {
                    execution: Box::new(execution),
                });
            }

            execution.finish_job(&job_execution_id)?;
            if execution.is_terminal() {
                break;
            }
        }

        execution.finalize_if_complete();
        match execution.status {
            super::state::ExecutionStatus::Completed => {
                info!(execution = %execution_id, "execution completed");
                self.emit(
                    &execution_id,
                    FlowEvent::ExecutionCompleted {
                        duration_ms: execution.duration_ms.unwrap_or(0),
                    },
                );
            }
            super::state::ExecutionStatus::Failed => {
                self.emit(&execution_id, FlowEvent::ExecutionFailed);
            }
            _ => {}
        }
        Ok(execution)
    }

    /// Resolves the step's run-time dependencies, then runs the external
    /// action. Returns `Err` only for fatal conditions; action and
    /// resolution failures come back as a failed outcome.
    async fn run_step(
        &self,
        step_execution_id: String,
        step: Step,
        execution_id: String,
        flow_id: Option<String>,
        index: &GraphIndex<'_>,
        messages: &MessageStore,
        semaphore: &Semaphore,
    ) -> Result<StepOutcome> {
        let _permit = semaphore
            .acquire()
            .await
            .map_err(|_| FlowError::InvalidState("step semaphore closed".to_string()))?;
        let started = Instant::now();
        let node_id = step.node_id.clone();

        if let Err(err) = resolve_dependencies(
            &step.node_id,
            index,
            messages,
            self.resolver.as_ref(),
            self.config.max_resolve_depth,
        )
        .await
        {
            if !err.is_step_recoverable() {
                return Err(err);
            }
            return Ok(StepOutcome {
                step_execution_id,
                node_id,
                result: Err(err.to_string()),
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }

        let node = index
            .node(&step.node_id)
            .ok_or_else(|| FlowError::NodeNotFound(step.node_id.clone()))?
            .clone();
        let ctx = StepCtx {
            execution_id,
            flow_id,
            node,
            variable_node_ids: step.variable_node_ids,
            messages: messages.clone(),
        };

        let result = match self.config.step_timeout {
            Some(limit) => match timeout(limit, self.action.execute(&ctx)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!(
                    "step action timed out after {}ms",
                    limit.as_millis()
                )),
            },
            None => self.action.execute(&ctx).await,
        };

        Ok(StepOutcome {
            step_execution_id,
            node_id,
            result: result.map_err(|e| e.to_string()),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn emit(&self, run_id: &str, event: FlowEvent) {
        if let Some(sink) = &self.event_sink {
            sink.emit(&FlowEventEnvelope {
                sequence: next_sequence(),
                run_id: run_id.to_string(),
                timestamp: now_ms(),
                event,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactMessage;
    use crate::graph::model::{Connection, NodeContent, NodeKind};
    use crate::runtime::state::ExecutionStatus;
    use crate::snapshot;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn action_node(id: &str) -> Node {
        Node::new(
            id,
            NodeContent::Action {
                name: id.to_string(),
                prompt: None,
            },
        )
    }

    fn text_node(id: &str, value: &str) -> Node {
        Node::new(
            id,
            NodeContent::Text {
                value: value.to_string(),
            },
        )
    }

    fn op_conn(id: &str, source: &str, target: &str) -> Connection {
        Connection::new(id, source, NodeKind::Operation, target, NodeKind::Operation)
    }

    fn generated(title: &str) -> ArtifactObject {
        ArtifactObject::GeneratedText {
            title: title.to_string(),
            content: format!("generated for {}", title),
            messages: vec![ArtifactMessage {
                role: "assistant".to_string(),
                content: "done".to_string(),
            }],
        }
    }

    /// Action that succeeds for every node except those listed.
    struct ScriptedAction {
        fail_nodes: HashSet<String>,
        calls: AtomicUsize,
    }

    impl ScriptedAction {
        fn ok() -> Self {
            Self {
                fail_nodes: HashSet::new(),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing(nodes: &[&str]) -> Self {
            Self {
                fail_nodes: nodes.iter().map(|s| s.to_string()).collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl StepAction for ScriptedAction {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn execute(&self, ctx: &StepCtx) -> anyhow::Result<ArtifactObject> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_nodes.contains(&ctx.node.id) {
                anyhow::bail!("scripted failure for {}", ctx.node.id);
            }
            Ok(generated(&ctx.node.id))
        }
    }

    /// Resolves variable nodes to their static value.
    struct StaticResolver;

    #[async_trait]
    impl NodeResolver for StaticResolver {
        async fn resolve(&self, node: &Node, _messages: &MessageStore) -> anyhow::Result<Value> {
            match &node.content {
                NodeContent::Text { value } => Ok(json!({ "value": value })),
                _ => Ok(json!({ "node": node.id })),
            }
        }
    }

    fn runner(action: ScriptedAction) -> FlowRunner {
        FlowRunner::new(Arc::new(action), Arc::new(StaticResolver))
    }

    fn cancel_channel() -> oneshot::Receiver<()> {
        let (_tx, rx) = oneshot::channel();
        std::mem::forget(_tx);
        rx
    }

    #[tokio::test]
    async fn test_single_node_flow_completes() {
        let graph = Graph::new(vec![action_node("x")], vec![]);
        let runner = runner(ScriptedAction::ok());
        let (flow, execution) = runner
            .compile_and_run(&graph, &[], None, cancel_channel())
            .await
            .unwrap();

        assert_eq!(flow.step_count(), 1);
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.artifacts.len(), 1);
        assert_eq!(execution.artifacts[0].creator_node_id, "x");
        assert!(execution.duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_failure_blocks_next_job() {
        let graph = Graph::new(
            vec![action_node("a"), action_node("b")],
            vec![op_conn("c1", "a", "b")],
        );
        let runner = runner(ScriptedAction::failing(&["a"]));
        let (_, execution) = runner
            .compile_and_run(&graph, &[], None, cancel_channel())
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.job_executions[0].status, JobStatus::Failed);
        assert_eq!(execution.job_executions[1].status, JobStatus::Skipped);
        let failed = &execution.job_executions[0].step_executions[0];
        assert_eq!(failed.error.as_deref(), Some("scripted failure for a"));
        assert!(execution.artifacts.is_empty());
    }

    #[tokio::test]
    async fn test_same_job_sibling_finishes_on_failure() {
        // a and p are independent roots: one job with two steps. The
        // failing sibling must not prevent the other from completing.
        let graph = Graph::new(
            vec![action_node("a"), action_node("p"), action_node("b")],
            vec![op_conn("c1", "a", "b"), op_conn("c2", "p", "b")],
        );
        let runner = runner(ScriptedAction::failing(&["a"]));
        let (_, execution) = runner
            .compile_and_run(&graph, &[], None, cancel_channel())
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Failed);
        let first_job = &execution.job_executions[0];
        let by_node = |node: &str| {
            first_job
                .step_executions
                .iter()
                .find(|se| se.node_id == node)
                .unwrap()
        };
        assert_eq!(by_node("a").status, StepStatus::Failed);
        assert_eq!(by_node("p").status, StepStatus::Completed);
        assert_eq!(execution.artifacts.len(), 1);
        assert_eq!(execution.artifacts[0].creator_node_id, "p");
    }

    #[tokio::test]
    async fn test_variable_inputs_resolved_before_action() {
        struct AssertingAction;

        #[async_trait]
        impl StepAction for AssertingAction {
            fn name(&self) -> &str {
                "asserting"
            }

            async fn execute(&self, ctx: &StepCtx) -> anyhow::Result<ArtifactObject> {
                let message = ctx
                    .variable_message("topic")
                    .ok_or_else(|| anyhow::anyhow!("variable input not resolved"))?;
                assert_eq!(message["value"], "dragons");
                Ok(generated(&ctx.node.id))
            }
        }

        let graph = Graph::new(
            vec![action_node("gen"), text_node("topic", "dragons")],
            vec![Connection::new(
                "c1",
                "topic",
                NodeKind::Variable,
                "gen",
                NodeKind::Operation,
            )],
        );
        let runner = FlowRunner::new(Arc::new(AssertingAction), Arc::new(StaticResolver));
        let (_, execution) = runner
            .compile_and_run(&graph, &[], None, cancel_channel())
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_steps_of_one_job_run_concurrently() {
        // Both first-job steps wait on the same barrier; the run can only
        // finish if they are in flight at the same time.
        struct BarrierAction {
            barrier: tokio::sync::Barrier,
        }

        #[async_trait]
        impl StepAction for BarrierAction {
            fn name(&self) -> &str {
                "barrier"
            }

            async fn execute(&self, ctx: &StepCtx) -> anyhow::Result<ArtifactObject> {
                if ctx.node.id == "a" || ctx.node.id == "b" {
                    self.barrier.wait().await;
                }
                Ok(generated(&ctx.node.id))
            }
        }

        // a and b share the first job; z is the second job.
        let graph = Graph::new(
            vec![action_node("a"), action_node("b"), action_node("z")],
            vec![op_conn("c1", "a", "z"), op_conn("c2", "b", "z")],
        );
        let runner = FlowRunner::new(
            Arc::new(BarrierAction {
                barrier: tokio::sync::Barrier::new(2),
            }),
            Arc::new(StaticResolver),
        )
        .with_config(RunnerConfig {
            max_parallel_steps: 2,
            ..RunnerConfig::default()
        })
        .unwrap();

        let (_, execution) = tokio::time::timeout(
            Duration::from_secs(5),
            runner.compile_and_run(&graph, &[], None, cancel_channel()),
        )
        .await
        .expect("steps did not run concurrently")
        .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.artifacts.len(), 3);
    }

    #[tokio::test]
    async fn test_step_timeout_fails_step() {
        struct SlowAction;

        #[async_trait]
        impl StepAction for SlowAction {
            fn name(&self) -> &str {
                "slow"
            }

            async fn execute(&self, ctx: &StepCtx) -> anyhow::Result<ArtifactObject> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(generated(&ctx.node.id))
            }
        }

        let graph = Graph::new(vec![action_node("x")], vec![]);
        let runner = FlowRunner::new(Arc::new(SlowAction), Arc::new(StaticResolver))
            .with_config(RunnerConfig {
                step_timeout: Some(Duration::from_millis(20)),
                ..RunnerConfig::default()
            })
            .unwrap();
        let (_, execution) = runner
            .compile_and_run(&graph, &[], None, cancel_channel())
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        let step = &execution.job_executions[0].step_executions[0];
        assert!(step.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_scheduling() {
        struct HangingAction;

        #[async_trait]
        impl StepAction for HangingAction {
            fn name(&self) -> &str {
                "hanging"
            }

            async fn execute(&self, _ctx: &StepCtx) -> anyhow::Result<ArtifactObject> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(generated("never"))
            }
        }

        let graph = Graph::new(vec![action_node("x")], vec![]);
        let runner = FlowRunner::new(Arc::new(HangingAction), Arc::new(StaticResolver));
        let (tx, rx) = oneshot::channel();
        let run = runner.compile_and_run(&graph, &[], None, rx);
        tokio::pin!(run);

        tokio::select! {
            _ = &mut run => panic!("run finished before cancellation"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
        tx.send(()).unwrap();
        let err = run.await.unwrap_err();
        let execution = match err {
            FlowError::Cancelled { execution } => *execution,
            other => panic!("expected cancellation, got {:?}", other),
        };
        // The aggregate survives cancellation with nothing left running.
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        for je in &execution.job_executions {
            for se in &je.step_executions {
                assert_ne!(se.status, StepStatus::Running);
            }
        }
    }

    #[tokio::test]
    async fn test_cancelled_run_is_resumable_from_snapshot() {
        // First job completes quickly, the second hangs until cancelled.
        struct SlowSecondAction;

        #[async_trait]
        impl StepAction for SlowSecondAction {
            fn name(&self) -> &str {
                "slow-second"
            }

            async fn execute(&self, ctx: &StepCtx) -> anyhow::Result<ArtifactObject> {
                if ctx.node.id == "b" {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok(generated(&ctx.node.id))
            }
        }

        let graph = Graph::new(
            vec![action_node("a"), action_node("b")],
            vec![op_conn("c1", "a", "b")],
        );
        let flows = derive_flows(&graph.nodes, &graph.connections, &[]).unwrap();
        let flow = flows.into_iter().next().unwrap();

        let runner = FlowRunner::new(Arc::new(SlowSecondAction), Arc::new(StaticResolver));
        let (tx, rx) = oneshot::channel();
        let run = runner.run(&graph, &flow, rx);
        tokio::pin!(run);
        tokio::select! {
            _ = &mut run => panic!("run finished before cancellation"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
        tx.send(()).unwrap();
        let cancelled = match run.await.unwrap_err() {
            FlowError::Cancelled { execution } => *execution,
            other => panic!("expected cancellation, got {:?}", other),
        };
        // Completed work from before the cancellation is retained.
        assert_eq!(cancelled.artifacts.len(), 1);
        assert_eq!(cancelled.artifacts[0].creator_node_id, "a");

        // The cancelled aggregate snapshots and resumes to completion.
        let snap = snapshot::snapshot(&graph, &flow, &cancelled);
        let retry_action = Arc::new(ScriptedAction::ok());
        let retrying = FlowRunner::new(retry_action.clone(), Arc::new(StaticResolver));
        let retried = retrying.retry(&snap, None, cancel_channel()).await.unwrap();
        assert_eq!(retried.status, ExecutionStatus::Completed);
        assert_eq!(retried.id, cancelled.id);
        assert_eq!(retried.artifacts.len(), 2);
        // Only the interrupted second job re-ran.
        assert_eq!(retry_action.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_resumes_failed_execution() {
        // First run fails at node b; retry with a permissive action
        // completes and keeps a's artifact from the first run.
        let graph = Graph::new(
            vec![action_node("a"), action_node("b")],
            vec![op_conn("c1", "a", "b")],
        );
        let failing = runner(ScriptedAction::failing(&["b"]));
        let (flow, execution) = failing
            .compile_and_run(&graph, &[], None, cancel_channel())
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.artifacts.len(), 1);

        let snap = snapshot::snapshot(&graph, &flow, &execution);
        let retry_action = Arc::new(ScriptedAction::ok());
        let retrying = FlowRunner::new(retry_action.clone(), Arc::new(StaticResolver));
        let retried = retrying
            .retry(&snap, None, cancel_channel())
            .await
            .unwrap();
        assert_eq!(retried.status, ExecutionStatus::Completed);
        assert_eq!(retried.id, execution.id);
        let creators: Vec<&str> = retried
            .artifacts
            .iter()
            .map(|a| a.creator_node_id.as_str())
            .collect();
        assert_eq!(creators, vec!["a", "b"]);
        // The completed first job did not re-run.
        assert_eq!(retry_action.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_forced_retry_regenerates_artifact() {
        let graph = Graph::new(
            vec![action_node("a"), action_node("b")],
            vec![op_conn("c1", "a", "b")],
        );
        let first = runner(ScriptedAction::ok());
        let (flow, execution) = first
            .compile_and_run(&graph, &[], None, cancel_channel())
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        let step_a = flow.jobs[0].steps[0].id.clone();

        let snap = snapshot::snapshot(&graph, &flow, &execution);
        let second = runner(ScriptedAction::ok());
        let retried = second
            .retry(&snap, Some(&step_a), cancel_channel())
            .await
            .unwrap();
        assert_eq!(retried.status, ExecutionStatus::Completed);
        // Exactly one artifact per node: a's old artifact was purged and
        // regenerated, b's carried over.
        assert_eq!(retried.artifacts_for_node("a").len(), 1);
        assert_eq!(retried.artifacts_for_node("b").len(), 1);
    }

    #[tokio::test]
    async fn test_retry_from_store_missing_snapshot() {
        use crate::snapshot::MemorySnapshotStore;

        let runner = runner(ScriptedAction::ok());
        let store = MemorySnapshotStore::new();
        let err = runner
            .retry_from_store(&store, "missing", None, cancel_channel())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::SnapshotNotFound(_)));
    }

    #[tokio::test]
    async fn test_graph_error_propagates_from_compile() {
        let graph = Graph::new(
            vec![action_node("a"), action_node("b")],
            vec![op_conn("c1", "a", "b"), op_conn("c2", "b", "a")],
        );
        let runner = runner(ScriptedAction::ok());
        let err = runner
            .compile_and_run(&graph, &[], None, cancel_channel())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Graph(_)));
    }

    #[test]
    fn test_config_validation() {
        assert!(RunnerConfig::default().validate().is_ok());
        assert!(RunnerConfig {
            max_parallel_steps: 0,
            ..RunnerConfig::default()
        }
        .validate()
        .is_err());
        assert!(RunnerConfig {
            max_resolve_depth: 0,
            ..RunnerConfig::default()
        }
        .validate()
        .is_err());
        assert!(RunnerConfig {
            step_timeout: Some(Duration::ZERO),
            ..RunnerConfig::default()
        }
        .validate()
        .is_err());
    }
}
