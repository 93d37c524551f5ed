//! Execution state machine.
//!
//! An [`Execution`] is the root aggregate for one run of a flow: a tree of
//! job executions and step executions with status transitions, plus the
//! append-only artifact log. All mutation goes through the methods here and
//! is driven by a single writer (the runner task); completed and failed are
//! terminal at the execution level.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::artifact::Artifact;
use crate::core::errors::{FlowError, Result};
use crate::flow::model::Flow;
use crate::snapshot::ExecutionSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Run state of one step within one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecution {
    pub id: String,
    pub step_id: String,
    pub node_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepExecution {
    fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.run_started_at = None;
        self.duration_ms = None;
        self.error = None;
    }
}

/// Run state of one job within one execution. Completed iff all its step
/// executions are completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecution {
    pub id: String,
    pub job_id: String,
    pub status: JobStatus,
    pub step_executions: Vec<StepExecution>,
}

impl JobExecution {
    pub fn contains_step(&self, step_id: &str) -> bool {
        self.step_executions.iter().any(|se| se.step_id == step_id)
    }

    pub fn is_completed(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

/// One run-time instantiation of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    pub status: ExecutionStatus,
    pub job_executions: Vec<JobExecution>,
    pub artifacts: Vec<Artifact>,
    pub run_started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl Execution {
    /// Instantiates a fresh running execution from a compiled flow: one
    /// pending job execution per job, one pending step execution per step.
    pub fn start(flow: &Flow) -> Self {
        let job_executions = flow
            .jobs
            .iter()
            .map(|job| JobExecution {
                id: cuid2::create_id(),
                job_id: job.id.clone(),
                status: JobStatus::Pending,
                step_executions: job
                    .steps
                    .iter()
                    .map(|step| StepExecution {
                        id: cuid2::create_id(),
                        step_id: step.id.clone(),
                        node_id: step.node_id.clone(),
                        status: StepStatus::Pending,
                        run_started_at: None,
                        duration_ms: None,
                        error: None,
                    })
                    .collect(),
            })
            .collect();

        Self {
            id: cuid2::create_id(),
            flow_id: Some(flow.id.clone()),
            status: ExecutionStatus::Running,
            job_executions,
            artifacts: Vec::new(),
            run_started_at: Utc::now(),
            duration_ms: None,
        }
    }

    /// Rebuilds partial state from a snapshot for a retry.
    ///
    /// Job executions that are not completed, or that contain the forced
    /// step, reset to pending along with each of their step executions that
    /// is not completed or is the forced step. Completed jobs untouched by
    /// the force target carry over unchanged. Artifacts created by the
    /// forced step's node are dropped; they will be regenerated.
    pub fn build_retry_plan(
        snapshot: &ExecutionSnapshot,
        force_retry_step_id: Option<&str>,
    ) -> Self {
        let mut execution = snapshot.execution.clone();
        let forced_node: Option<String> = force_retry_step_id.and_then(|step_id| {
            execution
                .job_executions
                .iter()
                .flat_map(|je| je.step_executions.iter())
                .find(|se| se.step_id == step_id)
                .map(|se| se.node_id.clone())
        });

        for job_execution in &mut execution.job_executions {
            let forced_here =
                force_retry_step_id.is_some_and(|step_id| job_execution.contains_step(step_id));
            if job_execution.is_completed() && !forced_here {
                continue;
            }
            job_execution.status = JobStatus::Pending;
            for step_execution in &mut job_execution.step_executions {
                let forced = force_retry_step_id == Some(step_execution.step_id.as_str());
                if step_execution.status != StepStatus::Completed || forced {
                    step_execution.reset();
                }
            }
        }

        if let Some(node_id) = forced_node {
            execution.artifacts.retain(|a| a.creator_node_id != node_id);
        }

        execution.status = ExecutionStatus::Pending;
        execution.duration_ms = None;
        execution
    }

    /// Transitions a retry-planned (pending) execution back to running with
    /// a fresh start timestamp.
    pub fn resume(&mut self) {
        if self.status == ExecutionStatus::Pending {
            self.status = ExecutionStatus::Running;
            self.run_started_at = Utc::now();
            self.duration_ms = None;
        }
    }

    /// Marks the execution completed when every job execution already is.
    /// Covers a retry plan where all jobs carried over completed.
    pub(crate) fn finalize_if_complete(&mut self) {
        if self.status == ExecutionStatus::Running
            && self.job_executions.iter().all(|je| je.is_completed())
        {
            self.status = ExecutionStatus::Completed;
            self.stamp_duration();
        }
    }

    /// Marks a running execution cancelled. Steps that were in flight go
    /// back to pending (their work is lost), so no step execution is ever
    /// left in running; completed work is untouched and a snapshot of the
    /// result can be resumed later.
    pub fn cancel(&mut self) {
        if self.status != ExecutionStatus::Running {
            return;
        }
        for job_execution in &mut self.job_executions {
            for step_execution in &mut job_execution.step_executions {
                if step_execution.status == StepStatus::Running {
                    step_execution.reset();
                }
            }
            if job_execution.status == JobStatus::Running {
                job_execution.status = JobStatus::Pending;
            }
        }
        self.status = ExecutionStatus::Cancelled;
        self.stamp_duration();
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn job_execution(&self, id: &str) -> Option<&JobExecution> {
        self.job_executions.iter().find(|je| je.id == id)
    }

    pub fn step_execution(&self, id: &str) -> Option<&StepExecution> {
        self.job_executions
            .iter()
            .flat_map(|je| je.step_executions.iter())
            .find(|se| se.id == id)
    }

    /// Artifacts produced by a given node, newest last.
    pub fn artifacts_for_node(&self, node_id: &str) -> Vec<&Artifact> {
        self.artifacts
            .iter()
            .filter(|a| a.creator_node_id == node_id)
            .collect()
    }

    fn step_execution_mut(&mut self, id: &str) -> Result<&mut StepExecution> {
        self.job_executions
            .iter_mut()
            .flat_map(|je| je.step_executions.iter_mut())
            .find(|se| se.id == id)
            .ok_or_else(|| FlowError::StepNotFound(id.to_string()))
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_terminal() {
            return Err(FlowError::InvalidState(format!(
                "execution {} is terminal ({:?})",
                self.id, self.status
            )));
        }
        Ok(())
    }

    /// Marks a pending job execution as running.
    pub fn begin_job(&mut self, job_execution_id: &str) -> Result<()> {
        self.ensure_live()?;
        let job_execution = self
            .job_executions
            .iter_mut()
            .find(|je| je.id == job_execution_id)
            .ok_or_else(|| FlowError::JobNotFound(job_execution_id.to_string()))?;
        if job_execution.status != JobStatus::Pending {
            return Err(FlowError::InvalidState(format!(
                "job execution {} is {:?}, expected pending",
                job_execution_id, job_execution.status
            )));
        }
        job_execution.status = JobStatus::Running;
        Ok(())
    }

    /// Marks a pending step execution as running.
    pub fn begin_step(&mut self, step_execution_id: &str) -> Result<()> {
        self.ensure_live()?;
        let step_execution = self.step_execution_mut(step_execution_id)?;
        if step_execution.status != StepStatus::Pending {
            return Err(FlowError::InvalidState(format!(
                "step execution {} is {:?}, expected pending",
                step_execution_id, step_execution.status
            )));
        }
        step_execution.status = StepStatus::Running;
        step_execution.run_started_at = Some(Utc::now());
        Ok(())
    }

    /// Records a completed step, appending its artifact if one was produced.
    pub fn complete_step(
        &mut self,
        step_execution_id: &str,
        duration_ms: u64,
        artifact: Option<Artifact>,
    ) -> Result<()> {
        self.ensure_live()?;
        let step_execution = self.step_execution_mut(step_execution_id)?;
        step_execution.status = StepStatus::Completed;
        step_execution.duration_ms = Some(duration_ms);
        step_execution.error = None;
        if let Some(artifact) = artifact {
            self.record_artifact(artifact);
        }
        Ok(())
    }

    /// Records a failed step with the error message captured verbatim.
    pub fn fail_step(
        &mut self,
        step_execution_id: &str,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Result<()> {
        self.ensure_live()?;
        let step_execution = self.step_execution_mut(step_execution_id)?;
        step_execution.status = StepStatus::Failed;
        step_execution.duration_ms = Some(duration_ms);
        step_execution.error = Some(error.into());
        Ok(())
    }

    /// Appends an artifact to the execution's log. Append-only: an existing
    /// artifact from the same creator is never replaced in place; retries
    /// purge old artifacts explicitly through the retry plan.
    pub fn record_artifact(&mut self, artifact: Artifact) {
        self.artifacts.push(artifact);
    }

    /// Closes out a job after all its steps reached a terminal state.
    ///
    /// All steps completed marks the job completed, and the last job
    /// completing completes the execution. Any failed step fails the job
    /// and the execution; every job not yet started is skipped along with
    /// its pending steps.
    pub fn finish_job(&mut self, job_execution_id: &str) -> Result<()> {
        self.ensure_live()?;
        let index = self
            .job_executions
            .iter()
            .position(|je| je.id == job_execution_id)
            .ok_or_else(|| FlowError::JobNotFound(job_execution_id.to_string()))?;

        let job_execution = &mut self.job_executions[index];
        let any_failed = job_execution
            .step_executions
            .iter()
            .any(|se| se.status == StepStatus::Failed);
        let all_completed = job_execution
            .step_executions
            .iter()
            .all(|se| se.status == StepStatus::Completed);

        if any_failed {
            job_execution.status = JobStatus::Failed;
            self.skip_unstarted_jobs();
            self.status = ExecutionStatus::Failed;
            self.stamp_duration();
            debug!(execution = %self.id, job_execution = %job_execution_id, "job failed, execution failed");
            return Ok(());
        }

        if !all_completed {
            return Err(FlowError::InvalidState(format!(
                "job execution {} finished with non-terminal steps",
                job_execution_id
            )));
        }

        job_execution.status = JobStatus::Completed;
        if self
            .job_executions
            .iter()
            .all(|je| je.status == JobStatus::Completed)
        {
            self.status = ExecutionStatus::Completed;
            self.stamp_duration();
            debug!(execution = %self.id, "execution completed");
        }
        Ok(())
    }

    fn skip_unstarted_jobs(&mut self) {
        for job_execution in &mut self.job_executions {
            if job_execution.status == JobStatus::Pending {
                job_execution.status = JobStatus::Skipped;
                for step_execution in &mut job_execution.step_executions {
                    if step_execution.status == StepStatus::Pending {
                        step_execution.status = StepStatus::Skipped;
                    }
                }
            }
        }
    }

    fn stamp_duration(&mut self) {
        let elapsed = Utc::now().signed_duration_since(self.run_started_at);
        self.duration_ms = Some(elapsed.num_milliseconds().max(0) as u64);
    }
}
