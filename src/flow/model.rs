//! Compiled flow shapes: a flow is an ordered pipeline of jobs, each job a
//! set of steps that may run concurrently.

use serde::{Deserialize, Serialize};

/// One action-node execution unit within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub node_id: String,
    /// Variable-type nodes directly feeding this step, resolved without
    /// further recursion.
    pub variable_node_ids: Vec<String>,
}

/// One topological level of a flow. Steps in a job carry no ordering
/// dependency on each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub steps: Vec<Step>,
}

/// A compiled, schedulable pipeline derived from one connected component of
/// action nodes. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: String,
    pub nodes: Vec<String>,
    pub connections: Vec<String>,
    pub jobs: Vec<Job>,
}

impl Flow {
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.jobs
            .iter()
            .flat_map(|job| job.steps.iter())
            .find(|step| step.id == step_id)
    }

    pub fn job(&self, job_id: &str) -> Option<&Job> {
        self.jobs.iter().find(|job| job.id == job_id)
    }

    /// Node id of the first step of the first job, used as the flow's
    /// identity anchor across re-derivations.
    pub fn first_step_node(&self) -> Option<&str> {
        self.jobs
            .first()
            .and_then(|job| job.steps.first())
            .map(|step| step.node_id.as_str())
    }

    pub fn step_count(&self) -> usize {
        self.jobs.iter().map(|job| job.steps.len()).sum()
    }
}
