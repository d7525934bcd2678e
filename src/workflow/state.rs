//! Explicit workflow state and the reducer that merges node patches into it.
//!
//! Merge rules: scalar fields are last-write-wins, `logs` appends, and
//! `metadata` is shallow-merged key by key.

use baton_common::{
    NodeName, Phase, Retries, RiskSignals, Run, RunSnapshot, RunStatus, Task,
};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowState {
    pub run_id: Uuid,
    pub repo: String,
    pub branch: String,
    pub title: Option<String>,
    pub description: String,
    pub plan_summary: Option<String>,
    pub status: RunStatus,
    pub phase: Phase,
    pub current_node: NodeName,
    pub retries: Retries,
    pub tasks: Vec<Task>,
    pub iteration: u32,
    pub max_iterations: u32,
    pub signals: RiskSignals,
    pub logs: Vec<String>,
    pub metadata: Map<String, Value>,
}

impl WorkflowState {
    pub fn from_run(run: &Run) -> Self {
        Self {
            run_id: run.id,
            repo: run.repo.clone(),
            branch: run.branch.clone(),
            title: run.title.clone(),
            description: run.description.clone(),
            plan_summary: run.plan_summary.clone(),
            status: run.status,
            phase: run.phase,
            current_node: run.current_node,
            retries: run.retries,
            tasks: run.tasks.clone(),
            iteration: run.iteration.max(1),
            max_iterations: run.max_iterations,
            signals: run.signals,
            logs: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            status: self.status,
            phase: self.phase,
            current_node: self.current_node,
            retries: self.retries,
            tasks: self.tasks.clone(),
            plan_summary: self.plan_summary.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            repo: self.repo.clone(),
            branch: self.branch.clone(),
            iteration: self.iteration,
        }
    }

    /// Merge a patch into this state in place.
    pub fn apply(&mut self, patch: StatePatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(phase) = patch.phase {
            self.phase = phase;
        }
        if let Some(node) = patch.current_node {
            self.current_node = node;
        }
        if let Some(summary) = patch.plan_summary {
            self.plan_summary = Some(summary);
        }
        if let Some(tasks) = patch.tasks {
            self.tasks = tasks;
        }
        if let Some(retries) = patch.retries {
            self.retries = retries;
        }
        if let Some(iteration) = patch.iteration {
            self.iteration = iteration;
        }
        self.logs.extend(patch.logs);
        for (key, value) in patch.metadata {
            self.metadata.insert(key, value);
        }
    }

    /// Copy the non-projection workflow fields onto a persisted run.
    /// Status, phase, node and retries travel with the recorded step.
    pub fn project_onto(&self, run: &mut Run) {
        run.plan_summary = self.plan_summary.clone();
        run.tasks = self.tasks.clone();
        run.iteration = self.iteration;
    }
}

/// Pure reducer form of [`WorkflowState::apply`].
pub fn reduce(mut state: WorkflowState, patch: StatePatch) -> WorkflowState {
    state.apply(patch);
    state
}

/// Partial update produced by a node transform.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub status: Option<RunStatus>,
    pub phase: Option<Phase>,
    pub current_node: Option<NodeName>,
    pub plan_summary: Option<String>,
    pub tasks: Option<Vec<Task>>,
    pub retries: Option<Retries>,
    pub iteration: Option<u32>,
    pub logs: Vec<String>,
    pub metadata: Map<String, Value>,
}

impl StatePatch {
    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn plan_summary(mut self, summary: impl Into<String>) -> Self {
        self.plan_summary = Some(summary.into());
        self
    }

    pub fn tasks(mut self, tasks: Vec<Task>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn log(mut self, line: impl Into<String>) -> Self {
        self.logs.push(line.into());
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}
