use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::Delivery;
use crate::step::{NodeName, RunSnapshot, StepRecord, Transition};
use crate::task::{Retries, Role, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    AwaitingUnblock,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::AwaitingUnblock => "awaiting_unblock",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "awaiting_unblock" => Ok(Self::AwaitingUnblock),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// Coarse pipeline stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Intake,
    Plan,
    Dev,
    Review,
    Ops,
    Report,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Plan => "plan",
            Self::Dev => "dev",
            Self::Review => "review",
            Self::Ops => "ops",
            Self::Report => "report",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "intake" => Ok(Self::Intake),
            "plan" => Ok(Self::Plan),
            "dev" => Ok(Self::Dev),
            "review" => Ok(Self::Review),
            "ops" => Ok(Self::Ops),
            "report" => Ok(Self::Report),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

/// The three queue-driven stages handled by phase workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Dev,
    Review,
    Ops,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Dev, Stage::Review, Stage::Ops];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Review => "review",
            Self::Ops => "ops",
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            Self::Dev => Phase::Dev,
            Self::Review => Phase::Review,
            Self::Ops => Phase::Ops,
        }
    }

    pub fn node(&self) -> NodeName {
        match self {
            Self::Dev => NodeName::DevExecute,
            Self::Review => NodeName::Review,
            Self::Ops => NodeName::Ops,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Self::Dev => Role::Dev,
            Self::Review => Role::Review,
            Self::Ops => Role::Ops,
        }
    }

    /// Stage that receives the handoff after this one succeeds.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Self::Dev => Some(Self::Review),
            Self::Review => Some(Self::Ops),
            Self::Ops => None,
        }
    }

    pub fn from_phase(phase: Phase) -> Option<Stage> {
        match phase {
            Phase::Dev => Some(Self::Dev),
            Phase::Review => Some(Self::Review),
            Phase::Ops => Some(Self::Ops),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dev" => Ok(Self::Dev),
            "review" => Ok(Self::Review),
            "ops" => Ok(Self::Ops),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Queued,
    Running,
    Done,
    Blocked,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Blocked => "blocked",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStatuses {
    pub dev: StageStatus,
    pub review: StageStatus,
    pub ops: StageStatus,
}

impl StageStatuses {
    pub fn get(&self, stage: Stage) -> StageStatus {
        match stage {
            Stage::Dev => self.dev,
            Stage::Review => self.review,
            Stage::Ops => self.ops,
        }
    }

    pub fn set(&mut self, stage: Stage, status: StageStatus) {
        match stage {
            Stage::Dev => self.dev = status,
            Stage::Review => self.review = status,
            Stage::Ops => self.ops = status,
        }
    }
}

/// Risk flags raised at intake and consulted by the escalation policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskSignals {
    #[serde(default)]
    pub missing_secret: bool,
    #[serde(default)]
    pub destructive_change: bool,
    #[serde(default)]
    pub ambiguous_spec: bool,
}

impl RiskSignals {
    pub fn any(&self) -> bool {
        self.missing_secret || self.destructive_change || self.ambiguous_spec
    }
}

/// Request to create a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewRun {
    pub repo: String,
    pub description: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub signals: RiskSignals,
}

/// Persisted record of one run: the projection plus its full step history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub repo: String,
    pub branch: String,
    pub title: Option<String>,
    pub description: String,
    pub source: String,
    pub plan_summary: Option<String>,
    pub status: RunStatus,
    pub phase: Phase,
    pub current_node: NodeName,
    pub retries: Retries,
    pub tasks: Vec<Task>,
    pub iteration: u32,
    pub max_iterations: u32,
    pub history: Vec<StepRecord>,
    pub signals: RiskSignals,
    pub stages: StageStatuses,
    pub pr_number: Option<i64>,
    pub blocked_reason: Option<String>,
    pub escalated: bool,
    pub last_error: Option<String>,
    /// Delivery currently running the active stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_delivery: Option<Delivery>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_SOURCE: &str = "manual";

impl Run {
    pub fn new(id: Uuid, request: NewRun, max_iterations: u32) -> Self {
        let now = Utc::now();
        Self {
            id,
            repo: request.repo,
            branch: request
                .branch
                .filter(|b| !b.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
            title: request.title,
            description: request.description,
            source: request.source.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            plan_summary: None,
            status: RunStatus::Queued,
            phase: Phase::Intake,
            current_node: NodeName::Intake,
            retries: Retries::default(),
            tasks: Vec::new(),
            iteration: 1,
            max_iterations,
            history: Vec::new(),
            signals: request.signals,
            stages: StageStatuses::default(),
            pr_number: None,
            blocked_reason: None,
            escalated: false,
            last_error: None,
            active_delivery: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Append a step and move the projection to match it.
    ///
    /// This is the only place `status`, `phase`, `current_node` and `retries`
    /// change, so the projection always equals the last recorded step.
    pub fn record_step(&mut self, step: StepRecord) {
        self.status = step.status;
        self.phase = step.phase;
        self.current_node = step.current_node;
        self.retries = step.retries;
        self.updated_at = step.timestamp;
        if self.started_at.is_none() && step.status == RunStatus::Running {
            self.started_at = Some(step.timestamp);
        }
        if step.status.is_terminal() {
            self.completed_at = Some(step.timestamp);
        }
        self.history.push(step);
    }

    pub fn last_step(&self) -> Option<&StepRecord> {
        self.history.last()
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

    /// Snapshot with the projection fields replaced by the step being recorded.
    pub fn snapshot_at(&self, status: RunStatus, phase: Phase, node: NodeName) -> RunSnapshot {
        RunSnapshot {
            status,
            phase,
            current_node: node,
            ..self.snapshot()
        }
    }

    /// Record a step at `node` carrying the run's current retries and tasks.
    /// The phase follows the node, or stays put for nodes outside the
    /// sequence.
    pub fn record(
        &mut self,
        node: NodeName,
        transition: Transition,
        status: RunStatus,
        reason: Option<String>,
    ) {
        let phase = node.phase().unwrap_or(self.phase);
        let snapshot = self.snapshot_at(status, phase, node);
        self.record_step(StepRecord::capture(node, transition, snapshot, reason));
    }

    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }
}
