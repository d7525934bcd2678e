use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::run::{Phase, RunStatus};
use crate::task::{Retries, Role, Task};

/// A node of the workflow graph.
///
/// The six sequence nodes run in [`NodeName::SEQUENCE`] order. `Escalate` is
/// the alternate sink reachable from any retry-governed node and `Replan` is
/// the synthetic node recorded when an iteration restarts at planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeName {
    Intake,
    Plan,
    DevExecute,
    Review,
    Ops,
    Report,
    Escalate,
    Replan,
}

impl NodeName {
    pub const SEQUENCE: [NodeName; 6] = [
        NodeName::Intake,
        NodeName::Plan,
        NodeName::DevExecute,
        NodeName::Review,
        NodeName::Ops,
        NodeName::Report,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Plan => "plan",
            Self::DevExecute => "dev-execute",
            Self::Review => "review",
            Self::Ops => "ops",
            Self::Report => "report",
            Self::Escalate => "escalate",
            Self::Replan => "replan",
        }
    }

    /// Index in the fixed sequence, `None` for the off-sequence nodes.
    pub fn position(&self) -> Option<usize> {
        Self::SEQUENCE.iter().position(|n| n == self)
    }

    /// The node that follows this one in the fixed sequence.
    pub fn next(&self) -> Option<NodeName> {
        self.position()
            .and_then(|idx| Self::SEQUENCE.get(idx + 1).copied())
    }

    /// Retry-governed nodes map to the role whose counter they consume.
    pub fn role(&self) -> Option<Role> {
        match self {
            Self::Plan => Some(Role::Plan),
            Self::DevExecute => Some(Role::Dev),
            Self::Review => Some(Role::Review),
            Self::Ops => Some(Role::Ops),
            _ => None,
        }
    }

    /// Coarse phase the run is in while this node executes.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Intake => Some(Phase::Intake),
            Self::Plan => Some(Phase::Plan),
            Self::DevExecute => Some(Phase::Dev),
            Self::Review => Some(Phase::Review),
            Self::Ops => Some(Phase::Ops),
            Self::Report => Some(Phase::Report),
            Self::Escalate | Self::Replan => None,
        }
    }

    /// Inverse of [`NodeName::phase`] for the sequence nodes.
    pub fn for_phase(phase: Phase) -> NodeName {
        match phase {
            Phase::Intake => Self::Intake,
            Phase::Plan => Self::Plan,
            Phase::Dev => Self::DevExecute,
            Phase::Review => Self::Review,
            Phase::Ops => Self::Ops,
            Phase::Report => Self::Report,
        }
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "intake" => Ok(Self::Intake),
            "plan" => Ok(Self::Plan),
            "dev-execute" => Ok(Self::DevExecute),
            "review" => Ok(Self::Review),
            "ops" => Ok(Self::Ops),
            "report" => Ok(Self::Report),
            "escalate" => Ok(Self::Escalate),
            "replan" => Ok(Self::Replan),
            _ => Err(format!("Invalid node: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Start,
    Complete,
    Fail,
    Blocked,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Fail => "fail",
            Self::Blocked => "blocked",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full copy of the run's workflow-relevant fields at the instant a step
/// was recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub status: RunStatus,
    pub phase: Phase,
    pub current_node: NodeName,
    pub retries: Retries,
    pub tasks: Vec<Task>,
    pub plan_summary: Option<String>,
    pub title: Option<String>,
    pub description: String,
    pub repo: String,
    pub branch: String,
    pub iteration: u32,
}

/// One entry of a run's append-only execution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub node: NodeName,
    pub transition: Transition,
    pub status: RunStatus,
    pub phase: Phase,
    pub current_node: NodeName,
    pub retries: Retries,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub snapshot: RunSnapshot,
    pub timestamp: DateTime<Utc>,
}

impl StepRecord {
    /// Build a step whose projection fields are taken from `snapshot`.
    pub fn capture(
        node: NodeName,
        transition: Transition,
        snapshot: RunSnapshot,
        reason: Option<String>,
    ) -> Self {
        Self {
            node,
            transition,
            status: snapshot.status,
            phase: snapshot.phase,
            current_node: snapshot.current_node,
            retries: snapshot.retries,
            reason,
            snapshot,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_next() {
        assert_eq!(NodeName::Intake.next(), Some(NodeName::Plan));
        assert_eq!(NodeName::Ops.next(), Some(NodeName::Report));
        assert_eq!(NodeName::Report.next(), None);
        assert_eq!(NodeName::Escalate.next(), None);
    }

    #[test]
    fn test_node_serde_is_kebab_case() {
        let json = serde_json::to_string(&NodeName::DevExecute).unwrap();
        assert_eq!(json, "\"dev-execute\"");
        let parsed: NodeName = serde_json::from_str("\"dev-execute\"").unwrap();
        assert_eq!(parsed, NodeName::DevExecute);
    }

    #[test]
    fn test_roles_only_on_governed_nodes() {
        let governed: Vec<_> = NodeName::SEQUENCE
            .iter()
            .filter(|n| n.role().is_some())
            .collect();
        assert_eq!(
            governed,
            vec![
                &NodeName::Plan,
                &NodeName::DevExecute,
                &NodeName::Review,
                &NodeName::Ops
            ]
        );
    }

    #[test]
    fn test_for_phase_inverts_phase() {
        for node in NodeName::SEQUENCE {
            let phase = node.phase().unwrap();
            assert_eq!(NodeName::for_phase(phase), node);
        }
    }
}
