use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::Stage;

/// Named queues. `Runs` is the entry queue consumed by the orchestration
/// driver; the others feed the phase workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Runs,
    Dev,
    Review,
    Ops,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        QueueName::Runs,
        QueueName::Dev,
        QueueName::Review,
        QueueName::Ops,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Runs => "runs",
            Self::Dev => "dev",
            Self::Review => "review",
            Self::Ops => "ops",
        }
    }

    pub fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::Dev => Self::Dev,
            Stage::Review => Self::Review,
            Stage::Ops => Self::Ops,
        }
    }

    /// Stage fed by this queue. `None` for the entry queue.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Runs => None,
            Self::Dev => Some(Stage::Dev),
            Self::Review => Some(Stage::Review),
            Self::Ops => Some(Stage::Ops),
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "runs" => Ok(Self::Runs),
            "dev" => Ok(Self::Dev),
            "review" => Ok(Self::Review),
            "ops" => Ok(Self::Ops),
            _ => Err(format!("Invalid queue: {}", s)),
        }
    }
}

/// Body of every queued job. Optional fields fall back to the run's stored
/// values when the job is processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub run_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<i64>,
}

impl JobPayload {
    pub fn for_run(run_id: Uuid) -> Self {
        Self {
            run_id,
            target_repo: None,
            branch: None,
            pr_number: None,
        }
    }
}

/// A job handed to a consumer. `attempt` is 1-based and counts deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: i64,
    pub queue: QueueName,
    pub payload: JobPayload,
    pub attempt: u32,
    pub max_attempts: u32,
}

impl Job {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn delivery(&self) -> Delivery {
        Delivery {
            job_id: self.id,
            attempt: self.attempt,
        }
    }
}

/// One delivery of one job. A stage that is running belongs to exactly one
/// delivery; any other copy of the job must leave the run alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub job_id: i64,
    pub attempt: u32,
}

/// A job to be written together with a run mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub queue: QueueName,
    pub payload: JobPayload,
}

impl NewJob {
    pub fn new(queue: QueueName, payload: JobPayload) -> Self {
        Self { queue, payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_omits_empty_fields() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(JobPayload::for_run(id)).unwrap();
        assert_eq!(json, serde_json::json!({ "run_id": id.to_string() }));
    }

    #[test]
    fn test_queue_for_stage() {
        assert_eq!(QueueName::for_stage(Stage::Review), QueueName::Review);
        assert_eq!(QueueName::Ops.stage(), Some(Stage::Ops));
        assert_eq!(QueueName::Runs.stage(), None);
        assert_eq!("runs".parse::<QueueName>(), Ok(QueueName::Runs));
    }
}
