use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The role a unit of work belongs to. Every retry-governed node maps to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Plan,
    Dev,
    Review,
    Ops,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Plan, Role::Dev, Role::Review, Role::Ops];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Dev => "dev",
            Self::Review => "review",
            Self::Ops => "ops",
        }
    }

    /// Maximum number of times a node of this role may be entered per iteration.
    pub fn retry_ceiling(&self) -> u32 {
        match self {
            Self::Plan => 2,
            Self::Dev => 2,
            Self::Review => 1,
            Self::Ops => 1,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "dev" => Ok(Self::Dev),
            "review" => Ok(Self::Review),
            "ops" => Ok(Self::Ops),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Blocked => "blocked",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "blocked" => Ok(Self::Blocked),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub title: String,
    pub role: Role,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Task {
    pub fn new(title: impl Into<String>, role: Role, status: TaskStatus) -> Self {
        Self {
            title: title.into(),
            role,
            status,
            notes: None,
        }
    }
}

/// Set the status of every task owned by `role`. Returns how many were touched.
pub fn set_role_status(tasks: &mut [Task], role: Role, status: TaskStatus) -> usize {
    let mut touched = 0;
    for task in tasks.iter_mut().filter(|t| t.role == role) {
        task.status = status;
        touched += 1;
    }
    touched
}

/// Per-role retry counters. Reset to zero only when a run is replanned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retries {
    pub plan: u32,
    pub dev: u32,
    pub review: u32,
    pub ops: u32,
}

impl Retries {
    pub fn get(&self, role: Role) -> u32 {
        match role {
            Role::Plan => self.plan,
            Role::Dev => self.dev,
            Role::Review => self.review,
            Role::Ops => self.ops,
        }
    }

    pub fn set(&mut self, role: Role, value: u32) {
        match role {
            Role::Plan => self.plan = value,
            Role::Dev => self.dev = value,
            Role::Review => self.review = value,
            Role::Ops => self.ops = value,
        }
    }
}

impl fmt::Display for Retries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "plan={} dev={} review={} ops={}",
            self.plan, self.dev, self.review, self.ops
        )
    }
}
