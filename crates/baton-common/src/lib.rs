//! Shared domain types for the Baton run pipeline: runs and their step
//! history, tasks and retry counters, audit events and queued jobs.

pub mod event;
pub mod job;
pub mod run;
pub mod step;
pub mod task;

pub use event::{Event, NewEvent};
pub use job::{Delivery, Job, JobPayload, NewJob, QueueName};
pub use run::{
    NewRun, Phase, RiskSignals, Run, RunStatus, Stage, StageStatus, StageStatuses,
    DEFAULT_BRANCH, DEFAULT_SOURCE,
};
pub use step::{NodeName, RunSnapshot, StepRecord, Transition};
pub use task::{Retries, Role, Task, TaskStatus, set_role_status};
