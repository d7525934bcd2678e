//! Queue consumers.
//!
//! Each queue gets one [`QueueConsumer`] driving a [`JobHandler`]. The
//! consumer owns delivery accounting: a handler only reports success or a
//! classified [`WorkerError`].

pub mod consumer;

use async_trait::async_trait;
use baton_common::{Job, QueueName};

use crate::errors::WorkerError;

pub use consumer::{ConsumerSettings, QueueConsumer};

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    fn queue(&self) -> QueueName;

    async fn handle(&self, job: &Job) -> Result<(), WorkerError>;
}
