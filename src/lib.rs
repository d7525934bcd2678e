//! Baton: a queue-driven run orchestrator.
//!
//! A run is submitted through [`intake`], advanced through intake and plan by
//! the [`driver`], then carried through dev, review and ops by the phase
//! [`workers`], each consuming its own durable [`queue`]. Failures are judged
//! by the [`hitl`] policy; escalated runs wait for an explicit [`unblock`].

pub mod codehost;
pub mod commands;
pub mod config;
pub mod driver;
pub mod errors;
pub mod hitl;
pub mod intake;
pub mod logging;
pub mod queue;
pub mod store;
pub mod unblock;
pub mod workers;
pub mod workflow;
pub mod workspace;
