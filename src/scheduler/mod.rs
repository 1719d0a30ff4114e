//! Scheduler actor: job placement, completion tracking and service
//! supervision.
//!
//! Components:
//! - [`capacity`]: breadth-first node discovery and host affinity ordering
//! - [`assigner`]: ranking nodes and greedily placing threads
//! - [`watchdog`]: detecting tasks and services whose process died
//! - [`services`]: the declarative service catalog and per-service state
//! - [`SchedulerActor`] / [`SchedulerClient`]: the actor and its callers

pub mod actor;
pub mod assigner;
pub mod capacity;
pub mod client;
pub mod job;
pub mod protocol;
pub mod services;
pub mod state;
pub mod watchdog;

pub use actor::{SchedulerActor, SchedulerTimer};
pub use capacity::Capacity;
pub use client::{SchedulerClient, StartedJob};
pub use job::{HostAffinity, Job, JobId, JobSpec, Task, TaskId};
pub use protocol::{
    JobNotification, ReloadReport, SchedulerRequest, SchedulerResponse, SchedulerStatus,
};
pub use services::{ServiceOutcome, ServiceSpec, ServiceState, ServiceStatus};
pub use state::SchedulerState;
