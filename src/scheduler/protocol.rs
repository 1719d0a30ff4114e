use serde::{Deserialize, Serialize};

use crate::scheduler::{
    Capacity, HostAffinity, Job, JobId, JobSpec, ServiceOutcome, ServiceSpec, ServiceState, TaskId,
};
use crate::transport::ChannelId;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerRequest {
    Start {
        spec: JobSpec,
        /// Channel that receives one [`JobNotification`] when the job ends
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_notify: Option<ChannelId>,
    },
    /// Sent by tasks as a notification; never answered
    TaskFinished {
        job_id: JobId,
        task_id: TaskId,
        #[serde(default)]
        crash: bool,
    },
    KillJob {
        job_id: JobId,
    },
    Capacity {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        affinity: Option<HostAffinity>,
    },
    Status,
    /// Re-read the service catalog, from `catalog` if given or else from
    /// the configured file
    ReloadServices {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        catalog: Option<Vec<ServiceSpec>>,
    },
    EnableService {
        name: String,
    },
    DisableService {
        name: String,
    },
    StartService {
        name: String,
    },
    StopService {
        name: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerResponse {
    /// `placed` may be below `requested`. A job with nothing placed is not
    /// stored.
    Started {
        job_id: JobId,
        placed: u32,
        requested: u32,
    },
    Killed {
        job_id: JobId,
        tasks: usize,
    },
    JobNotFound {
        job_id: JobId,
    },
    Capacity {
        nodes: Vec<Capacity>,
    },
    Status {
        jobs: Vec<Job>,
        services: Vec<ServiceState>,
    },
    Reloaded {
        report: ReloadReport,
    },
    Service {
        name: String,
        outcome: ServiceOutcome,
    },
    Rejected {
        reason: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub restarted: Vec<String>,
    /// Enabled services that could not be started
    pub failed: Vec<String>,
}

/// Pushed to a job's finish channel, without a request id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobNotification {
    Finished {
        job_id: JobId,
        /// Whether the job ended through kill_job
        #[serde(default)]
        killed: bool,
    },
}

impl JobNotification {
    pub fn job_id(&self) -> JobId {
        match self {
            JobNotification::Finished { job_id, .. } => *job_id,
        }
    }
}

/// Jobs and services as currently stored.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerStatus {
    pub jobs: Vec<Job>,
    pub services: Vec<ServiceState>,
}
