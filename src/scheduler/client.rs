use std::time::Duration;

use crate::error::{KernelError, Result};
use crate::rpc::{ResponseEnvelope, RpcClient};
use crate::scheduler::{
    Capacity, HostAffinity, JobId, JobNotification, JobSpec, ReloadReport, SchedulerRequest,
    SchedulerResponse, SchedulerStatus, ServiceOutcome, ServiceSpec, TaskId,
};
use crate::transport::{ChannelId, Wait};

/// Outcome of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartedJob {
    pub job_id: JobId,
    pub placed: u32,
    pub requested: u32,
}

impl StartedJob {
    pub fn is_partial(&self) -> bool {
        self.placed < self.requested
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerClient {
    rpc: RpcClient,
    scheduler: ChannelId,
    timeout: Duration,
}

impl SchedulerClient {
    pub fn new(rpc: RpcClient, scheduler: ChannelId, timeout: Duration) -> Self {
        Self {
            rpc,
            scheduler,
            timeout,
        }
    }

    pub async fn start(&self, spec: JobSpec) -> Result<StartedJob> {
        self.start_request(spec, None).await
    }

    /// Start a job and have its finish notification sent to `notify`, a
    /// channel the caller holds.
    pub async fn start_with_notify(&self, spec: JobSpec, notify: ChannelId) -> Result<StartedJob> {
        self.start_request(spec, Some(notify)).await
    }

    /// Report a task as done. Fire-and-forget.
    pub async fn task_finished(&self, job_id: JobId, task_id: TaskId, crash: bool) -> Result<()> {
        self.rpc
            .send(
                self.scheduler,
                &SchedulerRequest::TaskFinished {
                    job_id,
                    task_id,
                    crash,
                },
            )
            .await
            .map(|_| ())
    }

    /// Kill every task of a job. Returns how many tasks it had.
    pub async fn kill_job(&self, job_id: JobId) -> Result<usize> {
        match self.call(&SchedulerRequest::KillJob { job_id }).await? {
            SchedulerResponse::Killed { tasks, .. } => Ok(tasks),
            SchedulerResponse::JobNotFound { job_id } => Err(KernelError::JobNotFound(job_id)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn capacity(&self, affinity: Option<HostAffinity>) -> Result<Vec<Capacity>> {
        match self.call(&SchedulerRequest::Capacity { affinity }).await? {
            SchedulerResponse::Capacity { nodes } => Ok(nodes),
            other => Err(unexpected(other)),
        }
    }

    pub async fn status(&self) -> Result<SchedulerStatus> {
        match self.call(&SchedulerRequest::Status).await? {
            SchedulerResponse::Status { jobs, services } => Ok(SchedulerStatus { jobs, services }),
            other => Err(unexpected(other)),
        }
    }

    pub async fn reload_services(&self, catalog: Option<Vec<ServiceSpec>>) -> Result<ReloadReport> {
        match self.call(&SchedulerRequest::ReloadServices { catalog }).await? {
            SchedulerResponse::Reloaded { report } => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    pub async fn enable_service(&self, name: &str) -> Result<ServiceOutcome> {
        self.service(SchedulerRequest::EnableService { name: name.into() }).await
    }

    pub async fn disable_service(&self, name: &str) -> Result<ServiceOutcome> {
        self.service(SchedulerRequest::DisableService { name: name.into() }).await
    }

    pub async fn start_service(&self, name: &str) -> Result<ServiceOutcome> {
        self.service(SchedulerRequest::StartService { name: name.into() }).await
    }

    pub async fn stop_service(&self, name: &str) -> Result<ServiceOutcome> {
        self.service(SchedulerRequest::StopService { name: name.into() }).await
    }

    /// Wait on `channel` for the finish notification of `job_id`.
    pub async fn wait_for_finish(&self, channel: ChannelId, job_id: JobId, wait: Wait) -> Result<JobNotification> {
        self.rpc
            .receive(channel, wait, |envelope: &ResponseEnvelope<JobNotification>| {
                envelope.body.job_id() == job_id
            })
            .await
    }

    async fn start_request(&self, spec: JobSpec, finish_notify: Option<ChannelId>) -> Result<StartedJob> {
        match self
            .call(&SchedulerRequest::Start {
                spec,
                finish_notify,
            })
            .await?
        {
            SchedulerResponse::Started {
                job_id,
                placed,
                requested,
            } => Ok(StartedJob {
                job_id,
                placed,
                requested,
            }),
            other => Err(unexpected(other)),
        }
    }

    async fn service(&self, request: SchedulerRequest) -> Result<ServiceOutcome> {
        match self.call(&request).await? {
            SchedulerResponse::Service { outcome, .. } => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    async fn call(&self, request: &SchedulerRequest) -> Result<SchedulerResponse> {
        self.rpc
            .call(self.scheduler, request, Wait::For(self.timeout))
            .await
    }
}

fn unexpected(response: SchedulerResponse) -> KernelError {
    match response {
        SchedulerResponse::Rejected { reason } => KernelError::Rejected(reason),
        other => KernelError::InvalidResponse(format!("unexpected scheduler response {other:?}")),
    }
}
