use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::cluster::{Cluster, ProcessHandle};
use crate::config::SchedulerConfig;
use crate::database::{DbClient, Document, LockLease};
use crate::error::{KernelError, Result};
use crate::rpc::{Actor, RequestEnvelope, Responder};
use crate::scheduler::services::{diff_catalog, load_catalog, validate_catalog, CatalogChange};
use crate::scheduler::state::TaskFinish;
use crate::scheduler::{
    assigner, capacity, watchdog, HostAffinity, Job, JobId, JobNotification, JobSpec, ReloadReport,
    SchedulerRequest, SchedulerResponse, ServiceOutcome, ServiceSpec, ServiceState, Task, TaskId,
};
use crate::transport::{ChannelId, Wait};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerTimer {
    /// Look for tasks whose process died
    TaskWatch,
    /// Check running services and restart crashed ones
    ServiceReview,
}

#[derive(Debug, Clone, Copy)]
enum ServiceOp {
    Enable,
    Disable,
    Start,
    Stop,
}

/// Places jobs on the cluster and supervises services.
///
/// All scheduler state lives in the shared document. Every mutation takes
/// the database lock, works on the granted snapshot and writes it back, so
/// capacity is always derived after the lock is held.
pub struct SchedulerActor {
    cluster: Arc<dyn Cluster>,
    db: DbClient,
    responder: Responder,
    config: SchedulerConfig,
    rng: StdRng,
}

impl SchedulerActor {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        db: DbClient,
        responder: Responder,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            cluster,
            db,
            responder,
            config,
            rng: StdRng::from_entropy(),
        }
    }

    /// Fix the placement shuffle for reproducible runs.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    fn lock_wait(&self) -> Wait {
        Wait::from_timeout(self.config.lock_timeout_ms.map(Duration::from_millis))
    }

    fn cost_per_thread(&self, executable: &str) -> Result<f64> {
        match self.cluster.script_cost(executable, 1) {
            Some(cost) if cost.is_finite() && cost > 0.0 => Ok(cost),
            _ => Err(KernelError::Rejected(format!(
                "no memory cost known for {executable}"
            ))),
        }
    }

    fn launch(&self, executable: &str, host: &str, threads: u32, args: &[String]) -> Option<ProcessHandle> {
        if !self.cluster.copy_executable(executable, host) {
            tracing::warn!(host, executable, "Failed to copy executable");
            return None;
        }
        match self.cluster.spawn(executable, host, threads, args) {
            Ok(process) => Some(process),
            Err(e) => {
                tracing::warn!(host, executable, threads, error = %e, "Spawn failed");
                None
            }
        }
    }

    /// Kill `process`. A process that is already gone counts as stopped.
    fn stop_process(&self, process: &ProcessHandle) -> bool {
        self.cluster.kill(process) || !self.cluster.is_running(process)
    }

    /// Rank nodes, then spawn tasks into `job` until its threads are placed
    /// or the nodes run out.
    fn place_job(&mut self, job: &mut Job, cost: f64) -> u32 {
        let root = self.cluster.root();
        let capacities = capacity::discover(self.cluster.as_ref(), self.config.root_reserved_mem);
        let ranked = assigner::rank(
            capacities,
            job.spec.threads,
            cost,
            job.spec.host_affinity.as_ref(),
            &root,
            &mut self.rng,
        );

        let spec = job.spec.clone();
        let job_id = job.id;
        let mut next_task: TaskId = 0;
        assigner::place(&ranked, spec.threads, cost, |node, threads| {
            let args = spec.task_args(job_id, next_task);
            let Some(process) = self.launch(&spec.executable, &node.hostname, threads, &args) else {
                return false;
            };
            job.tasks.insert(
                next_task,
                Task {
                    id: next_task,
                    hostname: node.hostname.clone(),
                    threads,
                    process,
                },
            );
            next_task += 1;
            true
        })
    }

    fn spawn_service(&mut self, spec: &ServiceSpec) -> Option<ProcessHandle> {
        let cost = match self.cost_per_thread(spec.executable()) {
            Ok(cost) => cost,
            Err(e) => {
                tracing::warn!(service = %spec.name, error = %e, "Cannot place service");
                return None;
            }
        };
        let root = self.cluster.root();
        let capacities = capacity::discover(self.cluster.as_ref(), self.config.root_reserved_mem);
        let ranked = assigner::rank(
            capacities,
            1,
            cost,
            spec.host_affinity.as_ref(),
            &root,
            &mut self.rng,
        );

        let args = spec.launch_args();
        let mut started = None;
        assigner::place(&ranked, 1, cost, |node, threads| {
            started = self.launch(spec.executable(), &node.hostname, threads, &args);
            started.is_some()
        });
        started
    }

    fn start_service(&mut self, state: &mut ServiceState) -> Option<ProcessHandle> {
        let process = self.spawn_service(&state.spec)?;
        tracing::info!(service = %state.spec.name, host = %process.hostname, pid = process.pid, "Service started");
        state.mark_running(process.clone());
        Some(process)
    }

    fn stop_service(&self, state: &mut ServiceState) -> bool {
        let Some(process) = state.process().cloned() else {
            return true;
        };
        if !self.stop_process(&process) {
            tracing::warn!(service = %state.spec.name, pid = process.pid, "Failed to kill service");
            return false;
        }
        tracing::info!(service = %state.spec.name, "Service stopped");
        state.mark_stopped();
        true
    }

    /// Write `document` back and release the lock. If the write fails,
    /// everything spawned under this lease is killed so no process runs
    /// without a record.
    async fn commit(&self, lease: LockLease, document: Document, spawned: &[ProcessHandle]) -> Result<()> {
        let Err(e) = self.db.write_and_unlock(lease, document).await else {
            return Ok(());
        };
        if !spawned.is_empty() {
            tracing::warn!(error = %e, processes = spawned.len(), "Commit failed, killing processes spawned under the lease");
        }
        for process in spawned {
            if !self.stop_process(process) {
                tracing::error!(host = %process.hostname, pid = process.pid, "Failed to kill uncommitted process");
            }
        }
        Err(e)
    }

    fn notify(&self, channel: ChannelId, notification: JobNotification) {
        let responder = self.responder.clone();
        tokio::spawn(async move {
            responder.respond(channel, None, &notification).await;
        });
    }

    async fn start(&mut self, spec: JobSpec, finish_notify: Option<ChannelId>) -> Result<SchedulerResponse> {
        if spec.threads == 0 {
            return Err(KernelError::Rejected("job requests zero threads".into()));
        }
        let cost = self.cost_per_thread(&spec.executable)?;

        let lease = self.db.lock(self.lock_wait()).await?;
        let mut document = lease.document().clone();
        let mut job = Job::new(JobId::new(), spec, finish_notify);
        let job_id = job.id;
        let requested = job.spec.threads;
        let placed = self.place_job(&mut job, cost);

        if placed == 0 {
            self.db.unlock(lease).await?;
            tracing::warn!(job_id = %job_id, executable = %job.spec.executable, requested, "No capacity for job");
            if let Some(channel) = finish_notify {
                self.notify(channel, JobNotification::Finished { job_id, killed: false });
            }
        } else {
            tracing::info!(
                job_id = %job_id,
                executable = %job.spec.executable,
                placed,
                requested,
                tasks = job.tasks.len(),
                "Job started"
            );
            let spawned: Vec<ProcessHandle> = job.tasks.values().map(|task| task.process.clone()).collect();
            document.scheduler_mut().jobs.insert(job_id, job);
            self.commit(lease, document, &spawned).await?;
        }

        Ok(SchedulerResponse::Started {
            job_id,
            placed,
            requested,
        })
    }

    async fn task_finished(&mut self, job_id: JobId, task_id: TaskId, crash: bool) -> Result<()> {
        let lease = self.db.lock(self.lock_wait()).await?;
        let mut document = lease.document().clone();

        match document.scheduler_mut().finish_task(job_id, task_id) {
            TaskFinish::UnknownJob | TaskFinish::UnknownTask => {
                tracing::warn!(job_id = %job_id, task_id, "Ignoring completion of unknown task");
                self.db.unlock(lease).await
            }
            TaskFinish::Removed { finished } => {
                if crash {
                    tracing::warn!(job_id = %job_id, task_id, "Task crashed");
                } else {
                    tracing::debug!(job_id = %job_id, task_id, "Task finished");
                }
                self.db.write_and_unlock(lease, document).await?;
                if let Some(job) = finished {
                    self.job_done(&job, false);
                }
                Ok(())
            }
        }
    }

    fn job_done(&self, job: &Job, killed: bool) {
        tracing::info!(job_id = %job.id, killed, "Job finished");
        if let Some(channel) = job.finish_notify {
            self.notify(
                channel,
                JobNotification::Finished {
                    job_id: job.id,
                    killed,
                },
            );
        }
    }

    async fn kill_job(&mut self, job_id: JobId) -> Result<SchedulerResponse> {
        let lease = self.db.lock(self.lock_wait()).await?;
        let mut document = lease.document().clone();

        let Some(job) = document.scheduler_mut().jobs.remove(&job_id) else {
            self.db.unlock(lease).await?;
            return Ok(SchedulerResponse::JobNotFound { job_id });
        };
        for task in job.tasks.values() {
            if !self.stop_process(&task.process) {
                tracing::warn!(job_id = %job_id, task_id = task.id, pid = task.process.pid, "Failed to kill task");
            }
        }
        self.db.write_and_unlock(lease, document).await?;
        self.job_done(&job, true);

        Ok(SchedulerResponse::Killed {
            job_id,
            tasks: job.tasks.len(),
        })
    }

    fn capacity(&self, affinity: Option<&HostAffinity>) -> SchedulerResponse {
        let nodes = capacity::discover(self.cluster.as_ref(), self.config.root_reserved_mem);
        SchedulerResponse::Capacity {
            nodes: capacity::apply_host_affinity(nodes, affinity, &self.cluster.root()),
        }
    }

    async fn status(&self) -> Result<SchedulerResponse> {
        let document = self.db.read().await?;
        let state = document.scheduler();
        Ok(SchedulerResponse::Status {
            jobs: state.jobs.values().cloned().collect(),
            services: state.services.values().cloned().collect(),
        })
    }

    /// Finish every task whose process is gone. The cheap unlocked read
    /// avoids taking the lock when nothing crashed.
    async fn watch_tasks(&mut self) -> Result<()> {
        let snapshot = self.db.read().await?;
        if watchdog::crashed_tasks(snapshot.scheduler(), self.cluster.as_ref()).is_empty() {
            return Ok(());
        }

        let lease = self.db.lock(self.lock_wait()).await?;
        let mut document = lease.document().clone();
        let crashed = watchdog::crashed_tasks(document.scheduler(), self.cluster.as_ref());
        let mut finished = Vec::new();
        for (job_id, task_id) in crashed {
            tracing::warn!(job_id = %job_id, task_id, "Task process is gone, finishing as crashed");
            if let TaskFinish::Removed { finished: Some(job) } =
                document.scheduler_mut().finish_task(job_id, task_id)
            {
                finished.push(job);
            }
        }
        self.db.write_and_unlock(lease, document).await?;

        for job in &finished {
            self.job_done(job, false);
        }
        Ok(())
    }

    async fn reload_services(&mut self, catalog: Option<Vec<ServiceSpec>>) -> Result<ReloadReport> {
        let catalog = match (catalog, &self.config.services_path) {
            (Some(catalog), _) => {
                validate_catalog(&catalog)?;
                catalog
            }
            (None, Some(path)) => load_catalog(path)?,
            (None, None) => {
                return Err(KernelError::Misconfigured("no service catalog configured".into()));
            }
        };

        let lease = self.db.lock(self.lock_wait()).await?;
        let mut document = lease.document().clone();
        let changes = diff_catalog(&catalog, &document.scheduler().services);
        let services = &mut document.scheduler_mut().services;
        let mut report = ReloadReport::default();
        let mut spawned = Vec::new();

        for change in changes {
            match change {
                CatalogChange::Added(spec) => {
                    let name = spec.name.clone();
                    let mut state = ServiceState::discovered(spec);
                    if state.enabled {
                        match self.start_service(&mut state) {
                            Some(process) => spawned.push(process),
                            None => report.failed.push(name.clone()),
                        }
                    }
                    services.insert(name.clone(), state);
                    report.added.push(name);
                }
                CatalogChange::Removed(name) => {
                    let Some(state) = services.get_mut(&name) else {
                        continue;
                    };
                    // A service that survives the kill stays listed
                    if self.stop_service(state) {
                        services.remove(&name);
                        report.removed.push(name);
                    } else {
                        report.failed.push(name);
                    }
                }
                CatalogChange::Changed(spec) => {
                    let name = spec.name.clone();
                    let Some(state) = services.get_mut(&name) else {
                        continue;
                    };
                    if !self.stop_service(state) {
                        report.failed.push(name);
                        continue;
                    }
                    state.spec = spec;
                    if state.enabled {
                        match self.start_service(state) {
                            Some(process) => spawned.push(process),
                            None => report.failed.push(name.clone()),
                        }
                    }
                    report.restarted.push(name);
                }
            }
        }
        self.commit(lease, document, &spawned).await?;

        tracing::info!(
            added = report.added.len(),
            removed = report.removed.len(),
            restarted = report.restarted.len(),
            failed = report.failed.len(),
            "Services reloaded"
        );
        Ok(report)
    }

    async fn review_services(&mut self) -> Result<()> {
        let snapshot = self.db.read().await?;
        let crashed = watchdog::crashed_services(snapshot.scheduler(), self.cluster.as_ref());
        let pending = snapshot.scheduler().services.values().any(ServiceState::wants_restart);
        if crashed.is_empty() && !pending {
            return Ok(());
        }

        let lease = self.db.lock(self.lock_wait()).await?;
        let mut document = lease.document().clone();
        let crashed = watchdog::crashed_services(document.scheduler(), self.cluster.as_ref());
        let services = &mut document.scheduler_mut().services;

        for name in &crashed {
            if let Some(state) = services.get_mut(name) {
                state.mark_crashed();
                if state.enabled {
                    tracing::warn!(service = %name, "Service crashed, restarting");
                } else {
                    tracing::error!(service = %name, "Service crashed and is disabled, leaving it down");
                }
            }
        }
        let mut spawned = Vec::new();
        for (name, state) in services.iter_mut() {
            if !state.wants_restart() {
                continue;
            }
            match self.start_service(state) {
                Some(process) => spawned.push(process),
                None => tracing::warn!(service = %name, "Service failed to start"),
            }
        }
        self.commit(lease, document, &spawned).await
    }

    async fn service_op(&mut self, name: &str, op: ServiceOp) -> Result<ServiceOutcome> {
        let lease = self.db.lock(self.lock_wait()).await?;
        let mut document = lease.document().clone();
        let Some(state) = document.scheduler_mut().services.get_mut(name) else {
            self.db.unlock(lease).await?;
            return Ok(ServiceOutcome::NotFound);
        };

        if state
            .process()
            .is_some_and(|process| !self.cluster.is_running(process))
        {
            state.mark_crashed();
        }

        let mut spawned = None;
        let outcome = match op {
            ServiceOp::Enable if state.enabled => ServiceOutcome::AlreadyEnabled,
            ServiceOp::Enable => {
                state.enabled = true;
                if state.is_running() {
                    ServiceOutcome::Ok
                } else {
                    spawned = self.start_service(state);
                    started_outcome(spawned.is_some())
                }
            }
            ServiceOp::Disable if !state.enabled => ServiceOutcome::AlreadyDisabled,
            ServiceOp::Disable => {
                state.enabled = false;
                if self.stop_service(state) {
                    ServiceOutcome::Ok
                } else {
                    ServiceOutcome::KillFailed
                }
            }
            ServiceOp::Start if state.is_running() => ServiceOutcome::AlreadyRunning,
            ServiceOp::Start => {
                spawned = self.start_service(state);
                started_outcome(spawned.is_some())
            }
            ServiceOp::Stop if !state.is_running() => ServiceOutcome::NotRunning,
            ServiceOp::Stop => {
                if self.stop_service(state) {
                    ServiceOutcome::Ok
                } else {
                    ServiceOutcome::KillFailed
                }
            }
        };

        tracing::info!(service = name, ?op, ?outcome, "Service request handled");
        self.commit(lease, document, spawned.as_slice()).await?;
        Ok(outcome)
    }

    async fn service_response(&mut self, name: String, op: ServiceOp) -> SchedulerResponse {
        match self.service_op(&name, op).await {
            Ok(outcome) => SchedulerResponse::Service { name, outcome },
            Err(e) => rejected(e),
        }
    }
}

fn started_outcome(started: bool) -> ServiceOutcome {
    if started {
        ServiceOutcome::Ok
    } else {
        ServiceOutcome::FailedToStart
    }
}

fn rejected(e: KernelError) -> SchedulerResponse {
    tracing::warn!(error = %e, "Scheduler request failed");
    SchedulerResponse::Rejected {
        reason: e.to_string(),
    }
}

#[async_trait]
impl Actor for SchedulerActor {
    type Request = SchedulerRequest;
    type Response = SchedulerResponse;
    type Timer = SchedulerTimer;

    fn name(&self) -> &'static str {
        "scheduler"
    }

    fn timers(&self) -> Vec<(SchedulerTimer, Duration)> {
        vec![
            (
                SchedulerTimer::TaskWatch,
                Duration::from_millis(self.config.task_watch_interval_ms.max(1)),
            ),
            (
                SchedulerTimer::ServiceReview,
                Duration::from_millis(self.config.service_review_interval_ms.max(1)),
            ),
        ]
    }

    async fn handle(&mut self, request: RequestEnvelope<SchedulerRequest>) -> Option<SchedulerResponse> {
        let response = match request.body {
            SchedulerRequest::Start {
                spec,
                finish_notify,
            } => self.start(spec, finish_notify).await.unwrap_or_else(rejected),
            SchedulerRequest::TaskFinished {
                job_id,
                task_id,
                crash,
            } => {
                if let Err(e) = self.task_finished(job_id, task_id, crash).await {
                    tracing::warn!(job_id = %job_id, task_id, error = %e, "Failed to record task completion");
                }
                return None;
            }
            SchedulerRequest::KillJob { job_id } => {
                self.kill_job(job_id).await.unwrap_or_else(rejected)
            }
            SchedulerRequest::Capacity { affinity } => self.capacity(affinity.as_ref()),
            SchedulerRequest::Status => self.status().await.unwrap_or_else(rejected),
            SchedulerRequest::ReloadServices { catalog } => match self.reload_services(catalog).await {
                Ok(report) => SchedulerResponse::Reloaded { report },
                Err(e) => rejected(e),
            },
            SchedulerRequest::EnableService { name } => {
                self.service_response(name, ServiceOp::Enable).await
            }
            SchedulerRequest::DisableService { name } => {
                self.service_response(name, ServiceOp::Disable).await
            }
            SchedulerRequest::StartService { name } => {
                self.service_response(name, ServiceOp::Start).await
            }
            SchedulerRequest::StopService { name } => {
                self.service_response(name, ServiceOp::Stop).await
            }
        };
        Some(response)
    }

    async fn on_timer(&mut self, timer: SchedulerTimer) {
        let result = match timer {
            SchedulerTimer::TaskWatch => self.watch_tasks().await,
            SchedulerTimer::ServiceReview => self.review_services().await,
        };
        if let Err(e) = result {
            tracing::warn!(?timer, error = %e, "Scheduler maintenance failed");
        }
    }
}
