use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::cluster::{ProcessHandle, ProcessTable};
use crate::config::DatabaseConfig;
use crate::database::lock::Abandon;
use crate::database::{
    Acquire, DbRequest, DbResponse, Document, DocumentStore, LockData, LockStatus, Release,
};
use crate::error::{KernelError, Result};
use crate::rpc::{Actor, RequestEnvelope, Responder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseTimer {
    /// Break locks held by processes that no longer exist
    StaleLockCheck,
}

/// Sole owner of the shared document.
pub struct DatabaseActor {
    document: Document,
    store: Arc<dyn DocumentStore>,
    processes: Arc<dyn ProcessTable>,
    responder: Responder,
    check_every: Duration,
}

impl DatabaseActor {
    /// Load the stored document and build the actor. Refuses to run anywhere
    /// but the configured home host.
    pub async fn open(
        identity: &ProcessHandle,
        config: &DatabaseConfig,
        store: Arc<dyn DocumentStore>,
        processes: Arc<dyn ProcessTable>,
        responder: Responder,
    ) -> Result<Self> {
        if identity.hostname != config.home_host {
            return Err(KernelError::Misconfigured(format!(
                "database must run on {}, not {}",
                config.home_host, identity.hostname
            )));
        }

        let document = store.load_document().await?;
        if let Some(holder) = document.meta().holder() {
            tracing::info!(
                host = %holder.hostname,
                pid = holder.pid,
                waiters = document.meta().waiters().count(),
                "Loaded document with an outstanding lock"
            );
        }

        Ok(Self {
            document,
            store,
            processes,
            responder,
            check_every: Duration::from_millis(config.lock_check_interval_ms.max(1)),
        })
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    async fn persist(&self) {
        if let Err(e) = self.store.save(&self.document).await {
            tracing::error!(error = %e, "Failed to persist document");
        }
    }

    /// Hand the lock to `next`, skipping waiters whose process is gone.
    /// Returns the waiter that ends up holding it.
    fn settle(&mut self, mut next: Option<LockData>) -> Option<LockData> {
        while let Some(candidate) = next {
            if self.processes.is_running(&candidate.process()) {
                return Some(candidate);
            }
            tracing::warn!(
                host = %candidate.hostname,
                pid = candidate.pid,
                "Skipping dead lock waiter"
            );
            next = self.document.meta_mut().force_release();
        }
        None
    }

    /// Push a deferred grant to the new holder without stalling the loop.
    fn push_grant(&self, holder: LockData) {
        tracing::debug!(host = %holder.hostname, pid = holder.pid, channel = holder.response_channel, "Granting queued lock");
        let responder = self.responder.clone();
        let response = DbResponse::LockGranted {
            holder: holder.clone(),
            document: Box::new(self.document.clone()),
        };
        tokio::spawn(async move {
            responder
                .respond(holder.response_channel, None, &response)
                .await;
        });
    }

    async fn break_stale_lock(&mut self) {
        let Some(current) = self.document.meta().holder().cloned() else {
            return;
        };
        if self.processes.is_running(&current.process()) {
            return;
        }

        tracing::warn!(
            host = %current.hostname,
            pid = current.pid,
            executable = %current.executable,
            "Breaking lock held by a dead process"
        );
        let next = self.document.meta_mut().force_release();
        let next = self.settle(next);
        self.persist().await;
        if let Some(next) = next {
            self.push_grant(next);
        }
    }

    async fn release_and_pass(&mut self, next: Option<LockData>) {
        let next = self.settle(next);
        self.persist().await;
        if let Some(next) = next {
            self.push_grant(next);
        }
    }
}

#[async_trait]
impl Actor for DatabaseActor {
    type Request = DbRequest;
    type Response = DbResponse;
    type Timer = DatabaseTimer;

    fn name(&self) -> &'static str {
        "database"
    }

    fn timers(&self) -> Vec<(DatabaseTimer, Duration)> {
        vec![(DatabaseTimer::StaleLockCheck, self.check_every)]
    }

    async fn before_batch(&mut self) {
        self.break_stale_lock().await;
    }

    async fn handle(&mut self, request: RequestEnvelope<DbRequest>) -> Option<DbResponse> {
        match request.body {
            DbRequest::Read => Some(DbResponse::Document {
                document: Box::new(self.document.clone()),
            }),
            DbRequest::Lock { holder } => {
                let outcome = self.document.meta_mut().acquire(holder.clone());
                self.persist().await;
                match outcome {
                    Acquire::Granted => {
                        tracing::debug!(host = %holder.hostname, pid = holder.pid, "Lock granted");
                        Some(DbResponse::LockGranted {
                            holder,
                            document: Box::new(self.document.clone()),
                        })
                    }
                    Acquire::Queued { position } => {
                        tracing::debug!(host = %holder.hostname, pid = holder.pid, position, "Lock queued");
                        Some(DbResponse::LockQueued { position })
                    }
                }
            }
            DbRequest::Unlock { holder } => match self.document.meta_mut().release(&holder) {
                Release::Released { next } => {
                    self.release_and_pass(next).await;
                    Some(DbResponse::Unlocked)
                }
                Release::NotHolder { current } => {
                    tracing::warn!(host = %holder.hostname, pid = holder.pid, "Unlock by a non-holder");
                    Some(DbResponse::LockedByOther { current })
                }
            },
            DbRequest::WriteAndUnlock { holder, document } => {
                if self.document.meta().holder() != Some(&holder) {
                    tracing::warn!(host = %holder.hostname, pid = holder.pid, "Write by a non-holder");
                    return Some(DbResponse::LockedByOther {
                        current: self.document.meta().holder().cloned(),
                    });
                }
                self.document.replace_content(*document);
                match self.document.meta_mut().release(&holder) {
                    Release::Released { next } => self.release_and_pass(next).await,
                    Release::NotHolder { .. } => self.persist().await,
                }
                Some(DbResponse::Written)
            }
            DbRequest::Abandon { holder } => {
                match self.document.meta_mut().abandon(&holder) {
                    Abandon::Dequeued => self.persist().await,
                    Abandon::Released { next } => self.release_and_pass(next).await,
                    Abandon::Unknown => {}
                }
                Some(DbResponse::Abandoned)
            }
            DbRequest::Status => Some(DbResponse::Status {
                status: LockStatus {
                    current_lock: self.document.meta().holder().cloned(),
                    lock_queue: self.document.meta().waiters().cloned().collect(),
                },
            }),
        }
    }

    async fn on_timer(&mut self, timer: DatabaseTimer) {
        match timer {
            DatabaseTimer::StaleLockCheck => self.break_stale_lock().await,
        }
    }
}
