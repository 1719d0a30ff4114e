use std::sync::Arc;
use std::time::Duration;

use crate::cluster::ProcessHandle;
use crate::database::{DbRequest, DbResponse, Document, DocumentStore, LockData, LockStatus};
use crate::error::{KernelError, Result};
use crate::rpc::{ResponseEnvelope, RpcClient};
use crate::transport::{ChannelId, Wait};

/// A granted lock. The response channel stays reserved until the lease is
/// given back through [`DbClient::unlock`] or [`DbClient::write_and_unlock`].
#[derive(Debug)]
#[must_use = "a lease holds the database lock until it is released"]
pub struct LockLease {
    holder: LockData,
    document: Document,
}

impl LockLease {
    pub fn holder(&self) -> &LockData {
        &self.holder
    }

    /// The document as of the moment the lock was granted.
    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn into_document(self) -> (LockData, Document) {
        (self.holder, self.document)
    }
}

/// Caller-side handle on the database actor.
#[derive(Debug, Clone)]
pub struct DbClient {
    rpc: RpcClient,
    database: ChannelId,
    identity: ProcessHandle,
    timeout: Duration,
    /// Set when the caller shares the database's host and can read the
    /// store directly
    local: Option<Arc<dyn DocumentStore>>,
}

impl DbClient {
    pub fn new(rpc: RpcClient, database: ChannelId, identity: ProcessHandle, timeout: Duration) -> Self {
        Self {
            rpc,
            database,
            identity,
            timeout,
            local: None,
        }
    }

    pub fn with_local_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.local = Some(store);
        self
    }

    pub fn identity(&self) -> &ProcessHandle {
        &self.identity
    }

    /// Current document. Never blocked by the lock.
    pub async fn read(&self) -> Result<Document> {
        if let Some(store) = &self.local {
            return store.load_document().await;
        }
        match self
            .rpc
            .call(self.database, &DbRequest::Read, Wait::For(self.timeout))
            .await?
        {
            DbResponse::Document { document } => Ok(*document),
            other => Err(unexpected(&other)),
        }
    }

    /// Acquire the lock, waiting up to `wait` for a queued grant.
    ///
    /// On timeout the request is abandoned so the lock cannot be handed to
    /// a caller that stopped waiting.
    pub async fn lock(&self, wait: Wait) -> Result<LockLease> {
        let reply_to = self.rpc.ports().reserve().await?;
        let holder = LockData::new(&self.identity, reply_to);

        match self.acquire(&holder, wait).await {
            Ok(document) => Ok(LockLease { holder, document }),
            Err(e) => {
                tracing::warn!(channel = reply_to, error = %e, "Lock not acquired, abandoning");
                if let Err(abandon_err) = self.abandon(&holder).await {
                    tracing::warn!(error = %abandon_err, "Failed to abandon lock request");
                }
                self.rpc.ports().release(reply_to).await;
                Err(e)
            }
        }
    }

    pub async fn unlock(&self, lease: LockLease) -> Result<()> {
        let (holder, _) = lease.into_document();
        let result = self.finish(&holder, &DbRequest::Unlock { holder: holder.clone() }).await;
        self.rpc.ports().release(holder.response_channel).await;
        result
    }

    /// Replace the document's content and release the lock in one step.
    pub async fn write_and_unlock(&self, lease: LockLease, document: Document) -> Result<()> {
        let (holder, _) = lease.into_document();
        let request = DbRequest::WriteAndUnlock {
            holder: holder.clone(),
            document: Box::new(document),
        };
        let result = self.finish(&holder, &request).await;
        self.rpc.ports().release(holder.response_channel).await;
        result
    }

    /// Lock, apply `f` to the document, and write the result back. If `f`
    /// fails the lock is released without writing.
    pub async fn update<T, F>(&self, wait: Wait, f: F) -> Result<T>
    where
        F: FnOnce(Document) -> Result<(Document, T)>,
    {
        let lease = self.lock(wait).await?;
        match f(lease.document().clone()) {
            Ok((document, value)) => {
                self.write_and_unlock(lease, document).await?;
                Ok(value)
            }
            Err(e) => {
                self.unlock(lease).await?;
                Err(e)
            }
        }
    }

    pub async fn status(&self) -> Result<LockStatus> {
        match self
            .rpc
            .call(self.database, &DbRequest::Status, Wait::For(self.timeout))
            .await?
        {
            DbResponse::Status { status } => Ok(status),
            other => Err(unexpected(&other)),
        }
    }

    async fn acquire(&self, holder: &LockData, wait: Wait) -> Result<Document> {
        let channel = holder.response_channel;
        let request = DbRequest::Lock {
            holder: holder.clone(),
        };
        let first: DbResponse = self
            .rpc
            .call_on(self.database, channel, &request, Wait::For(self.timeout))
            .await?;

        match first {
            DbResponse::LockGranted { document, .. } => Ok(*document),
            DbResponse::LockQueued { position } => {
                tracing::debug!(channel, position, "Waiting in lock queue");
                let grant = self
                    .rpc
                    .receive(channel, wait, |envelope: &ResponseEnvelope<DbResponse>| {
                        matches!(&envelope.body, DbResponse::LockGranted { holder: h, .. } if h == holder)
                    })
                    .await?;
                match grant {
                    DbResponse::LockGranted { document, .. } => Ok(*document),
                    other => Err(unexpected(&other)),
                }
            }
            other => Err(unexpected(&other)),
        }
    }

    async fn abandon(&self, holder: &LockData) -> Result<()> {
        let request = DbRequest::Abandon {
            holder: holder.clone(),
        };
        match self
            .rpc
            .call_on(self.database, holder.response_channel, &request, Wait::For(self.timeout))
            .await?
        {
            DbResponse::Abandoned => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn finish(&self, holder: &LockData, request: &DbRequest) -> Result<()> {
        match self
            .rpc
            .call_on(self.database, holder.response_channel, request, Wait::For(self.timeout))
            .await?
        {
            DbResponse::Unlocked | DbResponse::Written => Ok(()),
            DbResponse::LockedByOther { .. } => Err(KernelError::LockedByOther),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &DbResponse) -> KernelError {
    KernelError::InvalidResponse(format!("unexpected database response {response:?}"))
}
