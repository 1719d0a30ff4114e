use thiserror::Error;

use crate::scheduler::JobId;
use crate::transport::ChannelId;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Timed out waiting for a reply on channel {0}")]
    Timeout(ChannelId),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Malformed message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("No free response channel available")]
    NoFreeChannel,

    #[error("Lock is held by another process")]
    LockedByOther,

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Spawn failed: {0}")]
    Spawn(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Misconfigured: {0}")]
    Misconfigured(String),
}

pub type Result<T> = std::result::Result<T, KernelError>;
