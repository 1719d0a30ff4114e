//! The shared-state document and the actor that guards it.
//!
//! One [`DatabaseActor`] owns the document. Plain reads are always served,
//! whatever the lock state. Read-modify-write cycles go through an explicit
//! lock with a FIFO wait queue:
//!
//! 1. `lock` on a free lock answers [`DbResponse::LockGranted`] at once
//! 2. `lock` on a held lock answers [`DbResponse::LockQueued`], and the grant
//!    follows later on the same response channel
//! 3. `unlock` / `write_and_unlock` from the holder hands the lock to the
//!    next waiter, pushing it the current document
//!
//! A holder whose process died is detected at the top of every loop
//! iteration and on a timer; its lock is broken and passed on.

pub mod actor;
pub mod client;
pub mod document;
pub mod lock;
pub mod storage;

use serde::{Deserialize, Serialize};

pub use actor::{DatabaseActor, DatabaseTimer};
pub use client::{DbClient, LockLease};
pub use document::Document;
pub use lock::{Acquire, LockData, LockMeta, Release};
pub use storage::{DocumentStore, FileStore, MemoryStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DbRequest {
    Read,
    Lock {
        holder: LockData,
    },
    Unlock {
        holder: LockData,
    },
    WriteAndUnlock {
        holder: LockData,
        document: Box<Document>,
    },
    /// Leave the wait queue, or release the lock if it was granted meanwhile
    Abandon {
        holder: LockData,
    },
    Status,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DbResponse {
    Document {
        document: Box<Document>,
    },
    /// Placeholder reply: the caller is waiting in line
    LockQueued {
        position: usize,
    },
    /// The lock now belongs to `holder`. Sent immediately or deferred.
    LockGranted {
        holder: LockData,
        document: Box<Document>,
    },
    Unlocked,
    Written,
    LockedByOther {
        current: Option<LockData>,
    },
    Abandoned,
    Status {
        status: LockStatus,
    },
}

/// Lock diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStatus {
    pub current_lock: Option<LockData>,
    pub lock_queue: Vec<LockData>,
}
