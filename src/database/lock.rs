use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::cluster::{Pid, ProcessHandle};
use crate::transport::ChannelId;

/// Identifies one lock holder or waiter. Two values are the same holder
/// only if all five fields match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockData {
    pub hostname: String,
    pub executable: String,
    pub args: Vec<String>,
    pub pid: Pid,
    pub response_channel: ChannelId,
}

impl LockData {
    pub fn new(process: &ProcessHandle, response_channel: ChannelId) -> Self {
        Self {
            hostname: process.hostname.clone(),
            executable: process.executable.clone(),
            args: process.args.clone(),
            pid: process.pid,
            response_channel,
        }
    }

    pub fn process(&self) -> ProcessHandle {
        ProcessHandle {
            pid: self.pid,
            hostname: self.hostname.clone(),
            executable: self.executable.clone(),
            args: self.args.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    Granted,
    Queued { position: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// Lock released; `next` is the waiter it now belongs to
    Released { next: Option<LockData> },
    NotHolder { current: Option<LockData> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Abandon {
    Dequeued,
    Released { next: Option<LockData> },
    Unknown,
}

/// Lock state, persisted with the document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMeta {
    #[serde(default)]
    pub(crate) lock_queue: VecDeque<LockData>,
    #[serde(default)]
    pub(crate) current_lock: Option<LockData>,
}

impl LockMeta {
    pub fn holder(&self) -> Option<&LockData> {
        self.current_lock.as_ref()
    }

    pub fn waiters(&self) -> impl Iterator<Item = &LockData> {
        self.lock_queue.iter()
    }

    pub fn is_locked(&self) -> bool {
        self.current_lock.is_some()
    }

    pub(crate) fn acquire(&mut self, holder: LockData) -> Acquire {
        match &self.current_lock {
            None => {
                self.current_lock = Some(holder);
                Acquire::Granted
            }
            Some(current) if *current == holder => Acquire::Granted,
            Some(_) => {
                let position = match self.lock_queue.iter().position(|w| *w == holder) {
                    Some(index) => index + 1,
                    None => {
                        self.lock_queue.push_back(holder);
                        self.lock_queue.len()
                    }
                };
                Acquire::Queued { position }
            }
        }
    }

    pub(crate) fn release(&mut self, holder: &LockData) -> Release {
        if self.current_lock.as_ref() != Some(holder) {
            return Release::NotHolder {
                current: self.current_lock.clone(),
            };
        }
        Release::Released {
            next: self.grant_next(),
        }
    }

    pub(crate) fn abandon(&mut self, holder: &LockData) -> Abandon {
        if let Some(index) = self.lock_queue.iter().position(|w| w == holder) {
            self.lock_queue.remove(index);
            return Abandon::Dequeued;
        }
        match self.release(holder) {
            Release::Released { next } => Abandon::Released { next },
            Release::NotHolder { .. } => Abandon::Unknown,
        }
    }

    /// Drop the current holder unconditionally and grant the next waiter.
    pub(crate) fn force_release(&mut self) -> Option<LockData> {
        self.grant_next()
    }

    fn grant_next(&mut self) -> Option<LockData> {
        let next = self.lock_queue.pop_front();
        self.current_lock = next.clone();
        next
    }
}
