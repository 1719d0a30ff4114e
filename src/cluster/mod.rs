//! The compute nodes the kernel schedules onto.
//!
//! Everything the kernel needs to know about nodes and processes goes
//! through two traits:
//! - [`ProcessTable`]: which processes are alive, used for liveness checks
//! - [`Cluster`]: topology, memory, privilege, file copy, spawn and kill
//!
//! [`SimCluster`] is an in-memory implementation used by tests and by the
//! `serve` command.

pub mod sim;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use sim::{SimCluster, SimNode, Topology};

pub type Pid = u64;

/// Identity of a spawned process. A process "is" this handle only while
/// the live process with this pid runs the same executable with the same
/// args on the same host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub pid: Pid,
    pub hostname: String,
    pub executable: String,
    pub args: Vec<String>,
}

/// One entry of a node's live process list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub executable: String,
    pub args: Vec<String>,
    pub threads: u32,
}

impl ProcessInfo {
    /// Whether this live process still is the process `handle` recorded.
    pub fn matches(&self, handle: &ProcessHandle) -> bool {
        self.pid == handle.pid && self.executable == handle.executable && self.args == handle.args
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeMemory {
    pub total: f64,
    pub used: f64,
    pub cores: u32,
}

pub trait ProcessTable: Send + Sync {
    /// Live processes on `host`. Unknown hosts have none.
    fn processes(&self, host: &str) -> Vec<ProcessInfo>;

    fn pid_alive(&self, host: &str, pid: Pid) -> bool {
        self.processes(host).iter().any(|p| p.pid == pid)
    }

    fn is_running(&self, handle: &ProcessHandle) -> bool {
        self.processes(&handle.hostname)
            .iter()
            .any(|p| p.matches(handle))
    }
}

pub trait Cluster: ProcessTable {
    /// The node traversal starts from, and the one the kernel lives on.
    fn root(&self) -> String;

    fn neighbors(&self, host: &str) -> Vec<String>;

    /// Gain the privileges needed to run processes on `host`. Idempotent.
    fn escalate(&self, host: &str) -> bool;

    fn memory(&self, host: &str) -> Option<NodeMemory>;

    /// Memory needed to run `executable` with `threads` threads.
    fn script_cost(&self, executable: &str, threads: u32) -> Option<f64>;

    fn copy_executable(&self, executable: &str, host: &str) -> bool;

    fn spawn(
        &self,
        executable: &str,
        host: &str,
        threads: u32,
        args: &[String],
    ) -> Result<ProcessHandle>;

    fn kill(&self, handle: &ProcessHandle) -> bool;
}
