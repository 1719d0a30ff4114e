use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::cluster::{Cluster, NodeMemory, Pid, ProcessHandle, ProcessInfo, ProcessTable};
use crate::error::{KernelError, Result};

fn default_true() -> bool {
    true
}

/// Static description of one simulated node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimNode {
    pub hostname: String,
    pub max_mem: f64,
    #[serde(default = "default_cores")]
    pub cores: u32,
    #[serde(default)]
    pub neighbors: Vec<String>,
    /// Whether escalation succeeds on this node
    #[serde(default = "default_true")]
    pub rooted: bool,
}

fn default_cores() -> u32 {
    1
}

impl SimNode {
    pub fn new(hostname: impl Into<String>, max_mem: f64) -> Self {
        Self {
            hostname: hostname.into(),
            max_mem,
            cores: default_cores(),
            neighbors: Vec::new(),
            rooted: true,
        }
    }

    pub fn with_cores(mut self, cores: u32) -> Self {
        self.cores = cores;
        self
    }
}

/// A cluster description, loadable from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    pub root: String,
    pub nodes: Vec<SimNode>,
    /// Per-thread memory cost of each known executable
    #[serde(default)]
    pub costs: HashMap<String, f64>,
}

#[derive(Debug)]
struct Process {
    info: ProcessInfo,
    mem: f64,
    killable: bool,
}

#[derive(Debug)]
struct NodeEntry {
    spec: SimNode,
    files: HashSet<String>,
    processes: Vec<Process>,
}

impl NodeEntry {
    fn used_mem(&self) -> f64 {
        self.processes.iter().map(|p| p.mem).sum()
    }
}

#[derive(Debug)]
struct Inner {
    nodes: BTreeMap<String, NodeEntry>,
    costs: HashMap<String, f64>,
    next_pid: Pid,
}

/// In-memory cluster: nodes, links, files and a process table.
///
/// The root node holds every executable. Other nodes need a copy before a
/// spawn succeeds. Executables without a registered cost run for free.
#[derive(Debug)]
pub struct SimCluster {
    root: String,
    inner: Mutex<Inner>,
}

impl SimCluster {
    pub fn new(root: impl Into<String>, max_mem: f64, cores: u32) -> Self {
        let root = root.into();
        let cluster = Self {
            root: root.clone(),
            inner: Mutex::new(Inner {
                nodes: BTreeMap::new(),
                costs: HashMap::new(),
                next_pid: 1,
            }),
        };
        cluster.add_node(SimNode {
            hostname: root,
            max_mem,
            cores,
            neighbors: Vec::new(),
            rooted: true,
        });
        cluster
    }

    pub fn from_topology(topology: Topology) -> Result<Self> {
        let root_spec = topology
            .nodes
            .iter()
            .find(|n| n.hostname == topology.root)
            .ok_or_else(|| {
                KernelError::Misconfigured(format!("root node {} is not in the topology", topology.root))
            })?;

        let cluster = Self::new(topology.root.clone(), root_spec.max_mem, root_spec.cores);
        for node in &topology.nodes {
            if node.hostname != topology.root {
                cluster.add_node(SimNode {
                    neighbors: Vec::new(),
                    ..node.clone()
                });
            }
        }
        for node in &topology.nodes {
            for neighbor in &node.neighbors {
                cluster.link(&node.hostname, neighbor);
            }
        }
        for (executable, cost) in topology.costs {
            cluster.set_cost(executable, cost);
        }
        Ok(cluster)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_topology(serde_json::from_str(&raw)?)
    }

    pub fn add_node(&self, node: SimNode) {
        let mut inner = self.inner.lock();
        let neighbors = node.neighbors.clone();
        let hostname = node.hostname.clone();
        inner.nodes.insert(
            hostname.clone(),
            NodeEntry {
                spec: SimNode {
                    neighbors: Vec::new(),
                    ..node
                },
                files: HashSet::new(),
                processes: Vec::new(),
            },
        );
        drop(inner);
        for neighbor in neighbors {
            self.link(&hostname, &neighbor);
        }
    }

    /// Connect two nodes in both directions. Unknown hosts are ignored.
    pub fn link(&self, a: &str, b: &str) {
        let mut inner = self.inner.lock();
        if !inner.nodes.contains_key(a) || !inner.nodes.contains_key(b) || a == b {
            return;
        }
        for (from, to) in [(a, b), (b, a)] {
            if let Some(entry) = inner.nodes.get_mut(from) {
                if !entry.spec.neighbors.iter().any(|n| n == to) {
                    entry.spec.neighbors.push(to.to_string());
                }
            }
        }
    }

    pub fn set_cost(&self, executable: impl Into<String>, per_thread: f64) {
        self.inner.lock().costs.insert(executable.into(), per_thread);
    }

    pub fn set_rooted(&self, host: &str, rooted: bool) {
        if let Some(entry) = self.inner.lock().nodes.get_mut(host) {
            entry.spec.rooted = rooted;
        }
    }

    /// Kill a process without going through the kernel.
    pub fn crash(&self, host: &str, pid: Pid) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.nodes.get_mut(host) else {
            return false;
        };
        let before = entry.processes.len();
        entry.processes.retain(|p| p.info.pid != pid);
        entry.processes.len() != before
    }

    /// Replace a live process's args, as if the pid had been reused.
    pub fn set_process_args(&self, host: &str, pid: Pid, args: Vec<String>) -> bool {
        let mut inner = self.inner.lock();
        let Some(process) = inner
            .nodes
            .get_mut(host)
            .and_then(|entry| entry.processes.iter_mut().find(|p| p.info.pid == pid))
        else {
            return false;
        };
        process.info.args = args;
        true
    }

    /// Make `kill` fail for a live process. `crash` still removes it.
    pub fn set_killable(&self, host: &str, pid: Pid, killable: bool) -> bool {
        let mut inner = self.inner.lock();
        let Some(process) = inner
            .nodes
            .get_mut(host)
            .and_then(|entry| entry.processes.iter_mut().find(|p| p.info.pid == pid))
        else {
            return false;
        };
        process.killable = killable;
        true
    }

    pub fn used_mem(&self, host: &str) -> f64 {
        self.inner
            .lock()
            .nodes
            .get(host)
            .map(NodeEntry::used_mem)
            .unwrap_or(0.0)
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.inner.lock().nodes.keys().cloned().collect()
    }

    fn per_thread_cost(inner: &Inner, executable: &str) -> f64 {
        inner.costs.get(executable).copied().unwrap_or(0.0)
    }
}

impl ProcessTable for SimCluster {
    fn processes(&self, host: &str) -> Vec<ProcessInfo> {
        self.inner
            .lock()
            .nodes
            .get(host)
            .map(|entry| entry.processes.iter().map(|p| p.info.clone()).collect())
            .unwrap_or_default()
    }
}

impl Cluster for SimCluster {
    fn root(&self) -> String {
        self.root.clone()
    }

    fn neighbors(&self, host: &str) -> Vec<String> {
        self.inner
            .lock()
            .nodes
            .get(host)
            .map(|entry| entry.spec.neighbors.clone())
            .unwrap_or_default()
    }

    fn escalate(&self, host: &str) -> bool {
        self.inner
            .lock()
            .nodes
            .get(host)
            .is_some_and(|entry| entry.spec.rooted)
    }

    fn memory(&self, host: &str) -> Option<NodeMemory> {
        self.inner.lock().nodes.get(host).map(|entry| NodeMemory {
            total: entry.spec.max_mem,
            used: entry.used_mem(),
            cores: entry.spec.cores,
        })
    }

    fn script_cost(&self, executable: &str, threads: u32) -> Option<f64> {
        self.inner
            .lock()
            .costs
            .get(executable)
            .map(|per_thread| per_thread * f64::from(threads))
    }

    fn copy_executable(&self, executable: &str, host: &str) -> bool {
        match self.inner.lock().nodes.get_mut(host) {
            Some(entry) => {
                entry.files.insert(executable.to_string());
                true
            }
            None => false,
        }
    }

    fn spawn(
        &self,
        executable: &str,
        host: &str,
        threads: u32,
        args: &[String],
    ) -> Result<ProcessHandle> {
        if threads == 0 {
            return Err(KernelError::Spawn(format!("{executable} on {host}: zero threads")));
        }

        let mut inner = self.inner.lock();
        let mem = Self::per_thread_cost(&inner, executable) * f64::from(threads);
        let pid = inner.next_pid;
        let is_root = host == self.root;

        let entry = inner
            .nodes
            .get_mut(host)
            .ok_or_else(|| KernelError::Spawn(format!("unknown host {host}")))?;
        if !entry.spec.rooted {
            return Err(KernelError::Spawn(format!("no privileges on {host}")));
        }
        if !is_root && !entry.files.contains(executable) {
            return Err(KernelError::Spawn(format!("{executable} not present on {host}")));
        }
        if entry.used_mem() + mem > entry.spec.max_mem {
            return Err(KernelError::Spawn(format!(
                "{executable} x{threads} needs {mem} on {host}, {} free",
                entry.spec.max_mem - entry.used_mem()
            )));
        }

        entry.processes.push(Process {
            info: ProcessInfo {
                pid,
                executable: executable.to_string(),
                args: args.to_vec(),
                threads,
            },
            mem,
            killable: true,
        });
        inner.next_pid += 1;

        Ok(ProcessHandle {
            pid,
            hostname: host.to_string(),
            executable: executable.to_string(),
            args: args.to_vec(),
        })
    }

    fn kill(&self, handle: &ProcessHandle) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.nodes.get_mut(&handle.hostname) else {
            return false;
        };
        let before = entry.processes.len();
        entry
            .processes
            .retain(|p| !(p.killable && p.info.matches(handle)));
        entry.processes.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node() -> SimCluster {
        let cluster = SimCluster::new("home", 64.0, 4);
        cluster.add_node(SimNode {
            hostname: "n00dles".into(),
            max_mem: 8.0,
            cores: 1,
            neighbors: vec!["home".into()],
            rooted: true,
        });
        cluster.set_cost("hack", 2.0);
        cluster
    }

    #[test]
    fn links_are_symmetric() {
        let cluster = two_node();
        assert_eq!(cluster.neighbors("home"), vec!["n00dles".to_string()]);
        assert_eq!(cluster.neighbors("n00dles"), vec!["home".to_string()]);
    }

    #[test]
    fn spawn_requires_file_on_remote_nodes() {
        let cluster = two_node();
        assert!(cluster.spawn("hack", "n00dles", 1, &[]).is_err());
        assert!(cluster.copy_executable("hack", "n00dles"));
        let handle = cluster.spawn("hack", "n00dles", 2, &[]).unwrap();
        assert!(cluster.is_running(&handle));
        assert_eq!(cluster.used_mem("n00dles"), 4.0);
    }

    #[test]
    fn spawn_refuses_to_overcommit() {
        let cluster = two_node();
        cluster.copy_executable("hack", "n00dles");
        assert!(cluster.spawn("hack", "n00dles", 5, &[]).is_err());
        assert!(cluster.spawn("hack", "n00dles", 4, &[]).is_ok());
    }

    #[test]
    fn crash_and_arg_change_break_identity() {
        let cluster = two_node();
        let a = cluster.spawn("hack", "home", 1, &["x".into()]).unwrap();
        let b = cluster.spawn("hack", "home", 1, &["y".into()]).unwrap();

        assert!(cluster.set_process_args("home", a.pid, vec!["z".into()]));
        assert!(!cluster.is_running(&a));
        assert!(cluster.pid_alive("home", a.pid));

        assert!(cluster.crash("home", b.pid));
        assert!(!cluster.pid_alive("home", b.pid));
    }

    #[test]
    fn unkillable_process_survives_kill() {
        let cluster = two_node();
        let a = cluster.spawn("hack", "home", 1, &[]).unwrap();

        assert!(cluster.set_killable("home", a.pid, false));
        assert!(!cluster.kill(&a));
        assert!(cluster.is_running(&a));

        cluster.set_killable("home", a.pid, true);
        assert!(cluster.kill(&a));
        assert!(!cluster.is_running(&a));
    }

    #[test]
    fn unrooted_nodes_refuse_escalation_and_spawn() {
        let cluster = two_node();
        cluster.set_rooted("n00dles", false);
        cluster.copy_executable("hack", "n00dles");
        assert!(!cluster.escalate("n00dles"));
        assert!(cluster.spawn("hack", "n00dles", 1, &[]).is_err());
    }

    #[test]
    fn topology_loads_from_json() {
        let topology: Topology = serde_json::from_str(
            r#"{
                "root": "home",
                "nodes": [
                    {"hostname": "home", "max_mem": 32, "cores": 2, "neighbors": ["a"]},
                    {"hostname": "a", "max_mem": 16, "neighbors": ["b"]},
                    {"hostname": "b", "max_mem": 4, "rooted": false}
                ],
                "costs": {"weaken": 1.75}
            }"#,
        )
        .unwrap();
        let cluster = SimCluster::from_topology(topology).unwrap();

        assert_eq!(cluster.hostnames().len(), 3);
        assert_eq!(cluster.neighbors("b"), vec!["a".to_string()]);
        assert!(!cluster.escalate("b"));
        assert_eq!(cluster.script_cost("weaken", 4), Some(7.0));
        assert_eq!(cluster.memory("home").unwrap().cores, 2);
    }
}
