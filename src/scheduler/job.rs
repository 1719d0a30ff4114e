use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cluster::ProcessHandle;
use crate::transport::ChannelId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Sequential within one job, starting at 0.
pub type TaskId = u32;

/// Placement constraint on which nodes a job may use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostAffinity {
    /// Only this host
    MustRunOn { host: String },
    /// This host first, others for whatever does not fit
    PreferToRunOn { host: String },
}

impl HostAffinity {
    pub fn host(&self) -> &str {
        match self {
            HostAffinity::MustRunOn { host } | HostAffinity::PreferToRunOn { host } => host,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub threads: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_affinity: Option<HostAffinity>,
}

impl JobSpec {
    pub fn new(executable: impl Into<String>, threads: u32) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            threads,
            host_affinity: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_affinity(mut self, affinity: HostAffinity) -> Self {
        self.host_affinity = Some(affinity);
        self
    }

    /// Arguments a task of this job is launched with. The trailing ids let
    /// the task report its own completion.
    pub fn task_args(&self, job_id: JobId, task_id: TaskId) -> Vec<String> {
        let mut args = self.args.clone();
        args.extend([
            "--job-id".to_string(),
            job_id.to_string(),
            "--task-id".to_string(),
            task_id.to_string(),
        ]);
        args
    }
}

/// One placed, running piece of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub hostname: String,
    pub threads: u32,
    pub process: ProcessHandle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub spec: JobSpec,
    pub tasks: BTreeMap<TaskId, Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_notify: Option<ChannelId>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: JobId, spec: JobSpec, finish_notify: Option<ChannelId>) -> Self {
        Self {
            id,
            spec,
            tasks: BTreeMap::new(),
            finish_notify,
            created_at: Utc::now(),
        }
    }

    pub fn placed_threads(&self) -> u32 {
        self.tasks.values().map(|t| t.threads).sum()
    }

    pub fn is_done(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_args_append_identity() {
        let spec = JobSpec::new("hack.js", 4).with_args(["target"]);
        let id = JobId::new();
        let args = spec.task_args(id, 2);
        assert_eq!(args[0], "target");
        assert_eq!(args[1..], ["--job-id".to_string(), id.to_string(), "--task-id".to_string(), "2".to_string()]);
    }

    #[test]
    fn affinity_serializes_tagged() {
        let affinity = HostAffinity::MustRunOn { host: "n1".into() };
        let json = serde_json::to_value(&affinity).unwrap();
        assert_eq!(json, serde_json::json!({"type": "must_run_on", "host": "n1"}));
        assert_eq!(affinity.host(), "n1");
    }

    #[test]
    fn job_round_trips_with_task_map() {
        let mut job = Job::new(JobId::new(), JobSpec::new("w.js", 3), Some(120));
        job.tasks.insert(
            0,
            Task {
                id: 0,
                hostname: "home".into(),
                threads: 3,
                process: ProcessHandle {
                    pid: 7,
                    hostname: "home".into(),
                    executable: "w.js".into(),
                    args: vec![],
                },
            },
        );
        let raw = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, job);
        assert_eq!(back.placed_threads(), 3);
    }
}
