use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::scheduler::{Job, JobId, ServiceState, TaskId};

/// The scheduler's section of the shared document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerState {
    pub jobs: BTreeMap<JobId, Job>,
    pub services: BTreeMap<String, ServiceState>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskFinish {
    UnknownJob,
    UnknownTask,
    /// Task removed; `finished` is the job if that was its last task
    Removed { finished: Option<Job> },
}

impl SchedulerState {
    pub fn jobs(&self) -> &BTreeMap<JobId, Job> {
        &self.jobs
    }

    pub fn services(&self) -> &BTreeMap<String, ServiceState> {
        &self.services
    }

    /// Drop one task. A job left with no tasks is removed and returned.
    pub fn finish_task(&mut self, job_id: JobId, task_id: TaskId) -> TaskFinish {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return TaskFinish::UnknownJob;
        };
        if job.tasks.remove(&task_id).is_none() {
            return TaskFinish::UnknownTask;
        }
        let finished = if job.is_done() {
            self.jobs.remove(&job_id)
        } else {
            None
        };
        TaskFinish::Removed { finished }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ProcessHandle;
    use crate::scheduler::{JobSpec, Task};

    fn job_with_tasks(n: u32) -> Job {
        let mut job = Job::new(JobId::new(), JobSpec::new("w.js", n), None);
        for id in 0..n {
            job.tasks.insert(
                id,
                Task {
                    id,
                    hostname: "home".into(),
                    threads: 1,
                    process: ProcessHandle {
                        pid: u64::from(id) + 1,
                        hostname: "home".into(),
                        executable: "w.js".into(),
                        args: vec![],
                    },
                },
            );
        }
        job
    }

    #[test]
    fn last_task_finishes_job_once() {
        let mut state = SchedulerState::default();
        let job = job_with_tasks(2);
        let id = job.id;
        state.jobs.insert(id, job);

        assert_eq!(state.finish_task(id, 0), TaskFinish::Removed { finished: None });
        assert!(matches!(
            state.finish_task(id, 1),
            TaskFinish::Removed { finished: Some(_) }
        ));
        assert!(state.jobs().is_empty());
        assert_eq!(state.finish_task(id, 1), TaskFinish::UnknownJob);
    }

    #[test]
    fn duplicate_task_finish_is_ignored() {
        let mut state = SchedulerState::default();
        let job = job_with_tasks(2);
        let id = job.id;
        state.jobs.insert(id, job);

        state.finish_task(id, 0);
        assert_eq!(state.finish_task(id, 0), TaskFinish::UnknownTask);
        assert_eq!(state.jobs()[&id].tasks.len(), 1);
    }
}
