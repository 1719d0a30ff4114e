use crate::cluster::ProcessTable;
use crate::scheduler::{JobId, SchedulerState, TaskId};

/// Tasks whose process is gone or no longer runs the recorded executable
/// with the recorded args.
pub fn crashed_tasks<P>(state: &SchedulerState, processes: &P) -> Vec<(JobId, TaskId)>
where
    P: ProcessTable + ?Sized,
{
    state
        .jobs
        .values()
        .flat_map(|job| {
            job.tasks
                .values()
                .filter(move |task| !processes.is_running(&task.process))
                .map(move |task| (job.id, task.id))
        })
        .collect()
}

/// Running services whose process failed the same identity check.
pub fn crashed_services<P>(state: &SchedulerState, processes: &P) -> Vec<String>
where
    P: ProcessTable + ?Sized,
{
    state
        .services
        .iter()
        .filter(|(_, service)| {
            service
                .process()
                .is_some_and(|process| !processes.is_running(process))
        })
        .map(|(name, _)| name.clone())
        .collect()
}
