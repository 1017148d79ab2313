use std::time::Duration;

use devjob_data::Job;
use tracing::{info, instrument};

use crate::{
    error::JobError,
    registry::JobRegistry,
    supervisor::Supervisor,
    util::{is_pid_alive, wait_until_gone, ABNORMAL_EXIT_CODE},
    workspace::Workspace,
};

/// Outcome of a reconciliation pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// jobs whose process was already gone, finalized right away
    pub recovered: Vec<String>,
    /// jobs whose process outlived the previous server, finalized once it exits
    pub orphaned: Vec<String>,
}

/// Settles archived jobs that have no exit code and are not supervised by
/// this process. Their real exit status is lost, so they are recorded with
/// [`ABNORMAL_EXIT_CODE`].
///
/// Orphans that are still alive go back into the registry until they exit, so
/// they keep their device and their id like any running job.
#[instrument(skip_all)]
pub async fn reconcile(
    registry: &JobRegistry,
    workspace: &Workspace,
    supervisor: &Supervisor,
    orphan_poll: Duration,
) -> Result<ReconcileReport, JobError> {
    let mut report = ReconcileReport::default();
    for job in workspace.archived().await? {
        if job.is_finished() {
            continue;
        }
        match job.pid.filter(|pid| is_pid_alive(*pid)) {
            None => {
                if registry.is_running(&job.job_id).await {
                    continue;
                }
                info!("job {} lost its process, recording it as abnormal", job.job_id);
                report.recovered.push(job.job_id.clone());
                supervisor.finish(job, ABNORMAL_EXIT_CODE, true).await;
            }
            Some(pid) => {
                {
                    let mut registry = registry.lock().await;
                    if registry.find(&job.job_id).is_some() {
                        continue;
                    }
                    registry.insert(job.clone())?;
                }
                info!("job {} still runs as orphan pid {}, watching it", job.job_id, pid);
                report.orphaned.push(job.job_id.clone());
                tokio::spawn(watch_orphan(job, pid, supervisor.clone(), orphan_poll));
            }
        }
    }
    Ok(report)
}

async fn watch_orphan(job: Job, pid: u32, supervisor: Supervisor, poll: Duration) {
    wait_until_gone(pid, poll).await;
    supervisor.finish(job, ABNORMAL_EXIT_CODE, true).await
}
