use std::{io, path::Path, sync::Arc};

use devjob_data::{CreateJob, Device, Job, JobList, JOB_ID_ENV, NO_DEVICE, WORKSPACE_ENV};
use tokio::fs;
use tracing::{info, instrument, warn};

use crate::{
    admission::{admit, Candidate},
    config::PoolConfig,
    error::JobError,
    inventory::{DeviceFilter, DeviceInventory},
    materialize::{ScriptContext, ScriptMaterializer},
    notify::Notifier,
    reconcile::{reconcile, ReconcileReport},
    registry::JobRegistry,
    stream::{Follow, OutputFollower},
    supervisor::{self, JobProcess, Supervisor},
    terminate::kill_tree,
    util::new_job_id,
    workspace::{validate_job_id, JobEntry, JobPaths, Workspace},
};

/// Runs jobs on this host: admission, supervision, streaming and cleanup.
#[derive(Clone)]
pub struct JobPool {
    config: Arc<PoolConfig>,
    registry: Arc<JobRegistry>,
    workspace: Workspace,
    supervisor: Supervisor,
    inventory: Arc<dyn DeviceInventory>,
    materializer: Arc<dyn ScriptMaterializer>,
}

impl JobPool {
    /// creates the jobs root if needed, job paths are absolute from here on
    pub fn open(
        mut config: PoolConfig,
        inventory: Arc<dyn DeviceInventory>,
        materializer: Arc<dyn ScriptMaterializer>,
    ) -> Result<Self, JobError> {
        std::fs::create_dir_all(&config.jobs_root)?;
        config.jobs_root = std::fs::canonicalize(&config.jobs_root)?;
        let registry = Arc::new(JobRegistry::new());
        let workspace = Workspace::new(&config.jobs_root);
        let supervisor = Supervisor::new(
            registry.clone(),
            workspace.clone(),
            Notifier::new(config.callback_timeout),
            config.drain_grace,
            config.poll_interval,
        );
        Ok(Self {
            config: Arc::new(config),
            registry,
            workspace,
            supervisor,
            inventory,
            materializer,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Admits and starts a job.
    ///
    /// The registry stays locked from the admission checks until the job is
    /// inserted. A failure at any step leaves no registry entry and no
    /// workspace behind.
    #[instrument(skip(self, request))]
    pub async fn create(&self, request: CreateJob) -> Result<Job, JobError> {
        let CreateJob {
            job_id,
            repo,
            exclusive,
            env,
            callback,
        } = request;
        let repo = repo.ok_or_else(|| {
            JobError::BadRequest("the \"repo\" is mandatory for creating a new job".to_string())
        })?;
        let job_id = job_id.unwrap_or_else(new_job_id);
        validate_job_id(&job_id)?;
        let exclusive = exclusive.unwrap_or(true);
        let mut env = env.unwrap_or_default();
        let device_key = self.config.device_key.as_str();
        let device = env
            .entry(device_key.to_string())
            .or_insert_with(|| NO_DEVICE.to_string())
            .clone();
        info!("try to create job {} on device {}", job_id, device);

        let mut registry = self.registry.lock().await;
        let candidate = Candidate {
            job_id: &job_id,
            device: &device,
            exclusive,
        };
        admit(&registry, device_key, candidate, self.inventory.as_ref()).await?;

        let paths = self.workspace.allocate(&job_id).await?;
        env.insert(WORKSPACE_ENV.to_string(), paths.workspace.to_string_lossy().into_owned());
        env.insert(JOB_ID_ENV.to_string(), job_id.clone());
        let job = Job {
            job_id: job_id.clone(),
            repo,
            env,
            exclusive,
            started_at: None,
            finished_at: None,
            pid: None,
            exit_code: None,
            path: paths.root.clone(),
            callback,
            reconciled: false,
        };
        let (job, process) = match self.launch(&paths, job).await {
            Ok(launched) => launched,
            Err(err) => {
                warn!("could not start job {}: {}", job_id, err);
                if let Err(cleanup) = self.workspace.destroy(&job_id).await {
                    warn!("could not clean up workspace of job {}: {}", job_id, cleanup);
                }
                return Err(err);
            }
        };
        if let Err(err) = registry.insert(job.clone()) {
            // unreachable while admission holds the same guard
            if let Some(pid) = job.pid {
                if let Err(kill) = kill_tree(pid) {
                    warn!("could not stop unregistered job {} (pid {}): {}", job.job_id, pid, kill);
                }
            }
            return Err(err);
        }
        drop(registry);

        info!("job {} running with pid {:?}", job.job_id, job.pid);
        tokio::spawn(
            self.supervisor
                .clone()
                .supervise(process, job.clone(), paths.output),
        );
        Ok(job)
    }

    /// renders the script, spawns it and writes the initial metadata
    async fn launch(&self, paths: &JobPaths, mut job: Job) -> Result<(Job, JobProcess), JobError> {
        let script = self.materializer.render(&ScriptContext {
            repo: &job.repo,
            env: &job.env,
            workspace: &paths.workspace,
            local_repo: &paths.repo,
            init_script: &self.config.init_script,
        })?;
        fs::write(&paths.script, script).await?;
        let process =
            supervisor::spawn(paths, &job.env, self.config.interactive).map_err(JobError::Spawn)?;
        job.pid = process.id();
        job.started_at = Some(chrono::Utc::now());
        if let Err(err) = self.workspace.write_metadata(&job).await {
            if let Some(pid) = job.pid {
                if let Err(kill) = kill_tree(pid) {
                    warn!("could not stop job {} (pid {}) after failed start: {}", job.job_id, pid, kill);
                }
            }
            return Err(err);
        }
        Ok((job, process))
    }

    /// running jobs, plus every job on disk when `all` is set, ordered by start time
    #[instrument(skip(self))]
    pub async fn list(&self, all: bool, reverse: bool) -> Result<JobList, JobError> {
        let mut jobs = self.registry.list_running().await;
        sort_by_start(&mut jobs, reverse);
        let all = if all {
            let mut archived = self.workspace.archived().await?;
            sort_by_start(&mut archived, reverse);
            Some(archived)
        } else {
            None
        };
        Ok(JobList { jobs, all })
    }

    /// persisted metadata of a job, running or not
    #[instrument(skip(self))]
    pub async fn info(&self, job_id: &str) -> Result<Job, JobError> {
        self.workspace
            .read_metadata(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound(format!("no job with id {}", job_id)))
    }

    /// last `lines` lines of the job output, followed live while the job runs
    #[instrument(skip(self))]
    pub async fn stream(&self, job_id: &str, lines: usize) -> Result<OutputFollower, JobError> {
        let job = self.info(job_id).await?;
        let paths = self.workspace.paths(job_id)?;
        // the relay may still append for up to drain_grace after the pid is gone
        let follow = match job.pid {
            Some(pid) if !job.is_finished() => Some(Follow {
                pid,
                metadata: paths.metadata.clone(),
                settle: self.config.drain_grace + self.config.poll_interval,
            }),
            _ => None,
        };
        OutputFollower::open(
            &paths.output,
            lines,
            follow,
            self.config.heartbeat,
            self.config.poll_interval,
        )
        .await
        .map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => JobError::NotFound(format!("job {} has no output", job_id)),
            _ => err.into(),
        })
    }

    /// Signals the job's process tree. Returns as soon as the signals are
    /// sent, the supervisor records the exit.
    #[instrument(skip(self))]
    pub async fn terminate(&self, job_id: &str) -> Result<(), JobError> {
        let registry = self.registry.lock().await;
        let pid = registry
            .find(job_id)
            .and_then(|job| job.pid)
            .ok_or_else(|| JobError::Gone(format!("job {} is not running", job_id)))?;
        info!("try to terminate job {} with pid {}", job_id, pid);
        kill_tree(pid)?;
        Ok(())
    }

    /// listing of a directory in the job root, or the path of a file to send
    #[instrument(skip(self))]
    pub async fn files(&self, job_id: &str, path: &Path) -> Result<JobEntry, JobError> {
        if !self.workspace.exists(job_id).await? {
            return Err(JobError::NotFound(format!("no job with id {}", job_id)));
        }
        self.workspace.entry(job_id, path).await
    }

    /// removes the job root of a job that is not running
    #[instrument(skip(self))]
    pub async fn delete_files(&self, job_id: &str) -> Result<(), JobError> {
        let registry = self.registry.lock().await;
        if registry.find(job_id).is_some() {
            return Err(JobError::Conflict(format!("job {} is running", job_id)));
        }
        if !self.workspace.destroy(job_id).await? {
            return Err(JobError::NotFound(format!("no job with id {}", job_id)));
        }
        info!("deleted files of job {}", job_id);
        Ok(())
    }

    /// attached devices matching `filter`, healthy ones with their properties
    pub async fn devices(&self, filter: DeviceFilter) -> Result<Vec<Device>, JobError> {
        let mut devices = Vec::new();
        for device in self.inventory.devices().await? {
            if filter.matches(&device) {
                devices.push(self.inventory.describe(device).await);
            }
        }
        Ok(devices)
    }

    /// settles jobs a previous instance left without an exit code
    pub async fn reconcile(&self) -> Result<ReconcileReport, JobError> {
        reconcile(
            &self.registry,
            &self.workspace,
            &self.supervisor,
            self.config.orphan_poll,
        )
        .await
    }
}

fn sort_by_start(jobs: &mut [Job], reverse: bool) {
    jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
    if reverse {
        jobs.reverse();
    }
}
