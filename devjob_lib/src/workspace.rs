use std::{
    io,
    path::{Component, Path, PathBuf},
    time::UNIX_EPOCH,
};

use devjob_data::{FileEntry, Job};
use tokio::fs;
use tracing::{info, warn};

use crate::error::JobError;

pub const WORKSPACE_DIR: &str = "workspace";
pub const REPO_DIR: &str = "repo";
pub const OUTPUT_FILE: &str = "output";
pub const SCRIPT_FILE: &str = "run.sh";
pub const METADATA_FILE: &str = "job.json";

/// Locations inside one job root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobPaths {
    pub root: PathBuf,
    pub workspace: PathBuf,
    pub repo: PathBuf,
    pub output: PathBuf,
    pub script: PathBuf,
    pub metadata: PathBuf,
}

impl JobPaths {
    fn new(root: PathBuf) -> Self {
        Self {
            workspace: root.join(WORKSPACE_DIR),
            repo: root.join(REPO_DIR),
            output: root.join(OUTPUT_FILE),
            script: root.join(SCRIPT_FILE),
            metadata: root.join(METADATA_FILE),
            root,
        }
    }
}

/// What a path inside a job root points at.
#[derive(Debug)]
pub enum JobEntry {
    Dir(Vec<FileEntry>),
    File(PathBuf),
}

/// Owns the on-disk job directories under one root.
#[derive(Clone, Debug)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn paths(&self, job_id: &str) -> Result<JobPaths, JobError> {
        validate_job_id(job_id)?;
        Ok(JobPaths::new(self.root.join(job_id)))
    }

    /// wipes whatever a previous job with this id left behind and lays out a fresh tree
    pub async fn allocate(&self, job_id: &str) -> Result<JobPaths, JobError> {
        let paths = self.paths(job_id)?;
        match fs::remove_dir_all(&paths.root).await {
            Ok(()) => info!("removed stale job directory {}", paths.root.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        fs::create_dir_all(&paths.workspace).await?;
        fs::File::create(&paths.output).await?;
        Ok(paths)
    }

    /// returns false when there was nothing to remove
    pub async fn destroy(&self, job_id: &str) -> Result<bool, JobError> {
        let paths = self.paths(job_id)?;
        match fs::remove_dir_all(&paths.root).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn exists(&self, job_id: &str) -> Result<bool, JobError> {
        let paths = self.paths(job_id)?;
        Ok(fs::metadata(&paths.root).await.is_ok())
    }

    pub async fn write_metadata(&self, job: &Job) -> Result<(), JobError> {
        let paths = self.paths(&job.job_id)?;
        let json = serde_json::to_vec_pretty(job)?;
        // readers never see a half written file
        let tmp = paths.metadata.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &paths.metadata).await?;
        Ok(())
    }

    pub async fn read_metadata(&self, job_id: &str) -> Result<Option<Job>, JobError> {
        let paths = self.paths(job_id)?;
        match fs::read(&paths.metadata).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// every job with readable metadata, running or not
    pub async fn archived(&self) -> Result<Vec<Job>, JobError> {
        let mut jobs = Vec::new();
        let mut dirs = match fs::read_dir(&self.root).await {
            Ok(dirs) => dirs,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(jobs),
            Err(err) => return Err(err.into()),
        };
        while let Some(dir) = dirs.next_entry().await? {
            let metadata = dir.path().join(METADATA_FILE);
            let raw = match fs::read(&metadata).await {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            match serde_json::from_slice::<Job>(&raw) {
                Ok(job) => jobs.push(job),
                Err(err) => warn!("skipping unreadable {}: {}", metadata.display(), err),
            }
        }
        Ok(jobs)
    }

    /// resolves `rel` inside the job root to a listing or a file
    pub async fn entry(&self, job_id: &str, rel: &Path) -> Result<JobEntry, JobError> {
        let paths = self.paths(job_id)?;
        if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(JobError::BadRequest(format!(
                "path {} leaves the job directory",
                rel.display()
            )));
        }
        let target = paths.root.join(rel);
        let not_found = || JobError::NotFound(format!("{} does not exist in job {}", rel.display(), job_id));
        let meta = match fs::metadata(&target).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(not_found()),
            Err(err) => return Err(err.into()),
        };
        if !meta.is_dir() {
            return Ok(JobEntry::File(target));
        }
        let mut files = Vec::new();
        let mut dir = fs::read_dir(&target).await?;
        while let Some(entry) = dir.next_entry().await? {
            let meta = entry.metadata().await?;
            files.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: meta.is_dir(),
                create_time: unix_seconds(meta.created().or_else(|_| meta.modified())),
                modify_time: unix_seconds(meta.modified()),
                size: meta.len(),
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(JobEntry::Dir(files))
    }
}

fn unix_seconds(time: io::Result<std::time::SystemTime>) -> i64 {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// job ids name a directory, so they must be a single plain path segment
pub fn validate_job_id(job_id: &str) -> Result<(), JobError> {
    let valid = !job_id.is_empty()
        && job_id.len() <= 128
        && job_id != "."
        && job_id != ".."
        && !job_id.contains(|c: char| c == '/' || c == '\\' || c == '\0');
    if valid {
        Ok(())
    } else {
        Err(JobError::BadRequest(format!("invalid job id {:?}", job_id)))
    }
}
