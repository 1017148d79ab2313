use std::{collections::BTreeMap, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// env key holding the job's workspace directory
pub const WORKSPACE_ENV: &str = "WORKSPACE";
/// env key holding the job id
pub const JOB_ID_ENV: &str = "JOB_ID";
/// device selector value for jobs that need no device
pub const NO_DEVICE: &str = "no_device";

/// Full job record, persisted as `job.json` in the job root.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub repo: Value,
    pub env: BTreeMap<String, String>,
    pub exclusive: bool,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
    /// exit code was assigned after a restart instead of being observed
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reconciled: bool,
}

impl Job {
    pub fn is_finished(&self) -> bool {
        self.exit_code.is_some()
    }

    /// value of the device selector, `NO_DEVICE` when unset
    pub fn device<'a>(&'a self, device_key: &str) -> &'a str {
        self.env
            .get(device_key)
            .map(String::as_str)
            .unwrap_or(NO_DEVICE)
    }
}

/// Body of a job creation request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateJob {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub repo: Option<Value>,
    #[serde(default)]
    pub exclusive: Option<bool>,
    #[serde(default)]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub callback: Option<String>,
}

impl CreateJob {
    pub fn new(repo: Value) -> Self {
        Self {
            repo: Some(repo),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobList {
    pub jobs: Vec<Job>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all: Option<Vec<Job>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub is_dir: bool,
    pub create_time: i64,
    pub modify_time: i64,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListing {
    pub files: Vec<FileEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub serial: String,
    pub state: String,
    pub healthy: bool,
    /// build and product properties, only read from healthy devices
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}
