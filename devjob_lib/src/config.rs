use std::{path::PathBuf, time::Duration};

pub const DEFAULT_DEVICE_KEY: &str = "ANDROID_SERIAL";
pub const DEFAULT_INIT_SCRIPT: &str = ".init.sh";

#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// directory holding one subdirectory per job
    pub jobs_root: PathBuf,
    /// init script run from the checked out repo when the job names none
    pub init_script: String,
    /// env key selecting the target device
    pub device_key: String,
    /// idle period after which a live stream emits a heartbeat
    pub heartbeat: Duration,
    /// how often a live stream polls the output file and the process
    pub poll_interval: Duration,
    /// how long output relay may keep draining after the script exited
    pub drain_grace: Duration,
    /// answer host key and password prompts on the script's stdin
    pub interactive: bool,
    pub callback_timeout: Duration,
    /// how often reconciliation checks whether an orphaned job is gone
    pub orphan_poll: Duration,
}

impl PoolConfig {
    pub fn new(jobs_root: impl Into<PathBuf>) -> Self {
        Self {
            jobs_root: jobs_root.into(),
            init_script: DEFAULT_INIT_SCRIPT.to_string(),
            device_key: DEFAULT_DEVICE_KEY.to_string(),
            heartbeat: Duration::from_secs(5),
            poll_interval: Duration::from_millis(200),
            drain_grace: Duration::from_secs(2),
            interactive: true,
            callback_timeout: Duration::from_secs(10),
            orphan_poll: Duration::from_secs(1),
        }
    }
}
