use std::{collections::BTreeMap, path::Path, sync::Arc, sync::Once, time::Duration};

use devjob_data::Job;
use lazy_static::lazy_static;
use serde_json::json;
use tokio::{runtime::Runtime, time::sleep};

use crate::{
    config::PoolConfig, inventory::DeviceInventory, job_pool::JobPool,
    materialize::ShellMaterializer,
};

lazy_static! {
    pub static ref RUNTIME: Runtime = Runtime::new().unwrap();
}

static TRACING: Once = Once::new();

pub fn setup() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

pub fn job_fixture(job_id: &str, device: &str, exclusive: bool) -> Job {
    let mut env = BTreeMap::new();
    env.insert("ANDROID_SERIAL".to_string(), device.to_string());
    Job {
        job_id: job_id.to_string(),
        repo: json!({ "url": "https://example.com/repo.git" }),
        env,
        exclusive,
        started_at: Some(chrono::Utc::now()),
        finished_at: None,
        pid: Some(1),
        exit_code: None,
        path: Path::new("/tmp").join(job_id),
        callback: None,
        reconciled: false,
    }
}

pub fn test_config(root: &Path) -> PoolConfig {
    let mut config = PoolConfig::new(root);
    config.heartbeat = Duration::from_millis(300);
    config.poll_interval = Duration::from_millis(20);
    config.drain_grace = Duration::from_millis(500);
    config.orphan_poll = Duration::from_millis(50);
    config.callback_timeout = Duration::from_secs(1);
    config
}

pub fn test_pool(root: &Path, inventory: impl DeviceInventory + 'static) -> JobPool {
    JobPool::open(test_config(root), Arc::new(inventory), Arc::new(ShellMaterializer)).unwrap()
}

/// polls the persisted metadata until the job has an exit code
pub async fn wait_finished(pool: &JobPool, job_id: &str) -> Job {
    for _ in 0..500 {
        if let Ok(job) = pool.info(job_id).await {
            if job.is_finished() {
                return job;
            }
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("job {} did not finish in time", job_id);
}
