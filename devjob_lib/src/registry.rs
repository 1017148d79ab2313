use std::collections::HashMap;

use devjob_data::Job;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::JobError;

/// The set of jobs spawned by this process that have not finished yet.
///
/// Every access goes through [`JobRegistry::lock`], which hands out a
/// [`RegistryGuard`]. Admission decisions need a consistent view of all
/// running jobs, so there is a single lock for the whole map rather than one
/// per job.
pub struct JobRegistry {
    running: Mutex<HashMap<String, Job>>,
}

impl JobRegistry {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            running: Mutex::new(HashMap::new()),
        }
    }

    /// enter the registry critical section
    pub async fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            running: self.running.lock().await,
        }
    }

    pub async fn list_running(&self) -> Vec<Job> {
        self.lock().await.list_running()
    }

    pub async fn find(&self, job_id: &str) -> Result<Job, JobError> {
        self.lock()
            .await
            .find(job_id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(format!("no running job with id {}", job_id)))
    }

    pub async fn is_running(&self, job_id: &str) -> bool {
        self.lock().await.find(job_id).is_some()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RegistryGuard<'a> {
    running: MutexGuard<'a, HashMap<String, Job>>,
}

impl RegistryGuard<'_> {
    pub fn insert(&mut self, job: Job) -> Result<(), JobError> {
        if self.running.contains_key(&job.job_id) {
            return Err(JobError::DuplicateJob(job.job_id));
        }
        self.running.insert(job.job_id.clone(), job);
        Ok(())
    }

    pub fn remove(&mut self, job_id: &str) -> Option<Job> {
        self.running.remove(job_id)
    }

    pub fn find(&self, job_id: &str) -> Option<&Job> {
        self.running.get(job_id)
    }

    pub fn list_running(&self) -> Vec<Job> {
        self.running.values().cloned().collect()
    }

    /// running exclusive job bound to `device`, if any
    pub fn exclusive_holder(&self, device_key: &str, device: &str) -> Option<&Job> {
        self.running
            .values()
            .find(|job| job.exclusive && job.device(device_key) == device)
    }
}

#[cfg(test)]
mod test {
    use crate::{error::JobError, testing::job_fixture, testing::RUNTIME};

    use super::JobRegistry;

    #[test]
    fn test_insert_duplicate() {
        let registry = JobRegistry::new();
        RUNTIME.block_on(async {
            let mut guard = registry.lock().await;
            guard.insert(job_fixture("a", "X", true)).unwrap();
            match guard.insert(job_fixture("a", "Y", false)) {
                Err(JobError::DuplicateJob(id)) => assert_eq!("a", id),
                other => panic!("expected duplicate job error, got {:?}", other),
            }
            assert_eq!(1, guard.list_running().len());
        });
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let registry = JobRegistry::new();
        RUNTIME.block_on(async {
            assert!(registry.lock().await.remove("missing").is_none());
            assert!(matches!(
                registry.find("missing").await,
                Err(JobError::NotFound(_))
            ));
        });
    }

    #[test]
    fn test_list_is_snapshot() {
        let registry = JobRegistry::new();
        RUNTIME.block_on(async {
            registry
                .lock()
                .await
                .insert(job_fixture("a", "X", true))
                .unwrap();
            let snapshot = registry.list_running().await;
            registry.lock().await.remove("a");
            assert_eq!(1, snapshot.len());
            assert!(registry.list_running().await.is_empty());
            assert!(!registry.is_running("a").await);
        });
    }

    #[test]
    fn test_exclusive_holder() {
        let registry = JobRegistry::new();
        RUNTIME.block_on(async {
            let mut guard = registry.lock().await;
            guard.insert(job_fixture("shared", "X", false)).unwrap();
            assert!(guard.exclusive_holder("ANDROID_SERIAL", "X").is_none());
            guard.insert(job_fixture("owner", "X", true)).unwrap();
            let holder = guard.exclusive_holder("ANDROID_SERIAL", "X").unwrap();
            assert_eq!("owner", holder.job_id);
            assert!(guard.exclusive_holder("ANDROID_SERIAL", "Y").is_none());
        });
    }
}
