use devjob_data::NO_DEVICE;
use tracing::warn;

use crate::{error::JobError, inventory::DeviceInventory, registry::RegistryGuard};

/// What admission needs to know about a job that wants to start.
#[derive(Clone, Copy, Debug)]
pub struct Candidate<'a> {
    pub job_id: &'a str,
    pub device: &'a str,
    pub exclusive: bool,
}

/// Decides whether `candidate` may start right now.
///
/// Runs under the registry guard and the caller keeps holding it until the job
/// is inserted, so no conflicting job can be admitted in between.
pub async fn admit(
    registry: &RegistryGuard<'_>,
    device_key: &str,
    candidate: Candidate<'_>,
    inventory: &dyn DeviceInventory,
) -> Result<(), JobError> {
    if candidate.exclusive {
        if let Some(holder) = registry.exclusive_holder(device_key, candidate.device) {
            return Err(JobError::Conflict(format!(
                "device {} is busy with exclusive job {}",
                candidate.device, holder.job_id
            )));
        }
    }

    if candidate.device != NO_DEVICE {
        let healthy = match inventory.is_healthy(candidate.device).await {
            Ok(healthy) => healthy,
            Err(err) => {
                warn!("device inventory query failed: {}", err);
                false
            }
        };
        if !healthy {
            return Err(JobError::NotFound(format!(
                "device {} is not attached or not healthy",
                candidate.device
            )));
        }
    }

    if registry.find(candidate.job_id).is_some() {
        return Err(JobError::DuplicateJob(candidate.job_id.to_string()));
    }
    Ok(())
}
