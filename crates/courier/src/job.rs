//! Job Manager contract and an in-memory implementation.

use crate::error::{AgentError, Result};
use courier_conf::{JobProfile, Profile};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// The job subsystem as seen by the trigger manager.
///
/// Only instance ids cross this boundary; job internals stay behind it.
pub trait JobManager: Send + Sync {
    fn submit_job_profile(&self, profile: JobProfile) -> Result<()>;

    /// Delete a job. Unknown ids return `false`.
    fn delete_job(&self, instance_id: &str) -> bool;

    /// Live jobs keyed by instance id.
    fn jobs(&self) -> HashMap<String, JobProfile>;
}

/// Keeps submitted jobs in memory until they are deleted or completed.
#[derive(Debug, Default)]
pub struct InMemoryJobManager {
    jobs: Mutex<HashMap<String, JobProfile>>,
}

impl InMemoryJobManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a job finished; it leaves the live set.
    pub fn complete_job(&self, instance_id: &str) -> bool {
        let removed = self.lock_jobs().remove(instance_id).is_some();
        if removed {
            info!(instance_id, "job completed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock_jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_jobs().is_empty()
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.lock_jobs().contains_key(instance_id)
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<String, JobProfile>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl JobManager for InMemoryJobManager {
    fn submit_job_profile(&self, profile: JobProfile) -> Result<()> {
        if !profile.all_required_key_exist() {
            return Err(AgentError::invalid_profile(format!(
                "job profile missing keys: {}",
                profile.missing_keys().join(", ")
            )));
        }
        let instance_id = profile
            .instance_id()
            .ok_or_else(|| AgentError::job("job profile has no instance id"))?;

        let mut jobs = self.lock_jobs();
        if jobs.contains_key(&instance_id) {
            return Err(AgentError::job(format!(
                "job instance {} already submitted",
                instance_id
            )));
        }
        debug!(instance_id = %instance_id, job_id = ?profile.job_id(), "job submitted");
        jobs.insert(instance_id, profile);
        Ok(())
    }

    fn delete_job(&self, instance_id: &str) -> bool {
        let removed = self.lock_jobs().remove(instance_id).is_some();
        if removed {
            debug!(instance_id, "job deleted");
        }
        removed
    }

    fn jobs(&self) -> HashMap<String, JobProfile> {
        self.lock_jobs().clone()
    }
}
