use async_trait::async_trait;
use stack_common::{
    ids::ProvisioningJobId,
    time::Timestamp,
    wallet::{ProvisioningJobStatus, WalletProvisioningJob},
};

use crate::core::{
    error::CoreError,
    storage::{sled::SledStorage, ProvisioningJobProvider},
};

const JOB_PREFIX: &[u8] = b"pj:";

fn job_key(id: &ProvisioningJobId) -> Vec<u8> {
    SledStorage::concat_key(JOB_PREFIX, id.as_bytes())
}

fn claimable(job: &WalletProvisioningJob, now: Timestamp, stale_before: Timestamp) -> bool {
    match job.status {
        ProvisioningJobStatus::Queued => true,
        ProvisioningJobStatus::Retry => job
            .next_retry_at
            .map(|at| at <= now)
            .unwrap_or(true),
        // a worker died mid-job; re-claim after the visibility timeout
        ProvisioningJobStatus::InProgress => job.updated_at <= stale_before,
        _ => false,
    }
}

#[async_trait]
impl ProvisioningJobProvider for SledStorage {
    async fn get_provisioning_job(
        &self,
        id: &ProvisioningJobId,
    ) -> Result<Option<WalletProvisioningJob>, CoreError> {
        Self::load(&self.provisioning, &job_key(id))
    }

    async fn insert_provisioning_job(
        &mut self,
        job: &WalletProvisioningJob,
    ) -> Result<(), CoreError> {
        Self::save(&self.provisioning, &job_key(&job.id), job)
    }

    async fn update_provisioning_job(
        &mut self,
        job: &WalletProvisioningJob,
    ) -> Result<(), CoreError> {
        let key = job_key(&job.id);
        if !self.provisioning.contains_key(&key)? {
            return Err(CoreError::NotFound(format!("provisioning job {}", job.id)));
        }
        Self::save(&self.provisioning, &key, job)
    }

    async fn claim_due_provisioning_job(
        &mut self,
        now: Timestamp,
        stale_before: Timestamp,
    ) -> Result<Option<WalletProvisioningJob>, CoreError> {
        for item in self.provisioning.scan_prefix(JOB_PREFIX) {
            let (key, bytes) = item?;
            let mut job: WalletProvisioningJob = serde_json::from_slice(&bytes)?;
            if claimable(&job, now, stale_before) {
                job.status = ProvisioningJobStatus::InProgress;
                job.updated_at = now;
                Self::save(&self.provisioning, &key, &job)?;
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    async fn list_provisioning_jobs(&self) -> Result<Vec<WalletProvisioningJob>, CoreError> {
        Self::scan_prefix(&self.provisioning, JOB_PREFIX)
    }
}
