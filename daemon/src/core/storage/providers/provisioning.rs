// Wallet provisioning job storage provider trait

use async_trait::async_trait;
use stack_common::{
    ids::ProvisioningJobId,
    time::Timestamp,
    wallet::WalletProvisioningJob,
};

use crate::core::error::CoreError;

#[async_trait]
pub trait ProvisioningJobProvider {
    async fn get_provisioning_job(
        &self,
        id: &ProvisioningJobId,
    ) -> Result<Option<WalletProvisioningJob>, CoreError>;

    async fn insert_provisioning_job(
        &mut self,
        job: &WalletProvisioningJob,
    ) -> Result<(), CoreError>;

    async fn update_provisioning_job(
        &mut self,
        job: &WalletProvisioningJob,
    ) -> Result<(), CoreError>;

    /// Claim the next due job: queued or retry rows whose retry time has
    /// passed, plus in-progress rows older than the visibility cutoff
    /// (worker died mid-job). The claim flips the row to in-progress
    /// before it is returned, so concurrent pollers never share a job.
    async fn claim_due_provisioning_job(
        &mut self,
        now: Timestamp,
        stale_before: Timestamp,
    ) -> Result<Option<WalletProvisioningJob>, CoreError>;

    async fn list_provisioning_jobs(&self) -> Result<Vec<WalletProvisioningJob>, CoreError>;
}
