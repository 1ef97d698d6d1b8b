// Funding event (webhook) job storage provider trait

use async_trait::async_trait;
use stack_common::{
    events::{EventJobStatus, FundingEventJob},
    ids::EventJobId,
    time::Timestamp,
};

use crate::core::error::CoreError;

#[async_trait]
pub trait EventJobProvider {
    async fn get_event_job(&self, id: &EventJobId) -> Result<Option<FundingEventJob>, CoreError>;

    /// The (chain, tx_hash) unique key. Duplicate webhook deliveries land
    /// on the same row.
    async fn get_event_job_by_dedup(
        &self,
        chain: &str,
        tx_hash: &str,
    ) -> Result<Option<FundingEventJob>, CoreError>;

    /// Insert a job; fails with `conflict` if the (chain, tx_hash) slot is
    /// already taken.
    async fn insert_event_job(&mut self, job: &FundingEventJob) -> Result<(), CoreError>;

    async fn update_event_job(&mut self, job: &FundingEventJob) -> Result<(), CoreError>;

    /// Claim the next due pending job, flipping it to processing with a
    /// lease expiring at `lease_until`. A processing row whose lease has
    /// lapsed (worker died mid-job) is claimable again.
    async fn claim_due_event_job(
        &mut self,
        now: Timestamp,
        lease_until: Timestamp,
    ) -> Result<Option<FundingEventJob>, CoreError>;

    async fn list_event_jobs(
        &self,
        status: Option<EventJobStatus>,
    ) -> Result<Vec<FundingEventJob>, CoreError>;
}
