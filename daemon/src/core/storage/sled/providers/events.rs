use async_trait::async_trait;
use stack_common::{
    events::{EventJobStatus, FundingEventJob},
    ids::EventJobId,
    time::Timestamp,
};

use crate::core::{
    error::CoreError,
    storage::{sled::SledStorage, EventJobProvider},
};

const JOB_PREFIX: &[u8] = b"ev:";
const DEDUP_PREFIX: &[u8] = b"evd:";

fn job_key(id: &EventJobId) -> Vec<u8> {
    SledStorage::concat_key(JOB_PREFIX, id.as_bytes())
}

fn dedup_key(chain: &str, tx_hash: &str) -> Vec<u8> {
    SledStorage::concat_key(
        DEDUP_PREFIX,
        FundingEventJob::dedup_key(tx_hash, chain).as_bytes(),
    )
}

// Claim lease: a processing row carries its lease expiry in next_retry_at,
// so a worker death just means the row becomes due again.
fn claimable(job: &FundingEventJob, now: Timestamp) -> bool {
    match job.status {
        EventJobStatus::Pending => job.next_retry_at.map(|at| at <= now).unwrap_or(true),
        EventJobStatus::Processing => job.next_retry_at.map(|at| at <= now).unwrap_or(false),
        _ => false,
    }
}

#[async_trait]
impl EventJobProvider for SledStorage {
    async fn get_event_job(
        &self,
        id: &EventJobId,
    ) -> Result<Option<FundingEventJob>, CoreError> {
        Self::load(&self.events, &job_key(id))
    }

    async fn get_event_job_by_dedup(
        &self,
        chain: &str,
        tx_hash: &str,
    ) -> Result<Option<FundingEventJob>, CoreError> {
        Self::load_via_index(&self.events, &dedup_key(chain, tx_hash))
    }

    async fn insert_event_job(&mut self, job: &FundingEventJob) -> Result<(), CoreError> {
        let index = dedup_key(&job.chain, &job.tx_hash);
        if self.events.contains_key(&index)? {
            return Err(CoreError::Conflict(format!(
                "event job already captured for {}:{}",
                job.chain, job.tx_hash
            )));
        }
        let key = job_key(&job.id);
        Self::save(&self.events, &key, job)?;
        self.events.insert(index, key)?;
        Ok(())
    }

    async fn update_event_job(&mut self, job: &FundingEventJob) -> Result<(), CoreError> {
        let key = job_key(&job.id);
        if !self.events.contains_key(&key)? {
            return Err(CoreError::NotFound(format!("event job {}", job.id)));
        }
        Self::save(&self.events, &key, job)
    }

    async fn claim_due_event_job(
        &mut self,
        now: Timestamp,
        lease_until: Timestamp,
    ) -> Result<Option<FundingEventJob>, CoreError> {
        for item in self.events.scan_prefix(JOB_PREFIX) {
            let (key, bytes) = item?;
            let mut job: FundingEventJob = serde_json::from_slice(&bytes)?;
            if claimable(&job, now) {
                job.status = EventJobStatus::Processing;
                job.next_retry_at = Some(lease_until);
                Self::save(&self.events, &key, &job)?;
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    async fn list_event_jobs(
        &self,
        status: Option<EventJobStatus>,
    ) -> Result<Vec<FundingEventJob>, CoreError> {
        let all: Vec<FundingEventJob> = Self::scan_prefix(&self.events, JOB_PREFIX)?;
        Ok(match status {
            Some(status) => all.into_iter().filter(|job| job.status == status).collect(),
            None => all,
        })
    }
}
