use async_trait::async_trait;
use stack_common::{
    ids::StepJobId,
    saga::{SagaStepJob, StepStatus},
    time::Timestamp,
};

use crate::core::{
    error::CoreError,
    storage::{sled::SledStorage, SagaStepProvider},
};

const STEP_PREFIX: &[u8] = b"st:";
const IDEM_PREFIX: &[u8] = b"sti:";

fn step_key(id: &StepJobId) -> Vec<u8> {
    SledStorage::concat_key(STEP_PREFIX, id.as_bytes())
}

fn idem_key(key: &str) -> Vec<u8> {
    SledStorage::concat_key(IDEM_PREFIX, key.as_bytes())
}

fn claimable(step: &SagaStepJob, now: Timestamp, stale_before: Timestamp) -> bool {
    match step.status {
        StepStatus::Pending => step.next_retry_at.map(|at| at <= now).unwrap_or(true),
        StepStatus::Processing => step.updated_at <= stale_before,
        _ => false,
    }
}

#[async_trait]
impl SagaStepProvider for SledStorage {
    async fn get_step(&self, id: &StepJobId) -> Result<Option<SagaStepJob>, CoreError> {
        Self::load(&self.steps, &step_key(id))
    }

    async fn get_step_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<SagaStepJob>, CoreError> {
        Self::load_via_index(&self.steps, &idem_key(key))
    }

    async fn insert_step(&mut self, step: &SagaStepJob) -> Result<SagaStepJob, CoreError> {
        // enqueueing the same hop twice is expected during retries; hand
        // back the row that already owns the key
        if let Some(existing) = self
            .get_step_by_idempotency_key(&step.idempotency_key)
            .await?
        {
            return Ok(existing);
        }
        let key = step_key(&step.id);
        Self::save(&self.steps, &key, step)?;
        self.steps.insert(idem_key(&step.idempotency_key), key)?;
        Ok(step.clone())
    }

    async fn update_step(&mut self, step: &SagaStepJob) -> Result<(), CoreError> {
        let key = step_key(&step.id);
        if !self.steps.contains_key(&key)? {
            return Err(CoreError::NotFound(format!("saga step {}", step.id)));
        }
        Self::save(&self.steps, &key, step)
    }

    async fn claim_due_step(
        &mut self,
        now: Timestamp,
        stale_before: Timestamp,
    ) -> Result<Option<SagaStepJob>, CoreError> {
        for item in self.steps.scan_prefix(STEP_PREFIX) {
            let (key, bytes) = item?;
            let mut step: SagaStepJob = serde_json::from_slice(&bytes)?;
            if claimable(&step, now, stale_before) {
                step.status = StepStatus::Processing;
                step.updated_at = now;
                Self::save(&self.steps, &key, &step)?;
                return Ok(Some(step));
            }
        }
        Ok(None)
    }

    async fn list_steps(&self) -> Result<Vec<SagaStepJob>, CoreError> {
        Self::scan_prefix(&self.steps, STEP_PREFIX)
    }
}
