// Saga step queue storage provider trait

use async_trait::async_trait;
use stack_common::{
    ids::StepJobId,
    saga::SagaStepJob,
    time::Timestamp,
};

use crate::core::error::CoreError;

#[async_trait]
pub trait SagaStepProvider {
    async fn get_step(&self, id: &StepJobId) -> Result<Option<SagaStepJob>, CoreError>;

    async fn get_step_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<SagaStepJob>, CoreError>;

    /// Insert a step. Enqueueing the same idempotency key twice is a
    /// no-op returning the existing step.
    async fn insert_step(&mut self, step: &SagaStepJob) -> Result<SagaStepJob, CoreError>;

    async fn update_step(&mut self, step: &SagaStepJob) -> Result<(), CoreError>;

    /// Claim the next due pending step, flipping it to processing before
    /// returning. Stale processing rows past the visibility cutoff are
    /// claimable again.
    async fn claim_due_step(
        &mut self,
        now: Timestamp,
        stale_before: Timestamp,
    ) -> Result<Option<SagaStepJob>, CoreError>;

    async fn list_steps(&self) -> Result<Vec<SagaStepJob>, CoreError>;
}
