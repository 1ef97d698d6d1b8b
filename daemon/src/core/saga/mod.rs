// Saga plumbing: durable step queue and the worker that drains it.
//
// A step is enqueued with an idempotency key derived from (entity, step),
// so re-enqueueing a hop collapses onto the existing row. The runner claims
// one due step at a time, dispatches it under the step deadline, and feeds
// failures through the retry classification.

pub mod funding;
pub mod withdrawal;

use stack_common::{
    idempotency::derive_key,
    ids::{StepJobId, TraceId},
    saga::{SagaStepJob, SagaStepKind, StepStatus},
    time,
};

use crate::config::{CLAIM_VISIBILITY_TIMEOUT, DEFAULT_MAX_ATTEMPTS, STEP_DEADLINE};
use crate::core::{
    audit::Audit,
    backoff,
    error::CoreError,
    storage::{SagaStepProvider, SharedStorage, Storage},
};

pub use funding::FundingSaga;
pub use withdrawal::WithdrawalSaga;

/// Enqueue a step for an entity. Safe to call repeatedly: the derived key
/// collapses duplicates onto the first row.
pub async fn enqueue_step<S: Storage>(
    storage: &mut S,
    kind: SagaStepKind,
    entity_id: &str,
    trace_id: &TraceId,
) -> Result<SagaStepJob, CoreError> {
    let now = time::now();
    let step = SagaStepJob {
        id: StepJobId::generate(),
        kind,
        entity_id: entity_id.to_string(),
        status: StepStatus::Pending,
        attempt_count: 0,
        max_attempts: DEFAULT_MAX_ATTEMPTS,
        next_retry_at: None,
        last_error: None,
        idempotency_key: derive_key(entity_id, &kind.to_string()),
        trace_id: trace_id.clone(),
        created_at: now,
        updated_at: now,
    };
    let step = storage.insert_step(&step).await?;
    debug!("enqueued step {} for {} [{}]", kind, entity_id, trace_id);
    Ok(step)
}

/// Drains the step queue. Multiple runners can share the queue: claims are
/// atomic under the storage write lock.
pub struct StepRunner<S: Storage> {
    storage: SharedStorage<S>,
    funding: FundingSaga<S>,
    withdrawals: WithdrawalSaga<S>,
    audit: Audit<S>,
}

impl<S: Storage> Clone for StepRunner<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            funding: self.funding.clone(),
            withdrawals: self.withdrawals.clone(),
            audit: self.audit.clone(),
        }
    }
}

impl<S: Storage> StepRunner<S> {
    pub fn new(
        storage: SharedStorage<S>,
        funding: FundingSaga<S>,
        withdrawals: WithdrawalSaga<S>,
        audit: Audit<S>,
    ) -> Self {
        Self {
            storage,
            funding,
            withdrawals,
            audit,
        }
    }

    /// Claim and run one due step. Returns whether a step was processed,
    /// so callers can drain eagerly before sleeping.
    pub async fn poll_once(&self) -> Result<bool, CoreError> {
        let now = time::now();
        let stale_before = now
            - chrono::Duration::from_std(CLAIM_VISIBILITY_TIMEOUT)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let claimed = {
            let mut storage = self.storage.write().await;
            storage.claim_due_step(now, stale_before).await?
        };
        let Some(mut step) = claimed else {
            return Ok(false);
        };

        trace!("running step {} for {} [{}]", step.kind, step.entity_id, step.trace_id);
        // a step that outlives its deadline counts as an in-flight
        // transient failure and is rescheduled with the next backoff
        let outcome = match tokio::time::timeout(STEP_DEADLINE, self.dispatch(&step)).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::ExternalTransient {
                service: "step".to_string(),
                message: format!("step {} exceeded its deadline", step.kind),
            }),
        };

        match outcome {
            Ok(()) => {
                step.status = StepStatus::Completed;
                step.updated_at = time::now();
                self.storage.write().await.update_step(&step).await?;
                metrics::counter!("saga_steps_completed").increment(1);
            }
            Err(err) => self.handle_step_failure(step, err).await?,
        }
        Ok(true)
    }

    async fn dispatch(&self, step: &SagaStepJob) -> Result<(), CoreError> {
        use SagaStepKind::*;
        match step.kind {
            FundingOffRampInitiate => {
                self.funding
                    .step_off_ramp_initiate(&parse_id(&step.entity_id)?, &step.trace_id)
                    .await
            }
            FundingOffRampComplete => {
                self.funding
                    .step_off_ramp_complete(&parse_id(&step.entity_id)?, &step.trace_id)
                    .await
            }
            FundingBrokerFund => {
                self.funding
                    .step_broker_fund(&parse_id(&step.entity_id)?, &step.trace_id)
                    .await
            }
            FundingCompensate => {
                self.funding
                    .compensate(&parse_id(&step.entity_id)?, &step.trace_id)
                    .await
            }
            WithdrawalBrokerInitiate => {
                self.withdrawals
                    .step_broker_initiate(&parse_id(&step.entity_id)?, &step.trace_id)
                    .await
            }
            WithdrawalOnRampInitiate => {
                self.withdrawals
                    .step_on_ramp_initiate(&parse_id(&step.entity_id)?, &step.trace_id)
                    .await
            }
            WithdrawalOnRampComplete => {
                self.withdrawals
                    .step_on_ramp_complete(&parse_id(&step.entity_id)?, &step.trace_id)
                    .await
            }
            WithdrawalTransferInitiate => {
                self.withdrawals
                    .step_transfer_initiate(&parse_id(&step.entity_id)?, &step.trace_id)
                    .await
            }
            WithdrawalFinalize => {
                self.withdrawals
                    .step_finalize(&parse_id(&step.entity_id)?, &step.trace_id)
                    .await
            }
            WithdrawalCompensate => {
                self.withdrawals
                    .compensate(&parse_id(&step.entity_id)?, &step.trace_id)
                    .await
            }
        }
    }

    async fn handle_step_failure(
        &self,
        mut step: SagaStepJob,
        err: CoreError,
    ) -> Result<(), CoreError> {
        step.attempt_count += 1;
        step.last_error = Some(err.to_string());
        step.updated_at = time::now();

        if err.is_retryable() && step.attempt_count < step.max_attempts {
            warn!(
                "step {} for {} failed (attempt {}/{}), retrying: {err}",
                step.kind, step.entity_id, step.attempt_count, step.max_attempts
            );
            step.status = StepStatus::Pending;
            step.next_retry_at = Some(backoff::next_retry_at(step.attempt_count));
            self.storage.write().await.update_step(&step).await?;
            metrics::counter!("saga_steps_retried").increment(1);
            return Ok(());
        }

        let exhausted = err.is_retryable();
        step.status = if exhausted {
            StepStatus::Dlq
        } else {
            StepStatus::Failed
        };
        error!(
            "step {} for {} moved to {} after {} attempts: {err}",
            step.kind, step.entity_id, step.status, step.attempt_count
        );
        self.storage.write().await.update_step(&step).await?;
        metrics::counter!("saga_steps_dead", "status" => step.status.to_string()).increment(1);
        self.audit
            .record_failure(
                None,
                if exhausted {
                    "saga_step.dead_lettered"
                } else {
                    "saga_step.failed"
                },
                "saga_step",
                &step.id.to_string(),
                &err,
                &step.trace_id,
            )
            .await;

        // a permanently failed forward step triggers the entity's
        // compensation; a failed compensation is already terminal and has
        // raised its own exception
        if !matches!(
            step.kind,
            SagaStepKind::FundingCompensate | SagaStepKind::WithdrawalCompensate
        ) {
            let compensation = if step.kind.to_string().starts_with("funding") {
                SagaStepKind::FundingCompensate
            } else {
                SagaStepKind::WithdrawalCompensate
            };
            let mut storage = self.storage.write().await;
            enqueue_step(&mut *storage, compensation, &step.entity_id, &step.trace_id).await?;
        }
        Ok(())
    }
}

fn parse_id<T: std::str::FromStr>(raw: &str) -> Result<T, CoreError> {
    raw.parse()
        .map_err(|_| CoreError::Internal(format!("malformed entity id on step: {raw}")))
}
