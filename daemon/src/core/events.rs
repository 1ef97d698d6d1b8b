// Webhook event worker.
//
// The HTTP surface only verifies and captures; this worker turns the
// captured rows into an at-least-once queue with retries and a dead
// letter state. (chain, tx_hash) uniqueness means partner retry storms
// collapse before they ever reach a saga, and saga-side idempotency makes
// reprocessing harmless.

use stack_common::{
    amount::Amount,
    api::ChainWebhookPayload,
    currency::Currency,
    events::{EventErrorType, EventJobStatus, FundingEventJob},
    ids::{EventJobId, TraceId},
    time,
};

use crate::config::{CLAIM_VISIBILITY_TIMEOUT, DEFAULT_MAX_ATTEMPTS, STEP_DEADLINE};
use crate::core::{
    audit::Audit,
    backoff,
    error::CoreError,
    saga::FundingSaga,
    storage::{SharedStorage, Storage},
};

pub struct EventWorker<S: Storage> {
    storage: SharedStorage<S>,
    funding: FundingSaga<S>,
    audit: Audit<S>,
}

impl<S: Storage> Clone for EventWorker<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            funding: self.funding.clone(),
            audit: self.audit.clone(),
        }
    }
}

impl<S: Storage> EventWorker<S> {
    pub fn new(storage: SharedStorage<S>, funding: FundingSaga<S>, audit: Audit<S>) -> Self {
        Self {
            storage,
            funding,
            audit,
        }
    }

    /// Durable capture of a verified webhook delivery. Duplicate
    /// deliveries for the same (chain, tx_hash) return the existing row
    /// untouched.
    pub async fn capture(
        &self,
        payload: &ChainWebhookPayload,
    ) -> Result<FundingEventJob, CoreError> {
        let amount = Amount::parse(&payload.amount, Currency::Usdc)
            .map_err(|err| CoreError::Validation(err.to_string()))?;

        let mut storage = self.storage.write().await;
        if let Some(existing) = storage
            .get_event_job_by_dedup(&payload.chain, &payload.tx_hash)
            .await?
        {
            debug!(
                "duplicate webhook for {}:{} collapsed onto job {}",
                payload.chain, payload.tx_hash, existing.id
            );
            metrics::counter!("webhook_duplicates").increment(1);
            return Ok(existing);
        }

        let job = FundingEventJob {
            id: EventJobId::generate(),
            tx_hash: payload.tx_hash.clone(),
            chain: payload.chain.clone(),
            token: payload.token.clone(),
            amount,
            to_address: payload.to_address.clone(),
            status: EventJobStatus::Pending,
            attempt_count: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            last_error: None,
            error_type: None,
            next_retry_at: None,
            first_seen_at: time::now(),
            completed_at: None,
            webhook_payload: serde_json::to_value(payload)?,
            trace_id: TraceId::generate(),
        };
        storage.insert_event_job(&job).await?;
        metrics::counter!("webhook_events_captured").increment(1);
        info!(
            "captured funding event {}:{} for {} [{}]",
            job.chain, job.tx_hash, job.to_address, job.trace_id
        );
        Ok(job)
    }

    /// Claim and process one due event. Returns whether a job was
    /// processed so callers can drain before sleeping.
    pub async fn poll_once(&self) -> Result<bool, CoreError> {
        let now = time::now();
        let lease_until = now
            + chrono::Duration::from_std(CLAIM_VISIBILITY_TIMEOUT)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let claimed = {
            let mut storage = self.storage.write().await;
            storage.claim_due_event_job(now, lease_until).await?
        };
        let Some(mut job) = claimed else {
            return Ok(false);
        };

        let outcome = match tokio::time::timeout(STEP_DEADLINE, self.funding.on_chain_event(&job))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(CoreError::ExternalTransient {
                service: "events".to_string(),
                message: "event processing exceeded its deadline".to_string(),
            }),
        };

        match outcome {
            Ok(()) => {
                job.status = EventJobStatus::Completed;
                job.completed_at = Some(time::now());
                job.next_retry_at = None;
                self.storage.write().await.update_event_job(&job).await?;
                metrics::counter!("webhook_events_processed").increment(1);
            }
            Err(err) => self.handle_failure(job, err).await?,
        }
        Ok(true)
    }

    async fn handle_failure(
        &self,
        mut job: FundingEventJob,
        err: CoreError,
    ) -> Result<(), CoreError> {
        job.attempt_count += 1;
        job.last_error = Some(err.to_string());
        job.error_type = Some(classify(&err));

        if err.is_retryable() && job.attempt_count < job.max_attempts {
            warn!(
                "event {}:{} failed (attempt {}/{}), retrying: {err}",
                job.chain, job.tx_hash, job.attempt_count, job.max_attempts
            );
            job.status = EventJobStatus::Pending;
            job.next_retry_at = Some(backoff::next_retry_at(job.attempt_count));
            self.storage.write().await.update_event_job(&job).await?;
            metrics::counter!("webhook_events_retried").increment(1);
            return Ok(());
        }

        job.status = if err.is_retryable() {
            EventJobStatus::Dlq
        } else {
            EventJobStatus::Failed
        };
        job.next_retry_at = None;
        error!(
            "event {}:{} moved to {} after {} attempts: {err}",
            job.chain, job.tx_hash, job.status, job.attempt_count
        );
        self.storage.write().await.update_event_job(&job).await?;
        metrics::counter!("webhook_events_dead", "status" => job.status.to_string()).increment(1);
        self.audit
            .record_failure(
                None,
                if job.status == EventJobStatus::Dlq {
                    "event_job.dead_lettered"
                } else {
                    "event_job.failed"
                },
                "funding_event_job",
                &job.id.to_string(),
                &err,
                &job.trace_id,
            )
            .await;
        Ok(())
    }

    /// Current depth of the dead letter queue, surfaced through health.
    pub async fn dlq_depth(&self) -> Result<usize, CoreError> {
        let jobs = self
            .storage
            .read()
            .await
            .list_event_jobs(Some(EventJobStatus::Dlq))
            .await?;
        Ok(jobs.len())
    }
}

fn classify(err: &CoreError) -> EventErrorType {
    match err.code() {
        "external_transient" => EventErrorType::Transient,
        "external_permanent" | "validation" | "not_found" | "conflict" => {
            EventErrorType::Permanent
        }
        _ => EventErrorType::Internal,
    }
}
