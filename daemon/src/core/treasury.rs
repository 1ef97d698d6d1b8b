// Treasury / conversion engine.
//
// Threshold bands on the system buffers drive USDC<->USD conversion jobs;
// the funding and withdrawal sagas feed their ramp legs through the same
// job lifecycle. A conversion settles as a pair of single-currency
// balanced transactions (plus a separate fee transaction), so the
// per-transaction balancing invariant never bends for cross-currency
// moves.

use std::sync::Arc;

use chrono::Datelike;
use stack_common::{
    amount::Amount,
    conversion::{
        BufferThreshold, ConversionDirection, ConversionJob, ConversionJobStatus,
        ConversionProvider, ProviderStatus, TriggerReason,
    },
    currency::Currency,
    idempotency::derive_key,
    ids::{AccountId, ConversionJobId, ProviderId, TraceId},
    ledger::{AccountType, EntityRef, EntrySpec, TransactionType},
    saga::SagaStepKind,
    api::ProviderEventStatus,
    time,
};

use crate::adapters::{guarded, Adapters};
use crate::config::{
    DEFAULT_MAX_ATTEMPTS, PROVIDER_DEGRADED_COOLDOWN, PROVIDER_FAILURE_RATE_THRESHOLD,
    PROVIDER_MIN_OBSERVATIONS,
};
use crate::core::{
    audit::{status_change, Audit},
    backoff,
    error::CoreError,
    ledger::{Ledger, Posting},
    saga::enqueue_step,
    storage::{SharedStorage, Storage},
};

/// Parameters for a new conversion job.
#[derive(Clone, Debug)]
pub struct NewConversionJob {
    pub direction: ConversionDirection,
    /// Requested amount, denominated in the currency of whichever side
    /// triggered the conversion.
    pub amount: Amount,
    pub trigger_reason: TriggerReason,
    pub source_account_id: AccountId,
    pub destination_account_id: AccountId,
    pub source_counterparty_account_id: AccountId,
    pub destination_counterparty_account_id: AccountId,
    pub reference: Option<EntityRef>,
    pub idempotency_key: String,
    pub trace_id: TraceId,
}

/// Settlement details reported by the provider for a completed conversion.
#[derive(Clone, Debug, Default)]
pub struct ProviderSettlement {
    pub applied_rate_ppm: Option<u64>,
    /// Net destination amount credited, decimal string.
    pub destination_amount: Option<String>,
    /// Fees charged, decimal string, always USD.
    pub fees: Option<String>,
}

pub struct Treasury<S: Storage> {
    storage: SharedStorage<S>,
    ledger: Ledger<S>,
    audit: Audit<S>,
    adapters: Arc<Adapters>,
}

impl<S: Storage> Clone for Treasury<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            ledger: self.ledger.clone(),
            audit: self.audit.clone(),
            adapters: self.adapters.clone(),
        }
    }
}

impl<S: Storage> Treasury<S> {
    pub fn new(
        storage: SharedStorage<S>,
        ledger: Ledger<S>,
        audit: Audit<S>,
        adapters: Arc<Adapters>,
    ) -> Self {
        Self {
            storage,
            ledger,
            audit,
            adapters,
        }
    }

    /// Seed default thresholds and the devnet provider when the registry
    /// is empty. Idempotent across restarts.
    pub async fn bootstrap_defaults(&self) -> Result<(), CoreError> {
        let mut storage = self.storage.write().await;
        if storage
            .get_threshold(AccountType::SystemBufferUsdc)
            .await?
            .is_none()
        {
            let usdc = |units| Amount::from_units(units, Currency::Usdc);
            storage
                .upsert_threshold(&BufferThreshold {
                    account_type: AccountType::SystemBufferUsdc,
                    min: usdc(10_000),
                    target: usdc(50_000),
                    max: usdc(200_000),
                    batch_size: usdc(50_000),
                })
                .await?;
        }
        if storage
            .get_threshold(AccountType::SystemBufferFiat)
            .await?
            .is_none()
        {
            let usd = |units| Amount::from_units(units, Currency::Usd);
            storage
                .upsert_threshold(&BufferThreshold {
                    account_type: AccountType::SystemBufferFiat,
                    min: usd(10_000),
                    target: usd(50_000),
                    max: usd(200_000),
                    batch_size: usd(50_000),
                })
                .await?;
        }
        if storage.list_providers().await?.is_empty() {
            let usd = |units| Amount::from_units(units, Currency::Usd);
            storage
                .upsert_provider(&ConversionProvider {
                    id: ProviderId::generate(),
                    name: "devnet-ramp".to_string(),
                    priority: 0,
                    status: ProviderStatus::Active,
                    supported_directions: vec![
                        ConversionDirection::UsdcToUsd,
                        ConversionDirection::UsdToUsdc,
                    ],
                    min_conversion_amount: usd(1),
                    max_conversion_amount: usd(1_000_000),
                    daily_volume_limit: usd(10_000_000),
                    daily_volume_used: Amount::zero(Currency::Usd),
                    daily_volume_day: day_bucket(),
                    success_count: 0,
                    failure_count: 0,
                    window_successes: 0,
                    window_failures: 0,
                    degraded_until: None,
                    updated_at: time::now(),
                })
                .await?;
        }
        Ok(())
    }

    pub async fn get_job(&self, id: &ConversionJobId) -> Result<ConversionJob, CoreError> {
        self.storage
            .read()
            .await
            .get_conversion_job(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("conversion job {id}")))
    }

    /// Create a job, gated by its idempotency key: replays return the
    /// existing row.
    pub async fn create_job(&self, new: NewConversionJob) -> Result<ConversionJob, CoreError> {
        if new.amount.is_zero() {
            return Err(CoreError::Validation(
                "conversion amount must be positive".to_string(),
            ));
        }
        let currency = new.amount.currency();
        if currency != new.direction.source_currency()
            && currency != new.direction.destination_currency()
        {
            return Err(CoreError::Validation(format!(
                "amount currency {currency} does not match direction"
            )));
        }

        let mut storage = self.storage.write().await;
        if let Some(existing) = storage
            .get_conversion_job_by_idempotency_key(&new.idempotency_key)
            .await?
        {
            return Ok(existing);
        }

        let now = time::now();
        let job = ConversionJob {
            id: ConversionJobId::generate(),
            direction: new.direction,
            amount: new.amount,
            status: ConversionJobStatus::Pending,
            trigger_reason: new.trigger_reason,
            provider_id: None,
            provider_tx_id: None,
            ledger_transaction_id: None,
            source_transaction_id: None,
            fee_transaction_id: None,
            source_account_id: new.source_account_id,
            destination_account_id: new.destination_account_id,
            source_counterparty_account_id: new.source_counterparty_account_id,
            destination_counterparty_account_id: new.destination_counterparty_account_id,
            settled_source_amount: None,
            settled_destination_amount: None,
            reference: new.reference,
            applied_rate_ppm: None,
            fees: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_ATTEMPTS,
            next_retry_at: None,
            last_error: None,
            idempotency_key: new.idempotency_key,
            trace_id: new.trace_id,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        storage.insert_conversion_job(&job).await?;
        drop(storage);

        metrics::counter!("conversion_jobs_created", "trigger" => job.trigger_reason.to_string())
            .increment(1);
        info!(
            "created conversion job {} {} {} ({}) [{}]",
            job.id, job.direction, job.amount, job.trigger_reason, job.trace_id
        );
        Ok(job)
    }

    /// Submit a pending job to the best eligible provider. Transient
    /// submission failures reschedule the job; permanent ones fail it.
    pub async fn submit_job(&self, id: &ConversionJobId) -> Result<(), CoreError> {
        let mut job = self.get_job(id).await?;
        if job.status != ConversionJobStatus::Pending {
            return Ok(());
        }

        let provider = match self.select_provider(job.direction, &job.amount).await? {
            Some(provider) => provider,
            None => {
                return self
                    .reschedule_or_fail(
                        job,
                        CoreError::ExternalTransient {
                            service: "conversion".to_string(),
                            message: "no eligible conversion provider".to_string(),
                        },
                    )
                    .await;
            }
        };

        let submission = guarded(
            &self.adapters.conversion_breaker,
            self.adapters.conversion.submit_conversion(
                &provider.name,
                job.direction,
                &job.amount,
                &job.idempotency_key,
            ),
        )
        .await;

        match submission {
            Ok(submission) => {
                let old_status = job.status;
                job.provider_id = Some(provider.id);
                job.provider_tx_id = Some(submission.provider_tx_id.clone());
                job.status = ConversionJobStatus::ProviderSubmitted;
                job.updated_at = time::now();
                self.record_provider_volume(&provider.id, &job.amount).await?;
                self.storage
                    .write()
                    .await
                    .update_conversion_job(&job)
                    .await?;
                self.audit
                    .record(
                        None,
                        "conversion.submitted",
                        "conversion_job",
                        &job.id.to_string(),
                        status_change(old_status, job.status),
                        &job.trace_id,
                    )
                    .await;
                debug!(
                    "submitted conversion {} as {} via {}",
                    job.id, submission.provider_tx_id, provider.name
                );
                Ok(())
            }
            Err(err) => {
                if err.is_retryable() {
                    self.record_provider_outcome(&provider.id, false).await?;
                }
                self.reschedule_or_fail(job, err.into()).await
            }
        }
    }

    async fn reschedule_or_fail(
        &self,
        mut job: ConversionJob,
        err: CoreError,
    ) -> Result<(), CoreError> {
        if err.is_retryable() && job.retry_count < job.max_retries {
            job.retry_count += 1;
            job.next_retry_at = Some(backoff::next_retry_at(job.retry_count));
            job.last_error = Some(err.to_string());
            job.updated_at = time::now();
            warn!(
                "conversion {} submission failed (attempt {}/{}), retrying: {err}",
                job.id, job.retry_count, job.max_retries
            );
            self.storage
                .write()
                .await
                .update_conversion_job(&job)
                .await?;
            metrics::counter!("conversion_jobs_retried").increment(1);
            Ok(())
        } else {
            self.fail_job(job, err.to_string()).await
        }
    }

    /// One scheduler tick: re-submit due pending jobs, then evaluate every
    /// threshold band. Returns how many jobs were created.
    pub async fn tick(&self) -> Result<usize, CoreError> {
        // retries first so a replenishment blocked on a flaky provider
        // makes progress before new work piles on
        let due: Vec<ConversionJob> = {
            let storage = self.storage.read().await;
            storage
                .list_conversion_jobs()
                .await?
                .into_iter()
                .filter(|job| job.status == ConversionJobStatus::Pending)
                .filter(|job| {
                    job.next_retry_at
                        .map(|at| at <= time::now())
                        .unwrap_or(true)
                })
                .collect()
        };
        for job in due {
            if let Err(err) = self.submit_job(&job.id).await {
                error!("conversion submission for {} failed: {err}", job.id);
            }
        }

        let thresholds = self.storage.read().await.list_thresholds().await?;
        let mut created = 0;
        for threshold in thresholds {
            if let Some(job) = self.evaluate_threshold(&threshold).await? {
                self.submit_job(&job.id).await?;
                created += 1;
            }
        }
        Ok(created)
    }

    async fn evaluate_threshold(
        &self,
        threshold: &BufferThreshold,
    ) -> Result<Option<ConversionJob>, CoreError> {
        let account = self.ledger.system_account(threshold.account_type).await?;
        let active = self
            .storage
            .read()
            .await
            .list_active_conversion_jobs_for_account(&account.id)
            .await?;
        // one outstanding treasury job per buffer at a time
        if active.iter().any(|job| {
            matches!(
                job.trigger_reason,
                TriggerReason::BufferReplenishment
                    | TriggerReason::ScheduledRebalance
                    | TriggerReason::Manual
                    | TriggerReason::Emergency
            )
        }) {
            return Ok(None);
        }

        let currency = account.currency;
        let (amount, trigger, inbound) = if account.balance < threshold.min {
            let deficit = threshold.target.checked_sub(&account.balance)?;
            let amount = if deficit < threshold.batch_size {
                deficit
            } else {
                threshold.batch_size
            };
            (amount, TriggerReason::BufferReplenishment, true)
        } else if account.balance > threshold.max {
            let excess = account.balance.checked_sub(&threshold.target)?;
            let amount = if excess < threshold.batch_size {
                excess
            } else {
                threshold.batch_size
            };
            (amount, TriggerReason::ScheduledRebalance, false)
        } else {
            return Ok(None);
        };

        info!(
            "buffer {} at {} is outside [{}, {}], scheduling {} of {}",
            threshold.account_type,
            account.balance,
            threshold.min,
            threshold.max,
            trigger,
            amount
        );

        // replenishment converts into this buffer; rebalance drains out
        let direction = match (currency, inbound) {
            (Currency::Usdc, true) | (Currency::Usd, false) => ConversionDirection::UsdToUsdc,
            (Currency::Usd, true) | (Currency::Usdc, false) => ConversionDirection::UsdcToUsd,
        };
        let (source_type, destination_type) = match direction {
            ConversionDirection::UsdToUsdc => {
                (AccountType::SystemBufferFiat, AccountType::SystemBufferUsdc)
            }
            ConversionDirection::UsdcToUsd => {
                (AccountType::SystemBufferUsdc, AccountType::SystemBufferFiat)
            }
        };
        let source = self.ledger.system_account(source_type).await?;
        let destination = self.ledger.system_account(destination_type).await?;
        let external_usdc = self
            .ledger
            .system_account(AccountType::ExternalUsdcClearing)
            .await?;
        let external_fiat = self
            .ledger
            .system_account(AccountType::ExternalFiatClearing)
            .await?;
        let (source_counter, destination_counter) = match direction {
            ConversionDirection::UsdToUsdc => (external_fiat.id, external_usdc.id),
            ConversionDirection::UsdcToUsd => (external_usdc.id, external_fiat.id),
        };

        // the key derives from the observed buffer snapshot: concurrent
        // evaluations of the same state collapse onto one job, and a new
        // job can only be minted once a posting has moved the buffer. A
        // terminal job already holding the key (an earlier attempt that
        // failed without touching the buffer) chains the derivation so
        // the retry is its own idempotent unit.
        let mut idempotency_key = derive_key(
            "treasury",
            &format!(
                "{}:{}:{}",
                threshold.account_type,
                trigger,
                account.updated_at.timestamp_millis()
            ),
        );
        loop {
            let existing = self
                .storage
                .read()
                .await
                .get_conversion_job_by_idempotency_key(&idempotency_key)
                .await?;
            match existing {
                Some(job) if job.status.is_terminal() => {
                    idempotency_key = derive_key(&idempotency_key, &job.id.to_string());
                }
                _ => break,
            }
        }

        let trace_id = TraceId::generate();
        let job = self
            .create_job(NewConversionJob {
                direction,
                amount,
                trigger_reason: trigger,
                source_account_id: source.id,
                destination_account_id: destination.id,
                source_counterparty_account_id: source_counter,
                destination_counterparty_account_id: destination_counter,
                reference: None,
                idempotency_key,
                trace_id,
            })
            .await?;
        Ok(Some(job))
    }

    /// Apply a provider webhook to its job. Out-of-order events are
    /// accepted as forward jumps; duplicates are no-ops.
    pub async fn on_provider_event(
        &self,
        provider_tx_id: &str,
        status: ProviderEventStatus,
        settlement: ProviderSettlement,
        reason: Option<String>,
    ) -> Result<ConversionJob, CoreError> {
        let job = self
            .storage
            .read()
            .await
            .get_conversion_job_by_provider_tx(provider_tx_id)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!("conversion for provider tx {provider_tx_id}"))
            })?;

        match status {
            ProviderEventStatus::Submitted | ProviderEventStatus::Processing => {
                let next = match status {
                    ProviderEventStatus::Submitted => ConversionJobStatus::ProviderSubmitted,
                    _ => ConversionJobStatus::ProviderProcessing,
                };
                if job.status.can_transition_to(next) {
                    let mut updated = job.clone();
                    updated.status = next;
                    updated.updated_at = time::now();
                    self.storage
                        .write()
                        .await
                        .update_conversion_job(&updated)
                        .await?;
                    return Ok(updated);
                }
                Ok(job)
            }
            ProviderEventStatus::Completed => self.complete_job(job, settlement).await,
            ProviderEventStatus::Failed => {
                let message =
                    reason.unwrap_or_else(|| "provider reported failure".to_string());
                let id = job.id;
                self.fail_job(job, message).await?;
                self.get_job(&id).await
            }
        }
    }

    /// Settle a completed conversion: write the ledger pair (and fee leg),
    /// mark the job completed and wake the owning saga. The job's
    /// idempotency key gates the ledger writes, so a duplicate completion
    /// webhook cannot double-post.
    async fn complete_job(
        &self,
        mut job: ConversionJob,
        settlement: ProviderSettlement,
    ) -> Result<ConversionJob, CoreError> {
        if job.status == ConversionJobStatus::Completed {
            return Ok(job);
        }
        if !job.status.can_transition_to(ConversionJobStatus::ProviderCompleted) {
            warn!(
                "ignoring completion webhook for {} in state {}",
                job.id, job.status
            );
            return Ok(job);
        }
        let old_status = job.status;

        let source_currency = job.direction.source_currency();
        let destination_currency = job.direction.destination_currency();

        let fees = match &settlement.fees {
            Some(raw) => Amount::parse(raw, Currency::Usd)
                .map_err(|err| CoreError::Validation(err.to_string()))?,
            None => Amount::zero(Currency::Usd),
        };
        let destination_amount = match &settlement.destination_amount {
            Some(raw) => Amount::parse(raw, destination_currency)
                .map_err(|err| CoreError::Validation(err.to_string()))?,
            // par fallback when the provider omits the settled amount
            None => {
                let par = job.amount.rescaled(destination_currency)?;
                if destination_currency == Currency::Usd {
                    par.checked_sub(&fees).unwrap_or(par)
                } else {
                    par
                }
            }
        };
        // the destination side receives gross and pays the fee leg out of
        // it when the fee currency lives on that side
        let destination_gross = if destination_currency == Currency::Usd {
            destination_amount.checked_add(&fees)?
        } else {
            destination_amount
        };
        let source_amount = if job.amount.currency() == source_currency {
            job.amount
        } else {
            let par = destination_gross.rescaled(source_currency)?;
            if source_currency == Currency::Usd {
                par.checked_add(&fees)?
            } else {
                par
            }
        };

        job.status = ConversionJobStatus::LedgerUpdating;
        job.updated_at = time::now();
        self.storage.write().await.update_conversion_job(&job).await?;

        let reference = EntityRef::new("conversion_job", job.id);
        let source_tx = self
            .ledger
            .post_transaction(
                Posting::new(
                    derive_key(&job.idempotency_key, "source_leg"),
                    TransactionType::Conversion,
                    format!("conversion {} source leg", job.id),
                    vec![
                        EntrySpec::debit(job.source_account_id, source_amount),
                        EntrySpec::credit(job.source_counterparty_account_id, source_amount),
                    ],
                )
                .with_reference(reference.clone()),
            )
            .await?;
        let destination_tx = self
            .ledger
            .post_transaction(
                Posting::new(
                    derive_key(&job.idempotency_key, "destination_leg"),
                    TransactionType::Conversion,
                    format!("conversion {} destination leg", job.id),
                    vec![
                        EntrySpec::debit(
                            job.destination_counterparty_account_id,
                            destination_gross,
                        ),
                        EntrySpec::credit(job.destination_account_id, destination_gross),
                    ],
                )
                .with_reference(reference.clone()),
            )
            .await?;
        if !fees.is_zero() {
            let expense = self
                .ledger
                .system_account(AccountType::ConversionExpense)
                .await?;
            let fee_payer = if destination_currency == Currency::Usd {
                job.destination_account_id
            } else {
                job.source_counterparty_account_id
            };
            let fee_tx = self
                .ledger
                .post_transaction(
                    Posting::new(
                        derive_key(&job.idempotency_key, "fee_leg"),
                        TransactionType::Conversion,
                        format!("conversion {} fees", job.id),
                        vec![
                            EntrySpec::debit(fee_payer, fees),
                            EntrySpec::credit(expense.id, fees),
                        ],
                    )
                    .with_reference(reference),
                )
                .await?;
            job.fee_transaction_id = Some(fee_tx.id);
        }

        job.ledger_transaction_id = Some(destination_tx.id);
        job.source_transaction_id = Some(source_tx.id);
        job.settled_source_amount = Some(source_amount);
        job.settled_destination_amount = Some(destination_amount);
        job.applied_rate_ppm = settlement.applied_rate_ppm;
        job.fees = Some(fees);
        job.status = ConversionJobStatus::Completed;
        job.completed_at = Some(time::now());
        job.updated_at = time::now();
        self.storage.write().await.update_conversion_job(&job).await?;

        if let Some(provider_id) = job.provider_id {
            self.record_provider_outcome(&provider_id, true).await?;
        }
        self.audit
            .record(
                None,
                "conversion.completed",
                "conversion_job",
                &job.id.to_string(),
                status_change(old_status, job.status),
                &job.trace_id,
            )
            .await;
        metrics::counter!("conversion_jobs_completed").increment(1);
        info!(
            "conversion {} completed: {} -> {} (fees {}) [{}]",
            job.id, source_amount, destination_amount, fees, job.trace_id
        );

        self.wake_owning_saga(&job).await?;
        Ok(job)
    }

    async fn fail_job(&self, mut job: ConversionJob, reason: String) -> Result<(), CoreError> {
        if job.status.is_terminal() {
            return Ok(());
        }
        let old_status = job.status;
        job.status = ConversionJobStatus::Failed;
        job.last_error = Some(reason.clone());
        job.updated_at = time::now();
        self.storage.write().await.update_conversion_job(&job).await?;

        if let Some(provider_id) = job.provider_id {
            self.record_provider_outcome(&provider_id, false).await?;
        }
        self.audit
            .record(
                None,
                "conversion.failed",
                "conversion_job",
                &job.id.to_string(),
                status_change(old_status, job.status),
                &job.trace_id,
            )
            .await;
        metrics::counter!("conversion_jobs_failed").increment(1);
        error!("conversion {} failed: {reason} [{}]", job.id, job.trace_id);

        // the owning saga unwinds what it already posted
        if let Some(reference) = &job.reference {
            let kind = match reference.entity_type.as_str() {
                "deposit" => Some(SagaStepKind::FundingCompensate),
                "withdrawal" => Some(SagaStepKind::WithdrawalCompensate),
                _ => None,
            };
            if let Some(kind) = kind {
                let mut storage = self.storage.write().await;
                enqueue_step(&mut *storage, kind, &reference.entity_id, &job.trace_id).await?;
            }
        }
        Ok(())
    }

    async fn wake_owning_saga(&self, job: &ConversionJob) -> Result<(), CoreError> {
        let Some(reference) = &job.reference else {
            return Ok(());
        };
        let kind = match reference.entity_type.as_str() {
            "deposit" => Some(SagaStepKind::FundingOffRampComplete),
            "withdrawal" => Some(SagaStepKind::WithdrawalOnRampComplete),
            _ => None,
        };
        if let Some(kind) = kind {
            let mut storage = self.storage.write().await;
            enqueue_step(&mut *storage, kind, &reference.entity_id, &job.trace_id).await?;
        }
        Ok(())
    }

    /// Highest priority healthy provider that supports the direction, has
    /// daily headroom and accepts the amount. Degraded providers recover
    /// once their cooldown elapses.
    async fn select_provider(
        &self,
        direction: ConversionDirection,
        amount: &Amount,
    ) -> Result<Option<ConversionProvider>, CoreError> {
        let amount_usd = amount.rescaled(Currency::Usd)?;
        let today = day_bucket();
        let mut providers = self.storage.read().await.list_providers().await?;
        providers.sort_by_key(|provider| provider.priority);

        for mut provider in providers {
            if provider.status == ProviderStatus::Degraded {
                match provider.degraded_until {
                    Some(until) if until <= time::now() => {
                        info!("provider {} recovering from degraded", provider.name);
                        provider.status = ProviderStatus::Active;
                        provider.degraded_until = None;
                        provider.window_successes = 0;
                        provider.window_failures = 0;
                        provider.updated_at = time::now();
                        self.storage.write().await.upsert_provider(&provider).await?;
                    }
                    _ => continue,
                }
            }
            if provider.status != ProviderStatus::Active || !provider.supports(direction) {
                continue;
            }
            if amount_usd < provider.min_conversion_amount
                || amount_usd > provider.max_conversion_amount
            {
                continue;
            }
            let used_today = if provider.daily_volume_day == today {
                provider.daily_volume_used
            } else {
                Amount::zero(Currency::Usd)
            };
            if used_today.checked_add(&amount_usd)? > provider.daily_volume_limit {
                continue;
            }
            return Ok(Some(provider));
        }
        Ok(None)
    }

    async fn record_provider_volume(
        &self,
        provider_id: &ProviderId,
        amount: &Amount,
    ) -> Result<(), CoreError> {
        let mut storage = self.storage.write().await;
        let Some(mut provider) = storage.get_provider(provider_id).await? else {
            return Ok(());
        };
        let amount_usd = amount.rescaled(Currency::Usd)?;
        let today = day_bucket();
        if provider.daily_volume_day != today {
            provider.daily_volume_day = today;
            provider.daily_volume_used = Amount::zero(Currency::Usd);
        }
        provider.daily_volume_used = provider.daily_volume_used.checked_add(&amount_usd)?;
        provider.updated_at = time::now();
        storage.upsert_provider(&provider).await
    }

    /// Track success/failure counters and demote a provider whose rolling
    /// failure rate crossed the threshold.
    async fn record_provider_outcome(
        &self,
        provider_id: &ProviderId,
        success: bool,
    ) -> Result<(), CoreError> {
        let provider = {
            let mut storage = self.storage.write().await;
            let Some(mut provider) = storage.get_provider(provider_id).await? else {
                return Ok(());
            };
            if success {
                provider.success_count += 1;
                provider.window_successes += 1;
            } else {
                provider.failure_count += 1;
                provider.window_failures += 1;
            }
            if !success {
                if let Some(rate) = provider.window_failure_rate(PROVIDER_MIN_OBSERVATIONS) {
                    if rate >= PROVIDER_FAILURE_RATE_THRESHOLD
                        && provider.status == ProviderStatus::Active
                    {
                        warn!(
                            "provider {} demoted to degraded (failure rate {:.0}%)",
                            provider.name,
                            rate * 100.0
                        );
                        provider.status = ProviderStatus::Degraded;
                        provider.degraded_until = Some(
                            time::now()
                                + chrono::Duration::from_std(PROVIDER_DEGRADED_COOLDOWN)
                                    .unwrap_or_else(|_| chrono::Duration::seconds(300)),
                        );
                        metrics::counter!("conversion_providers_degraded").increment(1);
                    }
                }
            }
            provider.updated_at = time::now();
            storage.upsert_provider(&provider).await?;
            provider
        };
        if provider.status == ProviderStatus::Degraded {
            self.audit
                .record(
                    None,
                    "conversion_provider.degraded",
                    "conversion_provider",
                    &provider.id.to_string(),
                    status_change(ProviderStatus::Active, ProviderStatus::Degraded),
                    &TraceId::generate(),
                )
                .await;
        }
        Ok(())
    }

    /// Manual or emergency conversion, exposed to operators. The caller
    /// supplies the idempotency key so retries collapse.
    pub async fn trigger_manual(
        &self,
        direction: ConversionDirection,
        amount: Amount,
        emergency: bool,
        idempotency_key: String,
    ) -> Result<ConversionJob, CoreError> {
        let (source_type, destination_type) = match direction {
            ConversionDirection::UsdToUsdc => {
                (AccountType::SystemBufferFiat, AccountType::SystemBufferUsdc)
            }
            ConversionDirection::UsdcToUsd => {
                (AccountType::SystemBufferUsdc, AccountType::SystemBufferFiat)
            }
        };
        let source = self.ledger.system_account(source_type).await?;
        let destination = self.ledger.system_account(destination_type).await?;
        let external_usdc = self
            .ledger
            .system_account(AccountType::ExternalUsdcClearing)
            .await?;
        let external_fiat = self
            .ledger
            .system_account(AccountType::ExternalFiatClearing)
            .await?;
        let (source_counter, destination_counter) = match direction {
            ConversionDirection::UsdToUsdc => (external_fiat.id, external_usdc.id),
            ConversionDirection::UsdcToUsd => (external_usdc.id, external_fiat.id),
        };
        let job = self
            .create_job(NewConversionJob {
                direction,
                amount,
                trigger_reason: if emergency {
                    TriggerReason::Emergency
                } else {
                    TriggerReason::Manual
                },
                source_account_id: source.id,
                destination_account_id: destination.id,
                source_counterparty_account_id: source_counter,
                destination_counterparty_account_id: destination_counter,
                reference: None,
                idempotency_key,
                trace_id: TraceId::generate(),
            })
            .await?;
        self.submit_job(&job.id).await?;
        self.get_job(&job.id).await
    }
}

/// Days since the common era; good enough as a daily volume bucket.
fn day_bucket() -> i64 {
    time::now().date_naive().num_days_from_ce() as i64
}
