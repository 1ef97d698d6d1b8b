// Withdrawal saga: brokerage debit -> on-ramp -> on-chain send.
//
// The ledger pre-debit at initiation parks the user's fiat in the holding
// account before any partner is called, so a failure at any later hop can
// only ever strand system-side value, never over-withdraw a user. All
// compensation is the reversal primitive applied newest-first.

use std::sync::Arc;

use chrono::Duration;
use stack_common::{
    amount::Amount,
    conversion::{ConversionDirection, ConversionJobStatus, TriggerReason},
    currency::Currency,
    idempotency::derive_key,
    ids::{ConversionJobId, ExceptionId, TraceId, UserId, WithdrawalId},
    ledger::{AccountType, EntityRef, EntrySpec, TransactionStatus, TransactionType},
    reconciliation::{CheckType, ReconciliationException, ResolutionState, Severity},
    saga::SagaStepKind,
    time,
    withdrawal::{Withdrawal, WithdrawalLimits, WithdrawalStatus},
};

use crate::adapters::{guarded, Adapters};
use crate::config::{
    DEFAULT_DAILY_LIMIT_USD, DEFAULT_DUAL_AUTH_THRESHOLD_USD, DEFAULT_MONTHLY_LIMIT_USD,
    DEFAULT_WEEKLY_LIMIT_USD,
};
use crate::core::{
    audit::{status_change, Audit},
    error::CoreError,
    ledger::{Ledger, Posting},
    saga::enqueue_step,
    storage::{SharedStorage, Storage},
    treasury::{NewConversionJob, Treasury},
};

pub struct WithdrawalSaga<S: Storage> {
    storage: SharedStorage<S>,
    ledger: Ledger<S>,
    audit: Audit<S>,
    treasury: Treasury<S>,
    adapters: Arc<Adapters>,
}

impl<S: Storage> Clone for WithdrawalSaga<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            ledger: self.ledger.clone(),
            audit: self.audit.clone(),
            treasury: self.treasury.clone(),
            adapters: self.adapters.clone(),
        }
    }
}

impl<S: Storage> WithdrawalSaga<S> {
    pub fn new(
        storage: SharedStorage<S>,
        ledger: Ledger<S>,
        audit: Audit<S>,
        treasury: Treasury<S>,
        adapters: Arc<Adapters>,
    ) -> Self {
        Self {
            storage,
            ledger,
            audit,
            treasury,
            adapters,
        }
    }

    pub async fn get_withdrawal(&self, id: &WithdrawalId) -> Result<Withdrawal, CoreError> {
        self.storage
            .read()
            .await
            .get_withdrawal(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("withdrawal {id}")))
    }

    /// Start a withdrawal. Validates limits, pre-debits the user's buying
    /// power into the holding account, and only then persists the saga.
    /// An insufficient balance or a breached limit writes nothing.
    pub async fn initiate(
        &self,
        user_id: UserId,
        amount_usd: Amount,
        target_chain: &str,
        target_address: &str,
        idempotency_key: &str,
    ) -> Result<Withdrawal, CoreError> {
        if amount_usd.currency() != Currency::Usd {
            return Err(CoreError::Validation(
                "withdrawal amounts are denominated in USD".to_string(),
            ));
        }
        if amount_usd.is_zero() {
            return Err(CoreError::Validation(
                "withdrawal amount must be positive".to_string(),
            ));
        }
        if target_address.is_empty() || target_chain.is_empty() {
            return Err(CoreError::Validation(
                "target chain and address are required".to_string(),
            ));
        }

        let limits = self.effective_limits(&user_id).await?;
        self.check_limits(&user_id, &amount_usd, &limits).await?;

        let withdrawal_id = WithdrawalId::generate();
        let trace_id = TraceId::generate();

        let user_fiat = self
            .ledger
            .get_or_create_account(Some(user_id), AccountType::FiatExposure)
            .await?;
        let holding = self
            .ledger
            .get_or_create_account(Some(user_id), AccountType::PendingInvestment)
            .await?;

        // the pre-debit is the money gate: insufficient_funds surfaces
        // here and no withdrawal row is ever written
        let pre_debit_key = derive_key(idempotency_key, "pre_debit");
        let tx = self
            .ledger
            .post_transaction(
                Posting::new(
                    pre_debit_key,
                    TransactionType::Withdrawal,
                    format!("withdrawal {withdrawal_id} pre-debit"),
                    vec![
                        EntrySpec::debit(user_fiat.id, amount_usd),
                        EntrySpec::credit(holding.id, amount_usd),
                    ],
                )
                .with_reference(EntityRef::new("withdrawal", withdrawal_id)),
            )
            .await;
        let tx = match tx {
            Ok(tx) => tx,
            Err(err) => {
                self.audit
                    .record_failure(
                        Some(user_id),
                        "withdrawal.initiate",
                        "withdrawal",
                        &withdrawal_id.to_string(),
                        &err,
                        &trace_id,
                    )
                    .await;
                return Err(err);
            }
        };
        // a replayed client key that slipped past the response cache maps
        // to the first attempt's posting; refuse to mint a second saga
        match &tx.reference {
            Some(reference) if reference.entity_id == withdrawal_id.to_string() => {}
            _ => {
                return Err(CoreError::Conflict(format!(
                    "idempotency key {idempotency_key} already started a withdrawal"
                )))
            }
        }

        let requires_dual_auth = amount_usd >= limits.dual_auth_threshold;
        let now = time::now();
        let withdrawal = Withdrawal {
            id: withdrawal_id,
            user_id,
            amount_usd,
            target_chain: target_chain.to_string(),
            target_address: target_address.to_string(),
            status: WithdrawalStatus::Pending,
            requires_dual_auth,
            dual_auth_approved: false,
            broker_ref: None,
            on_ramp_ref: None,
            transfer_ref: None,
            tx_hash: None,
            failure_reason: None,
            trace_id: trace_id.clone(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.storage
            .write()
            .await
            .insert_withdrawal(&withdrawal)
            .await?;
        self.audit
            .record(
                Some(user_id),
                "withdrawal.initiated",
                "withdrawal",
                &withdrawal.id.to_string(),
                stack_common::audit::AuditChanges {
                    before: None,
                    after: Some(serde_json::json!({
                        "amount_usd": amount_usd.to_string(),
                        "target_chain": target_chain,
                        "requires_dual_auth": requires_dual_auth,
                    })),
                },
                &trace_id,
            )
            .await;
        metrics::counter!("withdrawals_initiated").increment(1);
        info!(
            "withdrawal {} of {} for user {} initiated [{}]",
            withdrawal.id, amount_usd, user_id, trace_id
        );

        if requires_dual_auth {
            info!(
                "withdrawal {} of {} parked for dual approval",
                withdrawal.id, amount_usd
            );
        } else {
            let mut storage = self.storage.write().await;
            enqueue_step(
                &mut *storage,
                SagaStepKind::WithdrawalBrokerInitiate,
                &withdrawal.id.to_string(),
                &trace_id,
            )
            .await?;
        }
        Ok(withdrawal)
    }

    /// Second approval for amounts over the dual-auth threshold.
    pub async fn approve_dual_auth(&self, id: &WithdrawalId) -> Result<(), CoreError> {
        let mut withdrawal = self.get_withdrawal(id).await?;
        if withdrawal.status != WithdrawalStatus::Pending {
            return Err(CoreError::Conflict(format!(
                "withdrawal {id} is {} and cannot be approved",
                withdrawal.status
            )));
        }
        if !withdrawal.requires_dual_auth || withdrawal.dual_auth_approved {
            return Ok(());
        }
        withdrawal.dual_auth_approved = true;
        withdrawal.updated_at = time::now();
        self.storage
            .write()
            .await
            .update_withdrawal(&withdrawal)
            .await?;
        self.audit
            .record(
                Some(withdrawal.user_id),
                "withdrawal.dual_auth_approved",
                "withdrawal",
                &id.to_string(),
                stack_common::audit::AuditChanges::default(),
                &withdrawal.trace_id,
            )
            .await;
        let mut storage = self.storage.write().await;
        enqueue_step(
            &mut *storage,
            SagaStepKind::WithdrawalBrokerInitiate,
            &id.to_string(),
            &withdrawal.trace_id,
        )
        .await?;
        Ok(())
    }

    /// pending -> broker_withdrawal_initiated: ask the broker to release
    /// the USD.
    pub async fn step_broker_initiate(
        &self,
        id: &WithdrawalId,
        _trace_id: &TraceId,
    ) -> Result<(), CoreError> {
        let mut withdrawal = self.get_withdrawal(id).await?;
        if withdrawal.status != WithdrawalStatus::Pending {
            debug!("withdrawal {} is {}, skipping broker initiate", id, withdrawal.status);
            return Ok(());
        }
        if withdrawal.requires_dual_auth && !withdrawal.dual_auth_approved {
            debug!("withdrawal {} still awaiting dual approval", id);
            return Ok(());
        }

        let broker_ref = guarded(
            &self.adapters.brokerage_breaker,
            self.adapters.brokerage.withdraw(
                &withdrawal.amount_usd,
                &derive_key(&withdrawal.id.to_string(), "broker_withdraw"),
            ),
        )
        .await?;

        withdrawal.broker_ref = Some(broker_ref);
        self.transition(&mut withdrawal, WithdrawalStatus::BrokerWithdrawalInitiated)
            .await?;
        self.storage
            .write()
            .await
            .update_withdrawal(&withdrawal)
            .await?;
        Ok(())
    }

    /// Broker journal settled: the cash is back in the fiat buffer.
    /// Driven by the broker webhook.
    pub async fn on_broker_settled(&self, broker_ref: &str) -> Result<(), CoreError> {
        let withdrawal = self
            .storage
            .read()
            .await
            .get_withdrawal_by_broker_ref(broker_ref)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!("withdrawal for journal {broker_ref}"))
            })?;
        let mut withdrawal = withdrawal;
        if withdrawal.status != WithdrawalStatus::BrokerWithdrawalInitiated {
            debug!(
                "withdrawal {} is {}, ignoring duplicate journal settlement",
                withdrawal.id, withdrawal.status
            );
            return Ok(());
        }

        let broker = self
            .ledger
            .system_account(AccountType::BrokerOperational)
            .await?;
        let buffer_fiat = self
            .ledger
            .system_account(AccountType::SystemBufferFiat)
            .await?;
        self.ledger
            .post_transaction(
                Posting::new(
                    derive_key(&withdrawal.id.to_string(), "broker_withdrawal_complete"),
                    TransactionType::Withdrawal,
                    format!("withdrawal {} released by broker", withdrawal.id),
                    vec![
                        EntrySpec::debit(broker.id, withdrawal.amount_usd),
                        EntrySpec::credit(buffer_fiat.id, withdrawal.amount_usd),
                    ],
                )
                .with_reference(EntityRef::new("withdrawal", withdrawal.id)),
            )
            .await?;

        self.transition(&mut withdrawal, WithdrawalStatus::BrokerWithdrawalComplete)
            .await?;
        self.storage
            .write()
            .await
            .update_withdrawal(&withdrawal)
            .await?;

        let mut storage = self.storage.write().await;
        enqueue_step(
            &mut *storage,
            SagaStepKind::WithdrawalOnRampInitiate,
            &withdrawal.id.to_string(),
            &withdrawal.trace_id,
        )
        .await?;
        Ok(())
    }

    /// broker_withdrawal_complete -> on_ramp_initiated: convert the buffer
    /// fiat back to stablecoin.
    pub async fn step_on_ramp_initiate(
        &self,
        id: &WithdrawalId,
        _trace_id: &TraceId,
    ) -> Result<(), CoreError> {
        let mut withdrawal = self.get_withdrawal(id).await?;
        if withdrawal.status != WithdrawalStatus::BrokerWithdrawalComplete {
            debug!("withdrawal {} is {}, skipping on-ramp initiate", id, withdrawal.status);
            return Ok(());
        }

        let buffer_fiat = self
            .ledger
            .system_account(AccountType::SystemBufferFiat)
            .await?;
        let buffer_usdc = self
            .ledger
            .system_account(AccountType::SystemBufferUsdc)
            .await?;
        let external_fiat = self
            .ledger
            .system_account(AccountType::ExternalFiatClearing)
            .await?;
        let external_usdc = self
            .ledger
            .system_account(AccountType::ExternalUsdcClearing)
            .await?;

        let job = self
            .treasury
            .create_job(NewConversionJob {
                direction: ConversionDirection::UsdToUsdc,
                amount: withdrawal.amount_usd,
                trigger_reason: TriggerReason::WithdrawalOnRamp,
                source_account_id: buffer_fiat.id,
                destination_account_id: buffer_usdc.id,
                source_counterparty_account_id: external_fiat.id,
                destination_counterparty_account_id: external_usdc.id,
                reference: Some(EntityRef::new("withdrawal", withdrawal.id)),
                idempotency_key: derive_key(&withdrawal.id.to_string(), "on_ramp_conversion"),
                trace_id: withdrawal.trace_id.clone(),
            })
            .await?;
        self.treasury.submit_job(&job.id).await?;

        withdrawal.on_ramp_ref = Some(job.id.to_string());
        self.transition(&mut withdrawal, WithdrawalStatus::OnRampInitiated)
            .await?;
        self.storage
            .write()
            .await
            .update_withdrawal(&withdrawal)
            .await?;
        Ok(())
    }

    /// on_ramp_initiated -> on_ramp_complete: conversion settled.
    pub async fn step_on_ramp_complete(
        &self,
        id: &WithdrawalId,
        _trace_id: &TraceId,
    ) -> Result<(), CoreError> {
        let mut withdrawal = self.get_withdrawal(id).await?;
        if withdrawal.status != WithdrawalStatus::OnRampInitiated {
            debug!("withdrawal {} is {}, skipping on-ramp complete", id, withdrawal.status);
            return Ok(());
        }
        let job = self.on_ramp_job(&withdrawal).await?;
        match job.status {
            ConversionJobStatus::Completed => {}
            ConversionJobStatus::Failed | ConversionJobStatus::Cancelled => return Ok(()),
            _ => {
                return Err(CoreError::ExternalTransient {
                    service: "conversion".to_string(),
                    message: format!("conversion {} not settled yet", job.id),
                })
            }
        }

        self.transition(&mut withdrawal, WithdrawalStatus::OnRampComplete)
            .await?;
        self.storage
            .write()
            .await
            .update_withdrawal(&withdrawal)
            .await?;

        let mut storage = self.storage.write().await;
        enqueue_step(
            &mut *storage,
            SagaStepKind::WithdrawalTransferInitiate,
            &withdrawal.id.to_string(),
            &withdrawal.trace_id,
        )
        .await?;
        Ok(())
    }

    /// on_ramp_complete -> transfer_initiated: send the stablecoin from
    /// the treasury to the user's address and release the buffer.
    pub async fn step_transfer_initiate(
        &self,
        id: &WithdrawalId,
        _trace_id: &TraceId,
    ) -> Result<(), CoreError> {
        let mut withdrawal = self.get_withdrawal(id).await?;
        if withdrawal.status != WithdrawalStatus::OnRampComplete {
            debug!("withdrawal {} is {}, skipping transfer", id, withdrawal.status);
            return Ok(());
        }
        let job = self.on_ramp_job(&withdrawal).await?;
        let usdc_amount = match job.settled_destination_amount {
            Some(amount) => amount,
            None => withdrawal.amount_usd.rescaled(Currency::Usdc)?,
        };

        let tx_hash = guarded(
            &self.adapters.custody_breaker,
            self.adapters.custody.send_tokens(
                &usdc_amount,
                &withdrawal.target_address,
                &withdrawal.target_chain,
                &derive_key(&withdrawal.id.to_string(), "transfer"),
            ),
        )
        .await?;

        let buffer_usdc = self
            .ledger
            .system_account(AccountType::SystemBufferUsdc)
            .await?;
        let external_usdc = self
            .ledger
            .system_account(AccountType::ExternalUsdcClearing)
            .await?;
        self.ledger
            .post_transaction(
                Posting::new(
                    derive_key(&withdrawal.id.to_string(), "transfer_initiated"),
                    TransactionType::Withdrawal,
                    format!("withdrawal {} on-chain send {tx_hash}", withdrawal.id),
                    vec![
                        EntrySpec::debit(buffer_usdc.id, usdc_amount),
                        EntrySpec::credit(external_usdc.id, usdc_amount),
                    ],
                )
                .with_reference(EntityRef::new("withdrawal", withdrawal.id)),
            )
            .await?;

        withdrawal.transfer_ref = Some(tx_hash.clone());
        withdrawal.tx_hash = Some(tx_hash);
        self.transition(&mut withdrawal, WithdrawalStatus::TransferInitiated)
            .await?;
        self.storage
            .write()
            .await
            .update_withdrawal(&withdrawal)
            .await?;
        Ok(())
    }

    /// transfer confirmed on chain: clear the holding account, terminal.
    pub async fn step_finalize(
        &self,
        id: &WithdrawalId,
        _trace_id: &TraceId,
    ) -> Result<(), CoreError> {
        let mut withdrawal = self.get_withdrawal(id).await?;
        if withdrawal.status != WithdrawalStatus::TransferInitiated {
            debug!("withdrawal {} is {}, skipping finalize", id, withdrawal.status);
            return Ok(());
        }

        let holding = self
            .ledger
            .get_or_create_account(Some(withdrawal.user_id), AccountType::PendingInvestment)
            .await?;
        let buffer_fiat = self
            .ledger
            .system_account(AccountType::SystemBufferFiat)
            .await?;
        self.ledger
            .post_transaction(
                Posting::new(
                    derive_key(&withdrawal.id.to_string(), "complete"),
                    TransactionType::Withdrawal,
                    format!("withdrawal {} settled on chain", withdrawal.id),
                    vec![
                        EntrySpec::debit(holding.id, withdrawal.amount_usd),
                        EntrySpec::credit(buffer_fiat.id, withdrawal.amount_usd),
                    ],
                )
                .with_reference(EntityRef::new("withdrawal", withdrawal.id)),
            )
            .await?;

        withdrawal.completed_at = Some(time::now());
        self.transition(&mut withdrawal, WithdrawalStatus::Complete)
            .await?;
        self.storage
            .write()
            .await
            .update_withdrawal(&withdrawal)
            .await?;
        metrics::counter!("withdrawals_completed").increment(1);
        info!(
            "withdrawal {} of {} settled to {} [{}]",
            withdrawal.id, withdrawal.amount_usd, withdrawal.target_address, withdrawal.trace_id
        );
        Ok(())
    }

    /// Unwind a failed withdrawal: reverse completed postings newest
    /// first. The pre-debit reversal restores the user's buying power.
    pub async fn compensate(&self, id: &WithdrawalId, _trace_id: &TraceId) -> Result<(), CoreError> {
        let mut withdrawal = self.get_withdrawal(id).await?;
        if withdrawal.status.is_terminal() {
            return Ok(());
        }

        let mut reversed_beyond_pre_debit = false;
        for key in ["transfer_initiated", "broker_withdrawal_complete"] {
            let full_key = derive_key(&withdrawal.id.to_string(), key);
            let posted = {
                let storage = self.storage.read().await;
                storage.get_transaction_by_idempotency_key(&full_key).await?
            };
            if let Some(tx) = posted {
                if tx.status == TransactionStatus::Completed {
                    self.ledger
                        .reverse_transaction(&tx.id, &derive_key(&full_key, "reversal"))
                        .await?;
                    reversed_beyond_pre_debit = true;
                }
            }
        }
        // the pre-debit key derives from the client idempotency key, so it
        // is found through the posting reference instead
        let pre_debit = {
            let storage = self.storage.read().await;
            storage
                .list_transactions()
                .await?
                .into_iter()
                .find(|tx| {
                    tx.transaction_type == TransactionType::Withdrawal
                        && tx.status == TransactionStatus::Completed
                        && tx
                            .reference
                            .as_ref()
                            .map(|r| {
                                r.entity_type == "withdrawal"
                                    && r.entity_id == withdrawal.id.to_string()
                            })
                            .unwrap_or(false)
                        && tx.description.contains("pre-debit")
                })
        };
        if let Some(tx) = pre_debit {
            self.ledger
                .reverse_transaction(
                    &tx.id,
                    &derive_key(&withdrawal.id.to_string(), "pre_debit_reversal"),
                )
                .await?;
        }

        let old_status = withdrawal.status;
        withdrawal.failure_reason = Some("withdrawal failed; funds restored".to_string());
        self.transition(&mut withdrawal, WithdrawalStatus::Failed)
            .await?;
        self.storage
            .write()
            .await
            .update_withdrawal(&withdrawal)
            .await?;
        metrics::counter!("withdrawals_failed").increment(1);

        let severity = if reversed_beyond_pre_debit {
            Severity::High
        } else {
            Severity::Medium
        };
        let exception = ReconciliationException {
            id: ExceptionId::generate(),
            report_id: None,
            check_type: CheckType::Withdrawals,
            severity,
            description: format!(
                "withdrawal {} failed after {old_status}; ledger unwound, partner legs need review",
                withdrawal.id
            ),
            discrepancy: Some(withdrawal.amount_usd),
            resolution_state: ResolutionState::Open,
            auto_corrected: false,
            created_at: time::now(),
            updated_at: time::now(),
        };
        self.storage
            .write()
            .await
            .insert_exception(&exception)
            .await?;
        warn!(
            "withdrawal {} compensated and failed; exception {} raised [{}]",
            withdrawal.id, exception.id, withdrawal.trace_id
        );
        Ok(())
    }

    /// Broker journal failed: unwind via compensation.
    pub async fn on_broker_failed(&self, broker_ref: &str) -> Result<(), CoreError> {
        let withdrawal = self
            .storage
            .read()
            .await
            .get_withdrawal_by_broker_ref(broker_ref)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!("withdrawal for journal {broker_ref}"))
            })?;
        let mut storage = self.storage.write().await;
        enqueue_step(
            &mut *storage,
            SagaStepKind::WithdrawalCompensate,
            &withdrawal.id.to_string(),
            &withdrawal.trace_id,
        )
        .await?;
        Ok(())
    }

    async fn on_ramp_job(
        &self,
        withdrawal: &Withdrawal,
    ) -> Result<stack_common::conversion::ConversionJob, CoreError> {
        let job_id: ConversionJobId = withdrawal
            .on_ramp_ref
            .as_deref()
            .ok_or_else(|| {
                CoreError::Internal(format!("withdrawal {} has no on-ramp ref", withdrawal.id))
            })?
            .parse()
            .map_err(|_| CoreError::Internal("malformed on-ramp ref".to_string()))?;
        self.treasury.get_job(&job_id).await
    }

    async fn effective_limits(&self, user_id: &UserId) -> Result<WithdrawalLimits, CoreError> {
        let configured = self
            .storage
            .read()
            .await
            .get_withdrawal_limits(user_id)
            .await?;
        Ok(configured.unwrap_or_else(|| WithdrawalLimits {
            daily: Amount::from_units(DEFAULT_DAILY_LIMIT_USD, Currency::Usd),
            weekly: Amount::from_units(DEFAULT_WEEKLY_LIMIT_USD, Currency::Usd),
            monthly: Amount::from_units(DEFAULT_MONTHLY_LIMIT_USD, Currency::Usd),
            dual_auth_threshold: Amount::from_units(
                DEFAULT_DUAL_AUTH_THRESHOLD_USD,
                Currency::Usd,
            ),
        }))
    }

    /// Rolling 24h/7d/30d windows over non-failed withdrawals.
    async fn check_limits(
        &self,
        user_id: &UserId,
        amount: &Amount,
        limits: &WithdrawalLimits,
    ) -> Result<(), CoreError> {
        let history = self
            .storage
            .read()
            .await
            .list_withdrawals_for_user(user_id)
            .await?;
        let now = time::now();
        let windows = [
            ("daily", now - Duration::days(1), &limits.daily),
            ("weekly", now - Duration::days(7), &limits.weekly),
            ("monthly", now - Duration::days(30), &limits.monthly),
        ];
        for (name, since, cap) in windows {
            let mut used = Amount::zero(Currency::Usd);
            for withdrawal in &history {
                if withdrawal.status != WithdrawalStatus::Failed && withdrawal.created_at >= since {
                    used = used.checked_add(&withdrawal.amount_usd)?;
                }
            }
            let projected = used.checked_add(amount)?;
            if projected > *cap {
                return Err(CoreError::LimitExceeded(format!(
                    "{name} cap {cap} would be exceeded ({projected} requested over the window)"
                )));
            }
        }
        Ok(())
    }

    async fn transition(
        &self,
        withdrawal: &mut Withdrawal,
        next: WithdrawalStatus,
    ) -> Result<(), CoreError> {
        if !withdrawal.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                entity: "withdrawal",
                from: withdrawal.status.to_string(),
                to: next.to_string(),
            });
        }
        let old = withdrawal.status;
        withdrawal.status = next;
        withdrawal.updated_at = time::now();
        metrics::counter!("withdrawal_transitions", "to" => next.to_string()).increment(1);
        self.audit
            .record(
                Some(withdrawal.user_id),
                "withdrawal.status_transition",
                "withdrawal",
                &withdrawal.id.to_string(),
                status_change(old, next),
                &withdrawal.trace_id,
            )
            .await;
        Ok(())
    }
}
