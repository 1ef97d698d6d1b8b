// Funding saga: on-chain deposit -> off-ramp -> brokerage buying power.
//
// Each hop posts its ledger legs under a key derived from the deposit id
// and the target state, so a replayed webhook or a retried step can never
// double-post. The USDC buffer absorbs the on-chain inflow at
// confirmation and is made whole again when the off-ramp settles.

use std::sync::Arc;

use stack_common::{
    amount::Amount,
    conversion::{ConversionDirection, ConversionJobStatus, TriggerReason},
    deposit::{Deposit, DepositStatus},
    events::FundingEventJob,
    idempotency::derive_key,
    ids::{DepositId, ExceptionId, TraceId},
    ledger::{AccountType, EntityRef, EntrySpec, TransactionType},
    reconciliation::{
        CheckType, ReconciliationException, ResolutionState, Severity,
    },
    saga::SagaStepKind,
    time,
};

use crate::adapters::{guarded, Adapters};
use crate::core::{
    audit::{status_change, Audit},
    error::CoreError,
    ledger::{Ledger, Posting},
    saga::enqueue_step,
    storage::{SharedStorage, Storage},
    treasury::{NewConversionJob, Treasury},
};

pub struct FundingSaga<S: Storage> {
    storage: SharedStorage<S>,
    ledger: Ledger<S>,
    audit: Audit<S>,
    treasury: Treasury<S>,
    adapters: Arc<Adapters>,
}

impl<S: Storage> Clone for FundingSaga<S> {
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

impl<S: Storage> FundingSaga<S> {
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

    pub async fn get_deposit(&self, id: &DepositId) -> Result<Deposit, CoreError> {
        self.storage
            .read()
            .await
            .get_deposit(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("deposit {id}")))
    }

    /// Entry point for chain finality events drained from the webhook
    /// queue. Routes outbound-transfer confirmations to the withdrawal
    /// saga; everything else is a deposit.
    pub async fn on_chain_event(&self, event: &FundingEventJob) -> Result<(), CoreError> {
        // an outbound withdrawal send confirming looks like any other
        // finality event; the tx hash tells them apart
        let outbound = {
            let storage = self.storage.read().await;
            storage.get_withdrawal_by_tx_hash(&event.tx_hash).await?
        };
        if let Some(withdrawal) = outbound {
            let mut storage = self.storage.write().await;
            enqueue_step(
                &mut *storage,
                SagaStepKind::WithdrawalFinalize,
                &withdrawal.id.to_string(),
                &event.trace_id,
            )
            .await?;
            return Ok(());
        }

        if event.token != "USDC" {
            return Err(CoreError::Validation(format!(
                "unsupported deposit token {}",
                event.token
            )));
        }
        let wallet = self
            .storage
            .read()
            .await
            .get_wallet_by_address(&event.chain, &event.to_address)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!(
                    "wallet for {} on {}",
                    event.to_address, event.chain
                ))
            })?;

        let deposit = {
            let existing = self
                .storage
                .read()
                .await
                .get_deposit_by_tx_hash(&event.chain, &event.tx_hash)
                .await?;
            match existing {
                Some(deposit) => deposit,
                None => {
                    let now = time::now();
                    let deposit = Deposit {
                        id: DepositId::generate(),
                        user_id: wallet.user_id,
                        wallet_id: wallet.id,
                        chain: event.chain.clone(),
                        tx_hash: event.tx_hash.clone(),
                        amount: event.amount,
                        status: DepositStatus::PendingConfirmation,
                        conversion_job_id: None,
                        net_proceeds_usd: None,
                        failure_reason: None,
                        trace_id: event.trace_id.clone(),
                        created_at: now,
                        updated_at: now,
                        confirmed_at: None,
                        off_ramp_initiated_at: None,
                        off_ramp_completed_at: None,
                        broker_funded_at: None,
                    };
                    self.storage.write().await.insert_deposit(&deposit).await?;
                    info!(
                        "new deposit {} of {} for user {} on {} [{}]",
                        deposit.id, deposit.amount, deposit.user_id, deposit.chain, deposit.trace_id
                    );
                    deposit
                }
            }
        };

        // the same event delivered twice lands here with the deposit
        // already confirmed; nothing to do
        if deposit.status != DepositStatus::PendingConfirmation {
            debug!(
                "deposit {} already {}, ignoring duplicate confirmation",
                deposit.id, deposit.status
            );
            return Ok(());
        }
        self.confirm_on_chain(deposit).await
    }

    /// pending_confirmation -> confirmed_on_chain: the USDC buffer absorbs
    /// the inflow and the user's on-chain claim is recognized.
    async fn confirm_on_chain(&self, mut deposit: Deposit) -> Result<(), CoreError> {
        let user_usdc = self
            .ledger
            .get_or_create_account(Some(deposit.user_id), AccountType::UsdcBalance)
            .await?;
        let buffer = self
            .ledger
            .system_account(AccountType::SystemBufferUsdc)
            .await?;

        self.ledger
            .post_transaction(
                Posting::new(
                    derive_key(&deposit.id.to_string(), "confirmed_on_chain"),
                    TransactionType::Deposit,
                    format!("deposit {} confirmed on {}", deposit.id, deposit.chain),
                    vec![
                        EntrySpec::debit(buffer.id, deposit.amount),
                        EntrySpec::credit(user_usdc.id, deposit.amount),
                    ],
                )
                .with_reference(EntityRef::new("deposit", deposit.id)),
            )
            .await?;

        self.transition(&mut deposit, DepositStatus::ConfirmedOnChain)
            .await?;
        deposit.confirmed_at = Some(time::now());
        self.storage.write().await.update_deposit(&deposit).await?;

        let mut storage = self.storage.write().await;
        enqueue_step(
            &mut *storage,
            SagaStepKind::FundingOffRampInitiate,
            &deposit.id.to_string(),
            &deposit.trace_id,
        )
        .await?;
        Ok(())
    }

    /// confirmed_on_chain -> off_ramp_initiated: hand the deposited USDC
    /// to the conversion engine. The conversion's source leg consumes the
    /// user's USDC claim and makes the buffer whole.
    pub async fn step_off_ramp_initiate(
        &self,
        id: &DepositId,
        _trace_id: &TraceId,
    ) -> Result<(), CoreError> {
        let mut deposit = self.get_deposit(id).await?;
        if deposit.status != DepositStatus::ConfirmedOnChain {
            debug!("deposit {} is {}, skipping off-ramp initiate", id, deposit.status);
            return Ok(());
        }

        let user_usdc = self
            .ledger
            .get_or_create_account(Some(deposit.user_id), AccountType::UsdcBalance)
            .await?;
        let buffer_usdc = self
            .ledger
            .system_account(AccountType::SystemBufferUsdc)
            .await?;
        let buffer_fiat = self
            .ledger
            .system_account(AccountType::SystemBufferFiat)
            .await?;
        let external_fiat = self
            .ledger
            .system_account(AccountType::ExternalFiatClearing)
            .await?;

        let job = self
            .treasury
            .create_job(NewConversionJob {
                direction: ConversionDirection::UsdcToUsd,
                amount: deposit.amount,
                trigger_reason: TriggerReason::FundingOffRamp,
                source_account_id: user_usdc.id,
                destination_account_id: buffer_fiat.id,
                source_counterparty_account_id: buffer_usdc.id,
                destination_counterparty_account_id: external_fiat.id,
                reference: Some(EntityRef::new("deposit", deposit.id)),
                idempotency_key: derive_key(&deposit.id.to_string(), "off_ramp_conversion"),
                trace_id: deposit.trace_id.clone(),
            })
            .await?;
        self.treasury.submit_job(&job.id).await?;

        deposit.conversion_job_id = Some(job.id);
        self.transition(&mut deposit, DepositStatus::OffRampInitiated)
            .await?;
        deposit.off_ramp_initiated_at = Some(time::now());
        self.storage.write().await.update_deposit(&deposit).await?;
        Ok(())
    }

    /// off_ramp_initiated -> off_ramp_complete: the provider settled; swap
    /// the user's claim from USDC to fiat, routed through the fiat buffer.
    pub async fn step_off_ramp_complete(
        &self,
        id: &DepositId,
        _trace_id: &TraceId,
    ) -> Result<(), CoreError> {
        let mut deposit = self.get_deposit(id).await?;
        if deposit.status != DepositStatus::OffRampInitiated {
            debug!("deposit {} is {}, skipping off-ramp complete", id, deposit.status);
            return Ok(());
        }
        let job_id = deposit.conversion_job_id.ok_or_else(|| {
            CoreError::Internal(format!("deposit {id} has no conversion job"))
        })?;
        let job = self.treasury.get_job(&job_id).await?;
        let proceeds = match job.status {
            ConversionJobStatus::Completed => job
                .settled_destination_amount
                .ok_or_else(|| CoreError::Internal("settled conversion lacks amount".into()))?,
            ConversionJobStatus::Failed | ConversionJobStatus::Cancelled => {
                // compensation was already queued by the conversion engine
                return Ok(());
            }
            // completion webhook has not landed yet; retry later
            _ => {
                return Err(CoreError::ExternalTransient {
                    service: "conversion".to_string(),
                    message: format!("conversion {} not settled yet", job.id),
                })
            }
        };

        let user_fiat = self
            .ledger
            .get_or_create_account(Some(deposit.user_id), AccountType::FiatExposure)
            .await?;
        let buffer_fiat = self
            .ledger
            .system_account(AccountType::SystemBufferFiat)
            .await?;

        self.ledger
            .post_transaction(
                Posting::new(
                    derive_key(&deposit.id.to_string(), "off_ramp_complete"),
                    TransactionType::Deposit,
                    format!("deposit {} off-ramp proceeds", deposit.id),
                    vec![
                        EntrySpec::debit(buffer_fiat.id, proceeds),
                        EntrySpec::credit(user_fiat.id, proceeds),
                    ],
                )
                .with_reference(EntityRef::new("deposit", deposit.id)),
            )
            .await?;

        deposit.net_proceeds_usd = Some(proceeds);
        self.transition(&mut deposit, DepositStatus::OffRampComplete)
            .await?;
        deposit.off_ramp_completed_at = Some(time::now());
        self.storage.write().await.update_deposit(&deposit).await?;

        let mut storage = self.storage.write().await;
        enqueue_step(
            &mut *storage,
            SagaStepKind::FundingBrokerFund,
            &deposit.id.to_string(),
            &deposit.trace_id,
        )
        .await?;
        Ok(())
    }

    /// off_ramp_complete -> broker_funded: wire the fiat to the brokerage
    /// and move it from the buffer into the broker operational account.
    pub async fn step_broker_fund(
        &self,
        id: &DepositId,
        _trace_id: &TraceId,
    ) -> Result<(), CoreError> {
        let mut deposit = self.get_deposit(id).await?;
        if deposit.status != DepositStatus::OffRampComplete {
            debug!("deposit {} is {}, skipping broker fund", id, deposit.status);
            return Ok(());
        }
        let amount = match deposit.net_proceeds_usd {
            Some(amount) => amount,
            None => deposit.amount.rescaled(stack_common::currency::Currency::Usd)?,
        };

        let journal_ref = guarded(
            &self.adapters.brokerage_breaker,
            self.adapters.brokerage.fund_account(
                &amount,
                &derive_key(&deposit.id.to_string(), "broker_fund"),
            ),
        )
        .await?;

        let buffer_fiat = self
            .ledger
            .system_account(AccountType::SystemBufferFiat)
            .await?;
        let broker = self
            .ledger
            .system_account(AccountType::BrokerOperational)
            .await?;
        self.ledger
            .post_transaction(
                Posting::new(
                    derive_key(&deposit.id.to_string(), "broker_funded"),
                    TransactionType::Deposit,
                    format!("deposit {} funded at broker ({journal_ref})", deposit.id),
                    vec![
                        EntrySpec::debit(buffer_fiat.id, amount),
                        EntrySpec::credit(broker.id, amount),
                    ],
                )
                .with_reference(EntityRef::new("deposit", deposit.id))
                .with_metadata(serde_json::json!({ "journal_ref": journal_ref })),
            )
            .await?;

        self.transition(&mut deposit, DepositStatus::BrokerFunded)
            .await?;
        deposit.broker_funded_at = Some(time::now());
        self.storage.write().await.update_deposit(&deposit).await?;
        metrics::counter!("deposits_completed").increment(1);
        info!(
            "deposit {} fully funded: {} buying power [{}]",
            deposit.id, amount, deposit.trace_id
        );
        Ok(())
    }

    /// Unwind a deposit that failed after funds moved: reverse the user
    /// claim postings in reverse order, fail the deposit and raise a
    /// reconciliation exception for the residue.
    pub async fn compensate(&self, id: &DepositId, _trace_id: &TraceId) -> Result<(), CoreError> {
        let mut deposit = self.get_deposit(id).await?;
        if deposit.status == DepositStatus::Failed {
            return Ok(());
        }
        if deposit.status == DepositStatus::BrokerFunded {
            return Err(CoreError::Conflict(format!(
                "deposit {id} already settled; nothing to compensate"
            )));
        }

        // reverse whichever user-claim postings made it through, newest
        // first; settled treasury conversion legs stand and are flagged to
        // reconciliation instead
        for step in ["broker_funded", "off_ramp_complete", "confirmed_on_chain"] {
            let key = derive_key(&deposit.id.to_string(), step);
            let posted = {
                let storage = self.storage.read().await;
                storage.get_transaction_by_idempotency_key(&key).await?
            };
            if let Some(tx) = posted {
                if tx.status == stack_common::ledger::TransactionStatus::Completed {
                    self.ledger
                        .reverse_transaction(&tx.id, &derive_key(&key, "reversal"))
                        .await?;
                }
            }
        }

        let old_status = deposit.status;
        deposit.failure_reason = Some("off-ramp failed; funds returned".to_string());
        self.transition(&mut deposit, DepositStatus::Failed).await?;
        self.storage.write().await.update_deposit(&deposit).await?;
        metrics::counter!("deposits_failed").increment(1);

        let discrepancy = deposit.amount;
        let severity = Severity::from_discrepancy(&discrepancy).max(Severity::High);
        let exception = ReconciliationException {
            id: ExceptionId::generate(),
            report_id: None,
            check_type: CheckType::Deposits,
            severity,
            description: format!(
                "deposit {} failed after {old_status}; user claim reversed, external legs need review",
                deposit.id
            ),
            discrepancy: Some(discrepancy),
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
            "deposit {} compensated and failed; exception {} raised [{}]",
            deposit.id, exception.id, deposit.trace_id
        );
        Ok(())
    }

    async fn transition(
        &self,
        deposit: &mut Deposit,
        next: DepositStatus,
    ) -> Result<(), CoreError> {
        if !deposit.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                entity: "deposit",
                from: deposit.status.to_string(),
                to: next.to_string(),
            });
        }
        let old = deposit.status;
        deposit.status = next;
        deposit.updated_at = time::now();
        metrics::counter!("deposit_transitions", "to" => next.to_string()).increment(1);
        self.audit
            .record(
                Some(deposit.user_id),
                "deposit.status_transition",
                "deposit",
                &deposit.id.to_string(),
                status_change(old, next),
                &deposit.trace_id,
            )
            .await;
        Ok(())
    }

    /// Pending deposit value for the balances read model: confirmed but
    /// not yet spendable at the broker.
    pub async fn pending_deposits_usd(
        &self,
        user_id: &stack_common::ids::UserId,
    ) -> Result<Amount, CoreError> {
        let deposits = self
            .storage
            .read()
            .await
            .list_deposits_for_user(user_id)
            .await?;
        let mut total = Amount::zero(stack_common::currency::Currency::Usd);
        for deposit in deposits {
            if !deposit.status.is_terminal() {
                let usd = deposit
                    .amount
                    .rescaled(stack_common::currency::Currency::Usd)?;
                total = total.checked_add(&usd)?;
            }
        }
        Ok(total)
    }
}
