// Reconciliation service.
//
// Scheduled proof that the ledger still matches the world: internal
// consistency first, then the external custodians. A failing check writes
// an exception sized by the discrepancy; low severity ones may be
// auto-corrected when the deployment allows it.

use std::sync::Arc;

use chrono::Duration;
use stack_common::{
    amount::Amount,
    conversion::ConversionJobStatus,
    currency::Currency,
    deposit::DepositStatus,
    idempotency::derive_key,
    ids::{ExceptionId, ReportId, TraceId},
    ledger::{AccountType, EntrySide, TransactionStatus},
    reconciliation::{
        CheckType, ReconciliationCheck, ReconciliationException, ReconciliationReport,
        ResolutionState, RunKind, Severity,
    },
    time::{self, Timestamp},
    withdrawal::WithdrawalStatus,
};

use crate::adapters::{guarded, Adapters};
use crate::core::{
    audit::Audit,
    error::CoreError,
    ledger::Ledger,
    storage::{SharedStorage, Storage},
};

/// Per-deployment reconciliation knobs. Tolerances default to one minor
/// unit (a cent, 1e-6 USDC).
#[derive(Clone, Debug)]
pub struct ReconciliationConfig {
    pub auto_correct_low_severity: bool,
    pub tolerance_usd: Amount,
    pub tolerance_usdc: Amount,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            auto_correct_low_severity: true,
            tolerance_usd: Amount::minor_unit(Currency::Usd),
            tolerance_usdc: Amount::minor_unit(Currency::Usdc),
        }
    }
}

pub struct Reconciliation<S: Storage> {
    storage: SharedStorage<S>,
    ledger: Ledger<S>,
    audit: Audit<S>,
    adapters: Arc<Adapters>,
    config: ReconciliationConfig,
}

impl<S: Storage> Clone for Reconciliation<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            ledger: self.ledger.clone(),
            audit: self.audit.clone(),
            adapters: self.adapters.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: Storage> Reconciliation<S> {
    pub fn new(
        storage: SharedStorage<S>,
        ledger: Ledger<S>,
        audit: Audit<S>,
        adapters: Arc<Adapters>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            storage,
            ledger,
            audit,
            adapters,
            config,
        }
    }

    /// One reconciliation run. Quick runs cover the recent window, full
    /// runs cover everything.
    pub async fn run(&self, kind: RunKind) -> Result<ReconciliationReport, CoreError> {
        let started_at = time::now();
        let since = match kind {
            RunKind::Quick => Some(started_at - Duration::hours(2)),
            RunKind::Full => None,
        };
        let trace_id = TraceId::generate();
        info!("starting {kind} reconciliation run [{trace_id}]");

        let mut checks = Vec::new();
        checks.push(self.check_ledger_consistency(since).await?);
        checks.push(self.check_custody_buffer().await?);
        checks.push(self.check_broker_fiat().await?);
        checks.push(self.check_deposits(since).await?);
        checks.push(self.check_conversions(since).await?);
        checks.push(self.check_withdrawals(since).await?);

        let passed = checks.iter().all(|check| check.passed);
        let report = ReconciliationReport {
            id: ReportId::generate(),
            kind,
            checks,
            passed,
            trace_id: trace_id.clone(),
            started_at,
            finished_at: time::now(),
        };
        self.storage.write().await.insert_report(&report).await?;

        for check in report.checks.iter().filter(|check| !check.passed) {
            self.raise_exception(&report, check).await?;
        }

        metrics::counter!("reconciliation_runs", "kind" => kind.to_string()).increment(1);
        if passed {
            info!("reconciliation {} passed all checks [{trace_id}]", report.id);
        } else {
            warn!(
                "reconciliation {} found {} failing checks [{trace_id}]",
                report.id,
                report.checks.iter().filter(|c| !c.passed).count()
            );
            metrics::counter!("reconciliation_failures").increment(1);
        }
        Ok(report)
    }

    async fn raise_exception(
        &self,
        report: &ReconciliationReport,
        check: &ReconciliationCheck,
    ) -> Result<(), CoreError> {
        let severity = check
            .discrepancy
            .as_ref()
            .map(Severity::from_discrepancy)
            .unwrap_or(Severity::Medium);
        let auto_corrected =
            severity == Severity::Low && self.config.auto_correct_low_severity;
        let exception = ReconciliationException {
            id: ExceptionId::generate(),
            report_id: Some(report.id),
            check_type: check.check_type,
            severity,
            description: check.details.clone(),
            discrepancy: check.discrepancy,
            resolution_state: if auto_corrected {
                ResolutionState::Resolved
            } else {
                ResolutionState::Open
            },
            auto_corrected,
            created_at: time::now(),
            updated_at: time::now(),
        };
        self.storage.write().await.insert_exception(&exception).await?;
        metrics::counter!("reconciliation_exceptions", "severity" => severity.to_string())
            .increment(1);
        self.audit
            .record(
                None,
                "reconciliation.exception_raised",
                "reconciliation_exception",
                &exception.id.to_string(),
                stack_common::audit::AuditChanges {
                    before: None,
                    after: Some(serde_json::json!({
                        "check": check.check_type.to_string(),
                        "severity": severity.to_string(),
                        "auto_corrected": auto_corrected,
                    })),
                },
                &report.trace_id,
            )
            .await;
        Ok(())
    }

    /// Manual workflow on an exception: open -> investigating -> resolved
    /// or wont_fix.
    pub async fn resolve_exception(
        &self,
        id: &stack_common::ids::ExceptionId,
        next: ResolutionState,
    ) -> Result<ReconciliationException, CoreError> {
        let mut exception = self
            .storage
            .read()
            .await
            .get_exception(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("exception {id}")))?;
        if !exception.resolution_state.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                entity: "reconciliation_exception",
                from: exception.resolution_state.to_string(),
                to: next.to_string(),
            });
        }
        exception.resolution_state = next;
        exception.updated_at = time::now();
        self.storage.write().await.update_exception(&exception).await?;
        Ok(exception)
    }

    /// Check 1: every transaction balances and every account's
    /// materialized balance equals its seed plus the running entry sum.
    async fn check_ledger_consistency(
        &self,
        since: Option<Timestamp>,
    ) -> Result<ReconciliationCheck, CoreError> {
        let storage = self.storage.read().await;
        let mut bad = Vec::new();

        for tx in storage.list_transactions().await? {
            if let Some(since) = since {
                if tx.created_at < since {
                    continue;
                }
            }
            let entries = storage.get_entries_for_transaction(&tx.id).await?;
            if entries.is_empty() {
                continue;
            }
            let currency = entries[0].amount.currency();
            let mut debits = Amount::zero(currency);
            let mut credits = Amount::zero(currency);
            let mut mixed = false;
            for entry in &entries {
                if entry.amount.currency() != currency {
                    mixed = true;
                    break;
                }
                match entry.side {
                    EntrySide::Debit => debits = debits.checked_add(&entry.amount)?,
                    EntrySide::Credit => credits = credits.checked_add(&entry.amount)?,
                }
            }
            if mixed || debits != credits {
                bad.push(format!("transaction {} is unbalanced", tx.id));
            }
        }

        for account in storage.list_accounts().await? {
            let entries = storage.get_entries_for_account(&account.id).await?;
            let mut credits = account.initial_balance;
            let mut debits = Amount::zero(account.currency);
            for entry in &entries {
                match entry.side {
                    EntrySide::Credit => credits = credits.checked_add(&entry.amount)?,
                    EntrySide::Debit => debits = debits.checked_add(&entry.amount)?,
                }
            }
            let expected = credits.checked_sub(&debits);
            match expected {
                Ok(expected) if expected == account.balance => {}
                _ => bad.push(format!(
                    "account {} balance diverges from its entries",
                    account.id
                )),
            }
        }

        Ok(ReconciliationCheck {
            check_type: CheckType::LedgerConsistency,
            passed: bad.is_empty(),
            details: if bad.is_empty() {
                "all transactions balanced, all balances match entries".to_string()
            } else {
                bad.join("; ")
            },
            discrepancy: None,
        })
    }

    /// Check 2: custodian-reported treasury USDC vs the USDC buffer.
    async fn check_custody_buffer(&self) -> Result<ReconciliationCheck, CoreError> {
        let reported = guarded(
            &self.adapters.custody_breaker,
            self.adapters.custody.get_treasury_balance("USDC"),
        )
        .await?;
        let buffer = self
            .ledger
            .system_account(AccountType::SystemBufferUsdc)
            .await?;
        let discrepancy = buffer.balance.abs_diff(&reported)?;
        let passed = discrepancy <= self.config.tolerance_usdc;
        Ok(ReconciliationCheck {
            check_type: CheckType::CustodialUsdcBuffer,
            passed,
            details: format!(
                "custodian reports {reported}, buffer at {}",
                buffer.balance
            ),
            discrepancy: (!passed).then_some(discrepancy),
        })
    }

    /// Check 3: broker-reported cash vs the broker operational account.
    async fn check_broker_fiat(&self) -> Result<ReconciliationCheck, CoreError> {
        let reported = guarded(
            &self.adapters.brokerage_breaker,
            self.adapters.brokerage.get_cash_balance(),
        )
        .await?;
        let broker = self
            .ledger
            .system_account(AccountType::BrokerOperational)
            .await?;
        let discrepancy = broker.balance.abs_diff(&reported)?;
        let passed = discrepancy <= self.config.tolerance_usd;
        Ok(ReconciliationCheck {
            check_type: CheckType::BrokerFiat,
            passed,
            details: format!(
                "broker reports {reported}, operational account at {}",
                broker.balance
            ),
            discrepancy: (!passed).then_some(discrepancy),
        })
    }

    /// Check 4: terminal deposits reconcile with their ledger postings.
    /// A deposit whose broker-funded posting exists but whose status
    /// lagged behind is the auto-correctable case.
    async fn check_deposits(
        &self,
        since: Option<Timestamp>,
    ) -> Result<ReconciliationCheck, CoreError> {
        let deposits = self.storage.read().await.list_deposits().await?;
        let mut bad = Vec::new();
        let mut corrected = 0usize;

        for mut deposit in deposits {
            if let Some(since) = since {
                if deposit.updated_at < since {
                    continue;
                }
            }
            let confirm_key = derive_key(&deposit.id.to_string(), "confirmed_on_chain");
            let confirm_tx = self
                .storage
                .read()
                .await
                .get_transaction_by_idempotency_key(&confirm_key)
                .await?;
            match deposit.status {
                DepositStatus::BrokerFunded => {
                    let ok = matches!(
                        &confirm_tx,
                        Some(tx) if tx.status == TransactionStatus::Completed
                    );
                    if !ok {
                        bad.push(format!(
                            "deposit {} is broker_funded without a confirmation posting",
                            deposit.id
                        ));
                    }
                }
                DepositStatus::Failed => {
                    if let Some(tx) = &confirm_tx {
                        if tx.status != TransactionStatus::Reversed {
                            bad.push(format!(
                                "failed deposit {} still holds an unreversed confirmation",
                                deposit.id
                            ));
                        }
                    }
                }
                DepositStatus::OffRampComplete => {
                    // status sync lag: the final posting landed but the row
                    // was not advanced
                    let funded_key = derive_key(&deposit.id.to_string(), "broker_funded");
                    let funded = self
                        .storage
                        .read()
                        .await
                        .get_transaction_by_idempotency_key(&funded_key)
                        .await?;
                    if let Some(tx) = funded {
                        if tx.status == TransactionStatus::Completed {
                            if self.config.auto_correct_low_severity {
                                deposit.status = DepositStatus::BrokerFunded;
                                deposit.broker_funded_at = Some(time::now());
                                deposit.updated_at = time::now();
                                self.storage
                                    .write()
                                    .await
                                    .update_deposit(&deposit)
                                    .await?;
                                self.audit
                                    .record(
                                        Some(deposit.user_id),
                                        "reconciliation.auto_corrected",
                                        "deposit",
                                        &deposit.id.to_string(),
                                        crate::core::audit::status_change(
                                            DepositStatus::OffRampComplete,
                                            DepositStatus::BrokerFunded,
                                        ),
                                        &deposit.trace_id,
                                    )
                                    .await;
                                corrected += 1;
                            } else {
                                bad.push(format!(
                                    "deposit {} status lags its broker-funded posting",
                                    deposit.id
                                ));
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        let mut details = if bad.is_empty() {
            "terminal deposits match their postings".to_string()
        } else {
            bad.join("; ")
        };
        if corrected > 0 {
            details.push_str(&format!(" ({corrected} status lags auto-corrected)"));
        }
        Ok(ReconciliationCheck {
            check_type: CheckType::Deposits,
            passed: bad.is_empty(),
            details,
            discrepancy: None,
        })
    }

    /// Check 5: every completed conversion job links exactly one
    /// destination-leg ledger transaction.
    async fn check_conversions(
        &self,
        since: Option<Timestamp>,
    ) -> Result<ReconciliationCheck, CoreError> {
        let jobs = self.storage.read().await.list_conversion_jobs().await?;
        let mut bad = Vec::new();
        for job in jobs {
            if job.status != ConversionJobStatus::Completed {
                continue;
            }
            if let Some(since) = since {
                if job.updated_at < since {
                    continue;
                }
            }
            let Some(tx_id) = job.ledger_transaction_id else {
                bad.push(format!("completed conversion {} has no ledger link", job.id));
                continue;
            };
            let storage = self.storage.read().await;
            let linked = storage.get_transaction(&tx_id).await?;
            let by_key = storage
                .get_transaction_by_idempotency_key(&derive_key(
                    &job.idempotency_key,
                    "destination_leg",
                ))
                .await?;
            drop(storage);
            match (linked, by_key) {
                (Some(tx), Some(gate)) if tx.id == gate.id => {}
                _ => bad.push(format!(
                    "conversion {} ledger linkage is inconsistent",
                    job.id
                )),
            }
        }
        Ok(ReconciliationCheck {
            check_type: CheckType::Conversions,
            passed: bad.is_empty(),
            details: if bad.is_empty() {
                "completed conversions each link one ledger transaction".to_string()
            } else {
                bad.join("; ")
            },
            discrepancy: None,
        })
    }

    /// Check 6: completed withdrawals carry their settlement posting.
    async fn check_withdrawals(
        &self,
        since: Option<Timestamp>,
    ) -> Result<ReconciliationCheck, CoreError> {
        let withdrawals = self.storage.read().await.list_withdrawals().await?;
        let mut bad = Vec::new();
        for withdrawal in withdrawals {
            if let Some(since) = since {
                if withdrawal.updated_at < since {
                    continue;
                }
            }
            if withdrawal.status != WithdrawalStatus::Complete {
                continue;
            }
            let key = derive_key(&withdrawal.id.to_string(), "complete");
            let tx = self
                .storage
                .read()
                .await
                .get_transaction_by_idempotency_key(&key)
                .await?;
            let ok = matches!(&tx, Some(tx) if tx.status == TransactionStatus::Completed);
            if !ok {
                bad.push(format!(
                    "withdrawal {} is complete without a settlement posting",
                    withdrawal.id
                ));
            }
        }
        Ok(ReconciliationCheck {
            check_type: CheckType::Withdrawals,
            passed: bad.is_empty(),
            details: if bad.is_empty() {
                "completed withdrawals match their postings".to_string()
            } else {
                bad.join("; ")
            },
            discrepancy: None,
        })
    }
}
