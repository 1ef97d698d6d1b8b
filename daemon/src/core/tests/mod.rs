// End-to-end scenarios over a temporary database and partner doubles.
//
// The harness drives the workers the way the schedulers would, and plays
// the partner webhooks back into the core, so every flow below runs the
// same code paths as a deployed daemon.

use std::sync::Arc;

use stack_common::{
    amount::Amount,
    api::{ChainWebhookPayload, ProviderEventStatus},
    conversion::{ConversionDirection, ConversionJobStatus, TriggerReason},
    currency::Currency,
    deposit::DepositStatus,
    events::EventJobStatus,
    ids::UserId,
    ledger::{AccountType, EntrySpec, TransactionType},
    reconciliation::{CheckType, RunKind, Severity},
    wallet::ProvisioningJobStatus,
    withdrawal::WithdrawalStatus,
};

use crate::adapters::{
    mock::{MockBrokerage, MockChainWatcher, MockConversionProvider, MockCustody},
    AdapterError, Adapters, BrokerageProvider as _,
};
use crate::core::{
    error::CoreError,
    ledger::Posting,
    reconciliation::ReconciliationConfig,
    storage::{
        ConversionStoreProvider as _, DepositProvider as _, EventJobProvider as _,
        LedgerTransactionProvider as _, ReconciliationProvider as _, SledStorage,
        WalletProvider as _, WithdrawalProvider as _,
    },
    treasury::ProviderSettlement,
    Core,
};

struct Harness {
    core: Arc<Core<SledStorage>>,
    custody: Arc<MockCustody>,
    conversion: Arc<MockConversionProvider>,
    brokerage: Arc<MockBrokerage>,
}

impl Harness {
    async fn new() -> Self {
        let custody = Arc::new(MockCustody::new());
        let conversion = Arc::new(MockConversionProvider::new());
        let brokerage = Arc::new(MockBrokerage::new());
        let watcher = Arc::new(MockChainWatcher::new());
        let adapters = Arc::new(Adapters::new(
            custody.clone(),
            conversion.clone(),
            brokerage.clone(),
            watcher,
        ));
        let core = Core::new(
            SledStorage::open_temporary().expect("temp storage"),
            adapters,
            ReconciliationConfig::default(),
        );
        core.bootstrap().await.expect("bootstrap");
        // the partner doubles hold what the ledger seeds say they hold,
        // the same way a funded devnet deployment starts out
        custody.set_treasury_balance(crate::config::default_buffer_seed(
            AccountType::SystemBufferUsdc,
        ));
        brokerage.set_cash_balance(crate::config::default_buffer_seed(
            AccountType::BrokerOperational,
        ));
        Self {
            core,
            custody,
            conversion,
            brokerage,
        }
    }

    /// Deliver a deposit finality webhook, mirroring the physical token
    /// arrival at the custodian. Duplicate deliveries do not double the
    /// custodian's holdings.
    async fn deposit_webhook(&self, payload: &ChainWebhookPayload) {
        let fresh = self
            .core
            .storage
            .read()
            .await
            .get_event_job_by_dedup(&payload.chain, &payload.tx_hash)
            .await
            .expect("dedup lookup")
            .is_none();
        self.core.events.capture(payload).await.expect("capture");
        if fresh {
            let amount = Amount::parse(&payload.amount, Currency::Usdc).expect("amount");
            self.custody.adjust_treasury(&amount, true);
        }
    }

    /// Provision one wallet and return its deposit address.
    async fn provision_wallet(&self, user: UserId, chain: &str) -> String {
        let job = self
            .core
            .provisioning
            .enqueue(user, vec![chain.to_string()])
            .await
            .expect("enqueue provisioning");
        while self.core.provisioning.poll_once().await.expect("provision poll") {}
        let job = self.core.provisioning.get_job(&job.id).await.expect("job");
        assert_eq!(job.status, ProvisioningJobStatus::Completed);
        self.core
            .get_deposit_address(&user, chain)
            .await
            .expect("deposit address")
    }

    fn chain_payload(chain: &str, tx_hash: &str, amount: &str, to: &str) -> ChainWebhookPayload {
        ChainWebhookPayload {
            chain: chain.to_string(),
            tx_hash: tx_hash.to_string(),
            token: "USDC".to_string(),
            amount: amount.to_string(),
            to_address: to.to_string(),
            confirmations: 32,
        }
    }

    /// Par settlement for whatever the provider has accepted but not yet
    /// settled, mimicking the conversion partner's completion webhooks.
    async fn settle_conversions(&self) -> bool {
        let mut progressed = false;
        for submission in self.conversion.submissions() {
            let job = self
                .core
                .storage
                .read()
                .await
                .get_conversion_job_by_provider_tx(&submission.provider_tx_id)
                .await
                .expect("lookup job");
            let Some(job) = job else { continue };
            if matches!(
                job.status,
                ConversionJobStatus::ProviderSubmitted | ConversionJobStatus::ProviderProcessing
            ) {
                let settled = self
                    .core
                    .treasury
                    .on_provider_event(
                        &submission.provider_tx_id,
                        ProviderEventStatus::Completed,
                        ProviderSettlement::default(),
                        None,
                    )
                    .await
                    .expect("settle conversion");
                // mirror the physical token movement at the custodian
                match settled.direction {
                    ConversionDirection::UsdcToUsd => {
                        if let Some(source) = settled.settled_source_amount {
                            self.custody.adjust_treasury(&source, false);
                        }
                    }
                    ConversionDirection::UsdToUsdc => {
                        if let Some(destination) = settled.settled_destination_amount {
                            self.custody.adjust_treasury(&destination, true);
                        }
                    }
                }
                progressed = true;
            }
        }
        progressed
    }

    /// Broker journals settle out of band; feed the callbacks back in.
    async fn settle_broker_withdrawals(&self) -> bool {
        let withdrawals = self
            .core
            .storage
            .read()
            .await
            .list_withdrawals()
            .await
            .expect("list withdrawals");
        let mut progressed = false;
        for withdrawal in withdrawals {
            if withdrawal.status == WithdrawalStatus::BrokerWithdrawalInitiated {
                if let Some(broker_ref) = &withdrawal.broker_ref {
                    self.core
                        .withdrawals
                        .on_broker_settled(broker_ref)
                        .await
                        .expect("broker settle");
                    progressed = true;
                }
            }
        }
        progressed
    }

    /// Outbound sends confirm on chain via the same webhook pipeline as
    /// deposits.
    async fn confirm_outbound_transfers(&self) -> bool {
        let withdrawals = self
            .core
            .storage
            .read()
            .await
            .list_withdrawals()
            .await
            .expect("list withdrawals");
        let mut progressed = false;
        for withdrawal in withdrawals {
            if withdrawal.status == WithdrawalStatus::TransferInitiated {
                if let Some(tx_hash) = &withdrawal.tx_hash {
                    let payload = Self::chain_payload(
                        &withdrawal.target_chain,
                        tx_hash,
                        &withdrawal
                            .amount_usd
                            .rescaled(Currency::Usdc)
                            .unwrap()
                            .to_string(),
                        &withdrawal.target_address,
                    );
                    // duplicate captures collapse, so this is safe to
                    // call on every pass
                    self.core.events.capture(&payload).await.expect("capture");
                    progressed = true;
                }
            }
        }
        progressed
    }

    /// Run workers and partner callbacks to quiescence.
    async fn drive(&self) {
        for _ in 0..40 {
            let mut progressed = false;
            while self.core.events.poll_once().await.expect("events poll") {
                progressed = true;
            }
            while self.core.steps.poll_once().await.expect("steps poll") {
                progressed = true;
            }
            progressed |= self.settle_conversions().await;
            progressed |= self.settle_broker_withdrawals().await;
            progressed |= self.confirm_outbound_transfers().await;
            if !progressed {
                break;
            }
        }
    }

    async fn system_balance(&self, account_type: AccountType) -> Amount {
        self.core
            .ledger
            .system_account(account_type)
            .await
            .expect("system account")
            .balance
    }

    async fn seed_buying_power(&self, user: UserId, units: u64) {
        let fiat = self
            .core
            .ledger
            .get_or_create_account(Some(user), AccountType::FiatExposure)
            .await
            .unwrap();
        let buffer = self
            .core
            .ledger
            .system_account(AccountType::SystemBufferFiat)
            .await
            .unwrap();
        self.core
            .ledger
            .post_transaction(Posting::new(
                format!("seed-{user}-{units}"),
                TransactionType::InternalTransfer,
                "test seed",
                vec![
                    EntrySpec::debit(buffer.id, Amount::from_units(units, Currency::Usd)),
                    EntrySpec::credit(fiat.id, Amount::from_units(units, Currency::Usd)),
                ],
            ))
            .await
            .unwrap();
    }
}

fn usd(units: u64) -> Amount {
    Amount::from_units(units, Currency::Usd)
}

fn usdc(units: u64) -> Amount {
    Amount::from_units(units, Currency::Usdc)
}

#[tokio::test]
async fn happy_deposit_reaches_broker_funded() {
    let harness = Harness::new().await;
    let user = UserId::generate();
    let address = harness.provision_wallet(user, "SOL-DEVNET").await;
    let buffer_usdc_before = harness.system_balance(AccountType::SystemBufferUsdc).await;

    let payload = Harness::chain_payload("SOL-DEVNET", "0xabc", "100.000000", &address);
    harness.deposit_webhook(&payload).await;
    harness.drive().await;

    let deposit = harness
        .core
        .storage
        .read()
        .await
        .get_deposit_by_tx_hash("SOL-DEVNET", "0xabc")
        .await
        .unwrap()
        .expect("deposit exists");
    assert_eq!(deposit.status, DepositStatus::BrokerFunded);
    assert!(deposit.broker_funded_at.is_some());

    let balances = harness.core.get_balances(&user).await.unwrap();
    assert_eq!(balances.buying_power_usd, usd(100));
    assert!(balances.usdc_on_chain.is_zero());
    assert!(balances.pending_deposits_usd.is_zero());

    // the USDC buffer absorbed the inflow and was made whole by the
    // off-ramp's source leg
    assert_eq!(
        harness.system_balance(AccountType::SystemBufferUsdc).await,
        buffer_usdc_before
    );
    // the broker really holds the user's cash now
    assert_eq!(
        harness.brokerage.get_cash_balance().await.unwrap(),
        harness
            .system_balance(AccountType::BrokerOperational)
            .await
    );

    // double-entry invariants hold across the whole flow
    let report = harness.core.reconciliation.run(RunKind::Full).await.unwrap();
    assert!(report.passed, "failing checks: {:?}", report.checks);
}

#[tokio::test]
async fn duplicate_webhook_processes_once() {
    let harness = Harness::new().await;
    let user = UserId::generate();
    let address = harness.provision_wallet(user, "SOL-DEVNET").await;

    let payload = Harness::chain_payload("SOL-DEVNET", "0xdup", "100.000000", &address);
    harness.deposit_webhook(&payload).await;
    harness.deposit_webhook(&payload).await;
    harness.drive().await;
    // a late replay after processing is also a no-op
    harness.deposit_webhook(&payload).await;
    harness.drive().await;

    let jobs = harness
        .core
        .storage
        .read()
        .await
        .list_event_jobs(None)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, EventJobStatus::Completed);

    let balances = harness.core.get_balances(&user).await.unwrap();
    assert_eq!(balances.buying_power_usd, usd(100));
}

#[tokio::test]
async fn off_ramp_permanent_failure_compensates_and_raises_exception() {
    let harness = Harness::new().await;
    let user = UserId::generate();
    let address = harness.provision_wallet(user, "SOL-DEVNET").await;
    let buffer_before = harness.system_balance(AccountType::SystemBufferUsdc).await;

    harness
        .conversion
        .fail_next(AdapterError::permanent("conversion", "invalid recipient"));
    let payload = Harness::chain_payload("SOL-DEVNET", "0xbad", "100.000000", &address);
    harness.deposit_webhook(&payload).await;
    harness.drive().await;

    let deposit = harness
        .core
        .storage
        .read()
        .await
        .get_deposit_by_tx_hash("SOL-DEVNET", "0xbad")
        .await
        .unwrap()
        .expect("deposit exists");
    assert_eq!(deposit.status, DepositStatus::Failed);

    // the reversal restored the buffer and zeroed the user's claim
    assert_eq!(
        harness.system_balance(AccountType::SystemBufferUsdc).await,
        buffer_before
    );
    let balances = harness.core.get_balances(&user).await.unwrap();
    assert!(balances.usdc_on_chain.is_zero());
    assert!(balances.buying_power_usd.is_zero());

    let exceptions = harness
        .core
        .storage
        .read()
        .await
        .list_exceptions()
        .await
        .unwrap();
    let raised = exceptions
        .iter()
        .find(|exception| exception.check_type == CheckType::Deposits)
        .expect("exception raised");
    assert!(raised.severity >= Severity::High);
}

#[tokio::test]
async fn withdrawal_with_insufficient_funds_writes_nothing() {
    let harness = Harness::new().await;
    let user = UserId::generate();
    harness.seed_buying_power(user, 50).await;

    let result = harness
        .core
        .withdrawals
        .initiate(user, usd(75), "SOL-DEVNET", "SoTarget1111", "client-key-1")
        .await;
    assert!(matches!(result, Err(CoreError::InsufficientFunds { .. })));

    // no saga row, no entries
    let withdrawals = harness
        .core
        .storage
        .read()
        .await
        .list_withdrawals()
        .await
        .unwrap();
    assert!(withdrawals.is_empty());
    let balances = harness.core.get_balances(&user).await.unwrap();
    assert_eq!(balances.buying_power_usd, usd(50));
    let holding = harness
        .core
        .ledger
        .get_or_create_account(Some(user), AccountType::PendingInvestment)
        .await
        .unwrap();
    assert!(holding.balance.is_zero());
}

#[tokio::test]
async fn wallet_provisioning_is_idempotent_per_chain() {
    let harness = Harness::new().await;
    let user = UserId::generate();
    harness.provision_wallet(user, "SOL-DEVNET").await;
    assert_eq!(harness.custody.created_count(), 1);

    // a second job for the same chain settles without a provider call
    let job = harness
        .core
        .provisioning
        .enqueue(user, vec!["SOL-DEVNET".to_string()])
        .await
        .unwrap();
    while harness.core.provisioning.poll_once().await.unwrap() {}
    let job = harness.core.provisioning.get_job(&job.id).await.unwrap();
    assert_eq!(job.status, ProvisioningJobStatus::Completed);
    assert_eq!(harness.custody.created_count(), 1);

    let wallets = harness
        .core
        .storage
        .read()
        .await
        .list_wallets_for_user(&user)
        .await
        .unwrap();
    assert_eq!(wallets.len(), 1);
}

#[tokio::test]
async fn provisioning_partial_success_across_chains() {
    let harness = Harness::new().await;
    let user = UserId::generate();
    harness
        .custody
        .fail_next(AdapterError::permanent("custody", "unsupported chain"));
    let job = harness
        .core
        .provisioning
        .enqueue(user, vec!["SOL-DEVNET".to_string(), "ETH-SEPOLIA".to_string()])
        .await
        .unwrap();
    while harness.core.provisioning.poll_once().await.unwrap() {}

    let job = harness.core.provisioning.get_job(&job.id).await.unwrap();
    assert_eq!(job.status, ProvisioningJobStatus::Completed);
    assert!(matches!(
        job.outcomes[0],
        stack_common::wallet::ChainProvisioningOutcome::Failed { .. }
    ));
    assert!(matches!(
        job.outcomes[1],
        stack_common::wallet::ChainProvisioningOutcome::Live { .. }
    ));
}

#[tokio::test]
async fn buffer_replenishment_fires_within_one_tick() {
    let harness = Harness::new().await;
    // drain the USDC buffer to 5k against its 10k/50k band
    let buffer = harness
        .core
        .ledger
        .system_account(AccountType::SystemBufferUsdc)
        .await
        .unwrap();
    let external = harness
        .core
        .ledger
        .system_account(AccountType::ExternalUsdcClearing)
        .await
        .unwrap();
    let drain = buffer.balance.checked_sub(&usdc(5_000)).unwrap();
    harness
        .core
        .ledger
        .post_transaction(Posting::new(
            "test-drain",
            TransactionType::InternalTransfer,
            "drain buffer for test",
            vec![
                EntrySpec::debit(buffer.id, drain),
                EntrySpec::credit(external.id, drain),
            ],
        ))
        .await
        .unwrap();

    let created = harness.core.treasury.tick().await.unwrap();
    assert_eq!(created, 1);

    // re-evaluating the same buffer state does not mint a duplicate
    let created = harness.core.treasury.tick().await.unwrap();
    assert_eq!(created, 0);

    let job = harness
        .core
        .storage
        .read()
        .await
        .list_conversion_jobs()
        .await
        .unwrap()
        .into_iter()
        .find(|job| job.trigger_reason == TriggerReason::BufferReplenishment)
        .expect("replenishment job");
    assert_eq!(job.direction, ConversionDirection::UsdToUsdc);
    assert_eq!(job.amount, usdc(45_000));

    let fiat_before = harness.system_balance(AccountType::SystemBufferFiat).await;
    harness.settle_conversions().await;
    assert_eq!(
        harness.system_balance(AccountType::SystemBufferUsdc).await,
        usdc(50_000)
    );
    // fiat side paid the full converted amount
    assert_eq!(
        harness.system_balance(AccountType::SystemBufferFiat).await,
        fiat_before.checked_sub(&usd(45_000)).unwrap()
    );

    // a second tick while the buffer is healthy creates nothing
    let created = harness.core.treasury.tick().await.unwrap();
    assert_eq!(created, 0);
}

#[tokio::test]
async fn replenishment_retries_idempotently_after_a_failed_attempt() {
    let harness = Harness::new().await;
    let buffer = harness
        .core
        .ledger
        .system_account(AccountType::SystemBufferUsdc)
        .await
        .unwrap();
    let external = harness
        .core
        .ledger
        .system_account(AccountType::ExternalUsdcClearing)
        .await
        .unwrap();
    let drain = buffer.balance.checked_sub(&usdc(5_000)).unwrap();
    harness
        .core
        .ledger
        .post_transaction(Posting::new(
            "test-drain-retry",
            TransactionType::InternalTransfer,
            "drain buffer for test",
            vec![
                EntrySpec::debit(buffer.id, drain),
                EntrySpec::credit(external.id, drain),
            ],
        ))
        .await
        .unwrap();

    // the first attempt dies permanently without touching the buffer
    harness
        .conversion
        .fail_next(AdapterError::permanent("conversion", "invalid account"));
    let created = harness.core.treasury.tick().await.unwrap();
    assert_eq!(created, 1);
    let jobs = harness
        .core
        .storage
        .read()
        .await
        .list_conversion_jobs()
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, ConversionJobStatus::Failed);

    // the next tick mints a fresh attempt under its own key instead of
    // replaying the failed row
    let created = harness.core.treasury.tick().await.unwrap();
    assert_eq!(created, 1);
    let jobs = harness
        .core
        .storage
        .read()
        .await
        .list_conversion_jobs()
        .await
        .unwrap();
    assert_eq!(jobs.len(), 2);
    assert_ne!(jobs[0].idempotency_key, jobs[1].idempotency_key);

    harness.settle_conversions().await;
    assert_eq!(
        harness.system_balance(AccountType::SystemBufferUsdc).await,
        usdc(50_000)
    );
}

#[tokio::test]
async fn deposit_then_withdrawal_round_trip_is_buffer_neutral() {
    let harness = Harness::new().await;
    let user = UserId::generate();
    let address = harness.provision_wallet(user, "SOL-DEVNET").await;

    let buffer_usdc = harness.system_balance(AccountType::SystemBufferUsdc).await;
    let buffer_fiat = harness.system_balance(AccountType::SystemBufferFiat).await;
    let broker = harness.system_balance(AccountType::BrokerOperational).await;

    let payload = Harness::chain_payload("SOL-DEVNET", "0xrt", "100.000000", &address);
    harness.deposit_webhook(&payload).await;
    harness.drive().await;
    assert_eq!(
        harness.core.get_balances(&user).await.unwrap().buying_power_usd,
        usd(100)
    );

    let withdrawal = harness
        .core
        .withdrawals
        .initiate(user, usd(100), "SOL-DEVNET", "SoTarget1111", "rt-key")
        .await
        .unwrap();
    harness.drive().await;

    let withdrawal = harness
        .core
        .withdrawals
        .get_withdrawal(&withdrawal.id)
        .await
        .unwrap();
    assert_eq!(withdrawal.status, WithdrawalStatus::Complete);
    assert!(withdrawal.tx_hash.is_some());

    // the user's exposure is back to zero and every pool is where it
    // started
    let balances = harness.core.get_balances(&user).await.unwrap();
    assert!(balances.buying_power_usd.is_zero());
    assert!(balances.usdc_on_chain.is_zero());
    assert_eq!(
        harness.system_balance(AccountType::SystemBufferUsdc).await,
        buffer_usdc
    );
    assert_eq!(
        harness.system_balance(AccountType::SystemBufferFiat).await,
        buffer_fiat
    );
    assert_eq!(
        harness.system_balance(AccountType::BrokerOperational).await,
        broker
    );
    let holding = harness
        .core
        .ledger
        .get_or_create_account(Some(user), AccountType::PendingInvestment)
        .await
        .unwrap();
    assert!(holding.balance.is_zero());

    let report = harness.core.reconciliation.run(RunKind::Full).await.unwrap();
    assert!(report.passed, "failing checks: {:?}", report.checks);
}

#[tokio::test]
async fn conversion_retry_settles_with_exactly_one_ledger_pair() {
    let harness = Harness::new().await;
    harness
        .conversion
        .fail_next(AdapterError::transient("conversion", "gateway timeout"));

    let job = harness
        .core
        .treasury
        .trigger_manual(
            ConversionDirection::UsdcToUsd,
            usdc(1_000),
            false,
            "manual-retry-key".to_string(),
        )
        .await
        .unwrap();
    assert_eq!(job.status, ConversionJobStatus::Pending);
    assert_eq!(job.retry_count, 1);
    assert!(job.next_retry_at.is_some());

    // provider recovered; the retry submits and the completion webhook
    // lands twice
    harness.core.treasury.submit_job(&job.id).await.unwrap();
    harness.settle_conversions().await;
    let provider_tx = harness
        .conversion
        .last_submission()
        .expect("submission")
        .provider_tx_id;
    let settled = harness
        .core
        .treasury
        .on_provider_event(
            &provider_tx,
            ProviderEventStatus::Completed,
            ProviderSettlement::default(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(settled.status, ConversionJobStatus::Completed);

    let job = harness.core.treasury.get_job(&job.id).await.unwrap();
    let destination_tx = job.ledger_transaction_id.expect("linked transaction");
    // the duplicate webhook did not double-post
    let entries = harness
        .core
        .storage
        .read()
        .await
        .get_entries_for_transaction(&destination_tx)
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    let report = harness.core.reconciliation.run(RunKind::Full).await.unwrap();
    assert!(report.passed, "failing checks: {:?}", report.checks);
}

#[tokio::test]
async fn withdrawal_limits_and_dual_auth() {
    let harness = Harness::new().await;
    let user = UserId::generate();
    harness.seed_buying_power(user, 20_000).await;

    // over the daily cap: deterministic rejection, nothing written
    let rejected = harness
        .core
        .withdrawals
        .initiate(user, usd(15_000), "SOL-DEVNET", "SoTarget1111", "limit-key")
        .await;
    assert!(matches!(rejected, Err(CoreError::LimitExceeded(_))));

    // over the dual-auth threshold: parked in pending until approved
    let withdrawal = harness
        .core
        .withdrawals
        .initiate(user, usd(6_000), "SOL-DEVNET", "SoTarget1111", "dual-key")
        .await
        .unwrap();
    assert!(withdrawal.requires_dual_auth);
    harness.drive().await;
    let parked = harness
        .core
        .withdrawals
        .get_withdrawal(&withdrawal.id)
        .await
        .unwrap();
    assert_eq!(parked.status, WithdrawalStatus::Pending);

    harness
        .core
        .withdrawals
        .approve_dual_auth(&withdrawal.id)
        .await
        .unwrap();
    harness.drive().await;
    let done = harness
        .core
        .withdrawals
        .get_withdrawal(&withdrawal.id)
        .await
        .unwrap();
    assert_eq!(done.status, WithdrawalStatus::Complete);

    // the second withdrawal's window usage includes the first
    let over = harness
        .core
        .withdrawals
        .initiate(user, usd(5_000), "SOL-DEVNET", "SoTarget1111", "window-key")
        .await;
    assert!(matches!(over, Err(CoreError::LimitExceeded(_))));
}

#[tokio::test]
async fn transient_off_ramp_failure_retries_to_completion() {
    let harness = Harness::new().await;
    let user = UserId::generate();
    let address = harness.provision_wallet(user, "SOL-DEVNET").await;

    harness
        .conversion
        .fail_next(AdapterError::transient("conversion", "503"));
    let payload = Harness::chain_payload("SOL-DEVNET", "0xretry", "100.000000", &address);
    harness.deposit_webhook(&payload).await;
    harness.drive().await;

    // the submission failed once and is waiting out its backoff
    let deposit = harness
        .core
        .storage
        .read()
        .await
        .get_deposit_by_tx_hash("SOL-DEVNET", "0xretry")
        .await
        .unwrap()
        .expect("deposit");
    assert_eq!(deposit.status, DepositStatus::OffRampInitiated);
    let job_id = deposit.conversion_job_id.expect("conversion job");
    let job = harness.core.treasury.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, ConversionJobStatus::Pending);
    assert_eq!(job.retry_count, 1);
    assert!(job.next_retry_at.unwrap() > stack_common::time::now());

    // provider recovers; the retried submission settles exactly once
    harness.core.treasury.submit_job(&job_id).await.unwrap();
    harness.drive().await;

    let deposit = harness
        .core
        .storage
        .read()
        .await
        .get_deposit_by_tx_hash("SOL-DEVNET", "0xretry")
        .await
        .unwrap()
        .expect("deposit");
    assert_eq!(deposit.status, DepositStatus::BrokerFunded);
    assert_eq!(
        harness.core.get_balances(&user).await.unwrap().buying_power_usd,
        usd(100)
    );
}
