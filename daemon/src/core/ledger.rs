// Double-entry ledger.
//
// The only place balances change. A posting validates the balanced-legs
// invariant, advances the materialized balances and commits everything in
// one storage transaction. Postings serialize on the storage write lock,
// which is what keeps balance == initial + sum(entries) true at every
// observable point.

use std::collections::HashMap;

use stack_common::{
    amount::Amount,
    ids::{AccountId, EntryId, TransactionId, UserId},
    ledger::{
        check_balanced, AccountType, EntityRef, EntrySide, EntrySpec, LedgerAccount,
        LedgerEntry, LedgerTransaction, TransactionStatus, TransactionType,
    },
    time,
};
use strum::IntoEnumIterator;

use crate::config::default_buffer_seed;
use crate::core::{
    error::CoreError,
    storage::{PostingCommit, SharedStorage, Storage},
};

/// Caller-side description of one posting.
#[derive(Clone, Debug)]
pub struct Posting {
    pub idempotency_key: String,
    pub transaction_type: TransactionType,
    pub reference: Option<EntityRef>,
    pub description: String,
    pub metadata: serde_json::Value,
    pub entries: Vec<EntrySpec>,
}

impl Posting {
    pub fn new(
        idempotency_key: impl Into<String>,
        transaction_type: TransactionType,
        description: impl Into<String>,
        entries: Vec<EntrySpec>,
    ) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            transaction_type,
            reference: None,
            description: description.into(),
            metadata: serde_json::Value::Null,
            entries,
        }
    }

    pub fn with_reference(mut self, reference: EntityRef) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

pub struct Ledger<S: Storage> {
    storage: SharedStorage<S>,
}

impl<S: Storage> Clone for Ledger<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
        }
    }
}

impl<S: Storage> Ledger<S> {
    pub fn new(storage: SharedStorage<S>) -> Self {
        Self { storage }
    }

    /// Create the singleton system accounts that do not exist yet, seeding
    /// buffers and clearing ceilings with their configured initial
    /// balances. Runs at every startup; existing accounts are untouched.
    pub async fn bootstrap_system_accounts(&self) -> Result<(), CoreError> {
        let mut storage = self.storage.write().await;
        for account_type in AccountType::iter().filter(|ty| !ty.is_user_account()) {
            if storage
                .get_account_by_owner(None, account_type)
                .await?
                .is_some()
            {
                continue;
            }
            let seed = default_buffer_seed(account_type);
            let now = time::now();
            let account = LedgerAccount {
                id: AccountId::generate(),
                user_id: None,
                account_type,
                currency: account_type.currency(),
                balance: seed,
                initial_balance: seed,
                created_at: now,
                updated_at: now,
            };
            info!("bootstrapping system account {} (seed {})", account_type, seed);
            storage.insert_account(&account).await?;
        }
        Ok(())
    }

    /// Fetch the unique account for an owner, creating user accounts
    /// lazily on first need. System accounts must already exist.
    pub async fn get_or_create_account(
        &self,
        user_id: Option<UserId>,
        account_type: AccountType,
    ) -> Result<LedgerAccount, CoreError> {
        match (user_id, account_type.is_user_account()) {
            (Some(_), false) => {
                return Err(CoreError::Validation(format!(
                    "{account_type} is a system account"
                )))
            }
            (None, true) => {
                return Err(CoreError::Validation(format!(
                    "{account_type} requires a user"
                )))
            }
            _ => {}
        }

        let mut storage = self.storage.write().await;
        if let Some(account) = storage
            .get_account_by_owner(user_id.as_ref(), account_type)
            .await?
        {
            return Ok(account);
        }
        let Some(user_id) = user_id else {
            return Err(CoreError::Internal(format!(
                "system account {account_type} missing; bootstrap has not run"
            )));
        };

        let now = time::now();
        let account = LedgerAccount {
            id: AccountId::generate(),
            user_id: Some(user_id),
            account_type,
            currency: account_type.currency(),
            balance: Amount::zero(account_type.currency()),
            initial_balance: Amount::zero(account_type.currency()),
            created_at: now,
            updated_at: now,
        };
        debug!("creating {} account for user {}", account_type, user_id);
        storage.insert_account(&account).await?;
        Ok(account)
    }

    pub async fn system_account(
        &self,
        account_type: AccountType,
    ) -> Result<LedgerAccount, CoreError> {
        self.storage
            .read()
            .await
            .get_account_by_owner(None, account_type)
            .await?
            .ok_or_else(|| {
                CoreError::Internal(format!(
                    "system account {account_type} missing; bootstrap has not run"
                ))
            })
    }

    pub async fn get_account(&self, id: &AccountId) -> Result<LedgerAccount, CoreError> {
        self.storage
            .read()
            .await
            .get_account(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("account {id}")))
    }

    /// Materialized balance, O(1).
    pub async fn get_balance(&self, id: &AccountId) -> Result<Amount, CoreError> {
        Ok(self.get_account(id).await?.balance)
    }

    pub async fn get_transaction(
        &self,
        id: &TransactionId,
    ) -> Result<LedgerTransaction, CoreError> {
        self.storage
            .read()
            .await
            .get_transaction(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("transaction {id}")))
    }

    /// Post a balanced transaction. Replaying an idempotency key returns
    /// the original transaction without touching any balance; any failure
    /// leaves the ledger exactly as it was.
    pub async fn post_transaction(
        &self,
        posting: Posting,
    ) -> Result<LedgerTransaction, CoreError> {
        if posting.idempotency_key.is_empty() {
            return Err(CoreError::Validation(
                "idempotency key must not be empty".to_string(),
            ));
        }

        let mut storage = self.storage.write().await;
        if let Some(existing) = storage
            .get_transaction_by_idempotency_key(&posting.idempotency_key)
            .await?
        {
            debug!(
                "posting replay for key {}, returning transaction {}",
                posting.idempotency_key, existing.id
            );
            return Ok(existing);
        }

        let currency = check_balanced(&posting.entries)?;
        let accounts =
            Self::apply_entries_to_accounts(&mut *storage, &posting.entries, currency).await?;

        let now = time::now();
        let transaction = LedgerTransaction {
            id: TransactionId::generate(),
            transaction_type: posting.transaction_type,
            reference: posting.reference,
            status: TransactionStatus::Completed,
            idempotency_key: posting.idempotency_key,
            description: posting.description,
            metadata: posting.metadata,
            reversed_by: None,
            created_at: now,
            completed_at: Some(now),
        };
        let entries: Vec<LedgerEntry> = posting
            .entries
            .iter()
            .map(|spec| LedgerEntry {
                id: EntryId::generate(),
                transaction_id: transaction.id,
                account_id: spec.account_id,
                side: spec.side,
                amount: spec.amount,
                created_at: now,
            })
            .collect();

        storage
            .commit_posting(PostingCommit {
                transaction: &transaction,
                entries: &entries,
                accounts: &accounts,
                original_update: None,
            })
            .await?;

        metrics::counter!("ledger_transactions_posted").increment(1);
        Ok(transaction)
    }

    /// Post the compensating transaction for a completed original: same
    /// legs, sides flipped. Only completed transactions can be reversed,
    /// and only once.
    pub async fn reverse_transaction(
        &self,
        original_id: &TransactionId,
        idempotency_key: &str,
    ) -> Result<LedgerTransaction, CoreError> {
        let mut storage = self.storage.write().await;
        if let Some(existing) = storage
            .get_transaction_by_idempotency_key(idempotency_key)
            .await?
        {
            return Ok(existing);
        }

        let mut original = storage
            .get_transaction(original_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("transaction {original_id}")))?;
        match original.status {
            TransactionStatus::Completed => {}
            TransactionStatus::Reversed => {
                return Err(CoreError::Conflict(format!(
                    "transaction {original_id} is already reversed"
                )))
            }
            status => {
                return Err(CoreError::Conflict(format!(
                    "cannot reverse a {status} transaction"
                )))
            }
        }

        let original_entries = storage.get_entries_for_transaction(original_id).await?;
        let specs: Vec<EntrySpec> = original_entries
            .iter()
            .map(|entry| EntrySpec {
                account_id: entry.account_id,
                side: entry.side.flipped(),
                amount: entry.amount,
            })
            .collect();
        let currency = check_balanced(&specs)?;
        let accounts = Self::apply_entries_to_accounts(&mut *storage, &specs, currency).await?;

        let now = time::now();
        let reversal = LedgerTransaction {
            id: TransactionId::generate(),
            transaction_type: TransactionType::Reversal,
            reference: Some(EntityRef::new("ledger_transaction", original.id)),
            status: TransactionStatus::Completed,
            idempotency_key: idempotency_key.to_string(),
            description: format!("reversal of {}", original.description),
            metadata: serde_json::Value::Null,
            reversed_by: None,
            created_at: now,
            completed_at: Some(now),
        };
        let entries: Vec<LedgerEntry> = specs
            .iter()
            .map(|spec| LedgerEntry {
                id: EntryId::generate(),
                transaction_id: reversal.id,
                account_id: spec.account_id,
                side: spec.side,
                amount: spec.amount,
                created_at: now,
            })
            .collect();

        original.status = TransactionStatus::Reversed;
        original.reversed_by = Some(reversal.id);

        storage
            .commit_posting(PostingCommit {
                transaction: &reversal,
                entries: &entries,
                accounts: &accounts,
                original_update: Some(&original),
            })
            .await?;

        metrics::counter!("ledger_transactions_reversed").increment(1);
        info!("reversed transaction {} with {}", original.id, reversal.id);
        Ok(reversal)
    }

    /// Load the touched accounts and advance their balances by the net
    /// effect of the entries. An account driven below zero fails the whole
    /// posting with `insufficient_funds`.
    async fn apply_entries_to_accounts(
        storage: &mut S,
        entries: &[EntrySpec],
        currency: stack_common::currency::Currency,
    ) -> Result<Vec<LedgerAccount>, CoreError> {
        let mut touched: HashMap<AccountId, LedgerAccount> = HashMap::new();
        for spec in entries {
            if !touched.contains_key(&spec.account_id) {
                let account = storage
                    .get_account(&spec.account_id)
                    .await?
                    .ok_or_else(|| {
                        CoreError::NotFound(format!("account {}", spec.account_id))
                    })?;
                if account.currency != currency {
                    return Err(CoreError::Validation(format!(
                        "account {} holds {}, entries are {}",
                        account.account_type, account.currency, currency
                    )));
                }
                touched.insert(spec.account_id, account);
            }
        }

        // apply credits before debits: the transaction is atomic, so only
        // its net effect on an account can overdraw
        let now = time::now();
        let ordered = entries
            .iter()
            .filter(|spec| spec.side == EntrySide::Credit)
            .chain(entries.iter().filter(|spec| spec.side == EntrySide::Debit));
        for spec in ordered {
            let account = touched
                .get_mut(&spec.account_id)
                .ok_or_else(|| CoreError::Internal("touched account vanished".to_string()))?;
            match spec.side {
                EntrySide::Credit => {
                    account.balance = account.balance.checked_add(&spec.amount)?;
                }
                EntrySide::Debit => {
                    account.balance =
                        account.balance.checked_sub(&spec.amount).map_err(|_| {
                            CoreError::InsufficientFunds {
                                account: account.account_type.to_string(),
                                need: spec.amount.to_string(),
                                have: account.balance.to_string(),
                            }
                        })?;
                }
            }
            account.updated_at = now;
        }

        Ok(touched.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stack_common::currency::Currency;

    use crate::core::storage::{LedgerTransactionProvider as _, SledStorage};

    async fn test_ledger() -> Ledger<SledStorage> {
        let storage = SledStorage::open_temporary().expect("temp storage");
        let ledger = Ledger::new(std::sync::Arc::new(
            stack_common::tokio::RwLock::new(storage),
        ));
        ledger.bootstrap_system_accounts().await.expect("bootstrap");
        ledger
    }

    fn usd(units: u64) -> Amount {
        Amount::from_units(units, Currency::Usd)
    }

    #[tokio::test]
    async fn posting_moves_balances_and_replays_idempotently() {
        let ledger = test_ledger().await;
        let user = UserId::generate();
        let fiat = ledger
            .get_or_create_account(Some(user), AccountType::FiatExposure)
            .await
            .unwrap();
        let buffer = ledger
            .system_account(AccountType::SystemBufferFiat)
            .await
            .unwrap();
        let seed = buffer.balance;

        let posting = Posting::new(
            "post-1",
            TransactionType::Deposit,
            "credit user",
            vec![
                EntrySpec::debit(buffer.id, usd(100)),
                EntrySpec::credit(fiat.id, usd(100)),
            ],
        );
        let tx = ledger.post_transaction(posting.clone()).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert_eq!(ledger.get_balance(&fiat.id).await.unwrap(), usd(100));
        assert_eq!(
            ledger.get_balance(&buffer.id).await.unwrap(),
            seed.checked_sub(&usd(100)).unwrap()
        );

        // same key: same transaction, no double apply
        let replay = ledger.post_transaction(posting).await.unwrap();
        assert_eq!(replay.id, tx.id);
        assert_eq!(ledger.get_balance(&fiat.id).await.unwrap(), usd(100));
    }

    #[tokio::test]
    async fn overdraft_fails_and_writes_nothing() {
        let ledger = test_ledger().await;
        let user = UserId::generate();
        let fiat = ledger
            .get_or_create_account(Some(user), AccountType::FiatExposure)
            .await
            .unwrap();
        let buffer = ledger
            .system_account(AccountType::SystemBufferFiat)
            .await
            .unwrap();

        let result = ledger
            .post_transaction(Posting::new(
                "post-overdraft",
                TransactionType::Withdrawal,
                "overdraw user",
                vec![
                    EntrySpec::debit(fiat.id, usd(75)),
                    EntrySpec::credit(buffer.id, usd(75)),
                ],
            ))
            .await;
        assert!(matches!(
            result,
            Err(CoreError::InsufficientFunds { .. })
        ));
        assert!(ledger.get_balance(&fiat.id).await.unwrap().is_zero());
        // nothing was committed for the failed key
        let replayed = ledger
            .storage
            .read()
            .await
            .get_transaction_by_idempotency_key("post-overdraft")
            .await
            .unwrap();
        assert!(replayed.is_none());
    }

    #[tokio::test]
    async fn unbalanced_and_mixed_currency_postings_are_rejected() {
        let ledger = test_ledger().await;
        let user = UserId::generate();
        let fiat = ledger
            .get_or_create_account(Some(user), AccountType::FiatExposure)
            .await
            .unwrap();
        let usdc = ledger
            .get_or_create_account(Some(user), AccountType::UsdcBalance)
            .await
            .unwrap();
        let buffer = ledger
            .system_account(AccountType::SystemBufferFiat)
            .await
            .unwrap();

        let unbalanced = ledger
            .post_transaction(Posting::new(
                "post-unbalanced",
                TransactionType::Deposit,
                "bad legs",
                vec![
                    EntrySpec::debit(buffer.id, usd(100)),
                    EntrySpec::credit(fiat.id, usd(90)),
                ],
            ))
            .await;
        assert!(matches!(unbalanced, Err(CoreError::Unbalanced(_))));

        let mixed = ledger
            .post_transaction(Posting::new(
                "post-mixed",
                TransactionType::Deposit,
                "mixed currencies",
                vec![
                    EntrySpec::debit(buffer.id, usd(100)),
                    EntrySpec::credit(usdc.id, Amount::from_units(100, Currency::Usdc)),
                ],
            ))
            .await;
        assert!(mixed.is_err());
    }

    #[tokio::test]
    async fn reversal_restores_balances_and_is_single_shot() {
        let ledger = test_ledger().await;
        let user = UserId::generate();
        let fiat = ledger
            .get_or_create_account(Some(user), AccountType::FiatExposure)
            .await
            .unwrap();
        let buffer = ledger
            .system_account(AccountType::SystemBufferFiat)
            .await
            .unwrap();
        let seed = buffer.balance;

        let tx = ledger
            .post_transaction(Posting::new(
                "post-to-reverse",
                TransactionType::Deposit,
                "credit user",
                vec![
                    EntrySpec::debit(buffer.id, usd(40)),
                    EntrySpec::credit(fiat.id, usd(40)),
                ],
            ))
            .await
            .unwrap();

        let reversal = ledger
            .reverse_transaction(&tx.id, "reverse-1")
            .await
            .unwrap();
        assert_eq!(reversal.transaction_type, TransactionType::Reversal);
        assert!(ledger.get_balance(&fiat.id).await.unwrap().is_zero());
        assert_eq!(ledger.get_balance(&buffer.id).await.unwrap(), seed);

        let original = ledger.get_transaction(&tx.id).await.unwrap();
        assert_eq!(original.status, TransactionStatus::Reversed);
        assert_eq!(original.reversed_by, Some(reversal.id));

        // replay returns the same reversal; a fresh key conflicts
        let replay = ledger
            .reverse_transaction(&tx.id, "reverse-1")
            .await
            .unwrap();
        assert_eq!(replay.id, reversal.id);
        assert!(matches!(
            ledger.reverse_transaction(&tx.id, "reverse-2").await,
            Err(CoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn lazy_user_accounts_are_unique_per_type() {
        let ledger = test_ledger().await;
        let user = UserId::generate();
        let first = ledger
            .get_or_create_account(Some(user), AccountType::UsdcBalance)
            .await
            .unwrap();
        let second = ledger
            .get_or_create_account(Some(user), AccountType::UsdcBalance)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        assert!(ledger
            .get_or_create_account(Some(user), AccountType::SystemBufferUsdc)
            .await
            .is_err());
        assert!(ledger
            .get_or_create_account(None, AccountType::UsdcBalance)
            .await
            .is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        // Random postings between a user account and the fiat buffer must
        // keep balance == initial + credits - debits on every account, and
        // reversing everything must restore the starting point.
        proptest! {
            #![proptest_config(ProptestConfig::with_cases(16))]
            #[test]
            fn balances_track_entries(amounts in proptest::collection::vec(1u64..500, 1..8)) {
                let rt = tokio::runtime::Runtime::new().expect("runtime");
                rt.block_on(async move {
                    run_random_postings(amounts).await;
                });
            }
        }

        async fn run_random_postings(amounts: Vec<u64>) {
            let ledger = test_ledger().await;
            let user = UserId::generate();
            let fiat = ledger
                .get_or_create_account(Some(user), AccountType::FiatExposure)
                .await
                .unwrap();
            let buffer = ledger
                .system_account(AccountType::SystemBufferFiat)
                .await
                .unwrap();

            let mut tx_ids = Vec::new();
            let mut total = 0u64;
            for (i, units) in amounts.iter().enumerate() {
                let tx = ledger
                    .post_transaction(Posting::new(
                        format!("prop-{i}"),
                        TransactionType::Deposit,
                        "prop deposit",
                        vec![
                            EntrySpec::debit(buffer.id, usd(*units)),
                            EntrySpec::credit(fiat.id, usd(*units)),
                        ],
                    ))
                    .await
                    .unwrap();
                tx_ids.push(tx.id);
                total += units;
            }

            // materialized balance equals the running sum of entries
            let entries = ledger
                .storage
                .read()
                .await
                .get_entries_for_account(&fiat.id)
                .await
                .unwrap();
            let mut from_entries = Amount::zero(Currency::Usd);
            for entry in &entries {
                from_entries = match entry.side {
                    EntrySide::Credit => from_entries.checked_add(&entry.amount).unwrap(),
                    EntrySide::Debit => from_entries.checked_sub(&entry.amount).unwrap(),
                };
            }
            let balance = ledger.get_balance(&fiat.id).await.unwrap();
            assert_eq!(balance, from_entries);
            assert_eq!(balance, usd(total));

            // reversing every transaction restores both accounts
            for (i, tx_id) in tx_ids.iter().enumerate() {
                ledger
                    .reverse_transaction(tx_id, &format!("prop-rev-{i}"))
                    .await
                    .unwrap();
            }
            assert!(ledger.get_balance(&fiat.id).await.unwrap().is_zero());
            let buffer_now = ledger.get_balance(&buffer.id).await.unwrap();
            assert_eq!(buffer_now, buffer.balance);
        }
    }
}
