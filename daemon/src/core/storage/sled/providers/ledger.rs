// Ledger rows live in a single tree so a posting commits transactionally
// across the transaction row, its entries, the balance updates and every
// secondary index.

use ::sled::transaction::{ConflictableTransactionError, TransactionError};
use async_trait::async_trait;
use stack_common::{
    ids::{AccountId, TransactionId, UserId},
    ledger::{
        check_balanced, AccountType, EntrySpec, LedgerAccount, LedgerEntry, LedgerTransaction,
    },
};

use crate::core::{
    error::CoreError,
    storage::{
        sled::{
            SledStorage, ACCOUNT_OWNER_PREFIX, ACCOUNT_PREFIX, ACCT_ENTRY_PREFIX, ENTRY_PREFIX,
            TX_ENTRY_PREFIX, TX_IDEM_PREFIX, TX_PREFIX,
        },
        AccountProvider, LedgerTransactionProvider, PostingCommit,
    },
};

fn account_key(id: &AccountId) -> Vec<u8> {
    SledStorage::concat_key(ACCOUNT_PREFIX, id.as_bytes())
}

fn owner_key(user_id: Option<&UserId>, account_type: AccountType) -> Vec<u8> {
    let owner = match user_id {
        Some(user_id) => format!("user:{user_id}:{account_type}"),
        None => format!("system:{account_type}"),
    };
    SledStorage::concat_key(ACCOUNT_OWNER_PREFIX, owner.as_bytes())
}

fn tx_key(id: &TransactionId) -> Vec<u8> {
    SledStorage::concat_key(TX_PREFIX, id.as_bytes())
}

fn entry_key(entry: &LedgerEntry) -> Vec<u8> {
    SledStorage::concat_key(ENTRY_PREFIX, entry.id.as_bytes())
}

// Index keys carry the creation time so prefix scans come back oldest
// first.
fn time_suffix(entry: &LedgerEntry) -> Vec<u8> {
    let millis = entry.created_at.timestamp_millis().max(0) as u64;
    let mut suffix = millis.to_be_bytes().to_vec();
    suffix.extend_from_slice(entry.id.as_bytes());
    suffix
}

fn acct_entry_key(entry: &LedgerEntry) -> Vec<u8> {
    let mut key = SledStorage::concat_key(ACCT_ENTRY_PREFIX, entry.account_id.as_bytes());
    key.extend_from_slice(&time_suffix(entry));
    key
}

fn tx_entry_key(entry: &LedgerEntry) -> Vec<u8> {
    let mut key = SledStorage::concat_key(TX_ENTRY_PREFIX, entry.transaction_id.as_bytes());
    key.extend_from_slice(&time_suffix(entry));
    key
}

#[async_trait]
impl AccountProvider for SledStorage {
    async fn get_account(&self, id: &AccountId) -> Result<Option<LedgerAccount>, CoreError> {
        Self::load(&self.ledger, &account_key(id))
    }

    async fn get_account_by_owner(
        &self,
        user_id: Option<&UserId>,
        account_type: AccountType,
    ) -> Result<Option<LedgerAccount>, CoreError> {
        Self::load_via_index(&self.ledger, &owner_key(user_id, account_type))
    }

    async fn insert_account(&mut self, account: &LedgerAccount) -> Result<(), CoreError> {
        let index = owner_key(account.user_id.as_ref(), account.account_type);
        if self.ledger.contains_key(&index)? {
            return Err(CoreError::Conflict(format!(
                "account {} already exists for this owner",
                account.account_type
            )));
        }
        let key = account_key(&account.id);
        Self::save(&self.ledger, &key, account)?;
        self.ledger.insert(index, key)?;
        Ok(())
    }

    async fn list_accounts(&self) -> Result<Vec<LedgerAccount>, CoreError> {
        Self::scan_prefix(&self.ledger, ACCOUNT_PREFIX)
    }
}

#[async_trait]
impl LedgerTransactionProvider for SledStorage {
    async fn get_transaction(
        &self,
        id: &TransactionId,
    ) -> Result<Option<LedgerTransaction>, CoreError> {
        Self::load(&self.ledger, &tx_key(id))
    }

    async fn get_transaction_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<LedgerTransaction>, CoreError> {
        let index = SledStorage::concat_key(TX_IDEM_PREFIX, key.as_bytes());
        Self::load_via_index(&self.ledger, &index)
    }

    async fn commit_posting(&mut self, commit: PostingCommit<'_>) -> Result<(), CoreError> {
        // the storage layer re-checks the balanced invariant; a caller bug
        // cannot write an unbalanced transaction
        let specs: Vec<EntrySpec> = commit
            .entries
            .iter()
            .map(|entry| EntrySpec {
                account_id: entry.account_id,
                side: entry.side,
                amount: entry.amount,
            })
            .collect();
        check_balanced(&specs)?;

        let mut writes: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();

        let primary = tx_key(&commit.transaction.id);
        writes.push((primary.clone(), serde_json::to_vec(commit.transaction)?));
        writes.push((
            SledStorage::concat_key(
                TX_IDEM_PREFIX,
                commit.transaction.idempotency_key.as_bytes(),
            ),
            primary,
        ));

        for entry in commit.entries {
            let primary = entry_key(entry);
            writes.push((primary.clone(), serde_json::to_vec(entry)?));
            writes.push((acct_entry_key(entry), primary.clone()));
            writes.push((tx_entry_key(entry), primary));
        }

        for account in commit.accounts {
            writes.push((account_key(&account.id), serde_json::to_vec(account)?));
        }

        if let Some(original) = commit.original_update {
            writes.push((tx_key(&original.id), serde_json::to_vec(original)?));
        }

        self.ledger
            .transaction(
                |tree| -> Result<(), ConflictableTransactionError<()>> {
                    for (key, value) in &writes {
                        tree.insert(key.as_slice(), value.as_slice())?;
                    }
                    Ok(())
                },
            )
            .map_err(|err| match err {
                TransactionError::Abort(()) => {
                    CoreError::Internal("ledger posting aborted".to_string())
                }
                TransactionError::Storage(err) => CoreError::Storage(err),
            })?;
        Ok(())
    }

    async fn get_entries_for_transaction(
        &self,
        id: &TransactionId,
    ) -> Result<Vec<LedgerEntry>, CoreError> {
        let prefix = SledStorage::concat_key(TX_ENTRY_PREFIX, id.as_bytes());
        self.collect_entries(&prefix)
    }

    async fn get_entries_for_account(
        &self,
        id: &AccountId,
    ) -> Result<Vec<LedgerEntry>, CoreError> {
        let prefix = SledStorage::concat_key(ACCT_ENTRY_PREFIX, id.as_bytes());
        self.collect_entries(&prefix)
    }

    async fn list_transactions(&self) -> Result<Vec<LedgerTransaction>, CoreError> {
        Self::scan_prefix(&self.ledger, TX_PREFIX)
    }
}

impl SledStorage {
    fn collect_entries(&self, index_prefix: &[u8]) -> Result<Vec<LedgerEntry>, CoreError> {
        let mut entries = Vec::new();
        for item in self.ledger.scan_prefix(index_prefix) {
            let (_, primary) = item?;
            if let Some(entry) = Self::load::<LedgerEntry>(&self.ledger, &primary)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}
