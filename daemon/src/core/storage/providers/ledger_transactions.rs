// Ledger transaction and entry storage provider trait

use async_trait::async_trait;
use stack_common::{
    ids::{AccountId, TransactionId},
    ledger::{LedgerAccount, LedgerEntry, LedgerTransaction},
};

use crate::core::error::CoreError;

/// One atomic posting: the transaction row, its entries, and the accounts
/// with their balances already advanced. Everything commits or nothing
/// does. `original_update` carries the reversed original when the posting
/// is a reversal.
pub struct PostingCommit<'a> {
    pub transaction: &'a LedgerTransaction,
    pub entries: &'a [LedgerEntry],
    pub accounts: &'a [LedgerAccount],
    pub original_update: Option<&'a LedgerTransaction>,
}

#[async_trait]
pub trait LedgerTransactionProvider {
    async fn get_transaction(
        &self,
        id: &TransactionId,
    ) -> Result<Option<LedgerTransaction>, CoreError>;

    async fn get_transaction_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<LedgerTransaction>, CoreError>;

    /// Commit a posting atomically. The implementation re-verifies that
    /// the entry legs balance before applying anything.
    async fn commit_posting(&mut self, commit: PostingCommit<'_>) -> Result<(), CoreError>;

    async fn get_entries_for_transaction(
        &self,
        id: &TransactionId,
    ) -> Result<Vec<LedgerEntry>, CoreError>;

    /// All entries ever posted against one account, oldest first.
    async fn get_entries_for_account(
        &self,
        id: &AccountId,
    ) -> Result<Vec<LedgerEntry>, CoreError>;

    async fn list_transactions(&self) -> Result<Vec<LedgerTransaction>, CoreError>;
}
