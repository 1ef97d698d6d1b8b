// Ledger account storage provider trait

use async_trait::async_trait;
use stack_common::{
    ids::{AccountId, UserId},
    ledger::{AccountType, LedgerAccount},
};

use crate::core::error::CoreError;

/// Storage for ledger accounts. Balances on these rows are only ever
/// written through `LedgerTransactionProvider::commit_posting`; this trait
/// covers creation and reads.
#[async_trait]
pub trait AccountProvider {
    async fn get_account(&self, id: &AccountId) -> Result<Option<LedgerAccount>, CoreError>;

    /// Look up the unique account for an owner. `user_id` is `None` for
    /// system accounts.
    async fn get_account_by_owner(
        &self,
        user_id: Option<&UserId>,
        account_type: AccountType,
    ) -> Result<Option<LedgerAccount>, CoreError>;

    /// Insert a new account. Fails with `conflict` if the (owner, type)
    /// slot is already taken.
    async fn insert_account(&mut self, account: &LedgerAccount) -> Result<(), CoreError>;

    async fn list_accounts(&self) -> Result<Vec<LedgerAccount>, CoreError>;
}
