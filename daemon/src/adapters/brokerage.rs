use async_trait::async_trait;
use stack_common::amount::Amount;

use super::AdapterError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JournalStatus {
    Queued,
    Settled,
    Failed,
}

/// Brokerage capability: cash movements in and out of the platform account
/// and the buying power read reconciliation compares against.
#[async_trait]
pub trait BrokerageProvider: Send + Sync {
    /// Cash the broker reports for the platform operational account.
    async fn get_cash_balance(&self) -> Result<Amount, AdapterError>;

    /// Push USD into the brokerage account. Returns the journal reference.
    async fn fund_account(
        &self,
        amount: &Amount,
        idempotency_key: &str,
    ) -> Result<String, AdapterError>;

    /// Pull USD out of the brokerage account. Returns the journal reference.
    async fn withdraw(
        &self,
        amount: &Amount,
        idempotency_key: &str,
    ) -> Result<String, AdapterError>;

    async fn get_journal_status(&self, journal_ref: &str) -> Result<JournalStatus, AdapterError>;
}
