mod providers;
pub mod sled;

use std::sync::Arc;

use stack_common::tokio::RwLock;

pub use providers::{
    AccountProvider, AuditProvider, ConversionStoreProvider, DepositProvider,
    EventJobProvider, IdempotencyProvider, LedgerTransactionProvider, PostingCommit,
    ProvisioningJobProvider, ReconciliationProvider, SagaStepProvider, WalletProvider,
    WithdrawalProvider,
};
pub use sled::SledStorage;

use crate::core::error::CoreError;

/// Full storage capability the core runs against: one provider trait per
/// entity family, implemented together by the backing database.
#[async_trait::async_trait]
pub trait Storage:
    AccountProvider
    + LedgerTransactionProvider
    + WalletProvider
    + ProvisioningJobProvider
    + DepositProvider
    + WithdrawalProvider
    + ConversionStoreProvider
    + EventJobProvider
    + SagaStepProvider
    + ReconciliationProvider
    + IdempotencyProvider
    + AuditProvider
    + Send
    + Sync
    + 'static
{
    /// Flush pending writes to disk.
    async fn flush(&mut self) -> Result<(), CoreError>;
}

/// The storage handle shared by every service. Mutations take the write
/// half, which is also what serializes row claims and ledger postings.
pub type SharedStorage<S> = Arc<RwLock<S>>;
