mod accounts;
mod audit;
mod conversions;
mod deposits;
mod events;
mod idempotency;
mod ledger_transactions;
mod provisioning;
mod reconciliation;
mod steps;
mod wallets;
mod withdrawals;

pub use accounts::AccountProvider;
pub use audit::AuditProvider;
pub use conversions::ConversionStoreProvider;
pub use deposits::DepositProvider;
pub use events::EventJobProvider;
pub use idempotency::IdempotencyProvider;
pub use ledger_transactions::{LedgerTransactionProvider, PostingCommit};
pub use provisioning::ProvisioningJobProvider;
pub use reconciliation::ReconciliationProvider;
pub use steps::SagaStepProvider;
pub use wallets::WalletProvider;
pub use withdrawals::WithdrawalProvider;
