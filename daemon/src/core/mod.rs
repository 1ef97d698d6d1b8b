pub mod audit;
pub mod backoff;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod ledger;
pub mod provisioning;
pub mod reconciliation;
pub mod saga;
pub mod storage;
pub mod treasury;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use stack_common::{
    amount::Amount,
    currency::Currency,
    ids::UserId,
    ledger::AccountType,
    wallet::WalletStatus,
};

use crate::adapters::Adapters;

use self::{
    audit::Audit,
    error::CoreError,
    events::EventWorker,
    idempotency::IdempotencyLayer,
    ledger::Ledger,
    provisioning::ProvisioningWorker,
    reconciliation::{Reconciliation, ReconciliationConfig},
    saga::{FundingSaga, StepRunner, WithdrawalSaga},
    storage::{SharedStorage, Storage},
    treasury::Treasury,
};

/// Balances read model composed from the ledger only.
#[derive(Clone, Debug)]
pub struct UserBalances {
    pub buying_power_usd: Amount,
    pub pending_deposits_usd: Amount,
    pub usdc_on_chain: Amount,
}

/// The assembled core: one storage handle, the ledger as the single
/// balance mutator, and every service wired over them.
pub struct Core<S: Storage> {
    pub storage: SharedStorage<S>,
    pub ledger: Ledger<S>,
    pub audit: Audit<S>,
    pub idempotency: IdempotencyLayer<S>,
    pub treasury: Treasury<S>,
    pub funding: FundingSaga<S>,
    pub withdrawals: WithdrawalSaga<S>,
    pub steps: StepRunner<S>,
    pub events: EventWorker<S>,
    pub provisioning: ProvisioningWorker<S>,
    pub reconciliation: Reconciliation<S>,
    pub adapters: Arc<Adapters>,
}

impl<S: Storage> Core<S> {
    pub fn new(
        storage: S,
        adapters: Arc<Adapters>,
        reconciliation_config: ReconciliationConfig,
    ) -> Arc<Self> {
        let storage: SharedStorage<S> =
            Arc::new(stack_common::tokio::RwLock::new(storage));
        let ledger = Ledger::new(storage.clone());
        let audit = Audit::new(storage.clone());
        let idempotency = IdempotencyLayer::new(storage.clone());
        let treasury = Treasury::new(
            storage.clone(),
            ledger.clone(),
            audit.clone(),
            adapters.clone(),
        );
        let funding = FundingSaga::new(
            storage.clone(),
            ledger.clone(),
            audit.clone(),
            treasury.clone(),
            adapters.clone(),
        );
        let withdrawals = WithdrawalSaga::new(
            storage.clone(),
            ledger.clone(),
            audit.clone(),
            treasury.clone(),
            adapters.clone(),
        );
        let steps = StepRunner::new(
            storage.clone(),
            funding.clone(),
            withdrawals.clone(),
            audit.clone(),
        );
        let events = EventWorker::new(storage.clone(), funding.clone(), audit.clone());
        let provisioning =
            ProvisioningWorker::new(storage.clone(), audit.clone(), adapters.clone());
        let reconciliation = Reconciliation::new(
            storage.clone(),
            ledger.clone(),
            audit.clone(),
            adapters.clone(),
            reconciliation_config,
        );

        Arc::new(Self {
            storage,
            ledger,
            audit,
            idempotency,
            treasury,
            funding,
            withdrawals,
            steps,
            events,
            provisioning,
            reconciliation,
            adapters,
        })
    }

    /// Startup: seed system accounts, thresholds and the provider
    /// registry. Interrupted work recovers on its own through claim
    /// leases, so there is nothing else to replay here.
    pub async fn bootstrap(&self) -> Result<(), CoreError> {
        self.ledger.bootstrap_system_accounts().await?;
        self.treasury.bootstrap_defaults().await?;
        Ok(())
    }

    /// `get_balances`: buying power, in-flight deposit value, on-chain
    /// USDC. Reads the ledger and the deposit rows only.
    pub async fn get_balances(&self, user_id: &UserId) -> Result<UserBalances, CoreError> {
        let fiat = self
            .ledger
            .get_or_create_account(Some(*user_id), AccountType::FiatExposure)
            .await?;
        let usdc = self
            .ledger
            .get_or_create_account(Some(*user_id), AccountType::UsdcBalance)
            .await?;
        let pending = self.funding.pending_deposits_usd(user_id).await?;
        Ok(UserBalances {
            buying_power_usd: fiat.balance,
            pending_deposits_usd: pending,
            usdc_on_chain: usdc.balance,
        })
    }

    /// Deposit address lookup: the user's live wallet on the chain.
    pub async fn get_deposit_address(
        &self,
        user_id: &UserId,
        chain: &str,
    ) -> Result<String, CoreError> {
        let wallet = self
            .storage
            .read()
            .await
            .get_wallet_by_user_chain(user_id, chain)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("wallet for user on {chain}")))?;
        if wallet.status != WalletStatus::Live {
            return Err(CoreError::NotFound(format!(
                "wallet on {chain} is still provisioning"
            )));
        }
        Ok(wallet.address)
    }

    /// Quick storage probe for the health endpoint.
    pub async fn storage_healthy(&self) -> bool {
        self.ledger
            .system_account(AccountType::SystemBufferUsdc)
            .await
            .is_ok()
    }
}

impl<S: Storage> Core<S> {
    /// Total USD value a user could eventually withdraw; used by tests
    /// and operator tooling rather than the client API.
    pub async fn total_user_value_usd(&self, user_id: &UserId) -> Result<Amount, CoreError> {
        let balances = self.get_balances(user_id).await?;
        let usdc_usd = balances.usdc_on_chain.rescaled(Currency::Usd)?;
        balances
            .buying_power_usd
            .checked_add(&balances.pending_deposits_usd)?
            .checked_add(&usdc_usd)
            .map_err(CoreError::from)
    }
}
