use async_trait::async_trait;
use stack_common::{amount::Amount, wallet::WalletAccountType};

use super::AdapterError;

/// A wallet created at the custody provider. Addresses and provider ids
/// only; key material never crosses this boundary.
#[derive(Clone, Debug)]
pub struct ProvisionedWallet {
    pub provider_wallet_id: String,
    pub address: String,
    pub chain: String,
    pub account_type: WalletAccountType,
}

/// Custody capability: wallet creation, balances and outbound sends within
/// the configured wallet set.
#[async_trait]
pub trait CustodyProvider: Send + Sync {
    /// Create one wallet per requested chain inside the wallet set.
    async fn create_wallet(
        &self,
        wallet_set_id: &str,
        chain: &str,
        account_type: WalletAccountType,
    ) -> Result<ProvisionedWallet, AdapterError>;

    /// Total token balance held across the system treasury wallets,
    /// reported by the custodian. Used by reconciliation.
    async fn get_treasury_balance(&self, token: &str) -> Result<Amount, AdapterError>;

    /// Send tokens from the treasury to an external address. Returns the
    /// submitted transaction hash.
    async fn send_tokens(
        &self,
        amount: &Amount,
        to_address: &str,
        chain: &str,
        idempotency_key: &str,
    ) -> Result<String, AdapterError>;
}
