// Managed wallet storage provider trait

use async_trait::async_trait;
use stack_common::{
    ids::{UserId, WalletId},
    wallet::ManagedWallet,
};

use crate::core::error::CoreError;

#[async_trait]
pub trait WalletProvider {
    async fn get_wallet(&self, id: &WalletId) -> Result<Option<ManagedWallet>, CoreError>;

    /// At most one wallet exists per (user, chain).
    async fn get_wallet_by_user_chain(
        &self,
        user_id: &UserId,
        chain: &str,
    ) -> Result<Option<ManagedWallet>, CoreError>;

    /// Resolve an inbound deposit address back to its wallet.
    async fn get_wallet_by_address(
        &self,
        chain: &str,
        address: &str,
    ) -> Result<Option<ManagedWallet>, CoreError>;

    async fn list_wallets_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<ManagedWallet>, CoreError>;

    /// Insert a wallet; fails with `conflict` if the (user, chain) slot is
    /// already taken.
    async fn insert_wallet(&mut self, wallet: &ManagedWallet) -> Result<(), CoreError>;

    async fn update_wallet(&mut self, wallet: &ManagedWallet) -> Result<(), CoreError>;
}
