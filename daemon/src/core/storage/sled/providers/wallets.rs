use async_trait::async_trait;
use stack_common::{
    ids::{UserId, WalletId},
    wallet::ManagedWallet,
};

use crate::core::{
    error::CoreError,
    storage::{sled::SledStorage, WalletProvider},
};

const WALLET_PREFIX: &[u8] = b"w:";
const USER_CHAIN_PREFIX: &[u8] = b"wuc:";
const ADDRESS_PREFIX: &[u8] = b"waddr:";

fn wallet_key(id: &WalletId) -> Vec<u8> {
    SledStorage::concat_key(WALLET_PREFIX, id.as_bytes())
}

fn user_chain_key(user_id: &UserId, chain: &str) -> Vec<u8> {
    let mut key = SledStorage::concat_key(USER_CHAIN_PREFIX, user_id.as_bytes());
    key.extend_from_slice(chain.as_bytes());
    key
}

fn address_key(chain: &str, address: &str) -> Vec<u8> {
    SledStorage::concat_key(ADDRESS_PREFIX, format!("{chain}:{address}").as_bytes())
}

#[async_trait]
impl WalletProvider for SledStorage {
    async fn get_wallet(&self, id: &WalletId) -> Result<Option<ManagedWallet>, CoreError> {
        Self::load(&self.wallets, &wallet_key(id))
    }

    async fn get_wallet_by_user_chain(
        &self,
        user_id: &UserId,
        chain: &str,
    ) -> Result<Option<ManagedWallet>, CoreError> {
        Self::load_via_index(&self.wallets, &user_chain_key(user_id, chain))
    }

    async fn get_wallet_by_address(
        &self,
        chain: &str,
        address: &str,
    ) -> Result<Option<ManagedWallet>, CoreError> {
        Self::load_via_index(&self.wallets, &address_key(chain, address))
    }

    async fn list_wallets_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<ManagedWallet>, CoreError> {
        let prefix = SledStorage::concat_key(USER_CHAIN_PREFIX, user_id.as_bytes());
        let mut wallets = Vec::new();
        for item in self.wallets.scan_prefix(&prefix) {
            let (_, primary) = item?;
            if let Some(wallet) = Self::load::<ManagedWallet>(&self.wallets, &primary)? {
                wallets.push(wallet);
            }
        }
        Ok(wallets)
    }

    async fn insert_wallet(&mut self, wallet: &ManagedWallet) -> Result<(), CoreError> {
        let index = user_chain_key(&wallet.user_id, &wallet.chain);
        if self.wallets.contains_key(&index)? {
            return Err(CoreError::Conflict(format!(
                "wallet already exists for user {} on {}",
                wallet.user_id, wallet.chain
            )));
        }
        let key = wallet_key(&wallet.id);
        Self::save(&self.wallets, &key, wallet)?;
        self.wallets.insert(index, key.clone())?;
        self.wallets
            .insert(address_key(&wallet.chain, &wallet.address), key)?;
        Ok(())
    }

    async fn update_wallet(&mut self, wallet: &ManagedWallet) -> Result<(), CoreError> {
        let key = wallet_key(&wallet.id);
        if !self.wallets.contains_key(&key)? {
            return Err(CoreError::NotFound(format!("wallet {}", wallet.id)));
        }
        Self::save(&self.wallets, &key, wallet)?;
        self.wallets
            .insert(address_key(&wallet.chain, &wallet.address), key)?;
        Ok(())
    }
}
