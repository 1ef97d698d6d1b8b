use async_trait::async_trait;
use stack_common::{
    deposit::Deposit,
    ids::{DepositId, UserId},
};

use crate::core::{
    error::CoreError,
    storage::{sled::SledStorage, DepositProvider},
};

const DEPOSIT_PREFIX: &[u8] = b"d:";
const TX_HASH_PREFIX: &[u8] = b"dt:";

fn deposit_key(id: &DepositId) -> Vec<u8> {
    SledStorage::concat_key(DEPOSIT_PREFIX, id.as_bytes())
}

fn tx_hash_key(chain: &str, tx_hash: &str) -> Vec<u8> {
    SledStorage::concat_key(TX_HASH_PREFIX, format!("{chain}:{tx_hash}").as_bytes())
}

#[async_trait]
impl DepositProvider for SledStorage {
    async fn get_deposit(&self, id: &DepositId) -> Result<Option<Deposit>, CoreError> {
        Self::load(&self.deposits, &deposit_key(id))
    }

    async fn get_deposit_by_tx_hash(
        &self,
        chain: &str,
        tx_hash: &str,
    ) -> Result<Option<Deposit>, CoreError> {
        Self::load_via_index(&self.deposits, &tx_hash_key(chain, tx_hash))
    }

    async fn insert_deposit(&mut self, deposit: &Deposit) -> Result<(), CoreError> {
        let index = tx_hash_key(&deposit.chain, &deposit.tx_hash);
        if self.deposits.contains_key(&index)? {
            return Err(CoreError::Conflict(format!(
                "deposit already exists for {}:{}",
                deposit.chain, deposit.tx_hash
            )));
        }
        let key = deposit_key(&deposit.id);
        Self::save(&self.deposits, &key, deposit)?;
        self.deposits.insert(index, key)?;
        Ok(())
    }

    async fn update_deposit(&mut self, deposit: &Deposit) -> Result<(), CoreError> {
        let key = deposit_key(&deposit.id);
        if !self.deposits.contains_key(&key)? {
            return Err(CoreError::NotFound(format!("deposit {}", deposit.id)));
        }
        Self::save(&self.deposits, &key, deposit)
    }

    async fn list_deposits(&self) -> Result<Vec<Deposit>, CoreError> {
        Self::scan_prefix(&self.deposits, DEPOSIT_PREFIX)
    }

    async fn list_deposits_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<Deposit>, CoreError> {
        let all = self.list_deposits().await?;
        Ok(all
            .into_iter()
            .filter(|deposit| deposit.user_id == *user_id)
            .collect())
    }
}
