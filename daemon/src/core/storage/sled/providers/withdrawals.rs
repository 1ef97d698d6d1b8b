use async_trait::async_trait;
use stack_common::{
    ids::{UserId, WithdrawalId},
    withdrawal::{Withdrawal, WithdrawalLimits},
};

use crate::core::{
    error::CoreError,
    storage::{sled::SledStorage, WithdrawalProvider},
};

const WITHDRAWAL_PREFIX: &[u8] = b"wd:";
const BROKER_REF_PREFIX: &[u8] = b"wb:";
const TX_HASH_PREFIX: &[u8] = b"wt:";
const LIMITS_PREFIX: &[u8] = b"lim:";

fn withdrawal_key(id: &WithdrawalId) -> Vec<u8> {
    SledStorage::concat_key(WITHDRAWAL_PREFIX, id.as_bytes())
}

fn limits_key(user_id: &UserId) -> Vec<u8> {
    SledStorage::concat_key(LIMITS_PREFIX, user_id.as_bytes())
}

#[async_trait]
impl WithdrawalProvider for SledStorage {
    async fn get_withdrawal(
        &self,
        id: &WithdrawalId,
    ) -> Result<Option<Withdrawal>, CoreError> {
        Self::load(&self.withdrawals, &withdrawal_key(id))
    }

    async fn get_withdrawal_by_broker_ref(
        &self,
        broker_ref: &str,
    ) -> Result<Option<Withdrawal>, CoreError> {
        let index = SledStorage::concat_key(BROKER_REF_PREFIX, broker_ref.as_bytes());
        Self::load_via_index(&self.withdrawals, &index)
    }

    async fn get_withdrawal_by_tx_hash(
        &self,
        tx_hash: &str,
    ) -> Result<Option<Withdrawal>, CoreError> {
        let index = SledStorage::concat_key(TX_HASH_PREFIX, tx_hash.as_bytes());
        Self::load_via_index(&self.withdrawals, &index)
    }

    async fn insert_withdrawal(&mut self, withdrawal: &Withdrawal) -> Result<(), CoreError> {
        let key = withdrawal_key(&withdrawal.id);
        if self.withdrawals.contains_key(&key)? {
            return Err(CoreError::Conflict(format!(
                "withdrawal {} already exists",
                withdrawal.id
            )));
        }
        Self::save(&self.withdrawals, &key, withdrawal)
    }

    async fn update_withdrawal(&mut self, withdrawal: &Withdrawal) -> Result<(), CoreError> {
        let key = withdrawal_key(&withdrawal.id);
        if !self.withdrawals.contains_key(&key)? {
            return Err(CoreError::NotFound(format!("withdrawal {}", withdrawal.id)));
        }
        Self::save(&self.withdrawals, &key, withdrawal)?;
        // partner references appear as the saga advances; keep the lookup
        // indexes in step with the row
        if let Some(broker_ref) = &withdrawal.broker_ref {
            let index = SledStorage::concat_key(BROKER_REF_PREFIX, broker_ref.as_bytes());
            self.withdrawals.insert(index, key.clone())?;
        }
        if let Some(tx_hash) = &withdrawal.tx_hash {
            let index = SledStorage::concat_key(TX_HASH_PREFIX, tx_hash.as_bytes());
            self.withdrawals.insert(index, key.clone())?;
        }
        Ok(())
    }

    async fn list_withdrawals(&self) -> Result<Vec<Withdrawal>, CoreError> {
        Self::scan_prefix(&self.withdrawals, WITHDRAWAL_PREFIX)
    }

    async fn list_withdrawals_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<Withdrawal>, CoreError> {
        let all = self.list_withdrawals().await?;
        Ok(all
            .into_iter()
            .filter(|withdrawal| withdrawal.user_id == *user_id)
            .collect())
    }

    async fn get_withdrawal_limits(
        &self,
        user_id: &UserId,
    ) -> Result<Option<WithdrawalLimits>, CoreError> {
        Self::load(&self.withdrawals, &limits_key(user_id))
    }

    async fn set_withdrawal_limits(
        &mut self,
        user_id: &UserId,
        limits: &WithdrawalLimits,
    ) -> Result<(), CoreError> {
        Self::save(&self.withdrawals, &limits_key(user_id), limits)
    }
}
