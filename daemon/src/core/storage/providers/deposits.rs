// Deposit storage provider trait

use async_trait::async_trait;
use stack_common::{
    deposit::Deposit,
    ids::{DepositId, UserId},
};

use crate::core::error::CoreError;

#[async_trait]
pub trait DepositProvider {
    async fn get_deposit(&self, id: &DepositId) -> Result<Option<Deposit>, CoreError>;

    /// Deposits are unique per (chain, tx_hash); this is how a webhook
    /// delivery finds the saga it belongs to.
    async fn get_deposit_by_tx_hash(
        &self,
        chain: &str,
        tx_hash: &str,
    ) -> Result<Option<Deposit>, CoreError>;

    async fn insert_deposit(&mut self, deposit: &Deposit) -> Result<(), CoreError>;

    async fn update_deposit(&mut self, deposit: &Deposit) -> Result<(), CoreError>;

    async fn list_deposits(&self) -> Result<Vec<Deposit>, CoreError>;

    async fn list_deposits_for_user(&self, user_id: &UserId)
        -> Result<Vec<Deposit>, CoreError>;
}
