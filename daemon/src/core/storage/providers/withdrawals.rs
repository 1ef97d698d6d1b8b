// Withdrawal storage provider trait

use async_trait::async_trait;
use stack_common::{
    ids::{UserId, WithdrawalId},
    withdrawal::{Withdrawal, WithdrawalLimits},
};

use crate::core::error::CoreError;

#[async_trait]
pub trait WithdrawalProvider {
    async fn get_withdrawal(&self, id: &WithdrawalId) -> Result<Option<Withdrawal>, CoreError>;

    /// Resolve a broker journal callback to its withdrawal.
    async fn get_withdrawal_by_broker_ref(
        &self,
        broker_ref: &str,
    ) -> Result<Option<Withdrawal>, CoreError>;

    /// Resolve an outbound transfer confirmation to its withdrawal.
    async fn get_withdrawal_by_tx_hash(
        &self,
        tx_hash: &str,
    ) -> Result<Option<Withdrawal>, CoreError>;

    async fn insert_withdrawal(&mut self, withdrawal: &Withdrawal) -> Result<(), CoreError>;

    async fn update_withdrawal(&mut self, withdrawal: &Withdrawal) -> Result<(), CoreError>;

    async fn list_withdrawals(&self) -> Result<Vec<Withdrawal>, CoreError>;

    async fn list_withdrawals_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<Withdrawal>, CoreError>;

    /// Per-user limit overrides; absent means system defaults apply.
    async fn get_withdrawal_limits(
        &self,
        user_id: &UserId,
    ) -> Result<Option<WithdrawalLimits>, CoreError>;

    async fn set_withdrawal_limits(
        &mut self,
        user_id: &UserId,
        limits: &WithdrawalLimits,
    ) -> Result<(), CoreError>;
}
