use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    amount::Amount,
    ids::{ConversionJobId, DepositId, TraceId, UserId, WalletId},
    time::Timestamp,
};

/// Funding saga states. Webhooks and queued saga steps drive a deposit
/// forward; `Failed` is reachable from anywhere on a permanent error or
/// exhausted retries.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DepositStatus {
    PendingConfirmation,
    ConfirmedOnChain,
    OffRampInitiated,
    OffRampComplete,
    BrokerFunded,
    Failed,
}

impl DepositStatus {
    /// The single forward edge out of this state, if any.
    pub const fn next(self) -> Option<DepositStatus> {
        match self {
            DepositStatus::PendingConfirmation => Some(DepositStatus::ConfirmedOnChain),
            DepositStatus::ConfirmedOnChain => Some(DepositStatus::OffRampInitiated),
            DepositStatus::OffRampInitiated => Some(DepositStatus::OffRampComplete),
            DepositStatus::OffRampComplete => Some(DepositStatus::BrokerFunded),
            DepositStatus::BrokerFunded | DepositStatus::Failed => None,
        }
    }

    pub fn can_transition_to(self, next: DepositStatus) -> bool {
        if matches!(next, DepositStatus::Failed) {
            return !self.is_terminal();
        }
        self.next() == Some(next)
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, DepositStatus::BrokerFunded | DepositStatus::Failed)
    }
}

/// One on-chain deposit moving through the funding saga.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Deposit {
    pub id: DepositId,
    pub user_id: UserId,
    pub wallet_id: WalletId,
    pub chain: String,
    pub tx_hash: String,
    pub amount: Amount,
    pub status: DepositStatus,
    /// Off-ramp conversion job, set once the saga initiates it.
    pub conversion_job_id: Option<ConversionJobId>,
    /// Net fiat proceeds of the off-ramp, set when the conversion settles.
    pub net_proceeds_usd: Option<Amount>,
    pub failure_reason: Option<String>,
    pub trace_id: TraceId,
    pub created_at: Timestamp,
    /// Timestamp of the most recent status transition.
    pub updated_at: Timestamp,
    pub confirmed_at: Option<Timestamp>,
    pub off_ramp_initiated_at: Option<Timestamp>,
    pub off_ramp_completed_at: Option<Timestamp>,
    pub broker_funded_at: Option<Timestamp>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_ordered() {
        let mut state = DepositStatus::PendingConfirmation;
        let expected = [
            DepositStatus::ConfirmedOnChain,
            DepositStatus::OffRampInitiated,
            DepositStatus::OffRampComplete,
            DepositStatus::BrokerFunded,
        ];
        for next in expected {
            assert!(state.can_transition_to(next));
            state = next;
        }
        assert!(state.is_terminal());
        assert_eq!(state.next(), None);
    }

    #[test]
    fn no_skipping_states() {
        assert!(!DepositStatus::PendingConfirmation.can_transition_to(DepositStatus::BrokerFunded));
        assert!(!DepositStatus::OffRampComplete.can_transition_to(DepositStatus::ConfirmedOnChain));
    }

    #[test]
    fn failure_reachable_until_terminal() {
        assert!(DepositStatus::OffRampInitiated.can_transition_to(DepositStatus::Failed));
        assert!(!DepositStatus::BrokerFunded.can_transition_to(DepositStatus::Failed));
        assert!(!DepositStatus::Failed.can_transition_to(DepositStatus::Failed));
    }
}
