use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    amount::Amount,
    ids::{TraceId, UserId, WithdrawalId},
    time::Timestamp,
};

/// Withdrawal saga states, in strict forward order. The ledger pre-debit at
/// `Pending` entry guarantees the system never over-withdraws even when a
/// later partner call fails.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    BrokerWithdrawalInitiated,
    BrokerWithdrawalComplete,
    OnRampInitiated,
    OnRampComplete,
    TransferInitiated,
    Complete,
    Failed,
}

impl WithdrawalStatus {
    pub const fn next(self) -> Option<WithdrawalStatus> {
        match self {
            WithdrawalStatus::Pending => Some(WithdrawalStatus::BrokerWithdrawalInitiated),
            WithdrawalStatus::BrokerWithdrawalInitiated => {
                Some(WithdrawalStatus::BrokerWithdrawalComplete)
            }
            WithdrawalStatus::BrokerWithdrawalComplete => Some(WithdrawalStatus::OnRampInitiated),
            WithdrawalStatus::OnRampInitiated => Some(WithdrawalStatus::OnRampComplete),
            WithdrawalStatus::OnRampComplete => Some(WithdrawalStatus::TransferInitiated),
            WithdrawalStatus::TransferInitiated => Some(WithdrawalStatus::Complete),
            WithdrawalStatus::Complete | WithdrawalStatus::Failed => None,
        }
    }

    pub fn can_transition_to(self, next: WithdrawalStatus) -> bool {
        if matches!(next, WithdrawalStatus::Failed) {
            return !self.is_terminal();
        }
        self.next() == Some(next)
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, WithdrawalStatus::Complete | WithdrawalStatus::Failed)
    }
}

/// One user withdrawal moving through the withdrawal saga.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: WithdrawalId,
    pub user_id: UserId,
    pub amount_usd: Amount,
    pub target_chain: String,
    pub target_address: String,
    pub status: WithdrawalStatus,
    /// Set when the amount crosses the dual-auth threshold; the saga does
    /// not leave `Pending` until a second approval clears it.
    pub requires_dual_auth: bool,
    pub dual_auth_approved: bool,
    pub broker_ref: Option<String>,
    pub on_ramp_ref: Option<String>,
    pub transfer_ref: Option<String>,
    pub tx_hash: Option<String>,
    pub failure_reason: Option<String>,
    pub trace_id: TraceId,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

/// Per-user withdrawal caps, evaluated at `Pending` entry against the
/// rolling day/week/month windows.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WithdrawalLimits {
    pub daily: Amount,
    pub weekly: Amount,
    pub monthly: Amount,
    /// Amounts at or above this require a second approval.
    pub dual_auth_threshold: Amount,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::Currency;

    #[test]
    fn forward_order_is_strict() {
        let mut state = WithdrawalStatus::Pending;
        let mut hops = 0;
        while let Some(next) = state.next() {
            assert!(state.can_transition_to(next));
            assert!(!next.can_transition_to(state));
            state = next;
            hops += 1;
        }
        assert_eq!(state, WithdrawalStatus::Complete);
        assert_eq!(hops, 6);
    }

    #[test]
    fn failure_edges() {
        assert!(WithdrawalStatus::OnRampInitiated.can_transition_to(WithdrawalStatus::Failed));
        assert!(!WithdrawalStatus::Complete.can_transition_to(WithdrawalStatus::Failed));
    }

    #[test]
    fn limits_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let limits = WithdrawalLimits {
            daily: Amount::from_units(10_000, Currency::Usd),
            weekly: Amount::from_units(25_000, Currency::Usd),
            monthly: Amount::from_units(50_000, Currency::Usd),
            dual_auth_threshold: Amount::from_units(5_000, Currency::Usd),
        };
        let decoded: WithdrawalLimits =
            serde_json::from_slice(&serde_json::to_vec(&limits)?)?;
        assert_eq!(decoded.daily, limits.daily);
        Ok(())
    }
}
