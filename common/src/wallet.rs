use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    ids::{ProvisioningJobId, TraceId, UserId, WalletId},
    time::Timestamp,
};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WalletAccountType {
    /// Externally owned account.
    Eoa,
    /// Smart contract account.
    Sca,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WalletStatus {
    Creating,
    Live,
    Failed,
}

impl WalletStatus {
    pub fn can_transition_to(self, next: WalletStatus) -> bool {
        matches!(
            (self, next),
            (WalletStatus::Creating, WalletStatus::Live)
                | (WalletStatus::Creating, WalletStatus::Failed)
        )
    }
}

/// A per-chain custodial wallet. Only the address and the provider's wallet
/// id are ever persisted; key material never leaves the custody provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManagedWallet {
    pub id: WalletId,
    pub user_id: UserId,
    pub chain: String,
    pub address: String,
    pub provider_wallet_id: String,
    pub account_type: WalletAccountType,
    pub status: WalletStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProvisioningJobStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Retry,
}

/// Per-chain outcome inside a provisioning job. Partial success is fine;
/// callers see exactly which chains came up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainProvisioningOutcome {
    Pending,
    Live { wallet_id: WalletId },
    Failed { reason: String },
}

/// A wallet provisioning job covering one user across several chains.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalletProvisioningJob {
    pub id: ProvisioningJobId,
    pub user_id: UserId,
    pub chains: Vec<String>,
    pub status: ProvisioningJobStatus,
    /// Outcome per requested chain, same order as `chains`.
    pub outcomes: Vec<ChainProvisioningOutcome>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<Timestamp>,
    pub error_message: Option<String>,
    pub trace_id: TraceId,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl WalletProvisioningJob {
    /// A job is settled once every chain is either live or terminally failed.
    pub fn all_chains_settled(&self) -> bool {
        self.outcomes
            .iter()
            .all(|outcome| !matches!(outcome, ChainProvisioningOutcome::Pending))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wallet_status_transitions() {
        assert!(WalletStatus::Creating.can_transition_to(WalletStatus::Live));
        assert!(WalletStatus::Creating.can_transition_to(WalletStatus::Failed));
        assert!(!WalletStatus::Live.can_transition_to(WalletStatus::Failed));
        assert!(!WalletStatus::Failed.can_transition_to(WalletStatus::Live));
    }

    #[test]
    fn settled_requires_no_pending_chains() {
        let job = WalletProvisioningJob {
            id: ProvisioningJobId::generate(),
            user_id: UserId::generate(),
            chains: vec!["SOL-DEVNET".into(), "ETH-SEPOLIA".into()],
            status: ProvisioningJobStatus::InProgress,
            outcomes: vec![
                ChainProvisioningOutcome::Live {
                    wallet_id: WalletId::generate(),
                },
                ChainProvisioningOutcome::Pending,
            ],
            attempt_count: 1,
            max_attempts: 5,
            next_retry_at: None,
            error_message: None,
            trace_id: TraceId::generate(),
            created_at: crate::time::now(),
            updated_at: crate::time::now(),
        };
        assert!(!job.all_chains_settled());

        let mut settled = job;
        settled.outcomes[1] = ChainProvisioningOutcome::Failed {
            reason: "unsupported chain".into(),
        };
        assert!(settled.all_chains_settled());
    }
}
