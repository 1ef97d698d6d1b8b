// Saga steps as durable jobs.
//
// A step is stored before any external call it makes, so a crashed worker
// loses nothing: the row is re-claimed on the next poll and the step's
// idempotency key collapses any half-applied work.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    ids::{StepJobId, TraceId},
    time::Timestamp,
};

/// Every queued step the two sagas run. The entity id names the deposit or
/// withdrawal the step belongs to.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SagaStepKind {
    /// Create and submit the off-ramp conversion for a confirmed deposit.
    FundingOffRampInitiate,
    /// Swap the user's claim from USDC to fiat once the off-ramp settled.
    FundingOffRampComplete,
    /// Push the settled fiat into the brokerage account.
    FundingBrokerFund,
    /// Ask the broker to release USD for a withdrawal.
    WithdrawalBrokerInitiate,
    /// Create and submit the on-ramp conversion for a withdrawal.
    WithdrawalOnRampInitiate,
    /// Advance the withdrawal once the on-ramp settled.
    WithdrawalOnRampComplete,
    /// Issue the on-chain send to the user's target address.
    WithdrawalTransferInitiate,
    /// Clear the holding account once the send confirmed.
    WithdrawalFinalize,
    /// Unwind a deposit whose off-ramp failed permanently.
    FundingCompensate,
    /// Unwind a withdrawal that failed after the pre-debit.
    WithdrawalCompensate,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Dlq,
}

impl StepStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Dlq
        )
    }
}

/// One queued saga step. The idempotency key is derived from the entity and
/// the target state, so enqueueing the same hop twice collapses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SagaStepJob {
    pub id: StepJobId,
    pub kind: SagaStepKind,
    /// Id of the deposit or withdrawal this step drives.
    pub entity_id: String,
    pub status: StepStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<Timestamp>,
    pub last_error: Option<String>,
    pub idempotency_key: String,
    pub trace_id: TraceId,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_kind_wire_form() {
        assert_eq!(
            serde_json::to_string(&SagaStepKind::FundingOffRampInitiate).unwrap(),
            "\"funding_off_ramp_initiate\""
        );
        assert_eq!(
            "withdrawal_finalize".parse::<SagaStepKind>().unwrap(),
            SagaStepKind::WithdrawalFinalize
        );
    }

    #[test]
    fn terminal_step_states() {
        assert!(StepStatus::Dlq.is_terminal());
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Processing.is_terminal());
    }
}
