use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    amount::Amount,
    currency::Currency,
    ids::{AccountId, ConversionJobId, ProviderId, TraceId, TransactionId},
    ledger::{AccountType, EntityRef},
    time::Timestamp,
};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConversionDirection {
    /// Off-ramp: stablecoin out, fiat in.
    UsdcToUsd,
    /// On-ramp: fiat out, stablecoin in.
    UsdToUsdc,
}

impl ConversionDirection {
    pub const fn source_currency(self) -> Currency {
        match self {
            ConversionDirection::UsdcToUsd => Currency::Usdc,
            ConversionDirection::UsdToUsdc => Currency::Usd,
        }
    }

    pub const fn destination_currency(self) -> Currency {
        match self {
            ConversionDirection::UsdcToUsd => Currency::Usd,
            ConversionDirection::UsdToUsdc => Currency::Usdc,
        }
    }

    pub const fn inverse(self) -> Self {
        match self {
            ConversionDirection::UsdcToUsd => ConversionDirection::UsdToUsdc,
            ConversionDirection::UsdToUsdc => ConversionDirection::UsdcToUsd,
        }
    }
}

/// Conversion job lifecycle. Provider webhooks may arrive out of order;
/// any forward jump is accepted, moving backwards never is.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConversionJobStatus {
    Pending,
    ProviderSubmitted,
    ProviderProcessing,
    ProviderCompleted,
    LedgerUpdating,
    Completed,
    Failed,
    Cancelled,
}

impl ConversionJobStatus {
    const fn rank(self) -> u8 {
        match self {
            ConversionJobStatus::Pending => 0,
            ConversionJobStatus::ProviderSubmitted => 1,
            ConversionJobStatus::ProviderProcessing => 2,
            ConversionJobStatus::ProviderCompleted => 3,
            ConversionJobStatus::LedgerUpdating => 4,
            ConversionJobStatus::Completed => 5,
            ConversionJobStatus::Failed => 6,
            ConversionJobStatus::Cancelled => 7,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            ConversionJobStatus::Completed
                | ConversionJobStatus::Failed
                | ConversionJobStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: ConversionJobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(
            next,
            ConversionJobStatus::Failed | ConversionJobStatus::Cancelled
        ) {
            return true;
        }
        next.rank() > self.rank()
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TriggerReason {
    BufferReplenishment,
    ScheduledRebalance,
    Manual,
    Emergency,
    /// Off-ramp leg of the funding saga.
    FundingOffRamp,
    /// On-ramp leg of the withdrawal saga.
    WithdrawalOnRamp,
}

/// One scheduled USDC-USD conversion. `amount` is denominated in the
/// currency of whichever side triggered the job (the deficient buffer for
/// replenishment, the source for drains and saga ramps); the provider
/// reports the settled amounts and fees, and the ledger write is gated by
/// `idempotency_key`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversionJob {
    pub id: ConversionJobId,
    pub direction: ConversionDirection,
    pub amount: Amount,
    pub status: ConversionJobStatus,
    pub trigger_reason: TriggerReason,
    pub provider_id: Option<ProviderId>,
    pub provider_tx_id: Option<String>,
    /// Destination-side conversion transaction, set once the ledger has
    /// been updated. This is the linked transaction reconciliation checks.
    pub ledger_transaction_id: Option<TransactionId>,
    /// Source-side leg of the conversion pair.
    pub source_transaction_id: Option<TransactionId>,
    /// Fee-leg transaction, when the provider charged fees.
    pub fee_transaction_id: Option<TransactionId>,
    pub source_account_id: AccountId,
    pub destination_account_id: AccountId,
    /// Counter-leg accounts for the two sides of the posting. System
    /// buffer conversions settle against the external clearing accounts;
    /// the funding off-ramp settles its source side back into the USDC
    /// buffer that absorbed the deposit.
    pub source_counterparty_account_id: AccountId,
    pub destination_counterparty_account_id: AccountId,
    /// Settled amounts as reported by the provider.
    pub settled_source_amount: Option<Amount>,
    pub settled_destination_amount: Option<Amount>,
    /// Business entity that caused this job, when not treasury-driven.
    pub reference: Option<EntityRef>,
    /// Destination units per source unit, as reported by the provider,
    /// in parts-per-million (1_000_000 = par).
    pub applied_rate_ppm: Option<u64>,
    pub fees: Option<Amount>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<Timestamp>,
    pub last_error: Option<String>,
    pub idempotency_key: String,
    pub trace_id: TraceId,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProviderStatus {
    Active,
    Inactive,
    /// Demoted after the rolling failure rate crossed the threshold;
    /// skipped by selection until it recovers.
    Degraded,
}

/// A registered conversion provider and its health bookkeeping.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversionProvider {
    pub id: ProviderId,
    pub name: String,
    /// Lower value wins among healthy candidates.
    pub priority: u32,
    pub status: ProviderStatus,
    pub supported_directions: Vec<ConversionDirection>,
    pub min_conversion_amount: Amount,
    pub max_conversion_amount: Amount,
    pub daily_volume_limit: Amount,
    pub daily_volume_used: Amount,
    /// Day bucket (days since epoch) the used counter belongs to.
    pub daily_volume_day: i64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Outcomes inside the current rolling health window.
    pub window_successes: u32,
    pub window_failures: u32,
    pub degraded_until: Option<Timestamp>,
    pub updated_at: Timestamp,
}

impl ConversionProvider {
    pub fn supports(&self, direction: ConversionDirection) -> bool {
        self.supported_directions.contains(&direction)
    }

    /// Failure share of the rolling window, if enough observations exist.
    pub fn window_failure_rate(&self, min_observations: u32) -> Option<f64> {
        let total = self.window_successes + self.window_failures;
        if total < min_observations {
            return None;
        }
        Some(f64::from(self.window_failures) / f64::from(total))
    }
}

/// Threshold band for one system buffer account: replenish below `min`
/// toward `target`, drain above `max`, batches capped at `batch_size`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BufferThreshold {
    pub account_type: AccountType,
    pub min: Amount,
    pub target: Amount,
    pub max: Amount,
    pub batch_size: Amount,
}

impl BufferThreshold {
    /// `min < target < max` and all amounts in the account's currency.
    pub fn validate(&self) -> Result<(), String> {
        let currency = self.account_type.currency();
        for (name, amount) in [
            ("min", &self.min),
            ("target", &self.target),
            ("max", &self.max),
            ("batch_size", &self.batch_size),
        ] {
            if amount.currency() != currency {
                return Err(format!("{name} must be denominated in {currency}"));
            }
        }
        if !(self.min < self.target && self.target < self.max) {
            return Err("thresholds must satisfy min < target < max".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_jumps_allowed_backwards_never() {
        use ConversionJobStatus::*;
        // regular path
        assert!(Pending.can_transition_to(ProviderSubmitted));
        assert!(ProviderSubmitted.can_transition_to(ProviderProcessing));
        // out-of-order provider webhook: completed without submitted
        assert!(Pending.can_transition_to(ProviderCompleted));
        // never backwards
        assert!(!ProviderCompleted.can_transition_to(ProviderSubmitted));
        assert!(!Completed.can_transition_to(Failed));
        // failure from anywhere live
        assert!(ProviderProcessing.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Cancelled));
    }

    #[test]
    fn direction_currencies() {
        assert_eq!(
            ConversionDirection::UsdcToUsd.source_currency(),
            Currency::Usdc
        );
        assert_eq!(
            ConversionDirection::UsdcToUsd.destination_currency(),
            Currency::Usd
        );
        assert_eq!(
            ConversionDirection::UsdToUsdc.inverse(),
            ConversionDirection::UsdcToUsd
        );
    }

    #[test]
    fn threshold_validation() {
        let t = BufferThreshold {
            account_type: AccountType::SystemBufferUsdc,
            min: Amount::from_units(10_000, Currency::Usdc),
            target: Amount::from_units(50_000, Currency::Usdc),
            max: Amount::from_units(100_000, Currency::Usdc),
            batch_size: Amount::from_units(50_000, Currency::Usdc),
        };
        assert!(t.validate().is_ok());

        let bad = BufferThreshold {
            min: Amount::from_units(60_000, Currency::Usdc),
            ..t.clone()
        };
        assert!(bad.validate().is_err());

        let wrong_currency = BufferThreshold {
            min: Amount::from_units(10_000, Currency::Usd),
            ..t
        };
        assert!(wrong_currency.validate().is_err());
    }

    #[test]
    fn failure_rate_needs_observations() {
        let provider = ConversionProvider {
            id: ProviderId::generate(),
            name: "mock".into(),
            priority: 0,
            status: ProviderStatus::Active,
            supported_directions: vec![ConversionDirection::UsdcToUsd],
            min_conversion_amount: Amount::from_units(1, Currency::Usdc),
            max_conversion_amount: Amount::from_units(1_000_000, Currency::Usdc),
            daily_volume_limit: Amount::from_units(10_000_000, Currency::Usdc),
            daily_volume_used: Amount::zero(Currency::Usdc),
            daily_volume_day: 0,
            success_count: 0,
            failure_count: 0,
            window_successes: 1,
            window_failures: 1,
            degraded_until: None,
            updated_at: crate::time::now(),
        };
        assert_eq!(provider.window_failure_rate(10), None);
        assert_eq!(provider.window_failure_rate(2), Some(0.5));
    }
}
