use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::{
    amount::Amount,
    ids::{ExceptionId, ReportId, TraceId},
    time::Timestamp,
};

/// Checks a reconciliation run performs against the ledger and the external
/// custodians.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CheckType {
    /// Debits equal credits for every transaction in the window.
    LedgerConsistency,
    /// On-chain USDC across system wallets matches the USDC buffer.
    CustodialUsdcBuffer,
    /// Broker-reported cash matches the broker operational account.
    BrokerFiat,
    /// Terminal deposits reconcile with their ledger entries.
    Deposits,
    /// Every completed conversion has exactly one linked ledger transaction.
    Conversions,
    /// Terminal withdrawals reconcile with their ledger entries.
    Withdrawals,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunKind {
    /// Hourly run over the recent window.
    Quick,
    /// Daily full-history run.
    Full,
}

/// Outcome of one check inside a report.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconciliationCheck {
    pub check_type: CheckType,
    pub passed: bool,
    pub details: String,
    /// Absolute mismatch, when the check compares amounts.
    pub discrepancy: Option<Amount>,
}

/// One reconciliation run and its checks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub id: ReportId,
    pub kind: RunKind,
    pub checks: Vec<ReconciliationCheck>,
    pub passed: bool,
    pub trace_id: TraceId,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Derive severity from the discrepancy magnitude, measured in whole
    /// units of the check's currency.
    pub fn from_discrepancy(discrepancy: &Amount) -> Severity {
        let currency = discrepancy.currency();
        if *discrepancy < Amount::from_units(1, currency) {
            Severity::Low
        } else if *discrepancy < Amount::from_units(100, currency) {
            Severity::Medium
        } else if *discrepancy < Amount::from_units(10_000, currency) {
            Severity::High
        } else {
            Severity::Critical
        }
    }
}

/// Human workflow for a recorded mismatch. Low-severity exceptions may be
/// auto-corrected instead.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResolutionState {
    Open,
    Investigating,
    Resolved,
    WontFix,
}

impl ResolutionState {
    pub fn can_transition_to(self, next: ResolutionState) -> bool {
        matches!(
            (self, next),
            (ResolutionState::Open, ResolutionState::Investigating)
                | (ResolutionState::Open, ResolutionState::Resolved)
                | (ResolutionState::Investigating, ResolutionState::Resolved)
                | (ResolutionState::Investigating, ResolutionState::WontFix)
        )
    }
}

/// A recorded mismatch between the ledger and an external source of truth.
/// Sagas raise exceptions directly when funds are affected; those have no
/// owning report.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconciliationException {
    pub id: ExceptionId,
    pub report_id: Option<ReportId>,
    pub check_type: CheckType,
    pub severity: Severity,
    pub description: String,
    pub discrepancy: Option<Amount>,
    pub resolution_state: ResolutionState,
    pub auto_corrected: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::Currency;

    #[test]
    fn severity_scales_with_magnitude() {
        let usd = |v| Amount::from_units(v, Currency::Usd);
        assert_eq!(
            Severity::from_discrepancy(&Amount::parse("0.01", Currency::Usd).unwrap()),
            Severity::Low
        );
        assert_eq!(Severity::from_discrepancy(&usd(5)), Severity::Medium);
        assert_eq!(Severity::from_discrepancy(&usd(500)), Severity::High);
        assert_eq!(Severity::from_discrepancy(&usd(50_000)), Severity::Critical);
        assert!(Severity::Low < Severity::Critical);
    }

    #[test]
    fn resolution_workflow() {
        assert!(ResolutionState::Open.can_transition_to(ResolutionState::Investigating));
        assert!(ResolutionState::Investigating.can_transition_to(ResolutionState::WontFix));
        assert!(!ResolutionState::Resolved.can_transition_to(ResolutionState::Open));
        assert!(!ResolutionState::Open.can_transition_to(ResolutionState::WontFix));
    }
}
