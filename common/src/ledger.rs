use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::{
    amount::{Amount, AmountError},
    currency::Currency,
    ids::{AccountId, EntryId, TransactionId, UserId},
    time::Timestamp,
};

/// Logical account classes. User accounts exist once per (user, type),
/// system accounts once per type.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AccountType {
    /// User claim on on-chain stablecoin.
    UsdcBalance,
    /// User buying power at the brokerage.
    FiatExposure,
    /// Holding account parking value while a withdrawal is in flight.
    PendingInvestment,
    /// System-owned stablecoin pool absorbing on-chain timing gaps.
    SystemBufferUsdc,
    /// System-owned fiat pool absorbing off-ramp timing gaps.
    SystemBufferFiat,
    /// Cash held at the brokerage on behalf of the platform.
    BrokerOperational,
    /// Conversion fees and rounding residue.
    ConversionExpense,
    /// Boundary account for stablecoin crossing the system edge
    /// (token rails, conversion providers). Seeded at bootstrap so that
    /// postings against the outside world stay balanced and non-negative.
    ExternalUsdcClearing,
    /// Boundary account for fiat crossing the system edge.
    ExternalFiatClearing,
}

impl AccountType {
    pub const fn currency(self) -> Currency {
        match self {
            AccountType::UsdcBalance
            | AccountType::SystemBufferUsdc
            | AccountType::ExternalUsdcClearing => Currency::Usdc,
            AccountType::FiatExposure
            | AccountType::PendingInvestment
            | AccountType::SystemBufferFiat
            | AccountType::BrokerOperational
            | AccountType::ConversionExpense
            | AccountType::ExternalFiatClearing => Currency::Usd,
        }
    }

    /// User-scoped account classes; everything else is a singleton system
    /// account created at bootstrap.
    pub const fn is_user_account(self) -> bool {
        matches!(
            self,
            AccountType::UsdcBalance | AccountType::FiatExposure | AccountType::PendingInvestment
        )
    }
}

/// One row per logical account. `balance` is materialized for O(1) reads and
/// always equals `initial_balance` plus the running sum of entries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub id: AccountId,
    pub user_id: Option<UserId>,
    pub account_type: AccountType,
    pub currency: Currency,
    pub balance: Amount,
    /// Bootstrap seed. Zero for user accounts; operational seed for system
    /// buffers and the external clearing ceilings.
    pub initial_balance: Amount,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    Investment,
    Conversion,
    InternalTransfer,
    BufferReplenishment,
    Reversal,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Reversed,
    Failed,
}

/// Link from a ledger transaction back to the business entity that caused it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl ToString) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.to_string(),
        }
    }
}

/// A grouping of balanced entries. The idempotency key uniquely identifies a
/// business attempt; replaying it returns this row unchanged.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: TransactionId,
    pub transaction_type: TransactionType,
    pub reference: Option<EntityRef>,
    pub status: TransactionStatus,
    pub idempotency_key: String,
    pub description: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Set once a reversal has been posted against this transaction.
    pub reversed_by: Option<TransactionId>,
    pub created_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntrySide {
    Debit,
    Credit,
}

impl EntrySide {
    pub const fn flipped(self) -> Self {
        match self {
            EntrySide::Debit => EntrySide::Credit,
            EntrySide::Credit => EntrySide::Debit,
        }
    }
}

/// One immutable leg of a transaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub transaction_id: TransactionId,
    pub account_id: AccountId,
    #[serde(rename = "entry_type")]
    pub side: EntrySide,
    pub amount: Amount,
    pub created_at: Timestamp,
}

/// Caller-side description of one leg for `post_transaction`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntrySpec {
    pub account_id: AccountId,
    pub side: EntrySide,
    pub amount: Amount,
}

impl EntrySpec {
    pub fn debit(account_id: AccountId, amount: Amount) -> Self {
        Self {
            account_id,
            side: EntrySide::Debit,
            amount,
        }
    }

    pub fn credit(account_id: AccountId, amount: Amount) -> Self {
        Self {
            account_id,
            side: EntrySide::Credit,
            amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BalanceCheckError {
    #[error("transaction has no entries")]
    Empty,

    #[error(transparent)]
    Amount(#[from] AmountError),

    #[error("unbalanced transaction: debits {debits}, credits {credits}")]
    Unbalanced { debits: String, credits: String },
}

/// Verify the balanced-transaction invariant over a set of entry specs:
/// non-empty, single currency, sum of debits equals sum of credits.
/// Returns the shared currency.
pub fn check_balanced(entries: &[EntrySpec]) -> Result<Currency, BalanceCheckError> {
    let first = entries.first().ok_or(BalanceCheckError::Empty)?;
    let currency = first.amount.currency();
    let mut debits = Amount::zero(currency);
    let mut credits = Amount::zero(currency);
    for entry in entries {
        match entry.side {
            EntrySide::Debit => debits = debits.checked_add(&entry.amount)?,
            EntrySide::Credit => credits = credits.checked_add(&entry.amount)?,
        }
    }
    if debits != credits {
        return Err(BalanceCheckError::Unbalanced {
            debits: debits.to_string(),
            credits: credits.to_string(),
        });
    }
    Ok(currency)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usd(units: u64) -> Amount {
        Amount::from_units(units, Currency::Usd)
    }

    #[test]
    fn account_type_currency_is_consistent() {
        use strum::IntoEnumIterator;
        for ty in AccountType::iter() {
            // every type maps to exactly one currency and user types are
            // the three user-facing claims
            let _ = ty.currency();
        }
        assert!(AccountType::UsdcBalance.is_user_account());
        assert!(!AccountType::SystemBufferUsdc.is_user_account());
    }

    #[test]
    fn balanced_check_accepts_matched_legs() {
        let a = AccountId::generate();
        let b = AccountId::generate();
        let entries = vec![
            EntrySpec::debit(a, usd(100)),
            EntrySpec::credit(b, usd(100)),
        ];
        assert_eq!(check_balanced(&entries).unwrap(), Currency::Usd);
    }

    #[test]
    fn balanced_check_rejects_mismatch() {
        let a = AccountId::generate();
        let b = AccountId::generate();
        let entries = vec![
            EntrySpec::debit(a, usd(100)),
            EntrySpec::credit(b, usd(99)),
        ];
        assert!(matches!(
            check_balanced(&entries),
            Err(BalanceCheckError::Unbalanced { .. })
        ));
        assert!(matches!(check_balanced(&[]), Err(BalanceCheckError::Empty)));
    }

    #[test]
    fn balanced_check_rejects_mixed_currencies() {
        let a = AccountId::generate();
        let b = AccountId::generate();
        let entries = vec![
            EntrySpec::debit(a, usd(100)),
            EntrySpec::credit(b, Amount::from_units(100, Currency::Usdc)),
        ];
        assert!(matches!(
            check_balanced(&entries),
            Err(BalanceCheckError::Amount(AmountError::CurrencyMismatch { .. }))
        ));
    }

    #[test]
    fn multi_leg_transactions_balance() {
        let a = AccountId::generate();
        let b = AccountId::generate();
        let c = AccountId::generate();
        // one debit split across two credits
        let entries = vec![
            EntrySpec::debit(a, usd(100)),
            EntrySpec::credit(b, usd(60)),
            EntrySpec::credit(c, usd(40)),
        ];
        assert!(check_balanced(&entries).is_ok());
    }

    #[test]
    fn transaction_row_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let tx = LedgerTransaction {
            id: TransactionId::generate(),
            transaction_type: TransactionType::Deposit,
            reference: Some(EntityRef::new("deposit", "d-1")),
            status: TransactionStatus::Completed,
            idempotency_key: "k".into(),
            description: "test".into(),
            metadata: serde_json::json!({"chain": "SOL-DEVNET"}),
            reversed_by: None,
            created_at: crate::time::now(),
            completed_at: Some(crate::time::now()),
        };
        let data = serde_json::to_vec(&tx)?;
        let decoded: LedgerTransaction = serde_json::from_slice(&data)?;
        assert_eq!(decoded.idempotency_key, tx.idempotency_key);
        assert_eq!(decoded.status, TransactionStatus::Completed);
        Ok(())
    }
}
