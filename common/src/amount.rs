// Fixed-point monetary amounts.
//
// Amounts are unsigned atomic integers on a U256 with a per-currency decimal
// scale (18 fractional digits for USDC, 6 for USD). Every operation is
// checked: overflow, underflow and currency mixing are errors, never panics.
// Display renders the decimal form, parsing accepts decimal strings with at
// most the currency's precision.

use std::cmp::Ordering;
use std::fmt;

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::currency::Currency;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: Currency, right: Currency },

    #[error("amount overflow")]
    Overflow,

    #[error("amount underflow: need {need}, have {have}")]
    Underflow { need: String, have: String },

    #[error("invalid decimal amount '{0}'")]
    InvalidDecimal(String),
}

/// An unsigned amount of a single currency at that currency's atomic scale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    atomic: U256,
    currency: Currency,
}

impl Amount {
    pub const fn from_atomic(atomic: U256, currency: Currency) -> Self {
        Self { atomic, currency }
    }

    pub fn zero(currency: Currency) -> Self {
        Self {
            atomic: U256::zero(),
            currency,
        }
    }

    /// Whole units of the currency (1 unit = 1 USDC / 1 USD).
    pub fn from_units(units: u64, currency: Currency) -> Self {
        Self {
            atomic: U256::from(units) * U256::exp10(currency.decimals() as usize),
            currency,
        }
    }

    /// Parse a decimal string such as `"100.000000"`. More fractional
    /// digits than the currency carries is an error, not silent rounding.
    pub fn parse(value: &str, currency: Currency) -> Result<Self, AmountError> {
        let invalid = || AmountError::InvalidDecimal(value.to_string());
        let mut parts = value.splitn(2, '.');
        let int_part = parts.next().ok_or_else(invalid)?;
        let frac_part = parts.next().unwrap_or("");

        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        let decimals = currency.decimals() as usize;
        if frac_part.len() > decimals || !frac_part.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }

        let int_value = if int_part.is_empty() {
            U256::zero()
        } else {
            U256::from_dec_str(int_part).map_err(|_| invalid())?
        };
        let frac_value = if frac_part.is_empty() {
            U256::zero()
        } else {
            U256::from_dec_str(frac_part).map_err(|_| invalid())?
                * U256::exp10(decimals - frac_part.len())
        };

        let atomic = int_value
            .checked_mul(U256::exp10(decimals))
            .and_then(|v| v.checked_add(frac_value))
            .ok_or(AmountError::Overflow)?;

        Ok(Self { atomic, currency })
    }

    pub fn atomic(&self) -> U256 {
        self.atomic
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn is_zero(&self) -> bool {
        self.atomic.is_zero()
    }

    fn ensure_same_currency(&self, other: &Self) -> Result<(), AmountError> {
        if self.currency != other.currency {
            return Err(AmountError::CurrencyMismatch {
                left: self.currency,
                right: other.currency,
            });
        }
        Ok(())
    }

    pub fn checked_add(&self, other: &Self) -> Result<Self, AmountError> {
        self.ensure_same_currency(other)?;
        let atomic = self
            .atomic
            .checked_add(other.atomic)
            .ok_or(AmountError::Overflow)?;
        Ok(Self {
            atomic,
            currency: self.currency,
        })
    }

    pub fn checked_sub(&self, other: &Self) -> Result<Self, AmountError> {
        self.ensure_same_currency(other)?;
        let atomic = self
            .atomic
            .checked_sub(other.atomic)
            .ok_or_else(|| AmountError::Underflow {
                need: other.to_string(),
                have: self.to_string(),
            })?;
        Ok(Self {
            atomic,
            currency: self.currency,
        })
    }

    /// Absolute difference, used for reconciliation discrepancies.
    pub fn abs_diff(&self, other: &Self) -> Result<Self, AmountError> {
        self.ensure_same_currency(other)?;
        let atomic = if self.atomic >= other.atomic {
            self.atomic - other.atomic
        } else {
            other.atomic - self.atomic
        };
        Ok(Self {
            atomic,
            currency: self.currency,
        })
    }

    /// Re-express this amount at another currency's scale, at par. Excess
    /// precision truncates toward zero; the residue is the caller's problem
    /// (conversion postings absorb it on the expense leg).
    pub fn rescaled(&self, to: Currency) -> Result<Self, AmountError> {
        if self.currency == to {
            return Ok(*self);
        }
        let from_dec = self.currency.decimals();
        let to_dec = to.decimals();
        let atomic = if to_dec >= from_dec {
            self.atomic
                .checked_mul(U256::exp10((to_dec - from_dec) as usize))
                .ok_or(AmountError::Overflow)?
        } else {
            self.atomic / U256::exp10((from_dec - to_dec) as usize)
        };
        Ok(Self {
            atomic,
            currency: to,
        })
    }

    /// One minor unit of this currency (default reconciliation tolerance).
    pub fn minor_unit(currency: Currency) -> Self {
        Self {
            atomic: U256::exp10(currency.minor_unit_exp() as usize),
            currency,
        }
    }
}

// Ordering is only defined within one currency.
impl PartialOrd for Amount {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.currency != other.currency {
            return None;
        }
        Some(self.atomic.cmp(&other.atomic))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let decimals = self.currency.decimals() as usize;
        let scale = U256::exp10(decimals);
        let int_part = self.atomic / scale;
        let frac_part = self.atomic % scale;
        if frac_part.is_zero() {
            write!(f, "{}", int_part)
        } else {
            let mut frac = frac_part.to_string();
            while frac.len() < decimals {
                frac.insert(0, '0');
            }
            write!(f, "{}.{}", int_part, frac.trim_end_matches('0'))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_roundtrip() -> Result<(), AmountError> {
        let a = Amount::parse("100.000000", Currency::Usd)?;
        assert_eq!(a, Amount::from_units(100, Currency::Usd));
        assert_eq!(a.to_string(), "100");

        let b = Amount::parse("0.25", Currency::Usdc)?;
        assert_eq!(b.to_string(), "0.25");
        assert_eq!(Amount::parse(&b.to_string(), Currency::Usdc)?, b);
        Ok(())
    }

    #[test]
    fn parse_rejects_excess_precision() {
        assert!(Amount::parse("1.0000001", Currency::Usd).is_err());
        assert!(Amount::parse("abc", Currency::Usd).is_err());
        assert!(Amount::parse("", Currency::Usd).is_err());
        assert!(Amount::parse("1.2.3", Currency::Usd).is_err());
    }

    #[test]
    fn arithmetic_is_checked() {
        let usd = Amount::from_units(10, Currency::Usd);
        let usdc = Amount::from_units(10, Currency::Usdc);
        assert!(matches!(
            usd.checked_add(&usdc),
            Err(AmountError::CurrencyMismatch { .. })
        ));
        assert!(matches!(
            Amount::zero(Currency::Usd).checked_sub(&usd),
            Err(AmountError::Underflow { .. })
        ));
        assert_eq!(
            usd.checked_sub(&usd).unwrap(),
            Amount::zero(Currency::Usd)
        );
    }

    #[test]
    fn rescale_at_par() -> Result<(), AmountError> {
        let usdc = Amount::parse("100.5", Currency::Usdc)?;
        let usd = usdc.rescaled(Currency::Usd)?;
        assert_eq!(usd, Amount::parse("100.5", Currency::Usd)?);
        // and back
        assert_eq!(usd.rescaled(Currency::Usdc)?, usdc);
        Ok(())
    }

    #[test]
    fn rescale_truncates_excess_precision() -> Result<(), AmountError> {
        // 1e-7 USDC is below fiat precision and truncates to zero
        let dust = Amount::parse("0.0000001", Currency::Usdc)?;
        assert!(dust.rescaled(Currency::Usd)?.is_zero());
        Ok(())
    }

    #[test]
    fn ordering_is_per_currency() {
        let one = Amount::from_units(1, Currency::Usd);
        let two = Amount::from_units(2, Currency::Usd);
        assert!(one < two);
        assert_eq!(
            one.partial_cmp(&Amount::from_units(1, Currency::Usdc)),
            None
        );
    }
}
