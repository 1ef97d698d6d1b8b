use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::config::{USDC_DECIMALS, USD_DECIMALS};

/// Value carriers handled by the ledger.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Currency {
    /// On-chain stablecoin, full chain precision.
    Usdc,
    /// Brokerage fiat, micro-dollar precision.
    Usd,
}

impl Currency {
    /// Fractional digits carried by atomic amounts of this currency.
    pub const fn decimals(self) -> u32 {
        match self {
            Currency::Usdc => USDC_DECIMALS,
            Currency::Usd => USD_DECIMALS,
        }
    }

    /// Exponent of one minor unit (1e-6 USDC, one cent) relative to the
    /// atomic scale. Used as the default reconciliation tolerance.
    pub const fn minor_unit_exp(self) -> u32 {
        match self {
            Currency::Usdc => crate::config::USDC_MINOR_UNIT_EXP,
            Currency::Usd => crate::config::USD_MINOR_UNIT_EXP,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_form_is_uppercase() {
        assert_eq!(serde_json::to_string(&Currency::Usdc).unwrap(), "\"USDC\"");
        assert_eq!(Currency::Usd.to_string(), "USD");
        assert_eq!("USDC".parse::<Currency>().unwrap(), Currency::Usdc);
    }
}
