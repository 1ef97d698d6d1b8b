// Shared constants for the stack backend.
//
// Amount scales follow the value carriers: on-chain USDC amounts keep the
// full 18 fractional digits reported by chains, fiat keeps 6 so that one
// atomic unit is a micro-dollar. Tolerances and TTLs that both crates need
// live here; service-local tuning stays in the daemon config.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Fractional digits carried by on-chain stablecoin amounts
pub const USDC_DECIMALS: u32 = 18;
// Fractional digits carried by fiat amounts (1 atomic unit = 1 micro-dollar)
pub const USD_DECIMALS: u32 = 6;

// One minor unit per currency, used as the default reconciliation tolerance
// (1e-6 USDC / 1 cent expressed in micro-dollars)
pub const USDC_MINOR_UNIT_EXP: u32 = 12;
pub const USD_MINOR_UNIT_EXP: u32 = 4;

// Idempotency response cache TTL
pub const IDEMPOTENCY_TTL_SECS: u64 = 24 * 60 * 60;

// Maximum accepted length for client supplied idempotency keys
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

// Chain tags used across the system. Chains are open-ended strings on the
// wire; these are the ones the devnet fixtures use.
pub const CHAIN_SOL_DEVNET: &str = "SOL-DEVNET";
pub const CHAIN_ETH_SEPOLIA: &str = "ETH-SEPOLIA";
