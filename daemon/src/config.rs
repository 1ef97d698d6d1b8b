use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use stack_common::{
    amount::Amount,
    currency::Currency,
    ledger::AccountType,
};

// bind address for the HTTP surface
// RPC endpoints include operational functions (treasury triggers, audit
// queries) that should not be exposed to the network without a gateway in
// front. To allow remote access, explicitly set --bind-address 0.0.0.0:8280.
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8280";

// Default sled database directory
pub const DEFAULT_DB_PATH: &str = "stack-db";

// Retry policy shared by saga steps, conversion jobs and worker queues.
// Exponential backoff starting at 1 minute, doubling, capped at 30 minutes,
// with +/-10% jitter applied on top.
pub const RETRY_INITIAL_DELAY_SECS: u64 = 60;
pub const RETRY_MAX_DELAY_SECS: u64 = 30 * 60;
pub const RETRY_JITTER_RATIO: f64 = 0.10;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

// Per-call timeout applied to every external adapter call, and the overall
// deadline bounding a single saga step or worker job
pub const ADAPTER_CALL_TIMEOUT: Duration = Duration::from_secs(15);
pub const STEP_DEADLINE: Duration = Duration::from_secs(60);

// Circuit breaker: open after this many consecutive failures, probe again
// once the cooldown elapses
pub const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
pub const CIRCUIT_COOLDOWN: Duration = Duration::from_secs(60);

// Worker poll cadence
pub const EVENT_WORKER_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const STEP_WORKER_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const PROVISIONING_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const TREASURY_TICK_INTERVAL: Duration = Duration::from_secs(30);
pub const IDEMPOTENCY_PURGE_INTERVAL: Duration = Duration::from_secs(10 * 60);

// Reconciliation cadence: quick run hourly, full run daily at this hour
pub const RECONCILIATION_QUICK_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const RECONCILIATION_FULL_RUN_HOUR: u32 = 2;

// Rows stuck in a claimed state longer than this are re-claimed on the next
// poll (worker died mid-job)
pub const CLAIM_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

// Conversion provider health: demote to degraded once the rolling failure
// rate crosses the threshold, recover after the cooldown
pub const PROVIDER_FAILURE_RATE_THRESHOLD: f64 = 0.5;
pub const PROVIDER_MIN_OBSERVATIONS: u32 = 4;
pub const PROVIDER_DEGRADED_COOLDOWN: Duration = Duration::from_secs(5 * 60);

// Treasury defaults, overridable through the thresholds table
pub fn default_buffer_seed(account_type: AccountType) -> Amount {
    match account_type {
        // external clearing ceilings: large enough that boundary postings
        // never run dry in practice
        AccountType::ExternalUsdcClearing => Amount::from_units(1_000_000_000, Currency::Usdc),
        AccountType::ExternalFiatClearing => Amount::from_units(1_000_000_000, Currency::Usd),
        AccountType::SystemBufferUsdc => Amount::from_units(100_000, Currency::Usdc),
        AccountType::SystemBufferFiat => Amount::from_units(100_000, Currency::Usd),
        AccountType::BrokerOperational => Amount::from_units(100_000, Currency::Usd),
        _ => Amount::zero(account_type.currency()),
    }
}

// Withdrawal limit defaults, applied when a user has no limits row
pub const DEFAULT_DAILY_LIMIT_USD: u64 = 10_000;
pub const DEFAULT_WEEKLY_LIMIT_USD: u64 = 25_000;
pub const DEFAULT_MONTHLY_LIMIT_USD: u64 = 50_000;
pub const DEFAULT_DUAL_AUTH_THRESHOLD_USD: u64 = 5_000;

/// Webhook signing secrets, one per partner endpoint. The devnet defaults
/// are fixtures; production deployments override them from the environment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookSecrets {
    pub chain: String,
    pub conversion: String,
    pub broker: String,
}

impl Default for WebhookSecrets {
    fn default() -> Self {
        Self {
            chain: "devnet-chain-secret".to_string(),
            conversion: "devnet-conversion-secret".to_string(),
            broker: "devnet-broker-secret".to_string(),
        }
    }
}

/// CLI configuration for the daemon binary.
#[derive(Parser, Clone, Debug)]
#[command(name = "stack_daemon", version, about = "Stack backend daemon")]
pub struct Config {
    /// Bind address for the HTTP surface
    #[arg(long, default_value = DEFAULT_BIND_ADDRESS)]
    pub bind_address: String,

    /// Directory for the embedded database
    #[arg(long, default_value = DEFAULT_DB_PATH)]
    pub db_path: String,

    /// Disable the reconciliation scheduler
    #[arg(long)]
    pub disable_reconciliation: bool,

    /// Interval between quick reconciliation runs
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1h")]
    pub reconciliation_interval: Duration,

    /// Keep low severity reconciliation exceptions open instead of
    /// auto-correcting them
    #[arg(long)]
    pub no_auto_correct: bool,

    /// Interval between treasury threshold evaluations
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    pub treasury_interval: Duration,

    /// Log level filter (overrides RUST_LOG)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
