use async_trait::async_trait;
use stack_common::amount::Amount;

use super::AdapterError;

/// A finality event observed for a watched address.
#[derive(Clone, Debug)]
pub struct ChainConfirmation {
    pub chain: String,
    pub tx_hash: String,
    pub to_address: String,
    pub token: String,
    pub amount: Amount,
    pub confirmations: u32,
}

/// Chain watching capability. In production this is a partner pushing
/// webhooks at us; the trait exists so the watch registration side has a
/// seam, and so tests can synthesize confirmations.
#[async_trait]
pub trait ChainWatcher: Send + Sync {
    /// Register an address for confirmation events.
    async fn watch(&self, address: &str, chain: &str) -> Result<(), AdapterError>;
}
