use async_trait::async_trait;
use stack_common::{amount::Amount, conversion::ConversionDirection};

use super::AdapterError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderConversionStatus {
    Submitted,
    Processing,
    Completed,
    Failed,
}

/// Acknowledgement for a submitted conversion.
#[derive(Clone, Debug)]
pub struct ConversionSubmission {
    pub provider_tx_id: String,
    pub status: ProviderConversionStatus,
}

/// Conversion (on/off-ramp) capability. Settlement details arrive through
/// the provider webhook; `get_conversion_status` exists for polling
/// recovery when a webhook goes missing.
#[async_trait]
pub trait ConversionProviderClient: Send + Sync {
    async fn submit_conversion(
        &self,
        provider_name: &str,
        direction: ConversionDirection,
        amount: &Amount,
        idempotency_key: &str,
    ) -> Result<ConversionSubmission, AdapterError>;

    async fn get_conversion_status(
        &self,
        provider_tx_id: &str,
    ) -> Result<ProviderConversionStatus, AdapterError>;
}
