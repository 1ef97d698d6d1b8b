// Wire types for the HTTP surface: webhook payloads the partners deliver
// and the request/response bodies the API layer consumes from the core.
// Monetary fields are decimal strings on the wire; parsing against the
// expected currency happens at the boundary.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::ids::{DepositId, UserId, WithdrawalId};

/// `POST /webhooks/chain` body: a partner reporting on-chain tx finality.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainWebhookPayload {
    pub chain: String,
    pub tx_hash: String,
    pub token: String,
    /// Decimal token amount, e.g. `"100.000000"`.
    pub amount: String,
    pub to_address: String,
    pub confirmations: u32,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProviderEventStatus {
    Submitted,
    Processing,
    Completed,
    Failed,
}

/// `POST /webhooks/conversion` body: conversion provider status callback.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversionWebhookPayload {
    pub provider_tx_id: String,
    pub status: ProviderEventStatus,
    /// Destination units per source unit, parts-per-million.
    pub applied_rate_ppm: Option<u64>,
    /// Decimal fee amount in the destination currency.
    pub fees: Option<String>,
    /// Decimal settled destination amount.
    pub destination_amount: Option<String>,
    pub reason: Option<String>,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BrokerEventKind {
    FundingSettled,
    WithdrawalSettled,
    JournalFailed,
}

/// `POST /webhooks/broker` body: brokerage journal status callback.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerWebhookPayload {
    pub journal_ref: String,
    pub event: BrokerEventKind,
    /// Decimal USD amount the journal settled.
    pub amount: String,
    pub reason: Option<String>,
}

/// `POST /withdrawals` body. The `Idempotency-Key` header carries the key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitiateWithdrawalRequest {
    pub user_id: UserId,
    /// Decimal USD amount.
    pub amount_usd: String,
    pub target_chain: String,
    pub target_address: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitiateWithdrawalResponse {
    pub withdrawal_id: WithdrawalId,
}

/// `GET /users/{id}/balances` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BalancesResponse {
    pub buying_power_usd: String,
    pub pending_deposits_usd: String,
    pub usdc_on_chain: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DepositAddressResponse {
    pub user_id: UserId,
    pub chain: String,
    pub address: String,
}

/// Acknowledgement for accepted webhook deliveries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookAck {
    pub accepted: bool,
    pub deposit_id: Option<DepositId>,
}

/// `POST /provisioning` body: create custodial wallets for a user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProvisioningRequest {
    pub user_id: UserId,
    pub chains: Vec<String>,
}

/// `POST /treasury/conversions` body: operator-triggered conversion.
/// The `Idempotency-Key` header carries the key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManualConversionRequest {
    pub direction: String,
    /// Decimal amount in the direction's source currency.
    pub amount: String,
    #[serde(default)]
    pub emergency: bool,
}

/// `PUT /users/{id}/withdrawal-limits` body. Decimal USD amounts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WithdrawalLimitsRequest {
    pub daily: String,
    pub weekly: String,
    pub monthly: String,
    pub dual_auth_threshold: String,
}

/// `POST /exceptions/{id}/resolve` body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolveExceptionRequest {
    /// Target resolution state: `investigating`, `resolved` or `wont_fix`.
    pub state: String,
}

/// Uniform error body; internals never leak past the taxonomy code.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub storage: bool,
    pub workers: Vec<WorkerHealth>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub name: String,
    pub healthy: bool,
    pub last_tick_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_webhook_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let payload = ChainWebhookPayload {
            chain: "SOL-DEVNET".into(),
            tx_hash: "0xabc".into(),
            token: "USDC".into(),
            amount: "100.000000".into(),
            to_address: "SoLA1111".into(),
            confirmations: 32,
        };
        let decoded: ChainWebhookPayload =
            serde_json::from_slice(&serde_json::to_vec(&payload)?)?;
        assert_eq!(decoded.tx_hash, "0xabc");
        assert_eq!(decoded.confirmations, 32);
        Ok(())
    }

    #[test]
    fn provider_status_wire_form() {
        assert_eq!(
            serde_json::to_string(&ProviderEventStatus::Completed).unwrap(),
            "\"completed\""
        );
    }
}
