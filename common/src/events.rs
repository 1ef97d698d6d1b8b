use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    amount::Amount,
    ids::{EventJobId, TraceId},
    time::Timestamp,
};

/// Durable webhook job lifecycle. (`tx_hash`, `chain`) is the unique key, so
/// partner retry storms collapse into a single row.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventJobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    /// Exhausted retries; kept for human investigation.
    Dlq,
}

impl EventJobStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            EventJobStatus::Completed | EventJobStatus::Failed | EventJobStatus::Dlq
        )
    }
}

/// Last-error classification for a job, driving the retry decision.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventErrorType {
    /// 5xx, timeout, network: retried with backoff.
    Transient,
    /// 4xx from a partner: the job fails without retries.
    Permanent,
    /// Bug or invariant violation: parked for investigation.
    Internal,
}

/// One captured chain-funding webhook, processed at least once by the event
/// worker and idempotent downstream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FundingEventJob {
    pub id: EventJobId,
    pub tx_hash: String,
    pub chain: String,
    pub token: String,
    pub amount: Amount,
    pub to_address: String,
    pub status: EventJobStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub error_type: Option<EventErrorType>,
    pub next_retry_at: Option<Timestamp>,
    pub first_seen_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    /// Raw payload as delivered, kept for replay and investigation.
    pub webhook_payload: serde_json::Value,
    pub trace_id: TraceId,
}

impl FundingEventJob {
    /// Storage key collapsing duplicate deliveries.
    pub fn dedup_key(tx_hash: &str, chain: &str) -> String {
        format!("{chain}:{tx_hash}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_is_stable_per_chain() {
        assert_eq!(
            FundingEventJob::dedup_key("0xabc", "SOL-DEVNET"),
            "SOL-DEVNET:0xabc"
        );
        assert_ne!(
            FundingEventJob::dedup_key("0xabc", "SOL-DEVNET"),
            FundingEventJob::dedup_key("0xabc", "ETH-SEPOLIA")
        );
    }

    #[test]
    fn terminal_states() {
        assert!(EventJobStatus::Dlq.is_terminal());
        assert!(EventJobStatus::Completed.is_terminal());
        assert!(!EventJobStatus::Processing.is_terminal());
    }
}
