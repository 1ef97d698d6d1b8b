// Idempotency primitives.
//
// Mutating entry points carry a client supplied `Idempotency-Key`. The
// cached response is keyed by that string; the request body hash detects a
// key reused for a different payload. Downstream keys (saga steps, ledger
// postings, conversion jobs) are derived deterministically from the parent
// key so retries collapse at every layer.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{ids::UserId, time::Timestamp};

/// A cached response for one idempotency key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub request_path: String,
    pub request_method: String,
    /// SHA-256 of the canonicalized request body, hex encoded.
    pub request_hash: String,
    pub user_id: Option<UserId>,
    pub response_status: u16,
    pub response_body: String,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
}

/// Hash of the canonical request body. JSON bodies are parsed and re-encoded
/// so that key order and whitespace do not change the hash; anything else is
/// hashed as raw bytes.
pub fn request_hash(body: &[u8]) -> String {
    let canonical: Vec<u8> = match serde_json::from_slice::<serde_json::Value>(body) {
        // serde_json maps are key-ordered, so this re-encoding is canonical
        Ok(value) => serde_json::to_vec(&value).unwrap_or_else(|_| body.to_vec()),
        Err(_) => body.to_vec(),
    };
    hex::encode(Sha256::digest(&canonical))
}

/// Deterministic downstream key: the same parent key and step always map to
/// the same child key, so a retry at any layer reuses the same ledger and
/// job idempotency gates.
pub fn derive_key(parent: &str, step: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent.as_bytes());
    hasher.update(b"/");
    hasher.update(step.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_hash_ignores_key_order_and_whitespace() {
        let a = br#"{"amount": "100", "chain": "SOL-DEVNET"}"#;
        let b = br#"{"chain":"SOL-DEVNET","amount":"100"}"#;
        assert_eq!(request_hash(a), request_hash(b));
    }

    #[test]
    fn different_payloads_differ() {
        let a = br#"{"amount":"100"}"#;
        let b = br#"{"amount":"200"}"#;
        assert_ne!(request_hash(a), request_hash(b));
    }

    #[test]
    fn non_json_hashes_raw() {
        assert_eq!(request_hash(b"abc"), request_hash(b"abc"));
        assert_ne!(request_hash(b"abc"), request_hash(b"abd"));
    }

    #[test]
    fn derived_keys_are_stable_and_distinct() {
        let parent = "client-key-1";
        assert_eq!(
            derive_key(parent, "deposit/off_ramp_initiated"),
            derive_key(parent, "deposit/off_ramp_initiated")
        );
        assert_ne!(
            derive_key(parent, "deposit/off_ramp_initiated"),
            derive_key(parent, "deposit/broker_funded")
        );
        assert_ne!(derive_key(parent, "a"), derive_key("other", "a"));
    }
}
