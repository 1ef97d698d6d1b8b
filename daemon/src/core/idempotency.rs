// Request-level idempotency layer.
//
// Mutating entry points pass through here before their handler runs. A key
// seen before with the same payload hash short-circuits to the cached
// response; the same key with a different payload is a conflict. Stored
// responses expire after the TTL and are purged by a background sweep.

use chrono::Duration;
use stack_common::{
    config::{IDEMPOTENCY_TTL_SECS, MAX_IDEMPOTENCY_KEY_LEN},
    idempotency::{request_hash, IdempotencyRecord},
    ids::UserId,
    time,
};

use crate::core::{
    error::CoreError,
    storage::{SharedStorage, Storage},
};

/// Outcome of the pre-handler check.
pub enum IdempotencyCheck {
    /// First sighting; run the handler and store its response.
    Fresh { request_hash: String },
    /// Same key, same payload: serve the cached response.
    Replay(IdempotencyRecord),
}

pub struct IdempotencyLayer<S: Storage> {
    storage: SharedStorage<S>,
}

impl<S: Storage> Clone for IdempotencyLayer<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
        }
    }
}

impl<S: Storage> IdempotencyLayer<S> {
    pub fn new(storage: SharedStorage<S>) -> Self {
        Self { storage }
    }

    pub async fn check(
        &self,
        key: &str,
        path: &str,
        method: &str,
        body: &[u8],
    ) -> Result<IdempotencyCheck, CoreError> {
        if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(CoreError::Validation(format!(
                "idempotency key must be 1..={MAX_IDEMPOTENCY_KEY_LEN} characters"
            )));
        }
        let hash = request_hash(body);
        let storage = self.storage.read().await;
        match storage.get_idempotency_record(key).await? {
            // an expired record no longer guards the key
            Some(record) if record.expires_at > time::now() => {
                if record.request_hash != hash {
                    return Err(CoreError::Conflict(format!(
                        "idempotency key {key} was used with a different payload"
                    )));
                }
                if record.request_path != path || record.request_method != method {
                    return Err(CoreError::Conflict(format!(
                        "idempotency key {key} was used on a different endpoint"
                    )));
                }
                metrics::counter!("idempotency_replays").increment(1);
                Ok(IdempotencyCheck::Replay(record))
            }
            _ => Ok(IdempotencyCheck::Fresh { request_hash: hash }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn store_response(
        &self,
        key: &str,
        path: &str,
        method: &str,
        request_hash: String,
        user_id: Option<UserId>,
        response_status: u16,
        response_body: String,
    ) -> Result<(), CoreError> {
        let now = time::now();
        let record = IdempotencyRecord {
            key: key.to_string(),
            request_path: path.to_string(),
            request_method: method.to_string(),
            request_hash,
            user_id,
            response_status,
            response_body,
            created_at: now,
            expires_at: now + Duration::seconds(IDEMPOTENCY_TTL_SECS as i64),
        };
        self.storage
            .write()
            .await
            .put_idempotency_record(&record)
            .await
    }

    /// Drop expired records. Runs on a background schedule.
    pub async fn purge_expired(&self) -> Result<usize, CoreError> {
        let purged = self
            .storage
            .write()
            .await
            .purge_expired_idempotency_records(time::now())
            .await?;
        if purged > 0 {
            debug!("purged {purged} expired idempotency records");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::SledStorage;
    use std::sync::Arc;

    fn layer() -> IdempotencyLayer<SledStorage> {
        IdempotencyLayer::new(Arc::new(stack_common::tokio::RwLock::new(
            SledStorage::open_temporary().unwrap(),
        )))
    }

    #[tokio::test]
    async fn fresh_then_replay_then_conflict() {
        let layer = layer();
        let body = br#"{"amount_usd":"75.00"}"#;

        let check = layer
            .check("key-1", "/withdrawals", "POST", body)
            .await
            .unwrap();
        let hash = match check {
            IdempotencyCheck::Fresh { request_hash } => request_hash,
            _ => panic!("expected fresh"),
        };

        layer
            .store_response(
                "key-1",
                "/withdrawals",
                "POST",
                hash,
                None,
                200,
                r#"{"withdrawal_id":"w-1"}"#.to_string(),
            )
            .await
            .unwrap();

        // byte-identical replay serves the cached response
        match layer
            .check("key-1", "/withdrawals", "POST", body)
            .await
            .unwrap()
        {
            IdempotencyCheck::Replay(record) => {
                assert_eq!(record.response_status, 200);
                assert!(record.response_body.contains("w-1"));
            }
            _ => panic!("expected replay"),
        }

        // same key, different payload: rejected
        let conflict = layer
            .check("key-1", "/withdrawals", "POST", br#"{"amount_usd":"90.00"}"#)
            .await;
        assert!(matches!(conflict, Err(CoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn key_validation() {
        let layer = layer();
        assert!(layer.check("", "/p", "POST", b"{}").await.is_err());
        let long = "k".repeat(300);
        assert!(layer.check(&long, "/p", "POST", b"{}").await.is_err());
    }
}
