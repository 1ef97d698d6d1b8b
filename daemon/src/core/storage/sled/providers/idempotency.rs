use async_trait::async_trait;
use stack_common::{idempotency::IdempotencyRecord, time::Timestamp};

use crate::core::{
    error::CoreError,
    storage::{sled::SledStorage, IdempotencyProvider},
};

#[async_trait]
impl IdempotencyProvider for SledStorage {
    async fn get_idempotency_record(
        &self,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, CoreError> {
        Self::load(&self.idempotency, key.as_bytes())
    }

    async fn put_idempotency_record(
        &mut self,
        record: &IdempotencyRecord,
    ) -> Result<(), CoreError> {
        Self::save(&self.idempotency, record.key.as_bytes(), record)
    }

    async fn purge_expired_idempotency_records(
        &mut self,
        now: Timestamp,
    ) -> Result<usize, CoreError> {
        let mut expired = Vec::new();
        for item in self.idempotency.iter() {
            let (key, bytes) = item?;
            let record: IdempotencyRecord = serde_json::from_slice(&bytes)?;
            if record.expires_at <= now {
                expired.push(key);
            }
        }
        let purged = expired.len();
        for key in expired {
            self.idempotency.remove(key)?;
        }
        Ok(purged)
    }
}
