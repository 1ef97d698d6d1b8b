// Idempotency record storage provider trait

use async_trait::async_trait;
use stack_common::{idempotency::IdempotencyRecord, time::Timestamp};

use crate::core::error::CoreError;

#[async_trait]
pub trait IdempotencyProvider {
    async fn get_idempotency_record(
        &self,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, CoreError>;

    async fn put_idempotency_record(
        &mut self,
        record: &IdempotencyRecord,
    ) -> Result<(), CoreError>;

    /// Drop expired records; returns how many were removed.
    async fn purge_expired_idempotency_records(
        &mut self,
        now: Timestamp,
    ) -> Result<usize, CoreError>;
}
