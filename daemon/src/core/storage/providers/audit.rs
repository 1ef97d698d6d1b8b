// Audit log storage provider trait

use async_trait::async_trait;
use stack_common::audit::{AuditEntry, AuditQuery};

use crate::core::error::CoreError;

/// Append-only by construction: there is no update or delete operation.
#[async_trait]
pub trait AuditProvider {
    async fn append_audit(&mut self, entry: &AuditEntry) -> Result<(), CoreError>;

    /// Filtered query, newest first, offset/limit paginated.
    async fn query_audit(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, CoreError>;
}
