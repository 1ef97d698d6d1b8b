use async_trait::async_trait;
use stack_common::audit::{AuditEntry, AuditQuery};

use crate::core::{
    error::CoreError,
    storage::{sled::SledStorage, AuditProvider},
};

// Keys are (creation millis, id) so iteration order is the timeline and a
// reverse scan is newest-first. There is deliberately no update or delete.
fn audit_key(entry: &AuditEntry) -> Vec<u8> {
    let millis = entry.created_at.timestamp_millis().max(0) as u64;
    let mut key = millis.to_be_bytes().to_vec();
    key.extend_from_slice(entry.id.as_bytes());
    key
}

#[async_trait]
impl AuditProvider for SledStorage {
    async fn append_audit(&mut self, entry: &AuditEntry) -> Result<(), CoreError> {
        Self::save(&self.audit, &audit_key(entry), entry)
    }

    async fn query_audit(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, CoreError> {
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(100);
        let mut matched = 0usize;
        let mut page = Vec::new();
        for item in self.audit.iter().rev() {
            let (_, bytes) = item?;
            let entry: AuditEntry = serde_json::from_slice(&bytes)?;
            if !query.matches(&entry) {
                continue;
            }
            matched += 1;
            if matched <= offset {
                continue;
            }
            page.push(entry);
            if page.len() >= limit {
                break;
            }
        }
        Ok(page)
    }
}
