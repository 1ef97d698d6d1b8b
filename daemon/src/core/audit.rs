// Append-only audit trail for sensitive writes.
//
// Recording never fails the business operation it describes: a storage
// error here is logged and counted, not propagated.

use stack_common::{
    audit::{AuditChanges, AuditEntry, AuditQuery, AuditStatus},
    ids::{AuditId, TraceId, UserId},
    time,
};

use crate::core::{
    error::CoreError,
    storage::{SharedStorage, Storage},
};

pub struct Audit<S: Storage> {
    storage: SharedStorage<S>,
}

impl<S: Storage> Clone for Audit<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
        }
    }
}

impl<S: Storage> Audit<S> {
    pub fn new(storage: SharedStorage<S>) -> Self {
        Self { storage }
    }

    pub async fn record(
        &self,
        user_id: Option<UserId>,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        changes: AuditChanges,
        trace_id: &TraceId,
    ) {
        self.append(
            user_id,
            action,
            resource_type,
            resource_id,
            changes,
            AuditStatus::Succeeded,
            None,
            trace_id,
        )
        .await
    }

    pub async fn record_failure(
        &self,
        user_id: Option<UserId>,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        error: &CoreError,
        trace_id: &TraceId,
    ) {
        self.append(
            user_id,
            action,
            resource_type,
            resource_id,
            AuditChanges::default(),
            AuditStatus::Failed,
            Some(error.to_string()),
            trace_id,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn append(
        &self,
        user_id: Option<UserId>,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        changes: AuditChanges,
        status: AuditStatus,
        error_message: Option<String>,
        trace_id: &TraceId,
    ) {
        let entry = AuditEntry {
            id: AuditId::generate(),
            user_id,
            action: action.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            changes,
            status,
            error_message,
            trace_id: trace_id.clone(),
            created_at: time::now(),
        };
        let mut storage = self.storage.write().await;
        if let Err(err) = storage.append_audit(&entry).await {
            metrics::counter!("audit_write_failures").increment(1);
            error!("failed to append audit entry for {action}: {err}");
        }
    }

    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, CoreError> {
        self.storage.read().await.query_audit(query).await
    }
}

/// Before/after helper for status transitions.
pub fn status_change(before: impl ToString, after: impl ToString) -> AuditChanges {
    AuditChanges {
        before: Some(serde_json::json!({ "status": before.to_string() })),
        after: Some(serde_json::json!({ "status": after.to_string() })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::SledStorage;
    use std::sync::Arc;

    #[tokio::test]
    async fn audit_appends_and_filters() {
        let storage = Arc::new(stack_common::tokio::RwLock::new(
            SledStorage::open_temporary().unwrap(),
        ));
        let audit = Audit::new(storage);
        let trace = TraceId::generate();
        let user = UserId::generate();

        audit
            .record(
                Some(user),
                "deposit.status_transition",
                "deposit",
                "d-1",
                status_change("pending_confirmation", "confirmed_on_chain"),
                &trace,
            )
            .await;
        audit
            .record(None, "conversion.completed", "conversion_job", "c-1", AuditChanges::default(), &trace)
            .await;

        let all = audit.query(&AuditQuery::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let deposits_only = audit
            .query(&AuditQuery {
                resource_type: Some("deposit".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(deposits_only.len(), 1);
        assert_eq!(deposits_only[0].action, "deposit.status_transition");
        assert_eq!(deposits_only[0].user_id, Some(user));
    }
}
