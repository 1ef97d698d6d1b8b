use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    ids::{AuditId, TraceId, UserId},
    time::Timestamp,
};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditStatus {
    Succeeded,
    Failed,
}

/// Before/after snapshots of the touched resource.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuditChanges {
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
}

/// One append-only audit trail entry. There is no update API; corrections
/// are new entries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditId,
    pub user_id: Option<UserId>,
    /// What happened, e.g. `deposit.status_transition`.
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub changes: AuditChanges,
    pub status: AuditStatus,
    pub error_message: Option<String>,
    pub trace_id: TraceId,
    pub created_at: Timestamp,
}

/// Filter for audit queries; all fields are conjunctive, pagination is
/// offset based over newest-first ordering.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuditQuery {
    pub user_id: Option<UserId>,
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl AuditQuery {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(user_id) = &self.user_id {
            if entry.user_id.as_ref() != Some(user_id) {
                return false;
            }
        }
        if let Some(action) = &self.action {
            if &entry.action != action {
                return false;
            }
        }
        if let Some(resource_type) = &self.resource_type {
            if &entry.resource_type != resource_type {
                return false;
            }
        }
        if let Some(resource_id) = &self.resource_id {
            if &entry.resource_id != resource_id {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(action: &str) -> AuditEntry {
        AuditEntry {
            id: AuditId::generate(),
            user_id: None,
            action: action.into(),
            resource_type: "deposit".into(),
            resource_id: "d-1".into(),
            changes: AuditChanges::default(),
            status: AuditStatus::Succeeded,
            error_message: None,
            trace_id: TraceId::generate(),
            created_at: crate::time::now(),
        }
    }

    #[test]
    fn query_filters_are_conjunctive() {
        let e = entry("deposit.status_transition");
        let all = AuditQuery::default();
        assert!(all.matches(&e));

        let by_action = AuditQuery {
            action: Some("deposit.status_transition".into()),
            resource_type: Some("deposit".into()),
            ..Default::default()
        };
        assert!(by_action.matches(&e));

        let wrong = AuditQuery {
            action: Some("withdrawal.created".into()),
            ..Default::default()
        };
        assert!(!wrong.matches(&e));
    }
}
