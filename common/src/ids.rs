// Typed identifiers.
//
// Every entity id is a 128-bit UUID. Newtypes keep a deposit id from ever
// being handed to a withdrawal lookup; the inner value is only exposed for
// storage key encoding.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::from_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// A platform user.
    UserId
);
uuid_id!(
    /// A ledger account.
    AccountId
);
uuid_id!(
    /// A ledger transaction.
    TransactionId
);
uuid_id!(
    /// One leg of a ledger transaction.
    EntryId
);
uuid_id!(
    /// A custodial wallet row.
    WalletId
);
uuid_id!(
    /// A wallet provisioning job.
    ProvisioningJobId
);
uuid_id!(
    /// A deposit (funding saga instance).
    DepositId
);
uuid_id!(
    /// A withdrawal (withdrawal saga instance).
    WithdrawalId
);
uuid_id!(
    /// A treasury conversion job.
    ConversionJobId
);
uuid_id!(
    /// A registered conversion provider.
    ProviderId
);
uuid_id!(
    /// A durable webhook event job.
    EventJobId
);
uuid_id!(
    /// A queued saga step.
    StepJobId
);
uuid_id!(
    /// A reconciliation report.
    ReportId
);
uuid_id!(
    /// A reconciliation exception.
    ExceptionId
);
uuid_id!(
    /// An audit log entry.
    AuditId
);

/// Correlation id propagated across saga hops and worker boundaries.
/// Generated at each external entry point and stamped on every row a
/// request touches, so one flow can be followed through the logs.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(String);

impl TraceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_roundtrip_through_display() {
        let id = DepositId::generate();
        let parsed: DepositId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn ids_serialize_transparent() {
        let id = AccountId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }
}
