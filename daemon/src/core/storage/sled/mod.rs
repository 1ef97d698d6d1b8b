mod providers;

use ::sled::{Db, Tree};
use serde::{de::DeserializeOwned, Serialize};

use crate::core::error::CoreError;

use super::Storage;

// Tree names
const LEDGER_TREE: &str = "ledger";
const WALLETS_TREE: &str = "wallets";
const PROVISIONING_TREE: &str = "provisioning_jobs";
const DEPOSITS_TREE: &str = "deposits";
const WITHDRAWALS_TREE: &str = "withdrawals";
const CONVERSIONS_TREE: &str = "conversions";
const EVENTS_TREE: &str = "event_jobs";
const STEPS_TREE: &str = "saga_steps";
const RECONCILIATION_TREE: &str = "reconciliation";
const IDEMPOTENCY_TREE: &str = "idempotency";
const AUDIT_TREE: &str = "audit";

// Key prefixes inside the ledger tree. All ledger state lives in one tree
// so a posting can commit transactionally across rows and indexes.
pub(crate) const ACCOUNT_PREFIX: &[u8] = b"account:";
pub(crate) const ACCOUNT_OWNER_PREFIX: &[u8] = b"acct_owner:";
pub(crate) const TX_PREFIX: &[u8] = b"tx:";
pub(crate) const TX_IDEM_PREFIX: &[u8] = b"tx_idem:";
pub(crate) const ENTRY_PREFIX: &[u8] = b"entry:";
pub(crate) const TX_ENTRY_PREFIX: &[u8] = b"tx_entry:";
pub(crate) const ACCT_ENTRY_PREFIX: &[u8] = b"acct_entry:";

/// Sled-backed storage. Values are JSON rows; secondary indexes are plain
/// key-to-id pointers under their own prefixes.
pub struct SledStorage {
    db: Db,
    pub(crate) ledger: Tree,
    pub(crate) wallets: Tree,
    pub(crate) provisioning: Tree,
    pub(crate) deposits: Tree,
    pub(crate) withdrawals: Tree,
    pub(crate) conversions: Tree,
    pub(crate) events: Tree,
    pub(crate) steps: Tree,
    pub(crate) reconciliation: Tree,
    pub(crate) idempotency: Tree,
    pub(crate) audit: Tree,
}

impl SledStorage {
    pub fn open(path: &str) -> Result<Self, CoreError> {
        let db = ::sled::open(path)?;
        Self::with_db(db)
    }

    /// Open on a temporary database; used by tests.
    pub fn open_temporary() -> Result<Self, CoreError> {
        let db = ::sled::Config::new().temporary(true).open()?;
        Self::with_db(db)
    }

    fn with_db(db: Db) -> Result<Self, CoreError> {
        Ok(Self {
            ledger: db.open_tree(LEDGER_TREE)?,
            wallets: db.open_tree(WALLETS_TREE)?,
            provisioning: db.open_tree(PROVISIONING_TREE)?,
            deposits: db.open_tree(DEPOSITS_TREE)?,
            withdrawals: db.open_tree(WITHDRAWALS_TREE)?,
            conversions: db.open_tree(CONVERSIONS_TREE)?,
            events: db.open_tree(EVENTS_TREE)?,
            steps: db.open_tree(STEPS_TREE)?,
            reconciliation: db.open_tree(RECONCILIATION_TREE)?,
            idempotency: db.open_tree(IDEMPOTENCY_TREE)?,
            audit: db.open_tree(AUDIT_TREE)?,
            db,
        })
    }

    // JSON row helpers

    pub(crate) fn load<T: DeserializeOwned>(
        tree: &Tree,
        key: &[u8],
    ) -> Result<Option<T>, CoreError> {
        match tree.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn save<T: Serialize>(
        tree: &Tree,
        key: &[u8],
        value: &T,
    ) -> Result<(), CoreError> {
        tree.insert(key, serde_json::to_vec(value)?)?;
        Ok(())
    }

    /// Follow a secondary index pointer to its row in the same tree.
    pub(crate) fn load_via_index<T: DeserializeOwned>(
        tree: &Tree,
        index_key: &[u8],
    ) -> Result<Option<T>, CoreError> {
        match tree.get(index_key)? {
            Some(primary_key) => Self::load(tree, &primary_key),
            None => Ok(None),
        }
    }

    /// All rows under a key prefix, in key order.
    pub(crate) fn scan_prefix<T: DeserializeOwned>(
        tree: &Tree,
        prefix: &[u8],
    ) -> Result<Vec<T>, CoreError> {
        let mut rows = Vec::new();
        for item in tree.scan_prefix(prefix) {
            let (_, bytes) = item?;
            rows.push(serde_json::from_slice(&bytes)?);
        }
        Ok(rows)
    }

    pub(crate) fn concat_key(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(prefix.len() + suffix.len());
        key.extend_from_slice(prefix);
        key.extend_from_slice(suffix);
        key
    }
}

#[async_trait::async_trait]
impl Storage for SledStorage {
    async fn flush(&mut self) -> Result<(), CoreError> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use stack_common::{
        amount::Amount,
        currency::Currency,
        ids::AccountId,
        ledger::{AccountType, LedgerAccount},
        time,
    };

    use crate::core::storage::{AccountProvider, Storage as _};

    use super::SledStorage;

    // Workers recover interrupted work by re-reading their rows on the
    // next poll, so rows written before a crash must come back intact
    // from a fresh open of the same directory.
    #[tokio::test]
    async fn rows_survive_a_reopen() {
        let dir = tempfile::Builder::new()
            .prefix("stack-db-")
            .tempdir()
            .expect("tempdir");
        let path = dir.path().to_str().expect("utf8 path").to_string();

        let seed = Amount::from_units(5, Currency::Usdc);
        let account = LedgerAccount {
            id: AccountId::generate(),
            user_id: None,
            account_type: AccountType::SystemBufferUsdc,
            currency: Currency::Usdc,
            balance: seed,
            initial_balance: seed,
            created_at: time::now(),
            updated_at: time::now(),
        };
        {
            let mut storage = SledStorage::open(&path).expect("open");
            storage.insert_account(&account).await.expect("insert");
            storage.flush().await.expect("flush");
        }

        let storage = SledStorage::open(&path).expect("reopen");
        let loaded = storage
            .get_account(&account.id)
            .await
            .expect("lookup")
            .expect("account survived");
        assert_eq!(loaded.balance, seed);
        assert_eq!(loaded.account_type, AccountType::SystemBufferUsdc);

        // the owner index came back with the row
        let by_owner = storage
            .get_account_by_owner(None, AccountType::SystemBufferUsdc)
            .await
            .expect("owner lookup")
            .expect("index survived");
        assert_eq!(by_owner.id, account.id);
    }
}
