use crate::error::{Error, Result};
use crate::types::{DelegatedRecord, DelegatedRecordKind, DelegationKey};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;

/// Delegated records table: "<domain>:<kind>" -> DelegatedRecord (JSON)
const DELEGATED_TABLE: TableDefinition<&str, &str> = TableDefinition::new("delegated_records");

/// Delegation API keys: bearer token -> DelegationKey (JSON)
const KEYS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("delegation_keys");

/// Index for chain detection: source_api_id -> "1" iff an active key for
/// that source accepts third-party delegations.
const SOURCE_ACCEPTS_INDEX: TableDefinition<&str, &str> =
    TableDefinition::new("source_accepts_delegations");

/// Local persistent store for the DNS delegation subsystem.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Database>,
}

fn record_key(domain: &str, kind: DelegatedRecordKind) -> String {
    format!("{}:{}", domain.to_lowercase().trim_end_matches('.'), kind)
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(DELEGATED_TABLE)?;
            let _ = write_txn.open_table(KEYS_TABLE)?;
            let _ = write_txn.open_table(SOURCE_ACCEPTS_INDEX)?;
        }
        write_txn.commit()?;

        Ok(Self {
            inner: Arc::new(db),
        })
    }

    // --- Delegated records ---

    /// Insert or replace the record set for `(domain, kind)`.
    pub fn upsert_delegated(&self, record: &DelegatedRecord) -> Result<()> {
        let key = record_key(&record.domain, record.kind);
        let json = serde_json::to_string(record)?;

        let write_txn = self.inner.begin_write()?;
        {
            let mut table = write_txn.open_table(DELEGATED_TABLE)?;
            table.insert(key.as_str(), json.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Fetch a record set, dropping it if its expiry has passed.
    pub fn get_delegated(
        &self,
        domain: &str,
        kind: DelegatedRecordKind,
    ) -> Result<Option<DelegatedRecord>> {
        let key = record_key(domain, kind);
        let read_txn = self.inner.begin_read()?;
        let table = read_txn.open_table(DELEGATED_TABLE)?;

        match table.get(key.as_str())? {
            Some(v) => {
                let record: DelegatedRecord = serde_json::from_str(v.value())?;
                if record.expires_at <= Utc::now() {
                    return Ok(None);
                }
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub fn remove_delegated(&self, domain: &str, kind: DelegatedRecordKind) -> Result<()> {
        let key = record_key(domain, kind);
        let write_txn = self.inner.begin_write()?;
        {
            let mut table = write_txn.open_table(DELEGATED_TABLE)?;
            table.remove(key.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Delete every delegated record whose `expires_at` is at or before
    /// `now`. Returns the number of purged rows.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let write_txn = self.inner.begin_write()?;
        let count;
        {
            let mut table = write_txn.open_table(DELEGATED_TABLE)?;

            let mut to_delete = Vec::new();
            {
                let iter = table.iter()?;
                for entry in iter {
                    let entry = entry.map_err(|e| Error::Store(e.to_string()))?;
                    let record: DelegatedRecord = serde_json::from_str(entry.1.value())?;
                    if record.expires_at <= now {
                        to_delete.push(entry.0.value().to_string());
                    }
                }
            }

            count = to_delete.len();
            for key in &to_delete {
                table.remove(key.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(count)
    }

    // --- Delegation API keys ---

    /// Register a delegation key, keeping the chain-detection index current.
    pub fn insert_key(&self, token: &str, key: &DelegationKey) -> Result<()> {
        let json = serde_json::to_string(key)?;
        let write_txn = self.inner.begin_write()?;
        {
            let mut keys = write_txn.open_table(KEYS_TABLE)?;
            keys.insert(token, json.as_str())?;

            let mut index = write_txn.open_table(SOURCE_ACCEPTS_INDEX)?;
            if key.active && key.accepts_delegations {
                index.insert(key.source_api_id.as_str(), "1")?;
            } else {
                index.remove(key.source_api_id.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Look up a bearer token. Returns the key only if it is active.
    pub fn validate_key(&self, token: &str) -> Result<Option<DelegationKey>> {
        let read_txn = self.inner.begin_read()?;
        let keys = read_txn.open_table(KEYS_TABLE)?;
        match keys.get(token)? {
            Some(v) => {
                let key: DelegationKey = serde_json::from_str(v.value())?;
                if key.active {
                    Ok(Some(key))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    /// Indexed chain check: does this source API itself accept delegations?
    pub fn source_accepts_delegations(&self, source_api_id: &str) -> Result<bool> {
        let read_txn = self.inner.begin_read()?;
        let index = read_txn.open_table(SOURCE_ACCEPTS_INDEX)?;
        Ok(index.get(source_api_id)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn test_store() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("test.redb")).unwrap();
        (store, dir)
    }

    fn record(domain: &str, expires_in: Duration) -> DelegatedRecord {
        DelegatedRecord {
            domain: domain.to_string(),
            kind: DelegatedRecordKind::A,
            records: vec!["203.0.113.5".to_string()],
            ttl_seconds: 60,
            source_api_id: "api-eu-1".to_string(),
            api_key_id: Uuid::new_v4(),
            organization_id: "org-A".to_string(),
            expires_at: Utc::now() + expires_in,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_upsert_replaces() {
        let (store, _dir) = test_store();

        let mut rec = record("box.my.example.com", Duration::hours(1));
        store.upsert_delegated(&rec).unwrap();

        rec.records = vec!["203.0.113.9".to_string()];
        store.upsert_delegated(&rec).unwrap();

        let found = store
            .get_delegated("box.my.example.com", DelegatedRecordKind::A)
            .unwrap()
            .unwrap();
        assert_eq!(found.records, vec!["203.0.113.9"]);
    }

    #[test]
    fn test_expired_record_not_returned() {
        let (store, _dir) = test_store();
        store
            .upsert_delegated(&record("old.my.example.com", Duration::seconds(-5)))
            .unwrap();
        assert!(store
            .get_delegated("old.my.example.com", DelegatedRecordKind::A)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_purge_expired() {
        let (store, _dir) = test_store();
        store
            .upsert_delegated(&record("live.my.example.com", Duration::hours(1)))
            .unwrap();
        store
            .upsert_delegated(&record("dead.my.example.com", Duration::seconds(-5)))
            .unwrap();

        let purged = store.purge_expired(Utc::now()).unwrap();
        assert_eq!(purged, 1);
        assert!(store
            .get_delegated("live.my.example.com", DelegatedRecordKind::A)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_key_validation_and_chain_index() {
        let (store, _dir) = test_store();

        let plain = DelegationKey {
            id: Uuid::new_v4(),
            organization_id: "org-A".to_string(),
            source_api_id: "api-eu-1".to_string(),
            accepts_delegations: false,
            active: true,
            created_at: Utc::now(),
        };
        let chaining = DelegationKey {
            id: Uuid::new_v4(),
            organization_id: "org-B".to_string(),
            source_api_id: "api-us-1".to_string(),
            accepts_delegations: true,
            active: true,
            created_at: Utc::now(),
        };
        store.insert_key("token-plain", &plain).unwrap();
        store.insert_key("token-chain", &chaining).unwrap();

        assert!(store.validate_key("token-plain").unwrap().is_some());
        assert!(store.validate_key("unknown").unwrap().is_none());

        assert!(!store.source_accepts_delegations("api-eu-1").unwrap());
        assert!(store.source_accepts_delegations("api-us-1").unwrap());

        // Deactivating the key clears the index entry.
        let mut revoked = chaining.clone();
        revoked.active = false;
        store.insert_key("token-chain", &revoked).unwrap();
        assert!(store.validate_key("token-chain").unwrap().is_none());
        assert!(!store.source_accepts_delegations("api-us-1").unwrap());
    }
}
