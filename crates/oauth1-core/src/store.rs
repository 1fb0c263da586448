//! ============================================================================
//! Credential Store - Persistent access tokens (redb)
//! ============================================================================
//! One record per API name, bincode-encoded.
//! Default path: ~/.oauth1/credentials.redb (override via OAUTH1_CREDENTIALS_PATH)
//! ============================================================================

use anyhow::{anyhow, Result};
use redb::{Database, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::types::{Credentials, TokenPair};

const CREDENTIALS: TableDefinition<&str, &[u8]> = TableDefinition::new("credentials");

/// Stored credentials for one API
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub api_name: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub access_token: String,
    pub access_secret: String,
    pub screen_name: String,
    pub user_id: String,
    pub user_id_encoded: String,
    pub user_password: String,
    pub user_password_encoded: String,
    /// Unix seconds
    pub saved_at: i64,
}

impl CredentialRecord {
    /// Snapshot authorized credentials; None if there is no access pair
    pub fn from_credentials(api_name: &str, creds: &Credentials) -> Option<Self> {
        let access = creds.access.as_ref()?;
        Some(Self {
            api_name: api_name.to_string(),
            consumer_key: creds.consumer_key.clone(),
            consumer_secret: creds.consumer_secret.clone(),
            access_token: access.token.clone(),
            access_secret: access.secret.clone(),
            screen_name: creds.screen_name.clone(),
            user_id: creds.user_id.clone(),
            user_id_encoded: creds.encoded_user_id.clone(),
            user_password: creds.user_password.clone(),
            user_password_encoded: creds.encoded_user_password.clone(),
            saved_at: chrono::Utc::now().timestamp(),
        })
    }

    pub fn access_pair(&self) -> Option<TokenPair> {
        TokenPair::new(self.access_token.clone(), self.access_secret.clone())
    }

    /// Copy the stored token and identity into `creds`
    pub fn apply_to(&self, creds: &mut Credentials) {
        creds.access = self.access_pair();
        creds.screen_name = self.screen_name.clone();
        creds.user_id = self.user_id.clone();
        creds.encoded_user_id = self.user_id_encoded.clone();
        creds.user_password = self.user_password.clone();
        creds.encoded_user_password = self.user_password_encoded.clone();
    }
}

/// Persistence for credential records
pub trait CredentialStore: Send + Sync {
    fn load(&self, api_name: &str) -> Result<Option<CredentialRecord>>;

    fn save(&self, record: &CredentialRecord) -> Result<()>;

    /// Returns whether a record was removed
    fn delete(&self, api_name: &str) -> Result<bool>;
}

/// Load a record and keep it only if it belongs to this consumer and
/// carries a full access pair
pub fn load_validated(
    store: &dyn CredentialStore,
    api_name: &str,
    consumer_key: &str,
    consumer_secret: &str,
) -> Result<Option<CredentialRecord>> {
    let record = match store.load(api_name)? {
        Some(record) => record,
        None => {
            debug!("No stored credentials for {}", api_name);
            return Ok(None);
        }
    };

    if record.consumer_key != consumer_key || record.consumer_secret != consumer_secret {
        warn!(
            "Stored credentials for {} belong to a different consumer key/secret; ignoring",
            api_name
        );
        return Ok(None);
    }
    if record.access_pair().is_none() {
        warn!("Stored credentials for {} have no access token; ignoring", api_name);
        return Ok(None);
    }

    Ok(Some(record))
}

/// redb-backed credential store
pub struct RedbCredentialStore {
    db: Database,
    path: PathBuf,
}

impl RedbCredentialStore {
    /// Open (or create) the database at the given path.
    /// If `path` is None, uses OAUTH1_CREDENTIALS_PATH or ~/.oauth1/credentials.redb
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let db_path = if let Some(p) = path {
            p.to_path_buf()
        } else if let Ok(env_path) = std::env::var("OAUTH1_CREDENTIALS_PATH") {
            PathBuf::from(env_path)
        } else {
            let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
            home.join(".oauth1").join("credentials.redb")
        };

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow!("Failed to create {}: {}", parent.display(), e))?;
        }

        info!("Opening credential store at: {}", db_path.display());

        let db = Database::create(&db_path)
            .map_err(|e| anyhow!("Failed to open credential store: {}", e))?;

        let write_txn = db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let _ = write_txn
                .open_table(CREDENTIALS)
                .map_err(|e| anyhow!("Failed to create credentials table: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit init: {}", e))?;

        Ok(Self { db, path: db_path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every stored record
    pub fn list(&self) -> Result<Vec<CredentialRecord>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(CREDENTIALS)
            .map_err(|e| anyhow!("Failed to open credentials table: {}", e))?;

        let mut results = Vec::new();
        let iter = table.range::<&str>(..)
            .map_err(|e| anyhow!("Failed to iterate credentials: {}", e))?;
        for entry in iter {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            let record: CredentialRecord = bincode::deserialize(value.value())
                .map_err(|e| anyhow!("Failed to deserialize credentials: {}", e))?;
            results.push(record);
        }
        Ok(results)
    }
}

impl CredentialStore for RedbCredentialStore {
    fn load(&self, api_name: &str) -> Result<Option<CredentialRecord>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(CREDENTIALS)
            .map_err(|e| anyhow!("Failed to open credentials table: {}", e))?;

        match table.get(api_name).map_err(|e| anyhow!("Failed to get credentials: {}", e))? {
            Some(value) => {
                let record: CredentialRecord = bincode::deserialize(value.value())
                    .map_err(|e| anyhow!("Failed to deserialize credentials: {}", e))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn save(&self, record: &CredentialRecord) -> Result<()> {
        let value = bincode::serialize(record)
            .map_err(|e| anyhow!("Failed to serialize credentials: {}", e))?;

        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn.open_table(CREDENTIALS)
                .map_err(|e| anyhow!("Failed to open credentials table: {}", e))?;
            table.insert(record.api_name.as_str(), value.as_slice())
                .map_err(|e| anyhow!("Failed to insert credentials: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Stored credentials for {}", record.api_name);
        Ok(())
    }

    fn delete(&self, api_name: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let removed;
        {
            let mut table = write_txn.open_table(CREDENTIALS)
                .map_err(|e| anyhow!("Failed to open credentials table: {}", e))?;
            removed = table.remove(api_name)
                .map_err(|e| anyhow!("Failed to remove credentials: {}", e))?
                .is_some();
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit delete: {}", e))?;

        if removed {
            debug!("Deleted credentials for {}", api_name);
        }
        Ok(removed)
    }
}

/// Process-local store, for tests and hosts without a disk
#[derive(Default)]
pub struct MemoryCredentialStore {
    records: Mutex<HashMap<String, CredentialRecord>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, CredentialRecord>>> {
        self.records
            .lock()
            .map_err(|e| anyhow!("Credential store lock poisoned: {}", e))
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self, api_name: &str) -> Result<Option<CredentialRecord>> {
        Ok(self.records()?.get(api_name).cloned())
    }

    fn save(&self, record: &CredentialRecord) -> Result<()> {
        self.records()?.insert(record.api_name.clone(), record.clone());
        Ok(())
    }

    fn delete(&self, api_name: &str) -> Result<bool> {
        Ok(self.records()?.remove(api_name).is_some())
    }
}
