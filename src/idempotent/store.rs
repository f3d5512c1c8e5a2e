use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use tracing::{debug, info};

use super::IdempotentRepository;
use super::error::{RepositoryError, Result};

const KEY_PREFIX: &str = "idem:";

/// Encode a repository key: idem:{key}
fn encode_key(key: &str) -> Vec<u8> {
    format!("{}{}", KEY_PREFIX, key).into_bytes()
}

/// Decode a repository key: idem:{key} -> key
fn decode_key(raw: &[u8]) -> Option<String> {
    std::str::from_utf8(raw)
        .ok()?
        .strip_prefix(KEY_PREFIX)
        .map(String::from)
}

/// One recorded key with its confirmation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryEntry {
    pub key: String,
    pub confirmed_at: DateTime<Utc>,
}

/// Fjall-backed idempotent repository
///
/// Layout:
/// - `idempotent` partition: idem:{key} -> confirmation time (i64 millis, big-endian)
///
/// The value carries no semantics beyond presence; the timestamp is kept for
/// inspection from the CLI.
pub struct FjallRepository {
    keyspace: Keyspace,
    keys: PartitionHandle,
    write_guard: Mutex<()>,
}

impl FjallRepository {
    /// Open or create a repository at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening idempotent repository at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;
        let keys = keyspace.open_partition("idempotent", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            keys,
            write_guard: Mutex::new(()),
        })
    }

    fn stamp() -> [u8; 8] {
        Utc::now().timestamp_millis().to_be_bytes()
    }

    fn insert(&self, key: &str) -> Result<()> {
        self.keys.insert(encode_key(key), Self::stamp())?;
        debug!(key, "Recorded idempotent key");
        Ok(())
    }

    /// List recorded keys in key order.
    pub fn entries(&self, limit: usize) -> Result<Vec<RepositoryEntry>> {
        let mut entries = Vec::new();
        for item in self.keys.iter().take(limit) {
            let (raw_key, value) = item?;
            let key = decode_key(&raw_key)
                .ok_or_else(|| RepositoryError::CorruptEntry(String::from_utf8_lossy(&raw_key).into_owned()))?;
            let millis: [u8; 8] = value
                .as_ref()
                .try_into()
                .map_err(|_| RepositoryError::CorruptEntry(key.clone()))?;
            let confirmed_at = DateTime::<Utc>::from_timestamp_millis(i64::from_be_bytes(millis))
                .ok_or_else(|| RepositoryError::CorruptEntry(key.clone()))?;
            entries.push(RepositoryEntry { key, confirmed_at });
        }
        Ok(entries)
    }

    /// Persist all pending writes to disk
    pub fn persist(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }
}

impl IdempotentRepository for FjallRepository {
    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.keys.contains_key(encode_key(key))?)
    }

    fn add(&self, key: &str) -> Result<bool> {
        let _guard = self.write_guard.lock().map_err(|_| RepositoryError::Poisoned)?;
        if self.contains(key)? {
            return Ok(false);
        }
        self.insert(key)?;
        Ok(true)
    }

    fn confirm(&self, key: &str) -> Result<()> {
        let _guard = self.write_guard.lock().map_err(|_| RepositoryError::Poisoned)?;
        if !self.contains(key)? {
            self.insert(key)?;
            // Confirmed keys must survive a crash
            self.keyspace.persist(fjall::PersistMode::SyncData)?;
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let _guard = self.write_guard.lock().map_err(|_| RepositoryError::Poisoned)?;
        let encoded = encode_key(key);
        let present = self.keys.contains_key(&encoded)?;
        if present {
            self.keys.remove(encoded)?;
            debug!(key, "Evicted idempotent key");
        }
        Ok(present)
    }

    fn clear(&self) -> Result<()> {
        let _guard = self.write_guard.lock().map_err(|_| RepositoryError::Poisoned)?;
        let mut raw_keys = Vec::new();
        for item in self.keys.iter() {
            let (raw_key, _) = item?;
            raw_keys.push(raw_key);
        }
        let count = raw_keys.len();
        for raw_key in raw_keys {
            self.keys.remove(raw_key)?;
        }
        info!(count, "Cleared idempotent repository");
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        let mut count = 0;
        for item in self.keys.iter() {
            item?;
            count += 1;
        }
        Ok(count)
    }
}
