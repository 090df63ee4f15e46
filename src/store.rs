//! Key-value persistence seam.
//!
//! The core talks to disk through the narrow `Kv` trait; a sled-backed
//! implementation is used by the node and an in-memory implementation backs
//! tests. Keyspace layout:
//!
//! - `accounts/<kind><account-id>` → `version (u64 BE) ‖ value`
//! - `blocks/<index (u64 BE)>` → marshalled block
//! - `blocks/latest` → latest index (u64 BE)
//! - `tx/<transaction-id>` → marshalled transaction

use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::RwLock;

/// Key prefix for account state leaves.
pub const ACCOUNTS_PREFIX: &[u8] = b"accounts/";
/// Key prefix for finalized block bodies.
pub const BLOCKS_PREFIX: &[u8] = b"blocks/";
/// Key of the latest finalized block index.
pub const BLOCKS_LATEST_KEY: &[u8] = b"blocks/latest";
/// Key prefix for transaction bodies.
pub const TX_PREFIX: &[u8] = b"tx/";

/// Errors from storage operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage i/o error: {0}")]
    Backend(String),
    #[error("stored value is corrupted: {0}")]
    Corrupt(String),
}

/// Trait for persistent key-value backends.
pub trait Kv: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;
    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
    fn flush(&self) -> Result<(), StoreError>;
}

/// sled-backed store.
pub struct SledKv {
    db: sled::Db,
}

impl SledKv {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(SledKv { db })
    }
}

impl Kv for SledKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.db
            .get(key)
            .map(|v| v.map(|ivec| ivec.to_vec()))
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.db
            .insert(key, value)
            .map(|_| ())
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.db
            .remove(key)
            .map(|_| ())
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut out = Vec::new();
        for entry in self.db.scan_prefix(prefix) {
            let (k, v) = entry.map_err(|e| StoreError::Backend(e.to_string()))?;
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map(|_| ())
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

/// In-memory store for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemKv {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Kv for MemKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.map.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.map.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        Ok(self
            .map
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
