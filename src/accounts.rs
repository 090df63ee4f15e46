//! Account state over the versioned tree.
//!
//! Keys are an entity-kind byte followed by the 32-byte account id; values
//! are little-endian u64s. Readers take snapshots that never block writers;
//! mutations happen on a private snapshot which is installed atomically by
//! `commit`, which also persists the leaf delta under the `accounts/` KV
//! prefix so a restart resumes from the committed state.

use parking_lot::RwLock;

use crate::avl::Tree;
use crate::store::{Kv, StoreError, ACCOUNTS_PREFIX};
use crate::{AccountId, Checksum};

/// Entity kinds within the account keyspace.
pub const KIND_BALANCE: u8 = 0x01;
pub const KIND_STAKE: u8 = 0x02;
pub const KIND_REWARD: u8 = 0x03;
pub const KIND_GAS_BALANCE: u8 = 0x04;
pub const KIND_NUM_PAGES: u8 = 0x05;

fn state_key(kind: u8, id: &AccountId) -> [u8; 33] {
    let mut key = [0u8; 33];
    key[0] = kind;
    key[1..].copy_from_slice(id);
    key
}

fn read_u64(tree: &Tree, kind: u8, id: &AccountId) -> u64 {
    tree.get(&state_key(kind, id))
        .and_then(|v| v.try_into().ok().map(u64::from_le_bytes))
        .unwrap_or(0)
}

fn write_u64(tree: &mut Tree, kind: u8, id: &AccountId, value: u64) {
    tree.insert(&state_key(kind, id), &value.to_le_bytes());
}

pub fn read_balance(tree: &Tree, id: &AccountId) -> u64 {
    read_u64(tree, KIND_BALANCE, id)
}

pub fn write_balance(tree: &mut Tree, id: &AccountId, value: u64) {
    write_u64(tree, KIND_BALANCE, id, value);
}

pub fn read_stake(tree: &Tree, id: &AccountId) -> u64 {
    read_u64(tree, KIND_STAKE, id)
}

pub fn write_stake(tree: &mut Tree, id: &AccountId, value: u64) {
    write_u64(tree, KIND_STAKE, id, value);
}

pub fn read_reward(tree: &Tree, id: &AccountId) -> u64 {
    read_u64(tree, KIND_REWARD, id)
}

pub fn write_reward(tree: &mut Tree, id: &AccountId, value: u64) {
    write_u64(tree, KIND_REWARD, id, value);
}

pub fn read_gas_balance(tree: &Tree, id: &AccountId) -> u64 {
    read_u64(tree, KIND_GAS_BALANCE, id)
}

pub fn write_gas_balance(tree: &mut Tree, id: &AccountId, value: u64) {
    write_u64(tree, KIND_GAS_BALANCE, id, value);
}

pub fn read_num_pages(tree: &Tree, id: &AccountId) -> u64 {
    read_u64(tree, KIND_NUM_PAGES, id)
}

/// The live account state plus its persistence.
pub struct Accounts {
    kv: std::sync::Arc<dyn Kv>,
    tree: RwLock<Tree>,
    /// Version up to which leaves have been written to the KV store. `None`
    /// before the first commit.
    persisted: RwLock<Option<u64>>,
}

impl Accounts {
    /// Open the account state, reloading any persisted leaves.
    pub fn new(kv: std::sync::Arc<dyn Kv>) -> Result<Self, StoreError> {
        let mut tree = Tree::new();
        let mut max_version = None;

        for (key, value) in kv.scan_prefix(ACCOUNTS_PREFIX)? {
            let leaf_key = &key[ACCOUNTS_PREFIX.len()..];
            if value.len() < 8 {
                return Err(StoreError::Corrupt(format!(
                    "account leaf {} too short",
                    hex::encode(leaf_key)
                )));
            }
            let version = u64::from_be_bytes(value[..8].try_into().expect("8 bytes"));
            tree.set_version(version);
            tree.insert(leaf_key, &value[8..]);
            max_version = Some(max_version.map_or(version, |m: u64| m.max(version)));
        }
        tree.set_version(max_version.unwrap_or(0));

        Ok(Accounts {
            kv,
            tree: RwLock::new(tree),
            persisted: RwLock::new(max_version),
        })
    }

    /// An immutable view of the current state. Cheap; never blocks writers
    /// for longer than the clone.
    pub fn snapshot(&self) -> Tree {
        self.tree.read().clone()
    }

    pub fn checksum(&self) -> Checksum {
        self.tree.read().checksum()
    }

    pub fn version(&self) -> u64 {
        self.tree.read().version()
    }

    /// Install `snapshot` as the live state (or re-commit the live state when
    /// `None`), persisting the leaf delta since the last commit.
    pub fn commit(&self, snapshot: Option<Tree>) -> Result<(), StoreError> {
        let mut guard = self.tree.write();
        let next = snapshot.unwrap_or_else(|| guard.clone());
        let persisted = *self.persisted.read();

        let mut pending: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut record = |key: &[u8], value: &[u8], version: u64| {
            let mut full_key = Vec::with_capacity(ACCOUNTS_PREFIX.len() + key.len());
            full_key.extend_from_slice(ACCOUNTS_PREFIX);
            full_key.extend_from_slice(key);
            let mut stored = Vec::with_capacity(8 + value.len());
            stored.extend_from_slice(&version.to_be_bytes());
            stored.extend_from_slice(value);
            pending.push((full_key, stored));
        };
        match persisted {
            None => next.for_each(&mut record),
            Some(since) => next.for_each_changed(since, &mut record),
        }

        for (key, value) in pending {
            self.kv.put(&key, &value)?;
        }
        for (key, _) in next.tombstones_since(persisted.unwrap_or(0)) {
            let mut full_key = Vec::with_capacity(ACCOUNTS_PREFIX.len() + key.len());
            full_key.extend_from_slice(ACCOUNTS_PREFIX);
            full_key.extend_from_slice(&key);
            self.kv.delete(&full_key)?;
        }
        self.kv.flush()?;

        *self.persisted.write() = Some(next.version());
        *guard = next;
        Ok(())
    }
}

/// Emit structured account-change events for every leaf written after
/// `since`. Runs against the freshly committed snapshot after finalization.
pub fn log_changes(snapshot: &Tree, since: u64) {
    snapshot.iterate_leaf_diff(since, |key, value| {
        if key.len() != 33 || value.len() != 8 {
            return;
        }
        let account = hex::encode(&key[1..]);
        let value = u64::from_le_bytes(value.try_into().expect("8 bytes"));
        match key[0] {
            KIND_BALANCE => {
                tracing::info!(target: "accounts", account_id = %account, balance = value, "balance updated")
            }
            KIND_STAKE => {
                tracing::info!(target: "accounts", account_id = %account, stake = value, "stake updated")
            }
            KIND_REWARD => {
                tracing::info!(target: "accounts", account_id = %account, reward = value, "reward updated")
            }
            KIND_GAS_BALANCE => {
                tracing::info!(target: "accounts", account_id = %account, gas_balance = value, "gas balance updated")
            }
            KIND_NUM_PAGES => {
                tracing::info!(target: "accounts", account_id = %account, num_pages = value, "num pages updated")
            }
            _ => {}
        }
    });
}
