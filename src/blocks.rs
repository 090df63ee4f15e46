//! Sliding-window block store.
//!
//! Keeps the most recent `pruning_limit` finalized blocks in memory and in
//! the KV store; saving a block past the window evicts the oldest one and
//! hands it back so the caller can garbage-collect its transaction bodies.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::block::Block;
use crate::store::{Kv, StoreError, BLOCKS_LATEST_KEY, BLOCKS_PREFIX};

fn block_key(index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(BLOCKS_PREFIX.len() + 8);
    key.extend_from_slice(BLOCKS_PREFIX);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

/// Append-only chain of finalized blocks with bounded retention.
pub struct BlockStore {
    kv: Arc<dyn Kv>,
    pruning_limit: u64,
    window: RwLock<VecDeque<Block>>,
}

impl BlockStore {
    /// Open the store, reloading the retained window from disk.
    pub fn open(kv: Arc<dyn Kv>, pruning_limit: u64) -> Result<Self, StoreError> {
        let mut window = VecDeque::new();

        if let Some(bytes) = kv.get(BLOCKS_LATEST_KEY)? {
            let latest = u64::from_be_bytes(
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Corrupt("blocks/latest".into()))?,
            );
            let oldest = latest.saturating_sub(pruning_limit.saturating_sub(1));
            for index in oldest..=latest {
                if let Some(body) = kv.get(&block_key(index))? {
                    let block = Block::unmarshal(&body)
                        .map_err(|e| StoreError::Corrupt(format!("block {index}: {e}")))?;
                    window.push_back(block);
                }
            }
        }

        Ok(BlockStore {
            kv,
            pruning_limit,
            window: RwLock::new(window),
        })
    }

    /// Persist a block as the new tip. Returns the block that fell out of the
    /// retention window, if any.
    pub fn save(&self, block: &Block) -> Result<Option<Block>, StoreError> {
        self.kv.put(&block_key(block.index), &block.marshal())?;
        self.kv.put(BLOCKS_LATEST_KEY, &block.index.to_be_bytes())?;

        let mut window = self.window.write();
        window.push_back(block.clone());

        let mut evicted = None;
        if window.len() as u64 > self.pruning_limit {
            if let Some(old) = window.pop_front() {
                self.kv.delete(&block_key(old.index))?;
                evicted = Some(old);
            }
        }
        Ok(evicted)
    }

    /// The most recently finalized block, `None` before genesis is saved.
    pub fn latest(&self) -> Option<Block> {
        self.window.read().back().cloned()
    }

    /// Look up a block by index within the retention window.
    pub fn get_by_index(&self, index: u64) -> Result<Option<Block>, StoreError> {
        if let Some(block) = self.window.read().iter().find(|b| b.index == index) {
            return Ok(Some(block.clone()));
        }
        match self.kv.get(&block_key(index))? {
            Some(body) => Ok(Some(Block::unmarshal(&body).map_err(|e| {
                StoreError::Corrupt(format!("block {index}: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    /// Clone of the retained window, oldest first.
    pub fn clone_window(&self) -> Vec<Block> {
        self.window.read().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemKv;

    fn block(index: u64) -> Block {
        Block::new(index, [index as u8; 32], vec![[index as u8; 32]])
    }

    fn store(limit: u64) -> BlockStore {
        BlockStore::open(Arc::new(MemKv::new()), limit).unwrap()
    }

    #[test]
    fn empty_store_has_no_latest() {
        let store = store(5);
        assert!(store.latest().is_none());
        assert!(store.get_by_index(0).unwrap().is_none());
    }

    #[test]
    fn save_and_latest() {
        let store = store(5);
        for index in 0..3 {
            assert!(store.save(&block(index)).unwrap().is_none());
        }
        assert_eq!(store.latest().unwrap().index, 2);
        assert_eq!(store.get_by_index(1).unwrap().unwrap(), block(1));
        assert_eq!(store.clone_window().len(), 3);
    }

    #[test]
    fn eviction_outside_window() {
        let store = store(5);
        for index in 0..=10 {
            let evicted = store.save(&block(index)).unwrap();
            if index < 5 {
                assert!(evicted.is_none());
            } else {
                assert_eq!(evicted.unwrap().index, index - 5);
            }
        }
        // Window now holds 6..=10; earlier blocks are gone from disk too.
        for index in 0..=5 {
            assert!(store.get_by_index(index).unwrap().is_none());
        }
        for index in 6..=10 {
            assert!(store.get_by_index(index).unwrap().is_some());
        }
    }

    #[test]
    fn reload_restores_window() {
        let kv = Arc::new(MemKv::new());
        {
            let store = BlockStore::open(kv.clone(), 3).unwrap();
            for index in 0..6 {
                store.save(&block(index)).unwrap();
            }
        }
        let store = BlockStore::open(kv, 3).unwrap();
        assert_eq!(store.latest().unwrap().index, 5);
        assert_eq!(store.clone_window().len(), 3);
        assert!(store.get_by_index(2).unwrap().is_none());
        assert_eq!(store.get_by_index(3).unwrap().unwrap(), block(3));
    }
}
