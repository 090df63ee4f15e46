//! Transaction mempool: the three disjoint sets behind consensus.
//!
//! - *proposable* — signature-checked transactions not yet inside any
//!   finalized block, held in a view sorted by logical index relative to the
//!   latest block so every node proposes the same prefix;
//! - *finalized* — transactions included in a persisted block, retained for
//!   the pruning window so peers can still validate recent proposals;
//! - *missing* — ids referenced by a peer's proposal that are not locally
//!   stored yet, pulled by the background loop.
//!
//! Reshuffling on every finalized block recomputes the sort view against the
//! new block id and drops anything that has fallen out of the pruning window.

use std::collections::{BTreeSet, HashMap};

use crate::block::Block;
use crate::constants::PROPOSAL_LIMIT;
use crate::transaction::Transaction;
use crate::TransactionId;

/// Errors from mempool lookups.
#[derive(Clone, Debug, thiserror::Error)]
pub enum MempoolError {
    #[error("missing transaction {}", hex::encode(.0))]
    Missing(TransactionId),
}

struct Entry {
    tx: Transaction,
    finalized: bool,
}

/// The transaction pool. Externally synchronized (the ledger wraps it in a
/// coarse rw-lock).
pub struct Mempool {
    latest: Block,
    pruning_limit: u64,
    entries: HashMap<TransactionId, Entry>,
    /// Proposable ids ordered by (logical index under `latest.id`, id).
    proposable: BTreeSet<(u64, TransactionId)>,
    /// Missing ids with the chain height they were first referenced at.
    missing: HashMap<TransactionId, u64>,
}

impl Mempool {
    pub fn new(latest: Block, pruning_limit: u64) -> Self {
        Mempool {
            latest,
            pruning_limit,
            entries: HashMap::new(),
            proposable: BTreeSet::new(),
            missing: HashMap::new(),
        }
    }

    /// Insert transactions, optionally verifying signatures. Stale
    /// transactions (outside the pruning window) and known ids are skipped.
    /// Returns the ids actually added, for membership-filter maintenance.
    pub fn batch_add(&mut self, txs: Vec<Transaction>, verify_signature: bool) -> Vec<TransactionId> {
        let mut added = Vec::with_capacity(txs.len());
        for tx in txs {
            if self.entries.contains_key(&tx.id) {
                continue;
            }
            if self.latest.index >= tx.block.saturating_add(self.pruning_limit) {
                continue; // would be pruned immediately
            }
            if verify_signature && !tx.verify_signature() {
                tracing::warn!(target: "tx", tx_id = %hex::encode(tx.id), "bad signature");
                continue;
            }

            self.missing.remove(&tx.id);
            self.proposable.insert((tx.logical_index(&self.latest.id), tx.id));
            added.push(tx.id);
            self.entries.insert(tx.id, Entry { tx, finalized: false });
        }
        added
    }

    /// Insert already-finalized transaction bodies (the startup reload path).
    pub fn batch_add_finalized(&mut self, txs: Vec<Transaction>) -> Vec<TransactionId> {
        let mut added = Vec::with_capacity(txs.len());
        for tx in txs {
            if self.entries.contains_key(&tx.id) {
                continue;
            }
            self.missing.remove(&tx.id);
            added.push(tx.id);
            self.entries.insert(tx.id, Entry { tx, finalized: true });
        }
        added
    }

    /// The deterministic proposal prefix: the first quarter of the sorted
    /// proposable view, hard-capped.
    pub fn proposable_ids(&self) -> Vec<TransactionId> {
        let len = self.proposable.len();
        if len == 0 {
            return Vec::new();
        }
        let take = (len / 4).max(1).min(PROPOSAL_LIMIT);
        self.proposable.iter().take(take).map(|(_, id)| *id).collect()
    }

    /// Ids referenced by validated peer proposals but not locally stored.
    pub fn missing_ids(&self) -> Vec<TransactionId> {
        self.missing.keys().copied().collect()
    }

    /// Record any of `ids` that are not locally held as missing. Returns
    /// whether at least one was missing.
    pub fn batch_mark_missing(&mut self, ids: &[TransactionId]) -> bool {
        let mut any = false;
        for id in ids {
            if !self.entries.contains_key(id) {
                self.missing.entry(*id).or_insert(self.latest.index + 1);
                any = true;
            }
        }
        any
    }

    /// Move ids from proposable to finalized.
    pub fn batch_mark_finalized(&mut self, ids: &[TransactionId]) {
        for id in ids {
            self.missing.remove(id);
            if let Some(entry) = self.entries.get_mut(id) {
                if !entry.finalized {
                    entry.finalized = true;
                    let key = (entry.tx.logical_index(&self.latest.id), *id);
                    self.proposable.remove(&key);
                }
            }
        }
    }

    /// After `next` is finalized: drop everything older than the pruning
    /// window, re-sort the proposable view under the new block id, and return
    /// the pruned ids so the caller can update the membership filter.
    pub fn reshuffle_pending(&mut self, next: Block) -> Vec<TransactionId> {
        let pruned: Vec<TransactionId> = self
            .entries
            .iter()
            .filter(|(_, entry)| next.index >= entry.tx.block.saturating_add(self.pruning_limit))
            .map(|(id, _)| *id)
            .collect();
        for id in &pruned {
            self.entries.remove(id);
        }
        self.missing
            .retain(|_, height| next.index < height.saturating_add(self.pruning_limit));

        self.proposable = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.finalized)
            .map(|(id, entry)| (entry.tx.logical_index(&next.id), *id))
            .collect();
        self.latest = next;

        pruned
    }

    pub fn get(&self, id: &TransactionId) -> Option<&Transaction> {
        self.entries.get(id).map(|entry| &entry.tx)
    }

    pub fn has(&self, id: &TransactionId) -> bool {
        self.entries.contains_key(id)
    }

    /// Look up a batch of ids, failing on the first absent one.
    pub fn batch_find(&self, ids: &[TransactionId]) -> Result<Vec<Transaction>, MempoolError> {
        let mut txs = Vec::with_capacity(ids.len());
        for id in ids {
            match self.entries.get(id) {
                Some(entry) => txs.push(entry.tx.clone()),
                None => return Err(MempoolError::Missing(*id)),
            }
        }
        Ok(txs)
    }

    /// Every known (non-pruned) transaction id; drives filter rebuilds.
    pub fn ids(&self) -> impl Iterator<Item = &TransactionId> {
        self.entries.keys()
    }

    /// Every known transaction body; drives mempool-sync delta computation.
    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.entries.values().map(|entry| &entry.tx)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn proposable_len(&self) -> usize {
        self.proposable.len()
    }

    pub fn latest(&self) -> &Block {
        &self.latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::testutil::{keypair, nop};

    fn genesis() -> Block {
        Block::new(0, [0u8; 32], vec![])
    }

    fn pool() -> Mempool {
        Mempool::new(genesis(), 30)
    }

    fn sample_txs(n: u64) -> Vec<Transaction> {
        let key = keypair(1);
        (0..n).map(|nonce| nop(&key, nonce, 0)).collect()
    }

    #[test]
    fn add_and_lookup() {
        let mut pool = pool();
        let txs = sample_txs(3);
        let ids: Vec<TransactionId> = txs.iter().map(|tx| tx.id).collect();

        let added = pool.batch_add(txs.clone(), true);
        assert_eq!(added.len(), 3);
        assert_eq!(pool.len(), 3);
        for id in &ids {
            assert!(pool.has(id));
        }
        assert_eq!(pool.batch_find(&ids).unwrap().len(), 3);

        // Duplicates are no-ops.
        let added = pool.batch_add(txs, true);
        assert!(added.is_empty());
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn add_rejects_bad_signature_when_verifying() {
        let mut pool = pool();
        let mut tx = sample_txs(1).remove(0);
        tx.sender_signature = [0u8; 64];

        assert!(pool.batch_add(vec![tx.clone()], true).is_empty());
        assert_eq!(pool.batch_add(vec![tx], false).len(), 1);
    }

    #[test]
    fn proposable_order_is_deterministic() {
        let txs = sample_txs(16);

        let mut a = pool();
        a.batch_add(txs.clone(), false);
        let mut reversed = txs.clone();
        reversed.reverse();
        let mut b = pool();
        b.batch_add(reversed, false);

        // Insertion order does not matter; both nodes propose the same prefix.
        assert_eq!(a.proposable_ids(), b.proposable_ids());
        // A quarter of 16.
        assert_eq!(a.proposable_ids().len(), 4);

        // And the prefix is sorted by logical index under the latest block.
        let ids = a.proposable_ids();
        let indices: Vec<u64> = ids
            .iter()
            .map(|id| a.get(id).unwrap().logical_index(&genesis().id))
            .collect();
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        assert_eq!(indices, sorted);
    }

    #[test]
    fn small_pools_still_propose() {
        let mut pool = pool();
        pool.batch_add(sample_txs(2), false);
        assert_eq!(pool.proposable_ids().len(), 1);
    }

    #[test]
    fn mark_missing_and_resolve() {
        let mut pool = pool();
        let txs = sample_txs(2);
        let known = txs[0].clone();
        let unknown_id = txs[1].id;
        pool.batch_add(vec![known], false);

        assert!(pool.batch_mark_missing(&[txs[0].id, unknown_id]));
        assert_eq!(pool.missing_ids(), vec![unknown_id]);

        // Nothing missing among known ids.
        assert!(!pool.batch_mark_missing(&[txs[0].id]));

        // Adding the body resolves the missing entry.
        pool.batch_add(vec![txs[1].clone()], false);
        assert!(pool.missing_ids().is_empty());
    }

    #[test]
    fn mark_finalized_removes_from_proposable() {
        let mut pool = pool();
        let txs = sample_txs(4);
        let ids: Vec<TransactionId> = txs.iter().map(|tx| tx.id).collect();
        pool.batch_add(txs, false);
        assert_eq!(pool.proposable_len(), 4);

        pool.batch_mark_finalized(&ids[..2]);
        assert_eq!(pool.proposable_len(), 2);
        assert_eq!(pool.len(), 4); // bodies retained
        for id in &ids[..2] {
            assert!(!pool.proposable_ids().contains(id));
        }
    }

    #[test]
    fn reshuffle_prunes_old_transactions() {
        let mut pool = Mempool::new(genesis(), 5);
        let key = keypair(2);
        let old = nop(&key, 0, 0); // observed at block 0
        let fresh = nop(&key, 1, 8); // observed at block 8
        pool.batch_add(vec![old.clone()], false);

        // Window still open: nothing pruned.
        let next = Block::new(4, [1u8; 32], vec![]);
        assert!(pool.reshuffle_pending(next).is_empty());

        pool.batch_add(vec![fresh.clone()], false);

        // Block 5 closes the window on `old` (0 + 5 <= 5).
        let next = Block::new(5, [2u8; 32], vec![]);
        let pruned = pool.reshuffle_pending(next);
        assert_eq!(pruned, vec![old.id]);
        assert!(!pool.has(&old.id));
        assert!(pool.has(&fresh.id));
        assert_eq!(pool.proposable_len(), 1);
    }

    #[test]
    fn reshuffle_prunes_stale_missing_entries() {
        let mut pool = Mempool::new(genesis(), 5);
        let ghost = [9u8; 32];
        pool.batch_mark_missing(&[ghost]); // recorded at height 1
        assert_eq!(pool.missing_ids().len(), 1);

        let next = Block::new(6, [1u8; 32], vec![]);
        pool.reshuffle_pending(next);
        assert!(pool.missing_ids().is_empty());
    }

    #[test]
    fn reshuffle_reorders_under_new_block_id() {
        let mut pool = pool();
        pool.batch_add(sample_txs(8), false);
        let before = pool.proposable_ids();

        let next = Block::new(1, [7u8; 32], vec![[1u8; 32]]);
        let next_id = next.id;
        pool.reshuffle_pending(next);
        let after = pool.proposable_ids();

        // Same population, freshly sorted under the new base block.
        assert_eq!(before.len(), after.len());
        let indices: Vec<u64> = after
            .iter()
            .map(|id| pool.get(id).unwrap().logical_index(&next_id))
            .collect();
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        assert_eq!(indices, sorted);
    }

    #[test]
    fn batch_find_reports_first_missing() {
        let mut pool = pool();
        let txs = sample_txs(1);
        pool.batch_add(txs.clone(), false);
        let ghost = [3u8; 32];
        match pool.batch_find(&[txs[0].id, ghost]) {
            Err(MempoolError::Missing(id)) => assert_eq!(id, ghost),
            other => panic!("expected Missing, got {other:?}"),
        }
    }

    #[test]
    fn stale_transactions_are_not_added() {
        let latest = Block::new(40, [0u8; 32], vec![]);
        let mut pool = Mempool::new(latest, 30);
        let key = keypair(3);
        let stale = nop(&key, 0, 1); // 40 >= 1 + 30
        let live = nop(&key, 1, 39);
        assert!(pool.batch_add(vec![stale], false).is_empty());
        assert_eq!(pool.batch_add(vec![live], false).len(), 1);
    }
}
