//! Collapsing: simulating a block's transactions against a state snapshot.
//!
//! Given a height, the predecessor block, and a batch of transactions, the
//! collapser forks the current state, pins the fork's version to the height,
//! and applies every transaction in logical-index order through the processor
//! registered for its tag. A transaction whose handler errors is recorded as
//! rejected and charged the flat fee when possible — the snapshot still
//! advances past it, which is how peers agree on state even under partial
//! failures.
//!
//! Results are memoized behind one-shot cells keyed by a HighwayHash of the
//! transaction id list, so identical candidates arriving from different
//! peers in the same round collapse exactly once.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::accounts::{read_balance, write_balance, Accounts};
use crate::avl::Tree;
use crate::block::Block;
use crate::constants::{COLLAPSE_CACHE_SIZE, TRANSACTION_FEE};
use crate::processor::{ProcessorContext, ProcessorError, ProcessorRegistry};
use crate::transaction::{Tag, Transaction};
use crate::TransactionId;

/// Why an entire proposal could not be collapsed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CollapseError {
    #[error("missing transaction {}", hex::encode(.0))]
    MissingTransaction(TransactionId),
    #[error("no processor registered for tag {0:?}")]
    UnregisteredTag(Tag),
}

/// The outcome of simulating one proposal.
#[derive(Debug)]
pub struct CollapseResults {
    pub applied: Vec<Transaction>,
    pub rejected: Vec<(Transaction, ProcessorError)>,
    pub applied_count: usize,
    pub rejected_count: usize,
    /// The post-application fork, version pinned to the collapse height.
    pub snapshot: Tree,
}

/// Apply `txs` in logical-index order under `current` to a fresh fork of the
/// account state.
pub fn collapse(
    height: u64,
    current: &Block,
    mut txs: Vec<Transaction>,
    accounts: &Accounts,
    registry: &ProcessorRegistry,
) -> Result<CollapseResults, CollapseError> {
    let mut snapshot = accounts.snapshot();
    snapshot.set_version(height);

    txs.sort_unstable_by_key(|tx| tx.sort_key(&current.id));

    let mut applied = Vec::with_capacity(txs.len());
    let mut rejected = Vec::new();

    for tx in txs {
        let Some(processor) = registry.get(tx.tag) else {
            return Err(CollapseError::UnregisteredTag(tx.tag));
        };
        let mut ctx = ProcessorContext {
            snapshot: &mut snapshot,
            tx: &tx,
            block_index: height,
        };
        match processor(&mut ctx) {
            Ok(()) => applied.push(tx),
            Err(e) => {
                // Rejection still charges the flat fee when the sender can
                // pay it; otherwise it is a pure no-op transition.
                let balance = read_balance(&snapshot, &tx.sender);
                if balance >= TRANSACTION_FEE {
                    write_balance(&mut snapshot, &tx.sender, balance - TRANSACTION_FEE);
                }
                rejected.push((tx, e));
            }
        }
    }

    Ok(CollapseResults {
        applied_count: applied.len(),
        rejected_count: rejected.len(),
        applied,
        rejected,
        snapshot,
    })
}

/// The cache key for a proposal: a HighwayHash of its concatenated ids.
pub fn cache_key(ids: &[TransactionId]) -> u64 {
    let parts: Vec<&[u8]> = ids.iter().map(|id| &id[..]).collect();
    crate::highway64(&parts)
}

type CollapseCell = Arc<OnceCell<Arc<CollapseResults>>>;

/// A small LRU of one-shot collapse cells. Concurrent requests for the same
/// key share a single computation; invalidation is implicit via finalization
/// (new heights produce new keys against the advanced state).
pub struct CollapseCache {
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    map: HashMap<u64, CollapseCell>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl Default for CollapseCache {
    fn default() -> Self {
        Self::with_capacity(COLLAPSE_CACHE_SIZE)
    }
}

impl CollapseCache {
    pub fn with_capacity(capacity: usize) -> Self {
        CollapseCache {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
                capacity,
            }),
        }
    }

    /// Fetch (or create) the one-shot cell for a key, refreshing its LRU
    /// position and evicting the coldest entry past capacity.
    pub fn entry(&self, key: u64) -> CollapseCell {
        let mut inner = self.inner.lock();
        if let Some(cell) = inner.map.get(&key).cloned() {
            inner.order.retain(|k| *k != key);
            inner.order.push_back(key);
            return cell;
        }

        let cell: CollapseCell = Arc::new(OnceCell::new());
        inner.map.insert(key, cell.clone());
        inner.order.push_back(key);
        if inner.map.len() > inner.capacity {
            if let Some(coldest) = inner.order.pop_front() {
                inner.map.remove(&coldest);
            }
        }
        cell
    }
}

/// Emit the collapse summary at finalization time.
pub fn log_results(results: &CollapseResults) {
    tracing::debug!(
        target: "consensus",
        num_applied_tx = results.applied_count,
        num_rejected_tx = results.rejected_count,
        "collapsed transactions"
    );
    for (tx, error) in &results.rejected {
        tracing::debug!(
            target: "consensus",
            tx_id = %hex::encode(tx.id),
            %error,
            "rejected transaction"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{read_stake, write_balance};
    use crate::store::MemKv;
    use crate::transaction::testutil::keypair;
    use crate::AccountId;

    fn accounts_with_balance(id: &AccountId, balance: u64) -> Accounts {
        let accounts = Accounts::new(Arc::new(MemKv::new())).unwrap();
        let mut snapshot = accounts.snapshot();
        write_balance(&mut snapshot, id, balance);
        accounts.commit(Some(snapshot)).unwrap();
        accounts
    }

    fn transfer(key: &ed25519_dalek::SigningKey, nonce: u64, to: &AccountId, amount: u64) -> Transaction {
        let mut payload = to.to_vec();
        payload.extend_from_slice(&amount.to_be_bytes());
        Transaction::new(key, key, nonce, 0, Tag::Transfer, payload, vec![])
    }

    fn genesis() -> Block {
        Block::new(0, [0u8; 32], vec![])
    }

    #[test]
    fn applies_transactions_in_logical_order() {
        let key = keypair(1);
        let sender = key.verifying_key().to_bytes();
        let accounts = accounts_with_balance(&sender, 10_000);

        let txs: Vec<Transaction> = (0..8).map(|n| transfer(&key, n, &[9u8; 32], 10)).collect();
        let registry = ProcessorRegistry::default();
        let results = collapse(1, &genesis(), txs.clone(), &accounts, &registry).unwrap();

        assert_eq!(results.applied_count, 8);
        assert_eq!(results.rejected_count, 0);
        assert_eq!(results.snapshot.version(), 1);

        // Application order is the deterministic sort, not submission order.
        let mut expected = txs;
        expected.sort_unstable_by_key(|tx| tx.sort_key(&genesis().id));
        let applied_ids: Vec<TransactionId> = results.applied.iter().map(|tx| tx.id).collect();
        let expected_ids: Vec<TransactionId> = expected.iter().map(|tx| tx.id).collect();
        assert_eq!(applied_ids, expected_ids);

        assert_eq!(read_balance(&results.snapshot, &[9u8; 32]), 80);
        // The live state is untouched until commit.
        assert_eq!(read_balance(&accounts.snapshot(), &[9u8; 32]), 0);
    }

    #[test]
    fn rejection_advances_snapshot_and_charges_fee() {
        let key = keypair(2);
        let sender = key.verifying_key().to_bytes();
        let accounts = accounts_with_balance(&sender, 150);

        // 100 + fee passes, then the second 100 cannot be covered.
        let txs = vec![
            transfer(&key, 0, &[9u8; 32], 100),
            transfer(&key, 1, &[9u8; 32], 100),
        ];
        let registry = ProcessorRegistry::default();
        let results = collapse(1, &genesis(), txs, &accounts, &registry).unwrap();

        assert_eq!(results.applied_count, 1);
        assert_eq!(results.rejected_count, 1);
        let (_, error) = &results.rejected[0];
        assert!(matches!(error, ProcessorError::InsufficientBalance { .. }));

        // 150 - (100 + fee) - rejection fee
        assert_eq!(
            read_balance(&results.snapshot, &sender),
            150 - 100 - TRANSACTION_FEE - TRANSACTION_FEE
        );
        assert_eq!(read_balance(&results.snapshot, &[9u8; 32]), 100);
    }

    #[test]
    fn missing_processor_is_fatal_for_the_proposal() {
        let key = keypair(3);
        let sender = key.verifying_key().to_bytes();
        let accounts = accounts_with_balance(&sender, 1_000);

        let tx = Transaction::new(&key, &key, 0, 0, Tag::Contract, vec![], vec![]);
        let registry = ProcessorRegistry::default();
        let err = collapse(1, &genesis(), vec![tx], &accounts, &registry).unwrap_err();
        assert_eq!(err, CollapseError::UnregisteredTag(Tag::Contract));
    }

    #[test]
    fn stake_reflected_in_snapshot() {
        let key = keypair(4);
        let sender = key.verifying_key().to_bytes();
        let accounts = accounts_with_balance(&sender, 1_000);

        let mut payload = vec![1u8];
        payload.extend_from_slice(&400u64.to_be_bytes());
        let tx = Transaction::new(&key, &key, 0, 0, Tag::Stake, payload, vec![]);

        let registry = ProcessorRegistry::default();
        let results = collapse(1, &genesis(), vec![tx], &accounts, &registry).unwrap();
        assert_eq!(read_stake(&results.snapshot, &sender), 400);
    }

    #[test]
    fn cache_key_depends_on_id_order() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        assert_eq!(cache_key(&[a, b]), cache_key(&[a, b]));
        assert_ne!(cache_key(&[a, b]), cache_key(&[b, a]));
        assert_ne!(cache_key(&[a]), cache_key(&[a, a]));
    }

    #[test]
    fn cache_runs_computation_once_per_key() {
        let cache = CollapseCache::with_capacity(4);
        let key = keypair(5);
        let sender = key.verifying_key().to_bytes();
        let accounts = accounts_with_balance(&sender, 1_000);
        let registry = ProcessorRegistry::default();

        let tx = transfer(&key, 0, &[9u8; 32], 10);
        let ids = vec![tx.id];

        let mut runs = 0;
        for _ in 0..3 {
            let cell = cache.entry(cache_key(&ids));
            cell.get_or_try_init(|| {
                runs += 1;
                collapse(1, &genesis(), vec![tx.clone()], &accounts, &registry).map(Arc::new)
            })
            .unwrap();
        }
        assert_eq!(runs, 1);
    }

    #[test]
    fn cache_evicts_coldest_entry() {
        let cache = CollapseCache::with_capacity(2);
        let a = cache.entry(1);
        a.set(Arc::new(CollapseResults {
            applied: vec![],
            rejected: vec![],
            applied_count: 0,
            rejected_count: 0,
            snapshot: Tree::new(),
        }))
        .ok();

        cache.entry(2);
        // Touch 1 so 2 becomes the coldest.
        cache.entry(1);
        cache.entry(3); // evicts 2

        assert!(cache.entry(1).get().is_some());
        assert!(cache.entry(2).get().is_none());
    }
}
