//! The ledger core: subsystem owner and block finalization loop.
//!
//! One `Ledger` owns the account state, block store, mempool, membership
//! filter, both Snowball samplers, and the collapse cache. `start` spawns the
//! long-lived tasks: the finalization loop plus the two mempool
//! reconciliation loops (gated by the sync token), the out-of-sync/state-sync
//! loop, and the stall watchdog.
//!
//! One finalization step: with no preferred block, propose one from the
//! mempool; once preferred, query a sample of peers and feed stake-weighted
//! tallies into the finalizer; once decided, commit — re-collapse with
//! logging, prune the mempool, persist the block and its transaction bodies,
//! commit the state fork, and reset the per-round caches.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::accounts::{self, write_balance, write_reward, write_stake, Accounts};
use crate::avl::Tree;
use crate::block::Block;
use crate::blocks::BlockStore;
use crate::collapse::{self, CollapseCache, CollapseError, CollapseResults};
use crate::config::Config;
use crate::constants::QUERY_WORKERS;
use crate::filter::Filter;
use crate::mempool::{Mempool, MempoolError};
use crate::net::rpc::QueryRequest;
use crate::net::{PeerId, PeerSet};
use crate::processor::ProcessorRegistry;
use crate::snowball::Snowball;
use crate::stall::{Delegate, StallConfig, StallDetector};
use crate::store::{Kv, StoreError};
use crate::transaction::{self, Transaction};
use crate::votes::{finalization_tallies, FinalizationVote};
use crate::{AccountId, BlockId, TransactionId};

/// Sync status flags; the node starts out of sync but able to finalize.
pub const SYNC_STATUS_OUT_OF_SYNC: u8 = 0;
pub const SYNC_STATUS_SYNCED: u8 = 1;
pub const SYNC_STATUS_FINALIZED: u8 = 2;
pub const SYNC_STATUS_FULLY_SYNCED: u8 = 3;

/// Errors from constructing a ledger.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid genesis document: {0}")]
    Genesis(String),
}

/// Initial account entry in a genesis document.
#[derive(Debug, Default, serde::Deserialize)]
struct GenesisAccount {
    #[serde(default)]
    balance: u64,
    #[serde(default)]
    stake: u64,
    #[serde(default)]
    reward: u64,
}

/// Per-round scratch owned by the finalization loop; never shared across
/// tasks.
#[derive(Default)]
struct RoundState {
    /// Last block each peer advertised, for the cache-echo in queries.
    peer_block_cache: HashMap<PeerId, Block>,
    /// Candidates already validated this round, to avoid re-collapsing
    /// identical proposals from different peers.
    block_valid_cache: HashSet<BlockId>,
}

/// The ledger core.
pub struct Ledger {
    pub(crate) config: Config,
    kv: Arc<dyn Kv>,

    pub(crate) accounts: Accounts,
    pub(crate) blocks: BlockStore,
    pub(crate) mempool: RwLock<Mempool>,
    pub(crate) filter: RwLock<Filter>,

    pub(crate) finalizer: Mutex<Snowball<Block>>,
    pub(crate) syncer: Mutex<Snowball<bool>>,

    collapse_cache: CollapseCache,
    processors: ProcessorRegistry,

    pub(crate) peers: PeerSet,
    query_permits: Arc<Semaphore>,

    /// Cancelled when out-of-sync is decided; consensus tasks check it at
    /// every loop head. Replaced with a fresh token after sync completes.
    pub(crate) sync_gate: Mutex<CancellationToken>,
    pub(crate) consensus_tasks: Mutex<Vec<JoinHandle<()>>>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,

    status: Mutex<u8>,
    pub(crate) stall: Arc<StallDetector>,
}

impl Ledger {
    /// Open (or bootstrap) a ledger over the given KV store and peer view.
    /// `genesis` is the JSON inception document applied on first boot.
    pub fn new(
        kv: Arc<dyn Kv>,
        peers: PeerSet,
        config: Config,
        genesis: Option<&str>,
    ) -> Result<Arc<Ledger>, LedgerError> {
        let accounts = Accounts::new(kv.clone())?;
        let blocks = BlockStore::open(kv.clone(), config.pruning_limit)?;

        let latest = match blocks.latest() {
            Some(block) => block,
            None => {
                let mut snapshot = accounts.snapshot();
                snapshot.set_version(0);
                if let Some(document) = genesis {
                    perform_inception(&mut snapshot, document)?;
                }
                accounts.commit(Some(snapshot))?;
                let genesis_block = Block::new(0, accounts.checksum(), vec![]);
                blocks.save(&genesis_block)?;
                genesis_block
            }
        };

        let stall = StallDetector::new(
            StallConfig {
                max_memory_mb: config.max_memory_mb,
            },
            Delegate::default(),
        );

        let ledger = Arc::new(Ledger {
            mempool: RwLock::new(Mempool::new(latest, config.pruning_limit)),
            filter: RwLock::new(Filter::with_bits(config.bloom_filter_m)),
            finalizer: Mutex::new(Snowball::new(config.snowball_alpha, config.snowball_beta)),
            syncer: Mutex::new(Snowball::new(config.sync_vote_threshold, config.snowball_beta)),
            collapse_cache: CollapseCache::default(),
            processors: ProcessorRegistry::default(),
            peers,
            query_permits: Arc::new(Semaphore::new(QUERY_WORKERS)),
            sync_gate: Mutex::new(CancellationToken::new()),
            consensus_tasks: Mutex::new(Vec::new()),
            background_tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            status: Mutex::new(SYNC_STATUS_FINALIZED),
            stall,
            config,
            kv,
            accounts,
            blocks,
        });

        ledger.load_transactions()?;
        Ok(ledger)
    }

    /// Spawn every long-lived task. Idempotent per process lifetime; call
    /// once.
    pub fn start(self: &Arc<Self>) {
        self.spawn_consensus();

        let mut background = self.background_tasks.lock();
        background.push(tokio::spawn(
            self.clone().sync_to_latest_block(self.shutdown.clone()),
        ));
        background.push(tokio::spawn(self.stall.clone().run()));
    }

    /// Spawn the consensus-gated tasks: finalization, mempool sync, and the
    /// missing-transaction pull loop.
    pub(crate) fn spawn_consensus(self: &Arc<Self>) {
        let gate = self.sync_gate.lock().clone();
        let mut tasks = self.consensus_tasks.lock();
        tasks.push(tokio::spawn(self.clone().finalize_blocks(gate.clone())));
        tasks.push(tokio::spawn(self.clone().sync_transactions(gate.clone())));
        tasks.push(tokio::spawn(self.clone().pull_missing_transactions(gate)));
    }

    /// Stop every task and wait for them to finish.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.sync_gate.lock().cancel();
        self.stall.stop();

        let consensus = std::mem::take(&mut *self.consensus_tasks.lock());
        for task in consensus {
            let _ = task.await;
        }
        let background = std::mem::take(&mut *self.background_tasks.lock());
        for task in background {
            let _ = task.await;
        }
    }

    /// Add transactions to the mempool and the membership filter.
    pub fn add_transaction(&self, verify_signature: bool, txs: Vec<Transaction>) {
        let added = self.mempool.write().batch_add(txs, verify_signature);
        let mut filter = self.filter.write();
        for id in &added {
            if !filter.insert(id) {
                tracing::warn!(target: "tx", tx_id = %hex::encode(id), "membership filter saturated");
            }
        }
    }

    pub fn has_transaction(&self, id: &TransactionId) -> bool {
        self.mempool.read().has(id)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn accounts(&self) -> &Accounts {
        &self.accounts
    }

    pub fn blocks(&self) -> &BlockStore {
        &self.blocks
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub fn kv(&self) -> &Arc<dyn Kv> {
        &self.kv
    }

    /// The finalizer's current candidate.
    pub fn preferred(&self) -> Option<Block> {
        self.finalizer.lock().preferred().cloned()
    }

    /// Restart the process via the stall detector's platform primitive.
    pub fn restart(&self) -> std::io::Result<()> {
        self.stall.try_restart()
    }

    pub fn sync_status(&self) -> &'static str {
        match *self.status.lock() {
            SYNC_STATUS_OUT_OF_SYNC => "Node is out of sync",
            SYNC_STATUS_SYNCED => "Node is synced, but not taking part in consensus process yet",
            SYNC_STATUS_FINALIZED => "Node is taking part in consensus process",
            SYNC_STATUS_FULLY_SYNCED => "Node is fully synced",
            _ => "Sync status unknown",
        }
    }

    pub(crate) fn apply_status(&self, flag: u8) {
        *self.status.lock() |= flag;
    }

    pub(crate) fn set_status(&self, flag: u8) {
        *self.status.lock() = flag;
    }

    pub(crate) fn is_out_of_sync_status(&self) -> bool {
        *self.status.lock() == SYNC_STATUS_OUT_OF_SYNC
    }

    /// The block finalization loop. Exits when the sync gate closes.
    pub(crate) async fn finalize_blocks(self: Arc<Self>, gate: CancellationToken) {
        let mut round = RoundState::default();
        loop {
            if gate.is_cancelled() {
                return;
            }
            self.stall.heartbeat();

            let preferred = self.finalizer.lock().preferred().cloned();
            match preferred {
                None => {
                    if let Some(proposed) = self.propose_block() {
                        tracing::debug!(
                            target: "consensus",
                            block_id = %hex::encode(proposed.id),
                            block_index = proposed.index,
                            num_transactions = proposed.transactions.len(),
                            "Proposing block..."
                        );
                        self.finalizer.lock().prefer(proposed);
                    } else {
                        // Nothing to propose; don't spin.
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                }
                Some(block) => {
                    if self.finalizer.lock().decided() {
                        self.finalize(block, &mut round);
                    } else {
                        self.query(&mut round).await;
                    }
                }
            }
        }
    }

    /// Build a proposal from the first quarter of the mempool.
    fn propose_block(&self) -> Option<Block> {
        let proposing = self.mempool.read().proposable_ids();
        if proposing.is_empty() {
            return None;
        }

        let latest = self.blocks.latest()?;
        let results = match self.collapse_transactions(latest.index + 1, &latest, &proposing, false)
        {
            Ok(results) => results,
            Err(e) => {
                tracing::error!(
                    target: "node",
                    error = %e,
                    "error collapsing transactions during block proposal"
                );
                return None;
            }
        };

        Some(Block::new(
            latest.index + 1,
            results.snapshot.checksum(),
            proposing,
        ))
    }

    /// Collapse a proposal through the memoizing cache. The computation for a
    /// given id list runs at most once concurrently; errors are not memoized
    /// so a proposal blocked on missing transactions can succeed later.
    pub(crate) fn collapse_transactions(
        &self,
        height: u64,
        current: &Block,
        ids: &[TransactionId],
        logging: bool,
    ) -> Result<Arc<CollapseResults>, CollapseError> {
        let cell = self.collapse_cache.entry(collapse::cache_key(ids));
        let results = cell
            .get_or_try_init(|| {
                let txs = self.mempool.read().batch_find(ids).map_err(|e| match e {
                    MempoolError::Missing(id) => CollapseError::MissingTransaction(id),
                })?;
                collapse::collapse(height, current, txs, &self.accounts, &self.processors)
                    .map(Arc::new)
            })?
            .clone();

        if logging {
            collapse::log_results(&results);
        }
        Ok(results)
    }

    /// One query round: sample peers, gather unique votes, filter invalid
    /// candidates, tick the finalizer with stake-weighted tallies.
    async fn query(&self, round: &mut RoundState) {
        let peers = self.peers.sample(self.config.snowball_k);
        if peers.is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return;
        }
        let Some(current) = self.blocks.latest() else {
            return;
        };
        let timeout = self.config.query_timeout();

        let mut join = JoinSet::new();
        for peer in peers {
            let cached = round.peer_block_cache.get(&peer.id()).cloned();
            let request = QueryRequest {
                block_index: current.index + 1,
                cache_block_id: cached.as_ref().map(|block| block.id),
            };
            let Ok(permit) = self.query_permits.clone().acquire_owned().await else {
                return;
            };
            join.spawn(async move {
                let _permit = permit;
                let response = peer.query(request, timeout).await;
                (peer.id(), cached, response)
            });
        }

        let mut votes: Vec<FinalizationVote> = Vec::new();
        let mut voters: HashSet<PeerId> = HashSet::new();
        while let Some(joined) = join.join_next().await {
            let Ok((voter, cached, response)) = joined else {
                continue;
            };
            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(target: "consensus", error = %e, "error while querying peer");
                    continue;
                }
            };

            // One vote per peer keeps the sampling fair.
            if !voters.insert(voter) {
                continue;
            }

            let block = if response.cache_valid {
                cached
            } else if response.block.is_empty() {
                None
            } else {
                match Block::unmarshal(&response.block) {
                    Ok(block) => {
                        round.peer_block_cache.insert(voter, block.clone());
                        Some(block)
                    }
                    Err(_) => None,
                }
            };
            votes.push(FinalizationVote { voter, block });
        }

        self.filter_invalid_votes(&current, &mut votes, round);
        let snapshot = self.accounts.snapshot();
        let tallies = finalization_tallies(&self.config, &snapshot, &votes);
        self.finalizer.lock().tick(&tallies);

        // Pace rounds so a low-latency network does not spin the loop.
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    /// Coerce invalid candidate blocks to abstentions, per the vote
    /// validation rules. Valid candidates are memoized by block id for the
    /// rest of the round.
    fn filter_invalid_votes(
        &self,
        current: &Block,
        votes: &mut [FinalizationVote],
        round: &mut RoundState,
    ) {
        for vote in votes.iter_mut() {
            let Some(block) = vote.block.clone() else {
                continue;
            };
            if round.block_valid_cache.contains(&block.id) {
                continue;
            }

            // Proposals must sit exactly one past our tip.
            if block.index != current.index + 1 {
                vote.block = None;
                continue;
            }

            // Every referenced transaction must be locally archived; unknown
            // ids are recorded for the pull loop and the vote abstains.
            let transactions = {
                let mut mempool = self.mempool.write();
                if mempool.batch_mark_missing(&block.transactions) {
                    vote.block = None;
                    continue;
                }
                match mempool.batch_find(&block.transactions) {
                    Ok(transactions) => transactions,
                    Err(_) => {
                        vote.block = None;
                        continue;
                    }
                }
            };

            let mut valid = true;
            let mut previous: Option<(u64, TransactionId)> = None;
            for tx in &transactions {
                // Referenced transactions must still be inside the pruning
                // window at the proposed height.
                if block.index >= tx.block.saturating_add(self.config.pruning_limit) {
                    valid = false;
                    break;
                }
                // Strictly increasing logical-index order: unique ids and
                // the same deterministic proposal everywhere.
                let key = tx.sort_key(&current.id);
                if let Some(previous) = previous {
                    if previous >= key {
                        valid = false;
                        break;
                    }
                }
                previous = Some(key);
            }
            if !valid {
                vote.block = None;
                continue;
            }

            let results =
                match self.collapse_transactions(block.index, current, &block.transactions, false) {
                    Ok(results) => results,
                    Err(e) => {
                        tracing::error!(
                            target: "node",
                            error = %e,
                            "error collapsing transactions during query"
                        );
                        vote.block = None;
                        continue;
                    }
                };
            if results.snapshot.checksum() != block.merkle {
                vote.block = None;
                continue;
            }

            round.block_valid_cache.insert(block.id);
        }
    }

    /// Commit the decided block.
    fn finalize(&self, block: Block, round: &mut RoundState) {
        let Some(current) = self.blocks.latest() else {
            return;
        };

        let results = match self.collapse_transactions(block.index, &current, &block.transactions, true)
        {
            Ok(results) => results,
            Err(e) => {
                tracing::error!(
                    target: "node",
                    error = %e,
                    "error collapsing transactions during finalization"
                );
                return;
            }
        };

        let checksum = results.snapshot.checksum();
        if checksum != block.merkle {
            tracing::error!(
                target: "node",
                target_block_index = block.index,
                expected_merkle_root = %hex::encode(block.merkle),
                yielded_merkle_root = %hex::encode(checksum),
                "Merkle root does not match"
            );
            return;
        }

        let pruned = self.mempool.write().reshuffle_pending(block.clone());
        {
            let mut filter = self.filter.write();
            for id in &pruned {
                filter.delete(id);
            }
        }

        let evicted = match self.blocks.save(&block) {
            Ok(evicted) => evicted,
            Err(e) => {
                tracing::error!(
                    target: "node",
                    error = %e,
                    "Failed to save preferred block to database"
                );
                return;
            }
        };

        if let Err(e) = self.store_transactions(&block, evicted.as_ref()) {
            tracing::error!(
                target: "node",
                error = %e,
                "Failed to save transactions from preferred block to database"
            );
            return;
        }

        if let Err(e) = self.accounts.commit(Some(results.snapshot.clone())) {
            // A failed state commit risks corruption; halt instead of
            // limping on.
            tracing::error!(
                target: "node",
                error = %e,
                "Failed to commit collapsed state; halting"
            );
            self.shutdown.cancel();
            self.sync_gate.lock().cancel();
            return;
        }

        accounts::log_changes(&results.snapshot, current.index);
        self.apply_status(SYNC_STATUS_FINALIZED);

        self.finalizer.lock().reset();
        round.block_valid_cache.clear();

        tracing::info!(
            target: "consensus",
            num_applied_tx = results.applied_count,
            num_rejected_tx = results.rejected_count,
            num_pruned_tx = pruned.len(),
            old_block_index = current.index,
            new_block_index = block.index,
            old_block_id = %hex::encode(current.id),
            new_block_id = %hex::encode(block.id),
            "Finalized block."
        );
    }

    /// Mark the block's transactions finalized and persist their bodies,
    /// deleting bodies that only the evicted block referenced.
    pub(crate) fn store_transactions(
        &self,
        block: &Block,
        evicted: Option<&Block>,
    ) -> Result<(), StoreError> {
        let txs = {
            let mut mempool = self.mempool.write();
            mempool.batch_mark_finalized(&block.transactions);
            match mempool.batch_find(&block.transactions) {
                Ok(txs) => txs,
                // Bodies can be legitimately absent right after state sync.
                Err(_) => return Ok(()),
            }
        };

        transaction::store_transactions(self.kv.as_ref(), &txs)?;
        if let Some(evicted) = evicted {
            transaction::delete_transactions(self.kv.as_ref(), &evicted.transactions)?;
        }
        Ok(())
    }

    /// Reload the bodies referenced by the retained block window.
    fn load_transactions(&self) -> Result<(), StoreError> {
        let window = self.blocks.clone_window();
        let mut count = 0;

        for block in &window {
            let txs = transaction::load_transactions(self.kv.as_ref(), &block.transactions)?;
            count += txs.len();
            let added = self.mempool.write().batch_add_finalized(txs);
            let mut filter = self.filter.write();
            for id in &added {
                filter.insert(id);
            }
        }

        if count > 0 {
            tracing::info!(
                target: "node",
                num_blocks = window.len(),
                num_transactions = count,
                "Loaded transactions from db."
            );
        }
        Ok(())
    }

    /// Reset the membership filter to exactly the mempool's contents.
    pub(crate) fn rebuild_filter(&self) {
        let mempool = self.mempool.read();
        let mut filter = self.filter.write();
        filter.reset();
        for id in mempool.ids() {
            if !filter.insert(id) {
                tracing::warn!(target: "sync", "membership filter saturated during rebuild");
            }
        }
    }
}

#[cfg(test)]
impl Ledger {
    /// Test hook: build the deterministic proposal from the mempool.
    pub(crate) fn propose_block_for_test(&self) -> Block {
        self.propose_block().expect("nothing proposable")
    }

    /// Test hook: drive one propose-and-commit cycle without a network.
    pub(crate) fn finalize_for_test(&self) {
        let proposed = self.propose_block().expect("nothing proposable");
        self.finalize(proposed, &mut RoundState::default());
    }
}

/// Apply a genesis document to the empty state tree.
fn perform_inception(tree: &mut Tree, document: &str) -> Result<(), LedgerError> {
    let entries: HashMap<String, GenesisAccount> =
        serde_json::from_str(document).map_err(|e| LedgerError::Genesis(e.to_string()))?;

    for (account_hex, entry) in &entries {
        let bytes = hex::decode(account_hex).map_err(|e| LedgerError::Genesis(e.to_string()))?;
        let id: AccountId = bytes
            .try_into()
            .map_err(|_| LedgerError::Genesis(format!("account id {account_hex} is not 32 bytes")))?;

        if entry.balance > 0 {
            write_balance(tree, &id, entry.balance);
        }
        if entry.stake > 0 {
            write_stake(tree, &id, entry.stake);
        }
        if entry.reward > 0 {
            write_reward(tree, &id, entry.reward);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::read_balance;
    use crate::store::MemKv;
    use crate::transaction::testutil::keypair;
    use crate::transaction::Tag;

    fn genesis_doc(account: &AccountId, balance: u64) -> String {
        format!("{{\"{}\": {{\"balance\": {balance}}}}}", hex::encode(account))
    }

    fn transfer(key: &ed25519_dalek::SigningKey, nonce: u64, to: &AccountId, amount: u64) -> Transaction {
        let mut payload = to.to_vec();
        payload.extend_from_slice(&amount.to_be_bytes());
        Transaction::new(key, key, nonce, 0, Tag::Transfer, payload, vec![])
    }

    fn ledger_with_funds(key: &ed25519_dalek::SigningKey) -> Arc<Ledger> {
        let sender = key.verifying_key().to_bytes();
        Ledger::new(
            Arc::new(MemKv::new()),
            PeerSet::new(),
            Config::default(),
            Some(&genesis_doc(&sender, 1_000_000_000)),
        )
        .unwrap()
    }

    #[test]
    fn bootstrap_creates_genesis_block() {
        let key = keypair(1);
        let sender = key.verifying_key().to_bytes();
        let ledger = ledger_with_funds(&key);

        let genesis = ledger.blocks().latest().unwrap();
        assert_eq!(genesis.index, 0);
        assert_eq!(genesis.merkle, ledger.accounts().checksum());
        assert!(genesis.transactions.is_empty());
        assert_eq!(
            read_balance(&ledger.accounts().snapshot(), &sender),
            1_000_000_000
        );
        assert_eq!(ledger.sync_status(), "Node is taking part in consensus process");
    }

    #[test]
    fn bootstrap_rejects_bad_genesis() {
        let result = Ledger::new(
            Arc::new(MemKv::new()),
            PeerSet::new(),
            Config::default(),
            Some("{\"zz\": {\"balance\": 1}}"),
        );
        assert!(matches!(result, Err(LedgerError::Genesis(_))));
    }

    #[test]
    fn propose_is_deterministic_across_nodes() {
        let key = keypair(2);
        let txs: Vec<Transaction> = (0..8).map(|n| transfer(&key, n, &[9u8; 32], 10)).collect();

        let a = ledger_with_funds(&key);
        let b = ledger_with_funds(&key);
        a.add_transaction(true, txs.clone());
        let mut reversed = txs;
        reversed.reverse();
        b.add_transaction(true, reversed);

        let block_a = a.propose_block().unwrap();
        let block_b = b.propose_block().unwrap();
        assert_eq!(block_a.id, block_b.id);
        assert_eq!(block_a.merkle, block_b.merkle);
        assert_eq!(block_a.index, 1);
    }

    #[test]
    fn finalize_commits_state_and_prunes_round() {
        let key = keypair(3);
        let sender = key.verifying_key().to_bytes();
        let recipient = [9u8; 32];
        let ledger = ledger_with_funds(&key);

        ledger.add_transaction(true, vec![transfer(&key, 0, &recipient, 100)]);
        let proposed = ledger.propose_block().unwrap();
        let mut round = RoundState::default();
        round.block_valid_cache.insert(proposed.id);

        ledger.finalize(proposed.clone(), &mut round);

        let latest = ledger.blocks().latest().unwrap();
        assert_eq!(latest.index, 1);
        assert_eq!(latest.id, proposed.id);
        assert_eq!(
            read_balance(&ledger.accounts().snapshot(), &recipient),
            100
        );
        assert_eq!(ledger.accounts().version(), 1);
        assert!(round.block_valid_cache.is_empty());
        assert!(!ledger.finalizer.lock().decided());

        // The transaction is finalized, not proposable.
        assert!(ledger.has_transaction(&proposed.transactions[0]));
        assert!(ledger.mempool.read().proposable_ids().is_empty());

        // Its body is persisted under tx/.
        let loaded =
            transaction::load_transactions(ledger.kv().as_ref(), &proposed.transactions).unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn finalize_refuses_wrong_merkle() {
        let key = keypair(4);
        let ledger = ledger_with_funds(&key);
        ledger.add_transaction(true, vec![transfer(&key, 0, &[9u8; 32], 100)]);

        let proposed = ledger.propose_block().unwrap();
        let forged = Block::new(proposed.index, [0xEE; 32], proposed.transactions.clone());
        let mut round = RoundState::default();
        ledger.finalize(forged, &mut round);

        assert_eq!(ledger.blocks().latest().unwrap().index, 0);
    }

    #[test]
    fn restart_resumes_from_disk() {
        let kv = Arc::new(MemKv::new());
        let key = keypair(5);
        let sender = key.verifying_key().to_bytes();
        let recipient = [9u8; 32];
        let doc = genesis_doc(&sender, 1_000_000_000);

        let (latest_id, checksum) = {
            let ledger =
                Ledger::new(kv.clone(), PeerSet::new(), Config::default(), Some(&doc)).unwrap();
            ledger.add_transaction(true, vec![transfer(&key, 0, &recipient, 250)]);
            let proposed = ledger.propose_block().unwrap();
            ledger.finalize(proposed, &mut RoundState::default());
            (
                ledger.blocks().latest().unwrap().id,
                ledger.accounts().checksum(),
            )
        };

        let reopened = Ledger::new(kv, PeerSet::new(), Config::default(), None).unwrap();
        let latest = reopened.blocks().latest().unwrap();
        assert_eq!(latest.index, 1);
        assert_eq!(latest.id, latest_id);
        assert_eq!(reopened.accounts().checksum(), checksum);
        assert_eq!(
            read_balance(&reopened.accounts().snapshot(), &recipient),
            250
        );
        // Reloaded bodies land in the finalized set and the filter.
        assert!(reopened.has_transaction(&latest.transactions[0]));
        assert!(reopened.filter.read().contains(&latest.transactions[0]));
    }

    #[test]
    fn vote_validation_rules() {
        let key = keypair(6);
        let ledger = ledger_with_funds(&key);
        ledger.add_transaction(true, vec![transfer(&key, 0, &[9u8; 32], 100)]);

        let current = ledger.blocks().latest().unwrap();
        let valid = ledger.propose_block().unwrap();
        let mut round = RoundState::default();

        let wrong_height = Block::new(5, valid.merkle, valid.transactions.clone());
        let unknown_tx = Block::new(1, valid.merkle, vec![[0xCC; 32]]);
        let wrong_merkle = Block::new(1, [0xEE; 32], valid.transactions.clone());

        let mut votes = vec![
            FinalizationVote {
                voter: [1; 32],
                block: Some(valid.clone()),
            },
            FinalizationVote {
                voter: [2; 32],
                block: Some(wrong_height),
            },
            FinalizationVote {
                voter: [3; 32],
                block: Some(unknown_tx),
            },
            FinalizationVote {
                voter: [4; 32],
                block: Some(wrong_merkle),
            },
        ];
        ledger.filter_invalid_votes(&current, &mut votes, &mut round);

        assert_eq!(votes[0].block.as_ref().unwrap().id, valid.id);
        assert!(votes[1].block.is_none());
        assert!(votes[2].block.is_none());
        assert!(votes[3].block.is_none());
        assert!(round.block_valid_cache.contains(&valid.id));

        // The unknown transaction is now tracked as missing.
        assert_eq!(ledger.mempool.read().missing_ids(), vec![[0xCC; 32]]);
    }

    #[test]
    fn duplicate_transactions_invalidate_a_vote() {
        let key = keypair(7);
        let ledger = ledger_with_funds(&key);
        let tx = transfer(&key, 0, &[9u8; 32], 100);
        ledger.add_transaction(true, vec![tx.clone()]);

        let current = ledger.blocks().latest().unwrap();
        let duplicated = Block::new(1, [0u8; 32], vec![tx.id, tx.id]);
        let mut votes = vec![FinalizationVote {
            voter: [1; 32],
            block: Some(duplicated),
        }];
        ledger.filter_invalid_votes(&current, &mut votes, &mut RoundState::default());
        assert!(votes[0].block.is_none());
    }

    #[tokio::test]
    async fn close_terminates_tasks() {
        let key = keypair(8);
        let ledger = ledger_with_funds(&key);
        ledger.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(5), ledger.close())
            .await
            .expect("close timed out");
    }
}
