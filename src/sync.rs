//! Synchronization: mempool reconciliation and state catch-up.
//!
//! Three loops live here. Two are consensus-gated: `sync_transactions`
//! periodically trades membership filters with sampled peers and streams back
//! whatever they hold that we don't, and `pull_missing_transactions`
//! broadcasts the mempool's missing-id list. The third,
//! `sync_to_latest_block`, runs for the life of the node: it repeatedly asks
//! a sample of peers whether we have fallen behind, feeds their answers into
//! the boolean Snowball, and — once "behind" is decided — tears down the
//! consensus tasks, downloads a checksum-addressed state diff from a ⅔
//! majority of peers, verifies it against the target block's Merkle root,
//! commits, and restarts consensus. No local state mutates until the final
//! checksum matches.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::block::Block;
use crate::filebuffer::PagedBuffer;
use crate::ledger::{Ledger, SYNC_STATUS_OUT_OF_SYNC, SYNC_STATUS_SYNCED};
use crate::net::rpc::{
    GetBlockRequest, OutOfSyncRequest, PullTransactionsRequest, RpcFault, SyncRequest,
    SyncResponse, TransactionsSyncRequest, TransactionsSyncResponse,
};
use crate::net::{NetworkError, Peer, SyncStream};
use crate::transaction::Transaction;
use crate::votes::{sync_tallies, SyncVote};
use crate::{blake2b, Checksum, TransactionId};

/// Cadence of the filter-exchange loop.
const TX_SYNC_INTERVAL: Duration = Duration::from_secs(3);
/// Cadence of the missing-id pull loop.
const MISSING_PULL_INTERVAL: Duration = Duration::from_millis(100);

impl Ledger {
    /// Periodically reconcile the mempool with a sample of peers via
    /// membership-filter exchange.
    pub(crate) async fn sync_transactions(self: Arc<Self>, gate: CancellationToken) {
        loop {
            tokio::select! {
                _ = gate.cancelled() => return,
                _ = tokio::time::sleep(TX_SYNC_INTERVAL) => {}
            }

            let peers = self.peers.sample(self.config.snowball_k);
            if peers.is_empty() {
                continue;
            }

            let filter_bytes = self.filter.read().marshal();

            let mut join = JoinSet::new();
            for peer in peers {
                let ledger = self.clone();
                let filter_bytes = filter_bytes.clone();
                join.spawn(async move {
                    ledger.sync_transactions_with(peer, filter_bytes).await;
                });
            }
            while join.join_next().await.is_some() {}
        }
    }

    /// One reconciliation stream against one peer.
    async fn sync_transactions_with(&self, peer: Peer, filter_bytes: Vec<u8>) {
        let timeout = self.config.download_tx_timeout();

        let Ok(mut stream) = peer.open_transactions_sync().await else {
            return;
        };
        if stream
            .requests
            .send(TransactionsSyncRequest::Filter(filter_bytes))
            .await
            .is_err()
        {
            return;
        }

        let header = tokio::time::timeout(timeout, stream.responses.recv()).await;
        let Ok(Some(TransactionsSyncResponse::TransactionsNum(count))) = header else {
            return;
        };
        if count == 0 {
            return;
        }
        if count > self.config.tx_sync_limit {
            tracing::debug!(
                target: "sync",
                count,
                "Bad number of transactions would be received"
            );
            return;
        }

        tracing::debug!(target: "sync", count, "Requesting transaction(s) to sync.");

        let mut remaining = count;
        while remaining > 0 {
            let chunk_size = remaining.min(self.config.tx_sync_chunk_size);
            if stream
                .requests
                .send(TransactionsSyncRequest::ChunkSize(chunk_size))
                .await
                .is_err()
            {
                return;
            }

            let response = tokio::time::timeout(timeout, stream.responses.recv()).await;
            let Ok(Some(TransactionsSyncResponse::Transactions(bodies))) = response else {
                return;
            };
            if bodies.is_empty() {
                return;
            }

            let mut txs = Vec::with_capacity(bodies.len());
            for body in &bodies {
                let Ok(tx) = Transaction::unmarshal(body) else {
                    tracing::warn!(target: "sync", "failed to unmarshal synced transaction");
                    continue;
                };
                if !tx.verify_signature() {
                    tracing::warn!(target: "sync", tx_id = %hex::encode(tx.id), "bad signature");
                    continue;
                }
                txs.push(tx);
            }

            remaining = remaining.saturating_sub(bodies.len() as u64);
            self.add_transaction(false, txs);
        }
    }

    /// Continuously pull missing transaction bodies from sampled peers.
    pub(crate) async fn pull_missing_transactions(self: Arc<Self>, gate: CancellationToken) {
        loop {
            tokio::select! {
                _ = gate.cancelled() => return,
                _ = tokio::time::sleep(MISSING_PULL_INTERVAL) => {}
            }

            let peers = self.peers.sample(self.config.snowball_k);
            if peers.is_empty() {
                continue;
            }

            let mut missing = self.mempool.read().missing_ids();
            if missing.is_empty() {
                continue;
            }
            missing.truncate(self.config.missing_tx_pull_limit);

            let request = PullTransactionsRequest {
                transaction_ids: missing,
            };
            let timeout = self.config.download_tx_timeout();

            let mut join = JoinSet::new();
            for peer in peers {
                let request = request.clone();
                join.spawn(async move { peer.pull_transactions(request, timeout).await });
            }

            let mut pulled: HashMap<TransactionId, Transaction> = HashMap::new();
            while let Some(joined) = join.join_next().await {
                let Ok(result) = joined else { continue };
                let response = match result {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::warn!(
                            target: "sync",
                            error = %e,
                            "failed to download missing transactions"
                        );
                        continue;
                    }
                };
                for body in &response.transactions {
                    let Ok(tx) = Transaction::unmarshal(body) else {
                        tracing::warn!(target: "sync", "error unmarshaling downloaded tx");
                        continue;
                    };
                    pulled.entry(tx.id).or_insert(tx);
                }
            }

            let mut txs = Vec::with_capacity(pulled.len());
            for (_, tx) in pulled {
                if !tx.verify_signature() {
                    tracing::warn!(target: "sync", tx_id = %hex::encode(tx.id), "bad signature");
                    continue;
                }
                txs.push(tx);
            }

            let count = txs.len();
            self.add_transaction(false, txs);
            if count > 0 {
                tracing::info!(target: "sync", count, "Pulled missing transaction(s).");
            }
        }
    }

    /// Sample peers until the boolean Snowball decides whether we are
    /// behind. Returns `None` on shutdown.
    pub(crate) async fn is_out_of_sync(&self, shutdown: &CancellationToken) -> Option<bool> {
        let k = self.config.snowball_k;

        loop {
            if shutdown.is_cancelled() {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;

            let peers = self.peers.sample(k);
            if peers.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => return None,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                continue;
            }

            let Some(current) = self.blocks.latest() else {
                continue;
            };
            let request = OutOfSyncRequest {
                block_index: current.index,
            };
            let timeout = self.config.check_out_of_sync_timeout();

            let mut join = JoinSet::new();
            for peer in peers {
                let request = request.clone();
                join.spawn(async move { (peer.id(), peer.check_out_of_sync(request, timeout).await) });
            }

            let mut votes = Vec::new();
            while let Some(joined) = join.join_next().await {
                let Ok((voter, result)) = joined else { continue };
                match result {
                    Ok(response) => votes.push(SyncVote {
                        voter,
                        out_of_sync: response.out_of_sync,
                    }),
                    Err(e) => {
                        tracing::warn!(target: "sync", error = %e, "error while checking out of sync")
                    }
                }
            }

            let snapshot = self.accounts.snapshot();
            let tallies = sync_tallies(&self.config, &snapshot, &votes);
            let mut syncer = self.syncer.lock();
            syncer.tick(&tallies);
            if syncer.decided() {
                return syncer.preferred().copied();
            }
        }
    }

    /// The sync supervisor: detect falling behind, then catch up via the
    /// chunked state-diff protocol and restart consensus.
    pub(crate) async fn sync_to_latest_block(self: Arc<Self>, shutdown: CancellationToken) {
        let mut backoff_secs = 0u64;

        loop {
            if shutdown.is_cancelled() {
                return;
            }
            self.stall.heartbeat();

            match self.is_out_of_sync(&shutdown).await {
                None => return,
                Some(false) => {
                    self.apply_status(SYNC_STATUS_SYNCED);
                    self.syncer.lock().reset();
                    if backoff_secs < 60 {
                        backoff_secs += 1;
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                    }
                    continue;
                }
                Some(true) => {}
            }

            self.set_status(SYNC_STATUS_OUT_OF_SYNC);
            let Some(current) = self.blocks.latest() else {
                continue;
            };
            backoff_secs = 0;

            // Shut the consensus tasks down and wait for them to drain.
            self.sync_gate.lock().cancel();
            let tasks = std::mem::take(&mut *self.consensus_tasks.lock());
            for task in tasks {
                let _ = task.await;
            }

            self.finalizer.lock().reset();
            self.syncer.lock().reset();

            tracing::info!(
                target: "sync",
                current_block_index = current.index,
                "Noticed that we are out of sync; downloading latest state snapshot from our peer(s)."
            );

            loop {
                if shutdown.is_cancelled() {
                    return;
                }
                self.stall.heartbeat();
                if self.perform_sync(&current).await {
                    break;
                }
            }

            if let Some(latest) = self.blocks.latest() {
                self.mempool.write().reshuffle_pending(latest);
            }
            self.rebuild_filter();

            *self.sync_gate.lock() = CancellationToken::new();
            self.spawn_consensus();
        }
    }

    /// One state-sync attempt. Returns false to retry from scratch; local
    /// state is only mutated after the reassembled diff's checksum matches
    /// the majority target block.
    pub(crate) async fn perform_sync(&self, current: &Block) -> bool {
        let peers = self.peers.sample(self.config.snowball_k);
        if peers.is_empty() {
            tracing::warn!(
                target: "sync",
                "It looks like there are no peers for us to sync with. Retrying..."
            );
            tokio::time::sleep(Duration::from_secs(1)).await;
            return false;
        }

        struct HeaderResponse {
            peer: Peer,
            latest: Block,
            checksums: Vec<Checksum>,
            stream: SyncStream,
        }

        // Open a sync stream per sampled peer and collect headers.
        let mut join = JoinSet::new();
        for peer in peers {
            let since = current.index;
            let timeout = self.config.download_tx_timeout();
            join.spawn(async move {
                let Ok(mut stream) = peer.open_sync().await else {
                    return None;
                };
                if stream.requests.send(SyncRequest::BlockId(since)).await.is_err() {
                    return None;
                }
                let header = tokio::time::timeout(timeout, stream.responses.recv()).await;
                let Ok(Some(SyncResponse::Header { block, checksums })) = header else {
                    return None;
                };
                let Ok(latest) = Block::unmarshal(&block) else {
                    return None;
                };
                if latest.index == 0 || checksums.is_empty() {
                    return None;
                }
                Some(HeaderResponse {
                    peer,
                    latest,
                    checksums,
                    stream,
                })
            });
        }

        let mut responses = Vec::new();
        while let Some(joined) = join.join_next().await {
            if let Ok(Some(response)) = joined {
                responses.push(response);
            }
        }
        if responses.is_empty() {
            return false;
        }

        // Pick the block the majority of responders are on.
        let total = responses.len();
        let mut groups: HashMap<u64, Vec<HeaderResponse>> = HashMap::new();
        for response in responses {
            groups.entry(response.latest.index).or_default().push(response);
        }
        let Some(majority) = groups
            .into_values()
            .find(|group| group.len() * 3 >= total * 2)
        else {
            tracing::warn!(
                target: "sync",
                "It looks like our peers could not decide on what the latest block currently is. Retrying..."
            );
            return false;
        };
        let target = majority[0].latest.clone();
        let backfill_peer = majority[0].peer.clone();

        tracing::debug!(
            target: "sync",
            target_block_index = target.index,
            merkle_root = %hex::encode(target.merkle),
            "Discovered the latest block the majority of our peers are on."
        );

        // For each chunk position, pick the checksum claimed by a 2/3
        // majority; its claimants are the viable download sources.
        struct Source {
            checksum: Checksum,
            streams: Vec<usize>,
        }

        let mut sources: Vec<Source> = Vec::new();
        let num_chunks = majority.iter().map(|r| r.checksums.len()).max().unwrap_or(0);
        for chunk_index in 0..num_chunks {
            let mut claims: HashMap<Checksum, Vec<usize>> = HashMap::new();
            for (stream_index, response) in majority.iter().enumerate() {
                if let Some(checksum) = response.checksums.get(chunk_index) {
                    claims.entry(*checksum).or_default().push(stream_index);
                }
            }
            let Some((checksum, streams)) = claims
                .into_iter()
                .find(|(_, claimants)| claimants.len() * 3 >= majority.len() * 2)
            else {
                return false; // no consistent checksum for this chunk
            };
            sources.push(Source { checksum, streams });
        }

        let chunk_size = self.config.sync_chunk_size;
        let buffer = match PagedBuffer::bounded((sources.len() * chunk_size) as u64) {
            Ok(buffer) => Arc::new(buffer),
            Err(e) => {
                tracing::error!(target: "sync", error = %e, "Could not create paged buffer! Retrying...");
                return false;
            }
        };

        tracing::debug!(
            target: "sync",
            num_chunks = sources.len(),
            "Starting up workers to download all chunks of data needed to sync to the latest block..."
        );

        // Streams may not concurrently send and receive at once; exclusive
        // locks serialize one request-response pair at a time.
        let streams: Vec<Arc<tokio::sync::Mutex<SyncStream>>> = majority
            .into_iter()
            .map(|response| Arc::new(tokio::sync::Mutex::new(response.stream)))
            .collect();

        let mut join = JoinSet::new();
        for (chunk_index, source) in sources.iter().enumerate() {
            let checksum = source.checksum;
            let candidates: Vec<_> = source.streams.iter().map(|i| streams[*i].clone()).collect();
            let buffer = buffer.clone();
            let timeout = self.config.download_tx_timeout();
            join.spawn(async move {
                let mut order: Vec<usize> = (0..candidates.len()).collect();
                order.shuffle(&mut rand::thread_rng());

                for stream_index in order {
                    let chunk = {
                        let mut stream = candidates[stream_index].lock().await;
                        if stream.requests.send(SyncRequest::Checksum(checksum)).await.is_err() {
                            continue;
                        }
                        match tokio::time::timeout(timeout, stream.responses.recv()).await {
                            Ok(Some(SyncResponse::Chunk(chunk))) => chunk,
                            _ => continue,
                        }
                    };

                    if chunk.is_empty() || chunk.len() > chunk_size {
                        continue;
                    }
                    if blake2b(&[&chunk]) != checksum {
                        continue;
                    }
                    if buffer
                        .write_at((chunk_index * chunk_size) as u64, &chunk)
                        .is_err()
                    {
                        continue;
                    }
                    return (chunk_index, Some(chunk.len()));
                }
                (chunk_index, None)
            });
        }

        let mut sizes = vec![0usize; sources.len()];
        while let Some(joined) = join.join_next().await {
            if let Ok((chunk_index, Some(size))) = joined {
                sizes[chunk_index] = size;
            }
        }

        if sizes.iter().any(|size| *size == 0) {
            tracing::error!(
                target: "sync",
                target_block_index = target.index,
                "Could not download one of the chunks necessary to sync to the latest block! Retrying..."
            );
            return false;
        }

        // Reassemble the diff in chunk order.
        let mut diff = Vec::with_capacity(sizes.iter().sum());
        for (chunk_index, size) in sizes.iter().enumerate() {
            match buffer.read_at((chunk_index * chunk_size) as u64, *size) {
                Ok(bytes) => diff.extend(bytes),
                Err(e) => {
                    tracing::error!(
                        target: "sync",
                        error = %e,
                        "Failed to read chunks back from the paged buffer. Restarting sync..."
                    );
                    return false;
                }
            }
        }

        tracing::info!(
            target: "sync",
            num_chunks = sizes.len(),
            target_block_index = target.index,
            "All chunks have been successfully verified and re-assembled into a diff. Applying diff..."
        );

        let mut snapshot = self.accounts.snapshot();
        if let Err(e) = snapshot.apply_diff(&diff) {
            tracing::error!(
                target: "sync",
                target_block_index = target.index,
                error = %e,
                "Failed to apply re-assembled diff to our ledger state. Restarting sync..."
            );
            return false;
        }

        let checksum = snapshot.checksum();
        if checksum != target.merkle {
            tracing::error!(
                target: "sync",
                target_block_index = target.index,
                expected_merkle_root = %hex::encode(target.merkle),
                yielded_merkle_root = %hex::encode(checksum),
                "Synced state disagrees with the target block. Restarting sync..."
            );
            return false;
        }

        // Backfill block metadata within the pruning window from one
        // majority peer; gaps from pruned rounds are acceptable.
        let oldest = current
            .index
            .max(target.index.saturating_sub(self.config.pruning_limit));
        let mut backfilled: Vec<Block> = Vec::new();
        for index in oldest..target.index {
            if let Ok(Some(_)) = self.blocks.get_by_index(index) {
                continue;
            }
            match backfill_peer
                .get_block(GetBlockRequest { block_index: index }, self.config.query_timeout())
                .await
            {
                Ok(response) => match Block::unmarshal(&response.block) {
                    Ok(block) => backfilled.push(block),
                    Err(e) => {
                        tracing::error!(target: "sync", error = %e, "Failed to decode backfilled block");
                        return false;
                    }
                },
                Err(NetworkError::Remote(RpcFault::RoundPruned)) => {
                    tracing::debug!(target: "sync", block_index = index, "Skipping pruned block.");
                    continue;
                }
                Err(e) => {
                    tracing::error!(target: "sync", error = %e, "Failed to fetch finalized block");
                    return false;
                }
            }
        }
        backfilled.push(target.clone());

        tracing::info!(target: "sync", blocks = backfilled.len(), "Going to save downloaded blocks");

        for block in &backfilled {
            let evicted = match self.blocks.save(block) {
                Ok(evicted) => evicted,
                Err(e) => {
                    tracing::error!(target: "sync", error = %e, "Failed to save finalized block to our database");
                    return false;
                }
            };
            if let Err(e) = self.store_transactions(block, evicted.as_ref()) {
                tracing::error!(target: "sync", error = %e, "Failed to save transactions from finalized block to our database");
                return false;
            }
        }

        if let Err(e) = self.accounts.commit(Some(snapshot)) {
            tracing::error!(target: "sync", error = %e, "failed to commit synced state to our database");
            return false;
        }

        tracing::info!(
            target: "sync",
            num_chunks = sizes.len(),
            old_block_index = current.index,
            new_block_index = target.index,
            old_block_id = %hex::encode(current.id),
            new_block_id = %hex::encode(target.id),
            new_merkle_root = %hex::encode(target.merkle),
            "Successfully built a new state snapshot out of chunk(s) we have received from peers."
        );
        true
    }
}
