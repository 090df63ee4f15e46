//! Server half of the wire protocol.
//!
//! `Protocol::spawn` hands back the RPC inbox sender for a ledger; whatever
//! transport the embedder wires up pushes `Rpc` envelopes into it. Unary
//! calls are answered inline; each streaming RPC gets its own task for the
//! life of the stream.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::filter::Filter;
use crate::ledger::Ledger;
use crate::net::rpc::{
    GetBlockRequest, GetBlockResponse, OutOfSyncRequest, OutOfSyncResponse,
    PullTransactionsRequest, PullTransactionsResponse, QueryRequest, QueryResponse, RpcFault,
    SyncRequest, SyncResponse, TransactionsSyncRequest, TransactionsSyncResponse,
};
use crate::net::{Rpc, RPC_CHANNEL_DEPTH};
use crate::{blake2b, Checksum};

/// Protocol pump factory.
pub struct Protocol;

impl Protocol {
    /// Spawn the dispatch loop for a ledger and return its RPC inbox.
    pub fn spawn(ledger: Arc<Ledger>) -> mpsc::Sender<Rpc> {
        let (inbox, outbox) = mpsc::channel(RPC_CHANNEL_DEPTH);
        tokio::spawn(serve(ledger, outbox));
        inbox
    }
}

async fn serve(ledger: Arc<Ledger>, mut inbox: mpsc::Receiver<Rpc>) {
    while let Some(rpc) = inbox.recv().await {
        match rpc {
            Rpc::Query { request, reply } => {
                let _ = reply.send(handle_query(&ledger, request));
            }
            Rpc::GetBlock { request, reply } => {
                let _ = reply.send(handle_get_block(&ledger, request));
            }
            Rpc::CheckOutOfSync { request, reply } => {
                let _ = reply.send(handle_check_out_of_sync(&ledger, request));
            }
            Rpc::PullTransactions { request, reply } => {
                let _ = reply.send(handle_pull_transactions(&ledger, request));
            }
            Rpc::Sync {
                requests,
                responses,
            } => {
                tokio::spawn(serve_sync_stream(ledger.clone(), requests, responses));
            }
            Rpc::SyncTransactions {
                requests,
                responses,
            } => {
                tokio::spawn(serve_transactions_sync_stream(
                    ledger.clone(),
                    requests,
                    responses,
                ));
            }
        }
    }
}

/// Answer a finalization query: history below our tip, the preferred
/// candidate one past it, an abstention otherwise. A matching cache echo is
/// answered with `cache_valid` instead of the full block.
fn handle_query(ledger: &Ledger, request: QueryRequest) -> QueryResponse {
    // While mid state-sync our view is not worth voting on.
    if ledger.is_out_of_sync_status() {
        return QueryResponse::default();
    }
    let Some(latest) = ledger.blocks().latest() else {
        return QueryResponse::default();
    };

    let candidate = if request.block_index <= latest.index {
        ledger.blocks().get_by_index(request.block_index).ok().flatten()
    } else if request.block_index == latest.index + 1 {
        ledger.preferred()
    } else {
        None
    };

    match candidate {
        None => QueryResponse::default(),
        Some(block) => {
            if request.cache_block_id == Some(block.id) {
                QueryResponse {
                    cache_valid: true,
                    block: Vec::new(),
                }
            } else {
                QueryResponse {
                    cache_valid: false,
                    block: block.marshal(),
                }
            }
        }
    }
}

fn handle_get_block(
    ledger: &Ledger,
    request: GetBlockRequest,
) -> Result<GetBlockResponse, RpcFault> {
    match ledger.blocks().get_by_index(request.block_index) {
        Ok(Some(block)) => Ok(GetBlockResponse {
            block: block.marshal(),
        }),
        _ => Err(RpcFault::RoundPruned),
    }
}

fn handle_check_out_of_sync(ledger: &Ledger, request: OutOfSyncRequest) -> OutOfSyncResponse {
    let out_of_sync = match ledger.blocks().latest() {
        Some(latest) => {
            latest.index
                >= request
                    .block_index
                    .saturating_add(ledger.config().sync_if_block_indices_differ_by)
        }
        None => false,
    };
    OutOfSyncResponse { out_of_sync }
}

fn handle_pull_transactions(
    ledger: &Ledger,
    request: PullTransactionsRequest,
) -> PullTransactionsResponse {
    let limit = ledger.config().missing_tx_pull_limit;
    let mempool = ledger.mempool.read();
    let transactions = request
        .transaction_ids
        .iter()
        .take(limit)
        .filter_map(|id| mempool.get(id).map(|tx| tx.marshal()))
        .collect();
    PullTransactionsResponse { transactions }
}

/// Serve one state-sync stream: a header enumerating the chunked diff since
/// the caller's block, then chunks by checksum on demand.
async fn serve_sync_stream(
    ledger: Arc<Ledger>,
    mut requests: mpsc::Receiver<SyncRequest>,
    responses: mpsc::Sender<SyncResponse>,
) {
    let Some(SyncRequest::BlockId(since)) = requests.recv().await else {
        return;
    };
    let Some(latest) = ledger.blocks().latest() else {
        return;
    };

    let snapshot = ledger.accounts().snapshot();
    let diff = snapshot.dump_diff(since);
    let chunks: Vec<Vec<u8>> = diff
        .chunks(ledger.config().sync_chunk_size)
        .map(|chunk| chunk.to_vec())
        .collect();
    let checksums: Vec<Checksum> = chunks.iter().map(|chunk| blake2b(&[chunk])).collect();

    tracing::debug!(
        target: "sync",
        since,
        latest_block_index = latest.index,
        num_chunks = chunks.len(),
        "Serving state diff"
    );

    if responses
        .send(SyncResponse::Header {
            block: latest.marshal(),
            checksums: checksums.clone(),
        })
        .await
        .is_err()
    {
        return;
    }

    let by_checksum: HashMap<Checksum, Vec<u8>> = checksums.into_iter().zip(chunks).collect();
    while let Some(request) = requests.recv().await {
        let SyncRequest::Checksum(checksum) = request else {
            continue;
        };
        let chunk = by_checksum.get(&checksum).cloned().unwrap_or_default();
        if responses.send(SyncResponse::Chunk(chunk)).await.is_err() {
            return;
        }
    }
}

/// Serve one mempool reconciliation stream: compute the delta against the
/// caller's membership filter, then hand out marshalled bodies in chunks.
async fn serve_transactions_sync_stream(
    ledger: Arc<Ledger>,
    mut requests: mpsc::Receiver<TransactionsSyncRequest>,
    responses: mpsc::Sender<TransactionsSyncResponse>,
) {
    let Some(TransactionsSyncRequest::Filter(bytes)) = requests.recv().await else {
        return;
    };
    let Ok(filter) = Filter::unmarshal(&bytes) else {
        return;
    };

    let delta: Vec<Vec<u8>> = {
        let mempool = ledger.mempool.read();
        mempool
            .transactions()
            .filter(|tx| !filter.contains(&tx.id))
            .map(|tx| tx.marshal())
            .collect()
    };

    if responses
        .send(TransactionsSyncResponse::TransactionsNum(delta.len() as u64))
        .await
        .is_err()
    {
        return;
    }
    if delta.is_empty() {
        return;
    }

    let mut offset = 0usize;
    while let Some(request) = requests.recv().await {
        let TransactionsSyncRequest::ChunkSize(size) = request else {
            continue;
        };
        let size = (size.min(ledger.config().tx_sync_chunk_size) as usize).min(delta.len() - offset);
        let chunk = delta[offset..offset + size].to_vec();
        offset += size;
        if responses
            .send(TransactionsSyncResponse::Transactions(chunk))
            .await
            .is_err()
        {
            return;
        }
        if offset >= delta.len() {
            return;
        }
    }
}
