//! Channel transport between the core and its peers.
//!
//! The core never touches sockets: a peer is a handle around an mpsc sender
//! of `Rpc` envelopes, and the remote side is whatever pump drains that
//! channel — an in-process `protocol::serve` task in tests, or an external
//! byte transport feeding frames through the `rpc` codec in production.
//! Unary calls carry a oneshot reply; the two streaming RPCs hand the callee
//! a bidirectional mpsc pair.

pub mod rpc;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};

use crate::AccountId;
use self::rpc::{
    GetBlockRequest, GetBlockResponse, OutOfSyncRequest, OutOfSyncResponse,
    PullTransactionsRequest, PullTransactionsResponse, QueryRequest, QueryResponse, RpcFault,
    SyncRequest, SyncResponse, TransactionsSyncRequest, TransactionsSyncResponse,
};

/// Peers are identified by their Ed25519 public key, which doubles as the
/// account their stake is read from.
pub type PeerId = AccountId;

/// Queue depth for a peer's RPC inbox.
pub const RPC_CHANNEL_DEPTH: usize = 64;
/// Queue depth for each direction of a stream.
pub const STREAM_CHANNEL_DEPTH: usize = 16;

/// Transport-level failures.
#[derive(Clone, Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("request timed out")]
    Timeout,
    #[error("peer is gone")]
    Disconnected,
    #[error("peer fault: {0}")]
    Remote(#[from] RpcFault),
}

/// An RPC envelope delivered to a peer's protocol pump.
pub enum Rpc {
    Query {
        request: QueryRequest,
        reply: oneshot::Sender<QueryResponse>,
    },
    GetBlock {
        request: GetBlockRequest,
        reply: oneshot::Sender<Result<GetBlockResponse, RpcFault>>,
    },
    CheckOutOfSync {
        request: OutOfSyncRequest,
        reply: oneshot::Sender<OutOfSyncResponse>,
    },
    PullTransactions {
        request: PullTransactionsRequest,
        reply: oneshot::Sender<PullTransactionsResponse>,
    },
    Sync {
        requests: mpsc::Receiver<SyncRequest>,
        responses: mpsc::Sender<SyncResponse>,
    },
    SyncTransactions {
        requests: mpsc::Receiver<TransactionsSyncRequest>,
        responses: mpsc::Sender<TransactionsSyncResponse>,
    },
}

/// Client half of a state-sync stream.
pub struct SyncStream {
    pub requests: mpsc::Sender<SyncRequest>,
    pub responses: mpsc::Receiver<SyncResponse>,
}

/// Client half of a mempool reconciliation stream.
pub struct TransactionsSyncStream {
    pub requests: mpsc::Sender<TransactionsSyncRequest>,
    pub responses: mpsc::Receiver<TransactionsSyncResponse>,
}

/// A reachable peer.
#[derive(Clone)]
pub struct Peer {
    id: PeerId,
    inbox: mpsc::Sender<Rpc>,
}

impl Peer {
    pub fn new(id: PeerId, inbox: mpsc::Sender<Rpc>) -> Self {
        Peer { id, inbox }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    async fn unary<Req, Res>(
        &self,
        make: impl FnOnce(Req, oneshot::Sender<Res>) -> Rpc,
        request: Req,
        timeout: Duration,
    ) -> Result<Res, NetworkError> {
        let (reply, response) = oneshot::channel();
        self.inbox
            .send(make(request, reply))
            .await
            .map_err(|_| NetworkError::Disconnected)?;
        match tokio::time::timeout(timeout, response).await {
            Err(_) => Err(NetworkError::Timeout),
            Ok(Err(_)) => Err(NetworkError::Disconnected),
            Ok(Ok(res)) => Ok(res),
        }
    }

    pub async fn query(
        &self,
        request: QueryRequest,
        timeout: Duration,
    ) -> Result<QueryResponse, NetworkError> {
        self.unary(|request, reply| Rpc::Query { request, reply }, request, timeout)
            .await
    }

    pub async fn get_block(
        &self,
        request: GetBlockRequest,
        timeout: Duration,
    ) -> Result<GetBlockResponse, NetworkError> {
        let result = self
            .unary(
                |request, reply| Rpc::GetBlock { request, reply },
                request,
                timeout,
            )
            .await?;
        Ok(result?)
    }

    pub async fn check_out_of_sync(
        &self,
        request: OutOfSyncRequest,
        timeout: Duration,
    ) -> Result<OutOfSyncResponse, NetworkError> {
        self.unary(
            |request, reply| Rpc::CheckOutOfSync { request, reply },
            request,
            timeout,
        )
        .await
    }

    pub async fn pull_transactions(
        &self,
        request: PullTransactionsRequest,
        timeout: Duration,
    ) -> Result<PullTransactionsResponse, NetworkError> {
        self.unary(
            |request, reply| Rpc::PullTransactions { request, reply },
            request,
            timeout,
        )
        .await
    }

    /// Open a bidirectional state-sync stream.
    pub async fn open_sync(&self) -> Result<SyncStream, NetworkError> {
        let (request_tx, request_rx) = mpsc::channel(STREAM_CHANNEL_DEPTH);
        let (response_tx, response_rx) = mpsc::channel(STREAM_CHANNEL_DEPTH);
        self.inbox
            .send(Rpc::Sync {
                requests: request_rx,
                responses: response_tx,
            })
            .await
            .map_err(|_| NetworkError::Disconnected)?;
        Ok(SyncStream {
            requests: request_tx,
            responses: response_rx,
        })
    }

    /// Open a bidirectional mempool reconciliation stream.
    pub async fn open_transactions_sync(&self) -> Result<TransactionsSyncStream, NetworkError> {
        let (request_tx, request_rx) = mpsc::channel(STREAM_CHANNEL_DEPTH);
        let (response_tx, response_rx) = mpsc::channel(STREAM_CHANNEL_DEPTH);
        self.inbox
            .send(Rpc::SyncTransactions {
                requests: request_rx,
                responses: response_tx,
            })
            .await
            .map_err(|_| NetworkError::Disconnected)?;
        Ok(TransactionsSyncStream {
            requests: request_tx,
            responses: response_rx,
        })
    }
}

/// The membership view: every peer this node can currently reach.
#[derive(Clone, Default)]
pub struct PeerSet {
    peers: Arc<RwLock<Vec<Peer>>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a peer by id.
    pub fn add(&self, peer: Peer) {
        let mut peers = self.peers.write();
        peers.retain(|p| p.id != peer.id);
        peers.push(peer);
    }

    pub fn remove(&self, id: &PeerId) {
        self.peers.write().retain(|p| p.id != *id);
    }

    /// A uniform random sample of up to `k` distinct peers.
    pub fn sample(&self, k: usize) -> Vec<Peer> {
        let peers = self.peers.read();
        peers
            .choose_multiple(&mut rand::thread_rng(), k)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> Peer {
        let (tx, _rx) = mpsc::channel(1);
        Peer::new([n; 32], tx)
    }

    #[test]
    fn add_replaces_by_id() {
        let set = PeerSet::new();
        set.add(peer(1));
        set.add(peer(1));
        set.add(peer(2));
        assert_eq!(set.len(), 2);

        set.remove(&[1u8; 32]);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn sample_bounds() {
        let set = PeerSet::new();
        for n in 0..5 {
            set.add(peer(n));
        }
        assert_eq!(set.sample(3).len(), 3);
        assert_eq!(set.sample(10).len(), 5);

        let sampled = set.sample(5);
        let mut ids: Vec<PeerId> = sampled.iter().map(|p| p.id()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 5, "sample must not repeat peers");
    }

    #[tokio::test]
    async fn unary_times_out_without_a_pump() {
        let (tx, _rx) = mpsc::channel(4);
        let peer = Peer::new([1u8; 32], tx);
        let result = peer
            .query(
                QueryRequest {
                    block_index: 1,
                    cache_block_id: None,
                },
                Duration::from_millis(20),
            )
            .await;
        assert!(matches!(result, Err(NetworkError::Timeout)));
    }

    #[tokio::test]
    async fn unary_reports_disconnected_peer() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let peer = Peer::new([1u8; 32], tx);
        let result = peer
            .query(
                QueryRequest {
                    block_index: 1,
                    cache_block_id: None,
                },
                Duration::from_millis(20),
            )
            .await;
        assert!(matches!(result, Err(NetworkError::Disconnected)));
    }

    #[tokio::test]
    async fn unary_roundtrip_through_a_pump() {
        let (tx, mut rx) = mpsc::channel(4);
        tokio::spawn(async move {
            while let Some(rpc) = rx.recv().await {
                if let Rpc::Query { request, reply } = rpc {
                    let _ = reply.send(QueryResponse {
                        cache_valid: request.cache_block_id.is_some(),
                        block: vec![],
                    });
                }
            }
        });

        let peer = Peer::new([1u8; 32], tx);
        let response = peer
            .query(
                QueryRequest {
                    block_index: 1,
                    cache_block_id: Some([2u8; 32]),
                },
                Duration::from_millis(200),
            )
            .await
            .unwrap();
        assert!(response.cache_valid);
    }
}
