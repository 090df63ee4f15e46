//! Wire protocol message definitions.
//!
//! These are the transport-agnostic RPC payloads the core exchanges with
//! peers. Blocks and transactions travel pre-marshalled (the bit-exact
//! big-endian codecs in `block`/`transaction`), so the envelope encoding can
//! evolve without touching content ids. For byte transports, `encode_frame`/
//! `decode_frame` provide a length-prefixed, size-limited bincode framing.

use serde::{Deserialize, Serialize};

/// Unary query for a peer's preferred block at `block_index`.
///
/// `cache_block_id` echoes the block this node last saw from the queried
/// peer; the peer answers `cache_valid` instead of re-sending an unchanged
/// proposal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub block_index: u64,
    pub cache_block_id: Option<[u8; 32]>,
}

/// Response to `QueryRequest`. An empty `block` with `cache_valid = false`
/// is an abstention.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub cache_valid: bool,
    pub block: Vec<u8>,
}

/// Fetch a finalized block by index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlockRequest {
    pub block_index: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlockResponse {
    pub block: Vec<u8>,
}

/// Remote-side failures that are part of the protocol (not transport errors).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum RpcFault {
    /// The requested block fell outside the peer's pruning window.
    #[error("round pruned")]
    RoundPruned,
}

/// Probe whether this node has fallen behind the peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutOfSyncRequest {
    pub block_index: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutOfSyncResponse {
    pub out_of_sync: bool,
}

/// Requests on a state-sync stream: first the base block index, then one
/// checksum per wanted chunk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncRequest {
    BlockId(u64),
    Checksum([u8; 32]),
}

/// Responses on a state-sync stream: the header enumerating chunk checksums,
/// then one chunk per request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncResponse {
    Header {
        block: Vec<u8>,
        checksums: Vec<[u8; 32]>,
    },
    Chunk(Vec<u8>),
}

/// Requests on a mempool reconciliation stream: first this node's membership
/// filter, then chunk-size pulls.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionsSyncRequest {
    Filter(Vec<u8>),
    ChunkSize(u64),
}

/// Responses on a mempool reconciliation stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionsSyncResponse {
    TransactionsNum(u64),
    Transactions(Vec<Vec<u8>>),
}

/// Pull specific transaction bodies by id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullTransactionsRequest {
    pub transaction_ids: Vec<[u8; 32]>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullTransactionsResponse {
    pub transactions: Vec<Vec<u8>>,
}

/// Errors from the frame codec.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CodecError {
    #[error("message serialization failed: {0}")]
    Serialize(String),
    #[error("message exceeds maximum frame size ({} bytes)", MAX_FRAME_BYTES)]
    FrameTooLarge,
    #[error("frame is truncated or corrupted")]
    Malformed,
}

/// Maximum encoded message size accepted on either side.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Size-limited bincode config shared by both directions. The limit guards
/// against allocation bombs from crafted length prefixes within payloads.
fn bincode_config() -> bincode::config::Configuration<
    bincode::config::LittleEndian,
    bincode::config::Fixint,
    bincode::config::Limit<{ 16 * 1024 * 1024 }>,
> {
    bincode::config::legacy().with_limit::<{ 16 * 1024 * 1024 }>()
}

/// Serialize a message with a u32 length prefix.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    let payload = bincode::serde::encode_to_vec(message, bincode_config())
        .map_err(|e| CodecError::Serialize(e.to_string()))?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge);
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a length-prefixed message, rejecting oversized or truncated frames.
pub fn decode_frame<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T, CodecError> {
    if data.len() < 4 {
        return Err(CodecError::Malformed);
    }
    let len = u32::from_le_bytes(data[..4].try_into().expect("4 bytes")) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge);
    }
    if data.len() != 4usize.saturating_add(len) {
        return Err(CodecError::Malformed);
    }
    let (message, _) = bincode::serde::decode_from_slice(&data[4..], bincode_config())
        .map_err(|_| CodecError::Malformed)?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_roundtrip() {
        let msg = QueryRequest {
            block_index: 42,
            cache_block_id: Some([7u8; 32]),
        };
        let decoded: QueryRequest = decode_frame(&encode_frame(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);

        let msg = QueryRequest {
            block_index: 1,
            cache_block_id: None,
        };
        let decoded: QueryRequest = decode_frame(&encode_frame(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn sync_stream_messages_roundtrip() {
        let header = SyncResponse::Header {
            block: vec![1, 2, 3],
            checksums: vec![[1u8; 32], [2u8; 32]],
        };
        let decoded: SyncResponse = decode_frame(&encode_frame(&header).unwrap()).unwrap();
        assert_eq!(decoded, header);

        let chunk = SyncResponse::Chunk(vec![0xAB; 100]);
        let decoded: SyncResponse = decode_frame(&encode_frame(&chunk).unwrap()).unwrap();
        assert_eq!(decoded, chunk);

        let req = SyncRequest::Checksum([9u8; 32]);
        let decoded: SyncRequest = decode_frame(&encode_frame(&req).unwrap()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn transactions_sync_messages_roundtrip() {
        let filter = TransactionsSyncRequest::Filter(vec![0u8; 64]);
        let decoded: TransactionsSyncRequest = decode_frame(&encode_frame(&filter).unwrap()).unwrap();
        assert_eq!(decoded, filter);

        let count = TransactionsSyncResponse::TransactionsNum(1_000);
        let decoded: TransactionsSyncResponse = decode_frame(&encode_frame(&count).unwrap()).unwrap();
        assert_eq!(decoded, count);

        let bodies = TransactionsSyncResponse::Transactions(vec![vec![1], vec![2, 3]]);
        let decoded: TransactionsSyncResponse = decode_frame(&encode_frame(&bodies).unwrap()).unwrap();
        assert_eq!(decoded, bodies);
    }

    #[test]
    fn pull_and_fault_roundtrip() {
        let pull = PullTransactionsRequest {
            transaction_ids: vec![[1u8; 32], [2u8; 32]],
        };
        let decoded: PullTransactionsRequest = decode_frame(&encode_frame(&pull).unwrap()).unwrap();
        assert_eq!(decoded, pull);

        let fault: Result<GetBlockResponse, RpcFault> = Err(RpcFault::RoundPruned);
        let decoded: Result<GetBlockResponse, RpcFault> =
            decode_frame(&encode_frame(&fault).unwrap()).unwrap();
        assert_eq!(decoded, fault);
    }

    #[test]
    fn decode_rejects_oversized_length() {
        let mut data = (u32::MAX).to_le_bytes().to_vec();
        data.extend_from_slice(&[0u8; 10]);
        assert!(matches!(
            decode_frame::<QueryResponse>(&data),
            Err(CodecError::FrameTooLarge)
        ));
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let mut data = 100u32.to_le_bytes().to_vec();
        data.extend_from_slice(&[0u8; 10]);
        assert!(matches!(
            decode_frame::<QueryResponse>(&data),
            Err(CodecError::Malformed)
        ));
        assert!(matches!(
            decode_frame::<QueryResponse>(&[1, 2]),
            Err(CodecError::Malformed)
        ));
    }

    #[test]
    fn decode_rejects_corrupted_payload() {
        let mut data = 8u32.to_le_bytes().to_vec();
        data.extend_from_slice(&[0xFF; 8]);
        assert!(matches!(
            decode_frame::<SyncRequest>(&data),
            Err(CodecError::Malformed)
        ));
    }
}
