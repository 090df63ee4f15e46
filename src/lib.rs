//! # Cascade
//!
//! A leaderless, probabilistic, block-finalizing ledger core:
//! - **Snowball finalization** — nodes repeatedly sample peers for their
//!   preferred next block and lock in once confidence holds for `beta`
//!   consecutive rounds; no leader, no view changes
//! - **Versioned Merkle state** — a copy-on-write AVL tree whose checksum
//!   commits every finalized block to its post-application state
//! - **Chunked state sync** — lagging nodes download a checksum-addressed
//!   state diff from a ⅔ majority of peers instead of replaying history
//! - **Continuous mempool reconciliation** — cuckoo-filter set exchange plus
//!   a missing-id pull loop keep peers' transaction pools converged
//!
//! The RPC transport, key-value engine, and contract VM are injected at the
//! edges; everything in between lives here.

pub mod accounts;
pub mod avl;
pub mod block;
pub mod blocks;
pub mod collapse;
pub mod config;
pub mod filebuffer;
pub mod filter;
pub mod ledger;
pub mod mempool;
pub mod net;
pub mod processor;
pub mod protocol;
pub mod snowball;
pub mod stall;
pub mod store;
pub mod sync;
pub mod transaction;
pub mod votes;

/// Protocol constants.
pub mod constants {
    /// Flat fee deducted from the sender of every transaction, including
    /// rejected ones.
    pub const TRANSACTION_FEE: u64 = 2;
    /// Floor applied to a voter's stake when weighing votes, so zero-stake
    /// peers still count.
    pub const MINIMUM_STAKE: u64 = 100;
    /// Hard cap on the number of transaction ids a single block proposal may
    /// carry.
    pub const PROPOSAL_LIMIT: usize = 16_384;
    /// Number of concurrent query RPCs allowed in flight at once.
    pub const QUERY_WORKERS: usize = 16;
    /// Number of collapse results memoized at a time.
    pub const COLLAPSE_CACHE_SIZE: usize = 16;
}

/// 256-bit transaction identifier (BLAKE2b of the canonical encoding).
pub type TransactionId = [u8; 32];
/// 256-bit block identifier (BLAKE2b of the concatenated transaction ids).
pub type BlockId = [u8; 32];
/// Ed25519 public key identifying an account (and a peer).
pub type AccountId = [u8; 32];
/// 256-bit Merkle checksum of the state tree.
pub type Checksum = [u8; 32];

/// The id of the empty block, used as an explicit "no block" marker.
pub const ZERO_BLOCK_ID: BlockId = [0u8; 32];

/// Compute the BLAKE2b-256 digest of the concatenation of `parts`.
pub fn blake2b(parts: &[&[u8]]) -> [u8; 32] {
    use blake2::digest::consts::U32;
    use blake2::{Blake2b, Digest};

    let mut hasher = Blake2b::<U32>::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Compute a 64-bit HighwayHash over the concatenation of `parts`, using the
/// protocol's fixed all-zero key. Used for logical transaction indices and
/// collapse cache keys.
pub fn highway64(parts: &[&[u8]]) -> u64 {
    use highway::{HighwayHash, HighwayHasher, Key};

    let mut hasher = HighwayHasher::new(Key([0; 4]));
    for part in parts {
        hasher.append(part);
    }
    hasher.finalize64()
}
