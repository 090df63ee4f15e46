//! Finalized block type and its bit-exact wire encoding.
//!
//! A block commits to a set of transaction ids at a chain index together with
//! the Merkle checksum of the state tree *after* applying those transactions,
//! in logical-index order, to the predecessor block's state. The block id is
//! the BLAKE2b-256 digest of the concatenated transaction ids, so two nodes
//! proposing the same content agree bit-for-bit on the id.
//!
//! Wire layout (big-endian):
//! `index (u64) ‖ merkle (32B) ‖ n (u32) ‖ tx_id[0..n] (32B each)`

use crate::{blake2b, snowball, BlockId, Checksum, TransactionId};

/// Errors from decoding a block.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BlockError {
    #[error("block encoding is truncated")]
    Truncated,
    #[error("block encoding has {0} trailing bytes")]
    TrailingBytes(usize),
}

/// A finalized (or proposed) batch of transaction ids at a chain index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub index: u64,
    pub merkle: Checksum,
    pub transactions: Vec<TransactionId>,

    pub id: BlockId,
}

impl Block {
    /// Construct a block, deriving its content id.
    pub fn new(index: u64, merkle: Checksum, transactions: Vec<TransactionId>) -> Self {
        let id = Self::compute_id(&transactions);
        Block {
            index,
            merkle,
            transactions,
            id,
        }
    }

    /// BLAKE2b-256 over the concatenated transaction ids.
    pub fn compute_id(transactions: &[TransactionId]) -> BlockId {
        let parts: Vec<&[u8]> = transactions.iter().map(|id| &id[..]).collect();
        blake2b(&parts)
    }

    /// Serialize to the canonical big-endian layout.
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 32 + 4 + self.transactions.len() * 32);
        buf.extend_from_slice(&self.index.to_be_bytes());
        buf.extend_from_slice(&self.merkle);
        buf.extend_from_slice(&(self.transactions.len() as u32).to_be_bytes());
        for id in &self.transactions {
            buf.extend_from_slice(id);
        }
        buf
    }

    /// Decode from the canonical layout, recomputing the content id.
    pub fn unmarshal(data: &[u8]) -> Result<Block, BlockError> {
        let mut cursor = Cursor { data, offset: 0 };

        let index = u64::from_be_bytes(cursor.take::<8>()?);
        let merkle = cursor.take::<32>()?;
        let n = u32::from_be_bytes(cursor.take::<4>()?) as usize;

        // Reject length prefixes the buffer cannot possibly satisfy before
        // allocating.
        if cursor.remaining() < n.saturating_mul(32) {
            return Err(BlockError::Truncated);
        }

        let mut transactions = Vec::with_capacity(n);
        for _ in 0..n {
            transactions.push(cursor.take::<32>()?);
        }

        if cursor.remaining() != 0 {
            return Err(BlockError::TrailingBytes(cursor.remaining()));
        }

        Ok(Block::new(index, merkle, transactions))
    }

}

impl snowball::Identity for Block {
    fn identity(&self) -> [u8; 32] {
        self.id
    }
}

pub(crate) struct Cursor<'a> {
    pub data: &'a [u8],
    pub offset: usize,
}

impl<'a> Cursor<'a> {
    pub fn take<const N: usize>(&mut self) -> Result<[u8; N], BlockError> {
        if self.data.len() < self.offset + N {
            return Err(BlockError::Truncated);
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.offset..self.offset + N]);
        self.offset += N;
        Ok(out)
    }

    pub fn take_slice(&mut self, n: usize) -> Result<&'a [u8], BlockError> {
        if self.data.len() < self.offset + n {
            return Err(BlockError::Truncated);
        }
        let out = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(out)
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}
