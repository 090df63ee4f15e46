//! Transaction type, canonical encoding, and signature scheme.
//!
//! A transaction is immutable once signed. Its id is the BLAKE2b-256 digest
//! of the canonical encoding *without* signatures. The creator signs
//! `tag ‖ payload`; the sender signs `tag ‖ payload ‖ parents`. Within a
//! proposed block, transactions are ordered by their *logical index*: a
//! 64-bit HighwayHash of `block_id ‖ tx_id` computed against the predecessor
//! block, which gives every node the same deterministic ordering without
//! coordination.
//!
//! Canonical layout (big-endian):
//! `sender (32B) ‖ creator (32B) ‖ nonce (u64) ‖ tag (u8) ‖
//!  payload_len (u32) ‖ payload ‖ parents_len (u32) ‖ parent_id* (32B each) ‖
//!  block (u64)` followed by
//! `creator_signature (64B) ‖ sender_signature (64B)`.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::block::{BlockError, Cursor};
use crate::store::{Kv, StoreError, TX_PREFIX};
use crate::{blake2b, highway64, AccountId, BlockId, TransactionId};

/// Maximum payload size accepted when decoding.
const MAX_PAYLOAD_BYTES: usize = 1 << 20;
/// Maximum parent references accepted when decoding.
const MAX_PARENTS: usize = 32;

/// The operation kind a transaction carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    Nop = 0,
    Transfer = 1,
    Contract = 2,
    Stake = 3,
}

impl Tag {
    /// Number of distinct tags; sizes the processor table.
    pub const COUNT: usize = 4;
}

impl TryFrom<u8> for Tag {
    type Error = TransactionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Tag::Nop),
            1 => Ok(Tag::Transfer),
            2 => Ok(Tag::Contract),
            3 => Ok(Tag::Stake),
            other => Err(TransactionError::UnknownTag(other)),
        }
    }
}

/// Errors from decoding or validating a transaction.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("transaction encoding is truncated")]
    Truncated,
    #[error("transaction encoding has trailing bytes")]
    TrailingBytes,
    #[error("unknown transaction tag {0}")]
    UnknownTag(u8),
    #[error("payload of {0} bytes exceeds the decode limit")]
    PayloadTooLarge(usize),
    #[error("{0} parent references exceed the decode limit")]
    TooManyParents(usize),
}

impl From<BlockError> for TransactionError {
    fn from(e: BlockError) -> Self {
        match e {
            BlockError::Truncated => TransactionError::Truncated,
            BlockError::TrailingBytes(_) => TransactionError::TrailingBytes,
        }
    }
}

/// An opaque signed operation against the account state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub sender: AccountId,
    pub creator: AccountId,
    pub nonce: u64,
    /// Chain index the creator observed when crafting the transaction; bounds
    /// how long the transaction stays proposable.
    pub block: u64,
    pub tag: Tag,
    pub payload: Vec<u8>,
    pub parents: Vec<TransactionId>,
    pub creator_signature: [u8; 64],
    pub sender_signature: [u8; 64],

    pub id: TransactionId,
}

impl Transaction {
    /// Craft and sign a transaction. `sender` and `creator` may be the same
    /// key.
    pub fn new(
        sender: &SigningKey,
        creator: &SigningKey,
        nonce: u64,
        block: u64,
        tag: Tag,
        payload: Vec<u8>,
        parents: Vec<TransactionId>,
    ) -> Transaction {
        let creator_signature = creator.sign(&creator_sign_data(tag, &payload)).to_bytes();
        let sender_signature = sender
            .sign(&sender_sign_data(tag, &payload, &parents))
            .to_bytes();

        let mut tx = Transaction {
            sender: sender.verifying_key().to_bytes(),
            creator: creator.verifying_key().to_bytes(),
            nonce,
            block,
            tag,
            payload,
            parents,
            creator_signature,
            sender_signature,
            id: [0; 32],
        };
        tx.id = blake2b(&[&tx.encode_unsigned()]);
        tx
    }

    fn encode_unsigned(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            32 + 32 + 8 + 1 + 4 + self.payload.len() + 4 + self.parents.len() * 32 + 8,
        );
        buf.extend_from_slice(&self.sender);
        buf.extend_from_slice(&self.creator);
        buf.extend_from_slice(&self.nonce.to_be_bytes());
        buf.push(self.tag as u8);
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&(self.parents.len() as u32).to_be_bytes());
        for parent in &self.parents {
            buf.extend_from_slice(parent);
        }
        buf.extend_from_slice(&self.block.to_be_bytes());
        buf
    }

    /// Serialize to the canonical layout, signatures included.
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = self.encode_unsigned();
        buf.extend_from_slice(&self.creator_signature);
        buf.extend_from_slice(&self.sender_signature);
        buf
    }

    /// Decode from the canonical layout, rederiving the id.
    pub fn unmarshal(data: &[u8]) -> Result<Transaction, TransactionError> {
        let mut cursor = Cursor { data, offset: 0 };

        let sender = cursor.take::<32>()?;
        let creator = cursor.take::<32>()?;
        let nonce = u64::from_be_bytes(cursor.take::<8>()?);
        let tag = Tag::try_from(cursor.take::<1>()?[0])?;

        let payload_len = u32::from_be_bytes(cursor.take::<4>()?) as usize;
        if payload_len > MAX_PAYLOAD_BYTES {
            return Err(TransactionError::PayloadTooLarge(payload_len));
        }
        let payload = cursor.take_slice(payload_len)?.to_vec();

        let parents_len = u32::from_be_bytes(cursor.take::<4>()?) as usize;
        if parents_len > MAX_PARENTS {
            return Err(TransactionError::TooManyParents(parents_len));
        }
        let mut parents = Vec::with_capacity(parents_len);
        for _ in 0..parents_len {
            parents.push(cursor.take::<32>()?);
        }

        let block = u64::from_be_bytes(cursor.take::<8>()?);
        let creator_signature = cursor.take::<64>()?;
        let sender_signature = cursor.take::<64>()?;

        if cursor.remaining() != 0 {
            return Err(TransactionError::TrailingBytes);
        }

        let mut tx = Transaction {
            sender,
            creator,
            nonce,
            block,
            tag,
            payload,
            parents,
            creator_signature,
            sender_signature,
            id: [0; 32],
        };
        tx.id = blake2b(&[&tx.encode_unsigned()]);
        Ok(tx)
    }

    /// Verify both signatures against the embedded public keys.
    pub fn verify_signature(&self) -> bool {
        let Ok(creator_key) = VerifyingKey::from_bytes(&self.creator) else {
            return false;
        };
        let creator_sig = Signature::from_bytes(&self.creator_signature);
        if creator_key
            .verify(&creator_sign_data(self.tag, &self.payload), &creator_sig)
            .is_err()
        {
            return false;
        }

        let Ok(sender_key) = VerifyingKey::from_bytes(&self.sender) else {
            return false;
        };
        let sender_sig = Signature::from_bytes(&self.sender_signature);
        sender_key
            .verify(
                &sender_sign_data(self.tag, &self.payload, &self.parents),
                &sender_sig,
            )
            .is_ok()
    }

    /// The deterministic 64-bit sort index of this transaction under the
    /// given predecessor block.
    pub fn logical_index(&self, block_id: &BlockId) -> u64 {
        highway64(&[block_id, &self.id])
    }

    /// Total sort key under a predecessor block: the logical index with the
    /// transaction id breaking 64-bit collisions.
    pub fn sort_key(&self, block_id: &BlockId) -> (u64, TransactionId) {
        (self.logical_index(block_id), self.id)
    }
}

fn creator_sign_data(tag: Tag, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + payload.len());
    buf.push(tag as u8);
    buf.extend_from_slice(payload);
    buf
}

fn sender_sign_data(tag: Tag, payload: &[u8], parents: &[TransactionId]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + payload.len() + parents.len() * 32);
    buf.push(tag as u8);
    buf.extend_from_slice(payload);
    for parent in parents {
        buf.extend_from_slice(parent);
    }
    buf
}

fn tx_key(id: &TransactionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(TX_PREFIX.len() + 32);
    key.extend_from_slice(TX_PREFIX);
    key.extend_from_slice(id);
    key
}

/// Persist transaction bodies under `tx/<id>`.
pub fn store_transactions(kv: &dyn Kv, txs: &[Transaction]) -> Result<(), StoreError> {
    for tx in txs {
        kv.put(&tx_key(&tx.id), &tx.marshal())?;
    }
    Ok(())
}

/// Load the bodies of the given ids, skipping any that are absent.
pub fn load_transactions(kv: &dyn Kv, ids: &[TransactionId]) -> Result<Vec<Transaction>, StoreError> {
    let mut txs = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(bytes) = kv.get(&tx_key(id))? {
            match Transaction::unmarshal(&bytes) {
                Ok(tx) => txs.push(tx),
                Err(e) => return Err(StoreError::Corrupt(format!("transaction {}: {e}", hex::encode(id)))),
            }
        }
    }
    Ok(txs)
}

/// Delete the bodies of the given ids.
pub fn delete_transactions(kv: &dyn Kv, ids: &[TransactionId]) -> Result<(), StoreError> {
    for id in ids {
        kv.delete(&tx_key(id))?;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn id_excludes_signatures() {
        let key = keypair(1);
        let a = nop(&key, 0, 0);
        let mut b = a.clone();
        b.sender_signature = [0xFF; 64];
        // Recompute the way unmarshal would: id depends only on the unsigned
        // encoding.
        assert_eq!(blake2b(&[&b.encode_unsigned()]), a.id);
    }

    #[test]
    fn marshal_roundtrip() {
        let key = keypair(2);
        let other = keypair(3);
        let tx = Transaction::new(
            &key,
            &other,
            42,
            7,
            Tag::Transfer,
            vec![1, 2, 3],
            vec![[9u8; 32]],
        );
        let decoded = Transaction::unmarshal(&tx.marshal()).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.id, tx.id);
        assert!(decoded.verify_signature());
    }

    #[test]
    fn verify_rejects_tampered_payload() {
        let key = keypair(4);
        let tx = Transaction::new(&key, &key, 0, 0, Tag::Transfer, vec![1, 2, 3], vec![]);
        let mut bytes = tx.marshal();
        // Flip one payload byte (offset: 32+32+8+1+4 = 77).
        bytes[77] ^= 0x01;
        let decoded = Transaction::unmarshal(&bytes).unwrap();
        assert!(!decoded.verify_signature());
        assert_ne!(decoded.id, tx.id);
    }

    #[test]
    fn verify_rejects_wrong_sender_key() {
        let key = keypair(5);
        let tx = Transaction::new(&key, &key, 0, 0, Tag::Nop, vec![], vec![]);
        let mut bytes = tx.marshal();
        bytes[0] ^= 0x01; // corrupt the sender public key
        let decoded = Transaction::unmarshal(&bytes).unwrap();
        assert!(!decoded.verify_signature());
    }

    #[test]
    fn unmarshal_rejects_truncated_and_trailing() {
        let key = keypair(6);
        let tx = nop(&key, 0, 0);
        let bytes = tx.marshal();
        assert!(Transaction::unmarshal(&bytes[..bytes.len() - 1]).is_err());

        let mut extended = bytes.clone();
        extended.push(0);
        assert!(matches!(
            Transaction::unmarshal(&extended),
            Err(TransactionError::TrailingBytes)
        ));
    }

    #[test]
    fn unmarshal_rejects_unknown_tag() {
        let key = keypair(7);
        let tx = nop(&key, 0, 0);
        let mut bytes = tx.marshal();
        bytes[72] = 0x7F; // tag byte offset: 32+32+8
        assert!(matches!(
            Transaction::unmarshal(&bytes),
            Err(TransactionError::UnknownTag(0x7F))
        ));
    }

    #[test]
    fn logical_index_depends_on_base_block() {
        let key = keypair(8);
        let tx = nop(&key, 0, 0);
        let a = tx.logical_index(&[1u8; 32]);
        let b = tx.logical_index(&[2u8; 32]);
        assert_ne!(a, b);
        // Stable for a fixed base.
        assert_eq!(a, tx.logical_index(&[1u8; 32]));
    }

    #[test]
    fn store_load_delete_roundtrip() {
        use crate::store::{Kv, MemKv};

        let kv = MemKv::new();
        let key = keypair(9);
        let txs: Vec<Transaction> = (0..3).map(|n| nop(&key, n, 0)).collect();
        let ids: Vec<TransactionId> = txs.iter().map(|tx| tx.id).collect();

        store_transactions(&kv, &txs).unwrap();
        let loaded = load_transactions(&kv, &ids).unwrap();
        assert_eq!(loaded, txs);

        delete_transactions(&kv, &ids[..1]).unwrap();
        let loaded = load_transactions(&kv, &ids).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(kv.get(&tx_key(&ids[0])).unwrap().is_none());
    }
}
