//! Cuckoo filter over transaction ids.
//!
//! Backs mempool set-reconciliation: a node hands its marshalled filter to a
//! peer, and the peer streams back every transaction whose id fails the
//! membership check. Four 16-bit fingerprints per bucket, two candidate
//! buckets per item, relocation on collision. Lookups may report false
//! positives (those transactions are simply picked up on a later round);
//! never false negatives for inserted ids.

use rand::Rng;

use crate::{highway64, TransactionId};

const SLOTS_PER_BUCKET: usize = 4;
const MAX_KICKS: usize = 500;

/// Errors from decoding a marshalled filter.
#[derive(Clone, Debug, thiserror::Error)]
pub enum FilterError {
    #[error("filter encoding is truncated")]
    Truncated,
    #[error("filter bucket count {0} is not a power of two")]
    BadBucketCount(u32),
    #[error("filter bucket count {0} exceeds the decode limit")]
    TooLarge(u32),
}

/// Upper bound on bucket count accepted from the wire (64 MiB of slots).
const MAX_BUCKETS: u32 = 1 << 23;

/// A cuckoo filter keyed by 32-byte transaction ids.
#[derive(Clone)]
pub struct Filter {
    /// Fingerprints; 0 marks an empty slot.
    buckets: Vec<[u16; SLOTS_PER_BUCKET]>,
    len: usize,
}

impl Filter {
    /// A filter sized from a bit budget: each bucket holds four 16-bit
    /// fingerprints, so `m` bits yield `m / 64` buckets.
    pub fn with_bits(m: usize) -> Self {
        let buckets = (m / 64).next_power_of_two().max(1);
        Filter {
            buckets: vec![[0; SLOTS_PER_BUCKET]; buckets],
            len: 0,
        }
    }

    fn mask(&self) -> usize {
        self.buckets.len() - 1
    }

    fn fingerprint_and_index(&self, id: &TransactionId) -> (u16, usize) {
        let hash = highway64(&[id]);
        let mut fingerprint = (hash & 0xFFFF) as u16;
        if fingerprint == 0 {
            fingerprint = 1;
        }
        let index = (hash >> 16) as usize & self.mask();
        (fingerprint, index)
    }

    fn alt_index(&self, index: usize, fingerprint: u16) -> usize {
        index ^ (highway64(&[&fingerprint.to_be_bytes()]) as usize & self.mask())
    }

    /// Insert an id. Returns false if the filter could not place it after the
    /// relocation budget was spent (the filter is effectively saturated).
    pub fn insert(&mut self, id: &TransactionId) -> bool {
        let (fingerprint, i1) = self.fingerprint_and_index(id);
        let i2 = self.alt_index(i1, fingerprint);

        if self.try_place(i1, fingerprint) || self.try_place(i2, fingerprint) {
            self.len += 1;
            return true;
        }

        // Relocate a random resident fingerprint until a slot frees up.
        let mut rng = rand::thread_rng();
        let mut index = if rng.gen::<bool>() { i1 } else { i2 };
        let mut fingerprint = fingerprint;
        for _ in 0..MAX_KICKS {
            let slot = rng.gen_range(0..SLOTS_PER_BUCKET);
            std::mem::swap(&mut self.buckets[index][slot], &mut fingerprint);
            index = self.alt_index(index, fingerprint);
            if self.try_place(index, fingerprint) {
                self.len += 1;
                return true;
            }
        }
        false
    }

    fn try_place(&mut self, index: usize, fingerprint: u16) -> bool {
        for slot in self.buckets[index].iter_mut() {
            if *slot == 0 {
                *slot = fingerprint;
                return true;
            }
        }
        false
    }

    /// Membership check; false positives possible, false negatives are not.
    pub fn contains(&self, id: &TransactionId) -> bool {
        let (fingerprint, i1) = self.fingerprint_and_index(id);
        let i2 = self.alt_index(i1, fingerprint);
        self.buckets[i1].contains(&fingerprint) || self.buckets[i2].contains(&fingerprint)
    }

    /// Remove one copy of an id's fingerprint. Returns whether one was found.
    pub fn delete(&mut self, id: &TransactionId) -> bool {
        let (fingerprint, i1) = self.fingerprint_and_index(id);
        let i2 = self.alt_index(i1, fingerprint);
        for index in [i1, i2] {
            for slot in self.buckets[index].iter_mut() {
                if *slot == fingerprint {
                    *slot = 0;
                    self.len -= 1;
                    return true;
                }
            }
        }
        false
    }

    /// Drop every entry, keeping capacity.
    pub fn reset(&mut self) {
        for bucket in self.buckets.iter_mut() {
            *bucket = [0; SLOTS_PER_BUCKET];
        }
        self.len = 0;
    }

    /// Approximate number of resident ids.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Serialize for the wire: bucket count, then fingerprints row-major.
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.buckets.len() * SLOTS_PER_BUCKET * 2);
        buf.extend_from_slice(&(self.buckets.len() as u32).to_be_bytes());
        for bucket in &self.buckets {
            for slot in bucket {
                buf.extend_from_slice(&slot.to_be_bytes());
            }
        }
        buf
    }

    pub fn unmarshal(data: &[u8]) -> Result<Filter, FilterError> {
        if data.len() < 4 {
            return Err(FilterError::Truncated);
        }
        let count = u32::from_be_bytes(data[..4].try_into().expect("4 bytes"));
        if !count.is_power_of_two() {
            return Err(FilterError::BadBucketCount(count));
        }
        if count > MAX_BUCKETS {
            return Err(FilterError::TooLarge(count));
        }
        let expected = 4 + count as usize * SLOTS_PER_BUCKET * 2;
        if data.len() != expected {
            return Err(FilterError::Truncated);
        }

        let mut buckets = Vec::with_capacity(count as usize);
        let mut len = 0;
        let mut offset = 4;
        for _ in 0..count {
            let mut bucket = [0u16; SLOTS_PER_BUCKET];
            for slot in bucket.iter_mut() {
                *slot = u16::from_be_bytes(data[offset..offset + 2].try_into().expect("2 bytes"));
                offset += 2;
                if *slot != 0 {
                    len += 1;
                }
            }
            buckets.push(bucket);
        }
        Ok(Filter { buckets, len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> TransactionId {
        let mut id = [0u8; 32];
        id[..4].copy_from_slice(&n.to_be_bytes());
        id
    }

    fn small() -> Filter {
        Filter::with_bits(1 << 16)
    }

    #[test]
    fn insert_then_contains() {
        let mut filter = small();
        for n in 0..512 {
            assert!(filter.insert(&id(n)));
        }
        for n in 0..512 {
            assert!(filter.contains(&id(n)), "lost id {n}");
        }
        assert_eq!(filter.len(), 512);
    }

    #[test]
    fn delete_removes_membership() {
        let mut filter = small();
        filter.insert(&id(1));
        filter.insert(&id(2));
        assert!(filter.delete(&id(1)));
        assert!(!filter.delete(&id(1)));
        assert!(!filter.contains(&id(1)));
        assert!(filter.contains(&id(2)));
        assert_eq!(filter.len(), 1);
    }

    #[test]
    fn reset_clears_everything() {
        let mut filter = small();
        for n in 0..64 {
            filter.insert(&id(n));
        }
        filter.reset();
        assert!(filter.is_empty());
        for n in 0..64 {
            assert!(!filter.contains(&id(n)));
        }
    }

    #[test]
    fn marshal_roundtrip_preserves_membership() {
        let mut filter = small();
        for n in 0..256 {
            filter.insert(&id(n));
        }
        let decoded = Filter::unmarshal(&filter.marshal()).unwrap();
        assert_eq!(decoded.len(), filter.len());
        for n in 0..256 {
            assert!(decoded.contains(&id(n)));
        }
    }

    #[test]
    fn unmarshal_rejects_bad_input() {
        assert!(matches!(
            Filter::unmarshal(&[0, 0]),
            Err(FilterError::Truncated)
        ));
        assert!(matches!(
            Filter::unmarshal(&3u32.to_be_bytes()),
            Err(FilterError::BadBucketCount(3))
        ));
        let mut truncated = 16u32.to_be_bytes().to_vec();
        truncated.extend_from_slice(&[0u8; 7]);
        assert!(matches!(
            Filter::unmarshal(&truncated),
            Err(FilterError::Truncated)
        ));
        assert!(matches!(
            Filter::unmarshal(&(1u32 << 24).to_be_bytes()),
            Err(FilterError::TooLarge(_))
        ));
    }

    #[test]
    fn low_false_positive_rate_at_moderate_load() {
        let mut filter = small();
        for n in 0..1024 {
            filter.insert(&id(n));
        }
        let mut false_positives = 0;
        for n in 10_000..20_000 {
            if filter.contains(&id(n)) {
                false_positives += 1;
            }
        }
        // 16-bit fingerprints: expect well under 1%.
        assert!(false_positives < 100, "{false_positives} false positives");
    }
}
