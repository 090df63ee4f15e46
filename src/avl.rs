//! Persistent, versioned AVL tree backing the account state.
//!
//! Snapshots are O(1): the tree is an immutable structure of `Arc`-shared
//! nodes, and every mutation path-copies from the root, so a cloned `Tree` is
//! a stable view that never observes later writes. Each node is tagged with
//! the tree version current at the time it was written (the consensus loop
//! sets the version to the finalized block index), and carries the maximum
//! version of its subtree so diff traversals can prune unchanged branches.
//!
//! The Merkle checksum is computed over the in-order sequence of leaves, so
//! it depends only on tree *contents*, never on insertion order or rotation
//! history. `dump_diff(since)` / `apply_diff` form an inverse pair: applying
//! the diff to the tree as of `since` reproduces the source tree's checksum.

use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::{blake2b, Checksum};

/// Errors from decoding a serialized tree diff.
#[derive(Clone, Debug, thiserror::Error)]
pub enum DiffError {
    #[error("diff encoding is truncated")]
    Truncated,
    #[error("diff entry has unknown tag {0}")]
    UnknownEntryTag(u8),
}

#[derive(Debug)]
struct Node {
    key: Box<[u8]>,
    value: Vec<u8>,
    version: u64,
    height: u32,
    max_version: u64,
    left: Option<Arc<Node>>,
    right: Option<Arc<Node>>,
}

fn height(node: &Option<Arc<Node>>) -> u32 {
    node.as_ref().map_or(0, |n| n.height)
}

fn subtree_max_version(node: &Option<Arc<Node>>) -> u64 {
    node.as_ref().map_or(0, |n| n.max_version)
}

fn mk(
    key: Box<[u8]>,
    value: Vec<u8>,
    version: u64,
    left: Option<Arc<Node>>,
    right: Option<Arc<Node>>,
) -> Arc<Node> {
    let height = 1 + height(&left).max(height(&right));
    let max_version = version
        .max(subtree_max_version(&left))
        .max(subtree_max_version(&right));
    Arc::new(Node {
        key,
        value,
        version,
        height,
        max_version,
        left,
        right,
    })
}

fn factor(node: &Node) -> i32 {
    height(&node.left) as i32 - height(&node.right) as i32
}

fn rotate_right(node: &Node) -> Arc<Node> {
    let l = node.left.as_ref().expect("left-heavy node has a left child");
    let new_right = mk(
        node.key.clone(),
        node.value.clone(),
        node.version,
        l.right.clone(),
        node.right.clone(),
    );
    mk(
        l.key.clone(),
        l.value.clone(),
        l.version,
        l.left.clone(),
        Some(new_right),
    )
}

fn rotate_left(node: &Node) -> Arc<Node> {
    let r = node.right.as_ref().expect("right-heavy node has a right child");
    let new_left = mk(
        node.key.clone(),
        node.value.clone(),
        node.version,
        node.left.clone(),
        r.left.clone(),
    );
    mk(
        r.key.clone(),
        r.value.clone(),
        r.version,
        Some(new_left),
        r.right.clone(),
    )
}

fn balance(node: Arc<Node>) -> Arc<Node> {
    let bf = factor(&node);
    if bf > 1 {
        let left = node.left.as_ref().expect("factor > 1 implies a left child");
        if factor(left) < 0 {
            let rotated = rotate_left(left);
            let rebuilt = mk(
                node.key.clone(),
                node.value.clone(),
                node.version,
                Some(rotated),
                node.right.clone(),
            );
            rotate_right(&rebuilt)
        } else {
            rotate_right(&node)
        }
    } else if bf < -1 {
        let right = node.right.as_ref().expect("factor < -1 implies a right child");
        if factor(right) > 0 {
            let rotated = rotate_right(right);
            let rebuilt = mk(
                node.key.clone(),
                node.value.clone(),
                node.version,
                node.left.clone(),
                Some(rotated),
            );
            rotate_left(&rebuilt)
        } else {
            rotate_left(&node)
        }
    } else {
        node
    }
}

fn insert_node(
    node: &Option<Arc<Node>>,
    key: &[u8],
    value: &[u8],
    version: u64,
) -> (Arc<Node>, bool) {
    match node {
        None => (
            mk(key.into(), value.to_vec(), version, None, None),
            true,
        ),
        Some(n) => match key.cmp(&n.key) {
            std::cmp::Ordering::Equal => (
                mk(
                    n.key.clone(),
                    value.to_vec(),
                    version,
                    n.left.clone(),
                    n.right.clone(),
                ),
                false,
            ),
            std::cmp::Ordering::Less => {
                let (new_left, added) = insert_node(&n.left, key, value, version);
                let rebuilt = mk(
                    n.key.clone(),
                    n.value.clone(),
                    n.version,
                    Some(new_left),
                    n.right.clone(),
                );
                (balance(rebuilt), added)
            }
            std::cmp::Ordering::Greater => {
                let (new_right, added) = insert_node(&n.right, key, value, version);
                let rebuilt = mk(
                    n.key.clone(),
                    n.value.clone(),
                    n.version,
                    n.left.clone(),
                    Some(new_right),
                );
                (balance(rebuilt), added)
            }
        },
    }
}

/// Extract the minimum node of a subtree, returning (min, rest).
fn take_min(node: &Arc<Node>) -> (Arc<Node>, Option<Arc<Node>>) {
    match &node.left {
        None => (node.clone(), node.right.clone()),
        Some(left) => {
            let (min, rest) = take_min(left);
            let rebuilt = mk(
                node.key.clone(),
                node.value.clone(),
                node.version,
                rest,
                node.right.clone(),
            );
            (min, Some(balance(rebuilt)))
        }
    }
}

fn delete_node(node: &Option<Arc<Node>>, key: &[u8]) -> (Option<Arc<Node>>, bool) {
    let Some(n) = node else {
        return (None, false);
    };
    match key.cmp(&n.key) {
        std::cmp::Ordering::Equal => match (&n.left, &n.right) {
            (None, right) => (right.clone(), true),
            (left, None) => (left.clone(), true),
            (left, Some(right)) => {
                let (successor, rest) = take_min(right);
                let rebuilt = mk(
                    successor.key.clone(),
                    successor.value.clone(),
                    successor.version,
                    left.clone(),
                    rest,
                );
                (Some(balance(rebuilt)), true)
            }
        },
        std::cmp::Ordering::Less => {
            let (new_left, removed) = delete_node(&n.left, key);
            if !removed {
                return (node.clone(), false);
            }
            let rebuilt = mk(
                n.key.clone(),
                n.value.clone(),
                n.version,
                new_left,
                n.right.clone(),
            );
            (Some(balance(rebuilt)), true)
        }
        std::cmp::Ordering::Greater => {
            let (new_right, removed) = delete_node(&n.right, key);
            if !removed {
                return (node.clone(), false);
            }
            let rebuilt = mk(
                n.key.clone(),
                n.value.clone(),
                n.version,
                n.left.clone(),
                new_right,
            );
            (Some(balance(rebuilt)), true)
        }
    }
}

/// A copy-on-write view of the account state at one version.
#[derive(Debug)]
pub struct Tree {
    root: Option<Arc<Node>>,
    version: u64,
    len: usize,
    /// Deleted keys with the version the deletion happened at, kept so diffs
    /// can replicate removals.
    tombstones: Vec<(Box<[u8]>, u64)>,
    checksum: OnceCell<Checksum>,
}

impl Clone for Tree {
    fn clone(&self) -> Self {
        Tree {
            root: self.root.clone(),
            version: self.version,
            len: self.len,
            tombstones: self.tombstones.clone(),
            checksum: self.checksum.clone(),
        }
    }
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    pub fn new() -> Self {
        Tree {
            root: None,
            version: 0,
            len: 0,
            tombstones: Vec::new(),
            checksum: OnceCell::new(),
        }
    }

    /// The version new writes are tagged with.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Set the write version; the consensus loop pins it to the block index
    /// being collapsed.
    pub fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        let mut cursor = self.root.as_deref();
        while let Some(n) = cursor {
            match key.cmp(&n.key) {
                std::cmp::Ordering::Equal => return Some(&n.value),
                std::cmp::Ordering::Less => cursor = n.left.as_deref(),
                std::cmp::Ordering::Greater => cursor = n.right.as_deref(),
            }
        }
        None
    }

    pub fn insert(&mut self, key: &[u8], value: &[u8]) {
        self.insert_with_version(key, value, self.version);
    }

    fn insert_with_version(&mut self, key: &[u8], value: &[u8], version: u64) {
        let (new_root, added) = insert_node(&self.root, key, value, version);
        self.root = Some(new_root);
        if added {
            self.len += 1;
        }
        self.checksum = OnceCell::new();
    }

    pub fn delete(&mut self, key: &[u8]) -> bool {
        self.delete_with_version(key, self.version)
    }

    fn delete_with_version(&mut self, key: &[u8], version: u64) -> bool {
        let (new_root, removed) = delete_node(&self.root, key);
        if removed {
            self.root = new_root;
            self.len -= 1;
            self.tombstones.push((key.into(), version));
            self.checksum = OnceCell::new();
        }
        removed
    }

    /// Merkle checksum over the in-order leaf sequence. Deterministic over
    /// contents, independent of the order mutations happened in. Memoized
    /// until the next mutation.
    pub fn checksum(&self) -> Checksum {
        *self.checksum.get_or_init(|| {
            let mut leaves = Vec::with_capacity(self.len);
            in_order(&self.root, &mut |n: &Node| {
                leaves.push(blake2b(&[
                    &(n.key.len() as u32).to_be_bytes(),
                    &n.key,
                    &(n.value.len() as u32).to_be_bytes(),
                    &n.value,
                ]));
            });
            merkle_root(leaves)
        })
    }

    /// Serialize every leaf written after `since`, plus the tombstones needed
    /// to replicate deletions.
    pub fn dump_diff(&self, since: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        self.for_each_changed(since, |key, value, version| {
            buf.push(0u8);
            buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
            buf.extend_from_slice(key);
            buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
            buf.extend_from_slice(value);
            buf.extend_from_slice(&version.to_be_bytes());
        });
        for (key, version) in self.tombstones_since(since) {
            buf.push(1u8);
            buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
            buf.extend_from_slice(&key);
            buf.extend_from_slice(&version.to_be_bytes());
        }
        buf
    }

    /// Replay a diff produced by `dump_diff` on the version of the tree it
    /// was taken against.
    pub fn apply_diff(&mut self, mut data: &[u8]) -> Result<(), DiffError> {
        fn take<'a>(data: &mut &'a [u8], n: usize) -> Result<&'a [u8], DiffError> {
            if data.len() < n {
                return Err(DiffError::Truncated);
            }
            let (head, rest) = data.split_at(n);
            *data = rest;
            Ok(head)
        }
        fn take_u32(data: &mut &[u8]) -> Result<usize, DiffError> {
            Ok(u32::from_be_bytes(take(data, 4)?.try_into().expect("4 bytes")) as usize)
        }
        fn take_u64(data: &mut &[u8]) -> Result<u64, DiffError> {
            Ok(u64::from_be_bytes(take(data, 8)?.try_into().expect("8 bytes")))
        }

        let mut max_version = self.version;
        while !data.is_empty() {
            let tag = take(&mut data, 1)?[0];
            match tag {
                0 => {
                    let key_len = take_u32(&mut data)?;
                    let key = take(&mut data, key_len)?.to_vec();
                    let value_len = take_u32(&mut data)?;
                    let value = take(&mut data, value_len)?.to_vec();
                    let version = take_u64(&mut data)?;
                    self.insert_with_version(&key, &value, version);
                    max_version = max_version.max(version);
                }
                1 => {
                    let key_len = take_u32(&mut data)?;
                    let key = take(&mut data, key_len)?.to_vec();
                    let version = take_u64(&mut data)?;
                    self.delete_with_version(&key, version);
                    max_version = max_version.max(version);
                }
                other => return Err(DiffError::UnknownEntryTag(other)),
            }
        }
        self.version = max_version;
        Ok(())
    }

    /// Visit every leaf written after `since`, in key order.
    pub fn iterate_leaf_diff(&self, since: u64, mut cb: impl FnMut(&[u8], &[u8])) {
        self.for_each_changed(since, |key, value, _| cb(key, value));
    }

    /// Like `iterate_leaf_diff` but exposing node versions; used by the
    /// persistence layer.
    pub(crate) fn for_each_changed(&self, since: u64, mut cb: impl FnMut(&[u8], &[u8], u64)) {
        fn walk(node: &Option<Arc<Node>>, since: u64, cb: &mut impl FnMut(&[u8], &[u8], u64)) {
            let Some(n) = node else { return };
            if n.max_version <= since {
                return; // nothing below here changed
            }
            walk(&n.left, since, cb);
            if n.version > since {
                cb(&n.key, &n.value, n.version);
            }
            walk(&n.right, since, cb);
        }
        walk(&self.root, since, &mut cb);
    }

    /// Visit every leaf, in key order.
    pub(crate) fn for_each(&self, mut cb: impl FnMut(&[u8], &[u8], u64)) {
        in_order(&self.root, &mut |n: &Node| cb(&n.key, &n.value, n.version));
    }

    /// Tombstones recorded after `since`, deduplicated to the newest per key
    /// and excluding keys that have since been re-inserted.
    pub(crate) fn tombstones_since(&self, since: u64) -> Vec<(Box<[u8]>, u64)> {
        let mut latest: std::collections::BTreeMap<&[u8], u64> = std::collections::BTreeMap::new();
        for (key, version) in &self.tombstones {
            if *version > since && self.get(key).is_none() {
                let entry = latest.entry(key).or_insert(*version);
                *entry = (*entry).max(*version);
            }
        }
        latest
            .into_iter()
            .map(|(key, version)| (key.into(), version))
            .collect()
    }

    #[cfg(test)]
    fn root_height(&self) -> u32 {
        height(&self.root)
    }
}

fn in_order(node: &Option<Arc<Node>>, cb: &mut impl FnMut(&Node)) {
    if let Some(n) = node {
        in_order(&n.left, cb);
        cb(n);
        in_order(&n.right, cb);
    }
}

fn merkle_root(mut level: Vec<Checksum>) -> Checksum {
    if level.is_empty() {
        return blake2b(&[b"cascade.empty.state"]);
    }
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            if pair.len() == 2 {
                next.push(blake2b(&[&pair[0], &pair[1]]));
            } else {
                next.push(pair[0]);
            }
        }
        level = next;
    }
    level[0]
}
