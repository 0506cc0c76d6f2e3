//! Common cryptography helper functions for Agora

use crate::hash::Hash;
use blake2::{digest::consts::U32, Blake2b, Digest};

/// Get a Blake2b-256 hash of some data
pub fn blake2b_256(data: &[u8]) -> Hash<32> {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(data);
    finish(hasher)
}

/// Get a Blake2b-256 hash over several parts, as if they were concatenated
pub fn blake2b_256_parts(parts: &[&[u8]]) -> Hash<32> {
    let mut hasher = Blake2b::<U32>::new();
    for part in parts {
        hasher.update(part);
    }
    finish(hasher)
}

fn finish(hasher: Blake2b<U32>) -> Hash<32> {
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&hasher.finalize());
    Hash::new(bytes)
}

/// Binary merkle root over a list of leaf hashes.
///
/// Each level pairs neighbours and hashes their concatenation. An odd node at
/// the end of a level is promoted unchanged. An empty list has the zero hash as
/// its root.
pub fn merkle_root(leaves: &[Hash<32>]) -> Hash<32> {
    if leaves.is_empty() {
        return Hash::default();
    }

    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => blake2b_256_parts(&[left.as_ref(), right.as_ref()]),
                [single] => *single,
                _ => unreachable!("chunks(2) yields one or two items"),
            })
            .collect();
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blake2b_256_is_stable() {
        // Blake2b-256 of the empty string
        assert_eq!(
            blake2b_256(b"").to_string(),
            "0e5751c026e543b2e8ab2eb06099daa1d1e5df47778f7787faab45cdf12fe3a8"
        );
    }

    #[test]
    fn parts_hash_equals_concatenation() {
        assert_eq!(blake2b_256_parts(&[b"ab", b"cd"]), blake2b_256(b"abcd"));
    }

    #[test]
    fn empty_merkle_root_is_zero() {
        assert_eq!(merkle_root(&[]), Hash::default());
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let leaf = blake2b_256(b"tx");
        assert_eq!(merkle_root(&[leaf]), leaf);
    }

    #[test]
    fn odd_leaf_is_promoted() {
        let a = blake2b_256(b"a");
        let b = blake2b_256(b"b");
        let c = blake2b_256(b"c");
        let ab = blake2b_256_parts(&[a.as_ref(), b.as_ref()]);
        let expected = blake2b_256_parts(&[ab.as_ref(), c.as_ref()]);
        assert_eq!(merkle_root(&[a, b, c]), expected);
    }

    #[test]
    fn order_matters() {
        let a = blake2b_256(b"a");
        let b = blake2b_256(b"b");
        assert_ne!(merkle_root(&[a, b]), merkle_root(&[b, a]));
    }
}
