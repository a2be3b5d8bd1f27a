//! # Hashing Utilities
//!
//! Two hash functions, each with one job:
//!
//! - **BLAKE3** - the default. Transaction ids, block hashes, message ids,
//!   CRDS digests, the turbine tree ordering, the selector's RNG seed. If a
//!   value is QUASAR-native and needs a digest, it gets BLAKE3.
//!
//! - **SHA-256** - reserved for the Proof of History chain. PoH is a
//!   sequential hash loop whose whole point is that it cannot be
//!   parallelized, and SHA-256 is what every PoH verifier on the planet
//!   already has hardware acceleration for. Speed of a single hash matters
//!   less than the fact that the chain can be replayed anywhere.
//!
//! Everything here returns fixed-size `[u8; 32]` arrays. The [`Hash`] alias
//! exists so signatures read as intent rather than as byte soup.

use sha2::{Digest, Sha256};

/// A 32-byte digest. Both hash functions in this module produce one.
pub type Hash = [u8; 32];

/// The all-zero digest. Used as the parent hash of genesis and as the
/// "nothing here yet" sentinel for empty Merkle trees.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Compute the SHA-256 hash of the input data.
///
/// ```
/// use quasar_protocol::crypto::sha256;
///
/// let hash = sha256(b"QUASAR protocol");
/// assert_eq!(hash.len(), 32);
/// ```
pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 over several slices fed sequentially, without concatenating
/// them into a temporary buffer first. `sha256_multi(&[a, b])` equals
/// `sha256(a ‖ b)`.
pub fn sha256_multi(parts: &[&[u8]]) -> Hash {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Compute the BLAKE3 hash of the input data.
///
/// The workhorse. Uses SIMD where the platform has it, which for the small
/// inputs we typically hash (a transaction, a header, a node id) mostly
/// means "fast enough to never show up in a profile".
///
/// ```
/// use quasar_protocol::crypto::blake3_hash;
///
/// let hash = blake3_hash(b"QUASAR protocol");
/// assert_eq!(hash.len(), 32);
/// ```
pub fn blake3_hash(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

/// Hash multiple byte slices together without concatenation overhead.
///
/// Same result as hashing the concatenation, less allocation. Used for
/// composite keys like `block_hash ‖ node_id` in the turbine tree.
pub fn blake3_hash_multi(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Compute a domain-separated hash using BLAKE3's `derive_key` mode.
///
/// `domain_separated_hash("quasar.block", data)` and
/// `domain_separated_hash("quasar.tx", data)` never collide even for
/// identical `data`, because the context string selects a different IV.
/// Prepending a tag by hand is not the same thing. Don't.
pub fn domain_separated_hash(context: &str, data: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Compute a Merkle root from a list of leaf hashes using BLAKE3.
///
/// Plain binary tree. An odd leaf at any level is paired with itself (the
/// Bitcoin rule; duplicate transactions are rejected by the pool long before
/// a block is built, so CVE-2012-2459 does not apply). A single leaf is also
/// paired with itself so the root is always a hash output, never a raw leaf.
///
/// Returns [`ZERO_HASH`] for an empty input.
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return ZERO_HASH;
    }

    let mut current_level: Vec<Hash> = leaves.to_vec();

    if current_level.len() == 1 {
        return blake3_hash_multi(&[current_level[0].as_slice(), current_level[0].as_slice()]);
    }

    while current_level.len() > 1 {
        let mut next_level = Vec::with_capacity((current_level.len() + 1) / 2);

        for chunk in current_level.chunks(2) {
            let left = &chunk[0];
            let right = if chunk.len() == 2 { &chunk[1] } else { &chunk[0] };
            next_level.push(blake3_hash_multi(&[left.as_slice(), right.as_slice()]));
        }

        current_level = next_level;
    }

    current_level[0]
}

/// Short hex prefix of a digest for log lines. Eight bytes is plenty to
/// eyeball-correlate entries across nodes without flooding the terminal.
pub fn short_hex(hash: &Hash) -> String {
    hex::encode(&hash[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        // SHA-256 of the empty string, the vector everyone has memorized.
        let hash = sha256(b"");
        let expected =
            hex::decode("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
                .unwrap();
        assert_eq!(hash.as_slice(), expected.as_slice());
    }

    #[test]
    fn sha256_multi_matches_concatenation() {
        let joined = sha256(b"quasarpoh");
        let multi = sha256_multi(&[b"quasar", b"poh"]);
        assert_eq!(joined, multi);
    }

    #[test]
    fn blake3_deterministic() {
        let a = blake3_hash(b"quasar");
        let b = blake3_hash(b"quasar");
        assert_eq!(a, b);
        assert_ne!(a, blake3_hash(b"Quasar"));
    }

    #[test]
    fn blake3_multi_matches_concatenation() {
        assert_eq!(
            blake3_hash(b"helloworld"),
            blake3_hash_multi(&[b"hello", b"world"])
        );
    }

    #[test]
    fn domain_separation_changes_output() {
        let a = domain_separated_hash("quasar.block", b"payload");
        let b = domain_separated_hash("quasar.tx", b"payload");
        assert_ne!(a, b);
        assert_ne!(a, blake3_hash(b"payload"));
    }

    #[test]
    fn merkle_root_edge_cases() {
        assert_eq!(merkle_root(&[]), ZERO_HASH);

        let leaf = blake3_hash(b"tx-1");
        let single = merkle_root(&[leaf]);
        assert_ne!(single, leaf);

        let leaves: Vec<Hash> = (0..5u8).map(|i| blake3_hash(&[i])).collect();
        let root = merkle_root(&leaves);
        let mut swapped = leaves.clone();
        swapped.swap(0, 1);
        assert_ne!(root, merkle_root(&swapped), "order must matter");
    }

    #[test]
    fn short_hex_is_sixteen_chars() {
        assert_eq!(short_hex(&blake3_hash(b"x")).len(), 16);
    }
}
