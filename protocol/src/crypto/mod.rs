//! # Cryptographic Primitives
//!
//! Boring, audited cryptography and nothing else:
//!
//! - **Ed25519** for node identities and every signature in the protocol.
//! - **BLAKE3** for content hashing: transaction ids, block hashes, CRDS
//!   digests, message ids.
//! - **SHA-256** for the Proof of History chain.
//!
//! Everything here is a thin, type-safe wrapper. If you are tempted to
//! optimize one of these functions, reconsider, then go read about timing
//! attacks and come back when the urge has passed.

pub mod hash;
pub mod keys;
pub mod signer;

pub use hash::{
    blake3_hash, blake3_hash_multi, domain_separated_hash, merkle_root, sha256, sha256_multi,
    short_hex, Hash, ZERO_HASH,
};
pub use keys::{KeyError, NodeKeypair, PublicKey, Signature};
pub use signer::Signer;
