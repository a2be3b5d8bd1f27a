//! # Key Management
//!
//! Ed25519 keypairs for QUASAR nodes.
//!
//! Every node in a permissioned QUASAR cluster is identified by one Ed25519
//! public key. The key signs the blocks the node produces as leader, the
//! CRDS entries it gossips, and the transactions it originates. Nothing
//! else in the protocol needs key material, so this module is small on
//! purpose.
//!
//! ## Why Ed25519?
//!
//! - Deterministic signatures. No per-signature nonce, no RNG at signing
//!   time, no way to leak the key through a bad `k`.
//! - 32-byte keys, 64-byte signatures. Gossip entries stay small.
//! - Fast verification, which matters when every shred-reassembled block
//!   and every pulled CRDS entry gets checked.
//!
//! Key bytes are never logged. `Debug` on a keypair prints the public half
//! only.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during key operations.
///
/// Deliberately vague about *why* something failed. Error messages are not
/// the place to describe key material.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key bytes: wrong length or not valid hex")]
    InvalidSecretKey,

    #[error("invalid public key bytes: not a valid Ed25519 point")]
    InvalidPublicKey,
}

/// A node identity keypair wrapping an Ed25519 signing key.
///
/// Intentionally not `Serialize`. Writing a secret key somewhere should be
/// an explicit call to [`secret_key_bytes`](Self::secret_key_bytes), not a
/// side effect of dumping a struct to TOML.
///
/// ```
/// use quasar_protocol::crypto::NodeKeypair;
///
/// let kp = NodeKeypair::generate();
/// let sig = kp.sign(b"slot 42 belongs to me");
/// assert!(kp.verify(b"slot 42 belongs to me", &sig));
/// ```
pub struct NodeKeypair {
    signing_key: SigningKey,
}

/// The public half of a node identity. Safe to gossip, log and compare.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    bytes: [u8; 32],
}

/// An Ed25519 signature.
///
/// Stored as `Vec<u8>` for serde friendliness. A valid signature is always
/// 64 bytes; anything else simply fails verification. The empty signature
/// is used for genesis, which nobody signs.
///
/// Signatures are totally ordered by their raw bytes. CRDS uses that order
/// to break wallclock ties, so it has to be the same on every node.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Signature {
    bytes: Vec<u8>,
}

impl NodeKeypair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Construct a keypair deterministically from a 32-byte seed.
    ///
    /// In Ed25519 the 32-byte secret key *is* the seed. Tests lean on this
    /// heavily to get stable node identities.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Reconstruct a keypair from a hex-encoded secret key, the format the
    /// node binary writes to its key file.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| KeyError::InvalidSecretKey)?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&seed))
    }

    /// Returns the public key associated with this keypair.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            bytes: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature {
            bytes: self.signing_key.sign(message).to_bytes().to_vec(),
        }
    }

    /// Verify a signature against this keypair's public key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.public_key().verify(message, signature)
    }

    /// Exports the raw 32-byte secret key.
    ///
    /// The node binary calls this exactly once, when `init` writes the key
    /// file. If you find yourself calling it anywhere else, stop.
    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl Clone for NodeKeypair {
    fn clone(&self) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&self.signing_key.to_bytes()),
        }
    }
}

impl fmt::Debug for NodeKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKeypair(pub={})", self.public_key().to_hex())
    }
}

// ---------------------------------------------------------------------------
// PublicKey
// ---------------------------------------------------------------------------

impl PublicKey {
    /// Create a `PublicKey` from raw bytes. No curve check; use
    /// [`try_from_slice`](Self::try_from_slice) for untrusted input.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Parse and validate a public key from a byte slice.
    pub fn try_from_slice(slice: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; 32] = slice.try_into().map_err(|_| KeyError::InvalidPublicKey)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self { bytes })
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// Verify a signature against this public key.
    ///
    /// Boolean on purpose: every caller wants yes/no, and "why" is nobody's
    /// business.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&self.bytes) else {
            return false;
        };
        let Some(dalek_sig) = signature.to_dalek_signature() else {
            return false;
        };
        verifying_key.verify(message, &dalek_sig).is_ok()
    }

    /// Hex-encoded representation. 64 characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Parse a hex-encoded public key string.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidPublicKey)?;
        Self::try_from_slice(&bytes)
    }

    /// Base58-encoded representation. This is what a node uses as its
    /// default node id when the operator does not pick a name.
    pub fn to_base58(&self) -> String {
        bs58::encode(self.bytes).into_string()
    }
}

impl Hash for PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", &self.to_hex()[..16])
    }
}

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

impl Signature {
    /// Create a signature from its raw 64-byte representation.
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }

    /// The empty signature. Only genesis carries one.
    pub fn empty() -> Self {
        Self { bytes: Vec::new() }
    }

    /// Returns the raw signature bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// `true` for the genesis placeholder.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn to_dalek_signature(&self) -> Option<DalekSignature> {
        let arr: [u8; 64] = self.bytes.as_slice().try_into().ok()?;
        Some(DalekSignature::from_bytes(&arr))
    }

    /// Returns the hex-encoded signature string.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex_str = self.to_hex();
        if hex_str.len() >= 128 {
            write!(f, "Signature({}...{})", &hex_str[..8], &hex_str[120..])
        } else {
            write!(f, "Signature({})", hex_str)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_sign_verify_roundtrip() {
        let kp = NodeKeypair::generate();
        let sig = kp.sign(b"block 7");
        assert!(kp.verify(b"block 7", &sig));
        assert!(!kp.verify(b"block 8", &sig));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let kp1 = NodeKeypair::generate();
        let kp2 = NodeKeypair::generate();
        let sig = kp1.sign(b"message");
        assert!(!kp2.verify(b"message", &sig));
    }

    #[test]
    fn from_seed_is_deterministic() {
        let a = NodeKeypair::from_seed(&[7u8; 32]);
        let b = NodeKeypair::from_seed(&[7u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.sign(b"x"), b.sign(b"x"));
    }

    #[test]
    fn hex_secret_roundtrip() {
        let kp = NodeKeypair::generate();
        let restored = NodeKeypair::from_hex(&hex::encode(kp.secret_key_bytes())).unwrap();
        assert_eq!(kp.public_key(), restored.public_key());

        assert!(NodeKeypair::from_hex("deadbeef").is_err());
        assert!(NodeKeypair::from_hex("not-hex-at-all").is_err());
    }

    #[test]
    fn public_key_hex_roundtrip() {
        let pk = NodeKeypair::generate().public_key();
        assert_eq!(PublicKey::from_hex(&pk.to_hex()).unwrap(), pk);
        assert!(PublicKey::from_hex("abcd").is_err());
    }

    #[test]
    fn malformed_signature_is_rejected_not_panicking() {
        let kp = NodeKeypair::generate();
        assert!(!kp.verify(b"anything", &Signature::empty()));
    }

    #[test]
    fn signatures_order_by_bytes() {
        let low = Signature::from_bytes([1u8; 64]);
        let high = Signature::from_bytes([2u8; 64]);
        assert!(high > low);
        assert!(low > Signature::empty());
    }
}
