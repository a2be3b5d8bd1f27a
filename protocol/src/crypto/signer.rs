//! # Signing Capability
//!
//! The consensus core never touches key files. It receives something that
//! can sign, and a free function that can verify. Where the key actually
//! lives (a file the node binary loaded, an HSM, a test seed) is somebody
//! else's problem.
//!
//! ```
//! use quasar_protocol::crypto::{signer, NodeKeypair, Signer};
//!
//! let kp = NodeKeypair::generate();
//! let sig = Signer::sign(&kp, b"crds entry");
//! assert!(signer::verify(b"crds entry", &sig, &kp.public_key()));
//! ```

use super::keys::{NodeKeypair, PublicKey, Signature};

/// Anything that can produce Ed25519 signatures for a single identity.
pub trait Signer: Send + Sync {
    /// The public key signatures from this signer verify against.
    fn public_key(&self) -> PublicKey;

    /// Sign an arbitrary payload.
    fn sign(&self, payload: &[u8]) -> Signature;
}

impl Signer for NodeKeypair {
    fn public_key(&self) -> PublicKey {
        NodeKeypair::public_key(self)
    }

    fn sign(&self, payload: &[u8]) -> Signature {
        NodeKeypair::sign(self, payload)
    }
}

/// Verify `signature` over `payload` against `public_key`.
pub fn verify(payload: &[u8], signature: &Signature, public_key: &PublicKey) -> bool {
    public_key.verify(payload, signature)
}
