//! # Envelope Signatures
//!
//! Domain-separated Ed25519 signing for everything the seed node puts on the
//! wire. A peer's identity is its public key, so a valid signature over an
//! envelope is what lets a receiver trust the sender address it advertises.
//!
//! Only strict Ed25519 verification is used (`verify_strict`), which rejects
//! small-order keys and non-canonical signatures.

use ed25519_dalek::{Signature, VerifyingKey};
use thiserror::Error;

use crate::identity::{Identity, Keypair};

/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Domain prefix for signed wire envelopes.
pub const ENVELOPE_SIGNATURE_DOMAIN: &[u8] = b"korium-seed-envelope-v1:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature is missing")]
    Missing,
    #[error("signature has invalid length")]
    InvalidLength,
    #[error("signature verification failed")]
    VerificationFailed,
    #[error("invalid public key")]
    InvalidPublicKey,
}

fn prefixed(domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(domain.len() + data.len());
    buf.extend_from_slice(domain);
    buf.extend_from_slice(data);
    buf
}

/// Sign `data` under `domain`. Returns the 64-byte signature.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    keypair.sign(&prefixed(domain, data)).to_bytes().to_vec()
}

/// Verify a signature produced by [`sign_with_domain`].
pub fn verify_with_domain(
    identity: &Identity,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; SIGNATURE_LEN] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;

    let verifying_key = VerifyingKey::try_from(identity.as_bytes().as_slice())
        .map_err(|_| SignatureError::InvalidPublicKey)?;

    verifying_key
        .verify_strict(&prefixed(domain, data), &Signature::from_bytes(&sig_bytes))
        .map_err(|_| SignatureError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_verifies_under_same_domain() {
        let kp = Keypair::generate();
        let sig = sign_with_domain(&kp, ENVELOPE_SIGNATURE_DOMAIN, b"payload");
        assert_eq!(sig.len(), SIGNATURE_LEN);
        assert!(verify_with_domain(&kp.identity(), ENVELOPE_SIGNATURE_DOMAIN, b"payload", &sig).is_ok());
    }

    #[test]
    fn signature_rejected_under_other_domain() {
        let kp = Keypair::generate();
        let sig = sign_with_domain(&kp, ENVELOPE_SIGNATURE_DOMAIN, b"payload");
        assert_eq!(
            verify_with_domain(&kp.identity(), b"other-domain:", b"payload", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn signature_rejected_for_other_signer() {
        let signer = Keypair::generate();
        let other = Keypair::generate();
        let sig = sign_with_domain(&signer, ENVELOPE_SIGNATURE_DOMAIN, b"payload");
        assert_eq!(
            verify_with_domain(&other.identity(), ENVELOPE_SIGNATURE_DOMAIN, b"payload", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn malformed_signatures_classified() {
        let kp = Keypair::generate();
        let id = kp.identity();
        assert_eq!(
            verify_with_domain(&id, ENVELOPE_SIGNATURE_DOMAIN, b"x", &[]),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify_with_domain(&id, ENVELOPE_SIGNATURE_DOMAIN, b"x", &[0u8; 12]),
            Err(SignatureError::InvalidLength)
        );
    }
}
