//! Ed25519 packet signing and verification
//!
//! # Signing Scheme
//!
//! ```text
//! hash = BLAKE3(packet[..len - signature_suffix])
//! signature = Ed25519_Sign(private_key, hash)
//! ```
//!
//! The signed region is everything in front of the signature slots, so a
//! verifier works on the exact received bytes without re-encoding.

use blake3::Hasher;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

/// Length of one signature slot on the wire
pub const SIGNATURE_LENGTH: usize = 64;

/// Sign `data` with a 32-byte Ed25519 private key
pub fn sign_bytes(private_key: &[u8; 32], data: &[u8]) -> [u8; SIGNATURE_LENGTH] {
    let hash = hash_signed_region(data);
    let signing_key = SigningKey::from_bytes(private_key);
    let signature: Signature = signing_key.sign(hash.as_bytes());
    signature.to_bytes()
}

/// Verify a signature over `data`.
///
/// Returns `false` for malformed public keys, malformed signatures and
/// signatures that do not match.
pub fn verify_bytes(public_key: &[u8], data: &[u8], signature: &[u8]) -> bool {
    let Ok(public_key) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(signature) = <[u8; SIGNATURE_LENGTH]>::try_from(signature) else {
        return false;
    };

    let verifying_key = match VerifyingKey::from_bytes(&public_key) {
        Ok(key) => key,
        Err(_) => {
            tracing::trace!("verify_bytes: invalid public key bytes");
            return false;
        }
    };

    let hash = hash_signed_region(data);
    verifying_key
        .verify(hash.as_bytes(), &Signature::from_bytes(&signature))
        .is_ok()
}

fn hash_signed_region(data: &[u8]) -> blake3::Hash {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::create_key_pair::generate_key_pair;

    #[test]
    fn test_sign_and_verify() {
        let kp = generate_key_pair();
        let data = b"\x00\x01community-prefix-and-payload";

        let signature = sign_bytes(&kp.private_key, data);
        assert_eq!(signature.len(), SIGNATURE_LENGTH);
        assert!(verify_bytes(&kp.public_key, data, &signature));
    }

    #[test]
    fn test_wrong_public_key_fails() {
        let kp = generate_key_pair();
        let other = generate_key_pair();
        let signature = sign_bytes(&kp.private_key, b"data");

        assert!(!verify_bytes(&other.public_key, b"data", &signature));
    }

    #[test]
    fn test_tampered_data_fails() {
        let kp = generate_key_pair();
        let signature = sign_bytes(&kp.private_key, b"data");

        assert!(!verify_bytes(&kp.public_key, b"datb", &signature));
    }

    #[test]
    fn test_zero_signature_fails() {
        let kp = generate_key_pair();
        assert!(!verify_bytes(&kp.public_key, b"data", &[0u8; SIGNATURE_LENGTH]));
    }

    #[test]
    fn test_wrong_lengths_fail() {
        let kp = generate_key_pair();
        let signature = sign_bytes(&kp.private_key, b"data");

        assert!(!verify_bytes(&kp.public_key[..31], b"data", &signature));
        assert!(!verify_bytes(&kp.public_key, b"data", &signature[..63]));
    }
}
