use ed25519_dalek::SigningKey;
use rand::RngCore;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of an encoded member public key
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// An Ed25519 key pair for signing and verification.
///
/// The private key is automatically zeroed from memory when dropped
/// to prevent secret key material from lingering.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    /// 32-byte private key (keep this secret!)
    pub private_key: [u8; 32],
    /// 32-byte public key (share this freely)
    #[zeroize(skip)]
    pub public_key: [u8; 32],
}

// Custom Debug implementation to prevent accidental private key exposure in logs
impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_key", &"[REDACTED]")
            .field("public_key", &hex::encode(self.public_key))
            .finish()
    }
}

/// Generate a new random Ed25519 key pair.
///
/// Uses the operating system's cryptographically secure random number generator.
pub fn generate_key_pair() -> KeyPair {
    key_pair_from_rng(&mut rand::rngs::OsRng)
}

/// Generate a key pair from the given random source.
///
/// Simulated networks pass a seeded RNG here so that member keys, and
/// therefore cids and mids, are reproducible between runs.
pub fn key_pair_from_rng<R: RngCore>(rng: &mut R) -> KeyPair {
    let mut secret_bytes = [0u8; 32];
    rng.fill_bytes(&mut secret_bytes);

    let keypair = key_pair_from_bytes(&secret_bytes);

    secret_bytes.zeroize();

    keypair
}

/// Derive a key pair from existing private key bytes.
///
/// Use this to restore a key pair from a stored private key.
pub fn key_pair_from_bytes(private_key: &[u8; 32]) -> KeyPair {
    let signing_key = SigningKey::from_bytes(private_key);

    KeyPair {
        private_key: signing_key.to_bytes(),
        public_key: signing_key.verifying_key().to_bytes(),
    }
}
