//! Security module for Dispersy
//!
//! Provides cryptographic operations:
//! - Key pair generation (Ed25519)
//! - Packet signing and verification (Ed25519 over BLAKE3)
//! - Member and community identifiers (SHA-1 over the public key)
//!
//! # Crypto Model
//!
//! Every member is an Ed25519 key pair. The 20-byte `mid` (and the community
//! `cid`) is `SHA1(public_key)`. A mid alone is not unique, but combined with a
//! valid signature it identifies the signer.

pub mod create_key_pair;
pub mod digest;
pub mod sign;

pub use create_key_pair::{
    generate_key_pair, key_pair_from_bytes, key_pair_from_rng, KeyPair, PUBLIC_KEY_LENGTH,
};
pub use digest::{mid_from_public_key, Mid, MID_LENGTH};
pub use sign::{sign_bytes, verify_bytes, SIGNATURE_LENGTH};
