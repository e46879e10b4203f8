//! SHA-1 identifiers for members and communities

use sha1::{Digest, Sha1};

/// Length of a member or community identifier
pub const MID_LENGTH: usize = 20;

/// 20-byte identifier: `SHA1(public_key)`
pub type Mid = [u8; MID_LENGTH];

/// Compute the mid (or cid, for a master key) of a public key
pub fn mid_from_public_key(public_key: &[u8]) -> Mid {
    let mut hasher = Sha1::new();
    hasher.update(public_key);
    hasher.finalize().into()
}
