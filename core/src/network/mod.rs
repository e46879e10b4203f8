//! Network layer for Dispersy
//!
//! Byte-level formats only; sockets live in `protocol::session`.
//!
//! - `wire`: big-endian reader/writer and address encoding
//! - `encoding`: self-describing application payload encoding
//! - `bloom`: Bloom filters for sync ranges and subjective sets
//! - `payload`: built-in message payloads
//! - `conversion`: packet framing, authentication and signatures

pub mod bloom;
pub mod conversion;
pub mod encoding;
pub mod payload;
pub mod wire;

pub use bloom::{BloomError, BloomFilter};
pub use conversion::{Conversion, ConversionError};
pub use encoding::{EncodingError, Value};
pub use payload::Payload;
pub use wire::WireError;
