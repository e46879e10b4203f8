//! Bloom filter used by sync ranges and subjective sets
//!
//! # Hashing
//!
//! ```text
//! H = DIGEST(prefix || key)
//! index_i = BE(H[i*s .. (i+1)*s]) mod m      for i in 0..k
//! ```
//!
//! `s` is the number of bytes needed to address `m` bits. The digest is the
//! cheapest of MD5, SHA-1, SHA-256, SHA-384 and SHA-512 that yields at
//! least `k * s` bytes.
//!
//! # Wire Form
//!
//! `functions u8 | bits u16 | prefix_len u8 | prefix | bitfield`

use md5::Md5;
use sha1::{Digest, Sha1};
use sha2::{Sha256, Sha384, Sha512};

use super::wire::{Reader, WireError, Writer};

/// Largest bit count the 2-byte wire field can describe
pub const MAX_BITS: u32 = 65528;

/// Errors for invalid Bloom filter configurations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BloomError {
    /// Bit count is zero, not a multiple of 8, or too large
    InvalidBits(u32),
    /// Function count is zero
    InvalidFunctions(u8),
    /// No supported digest is long enough for the requested slices
    DigestTooShort { needed: usize },
    /// Error rate outside (0, 1)
    InvalidErrorRate,
    /// Bitfield length does not match the bit count
    BitfieldLength { expected: usize, actual: usize },
    /// Malformed wire bytes
    Wire(WireError),
}

impl std::fmt::Display for BloomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BloomError::InvalidBits(bits) => write!(f, "invalid bloom bit count {}", bits),
            BloomError::InvalidFunctions(k) => write!(f, "invalid bloom function count {}", k),
            BloomError::DigestTooShort { needed } => {
                write!(f, "no digest provides {} bytes", needed)
            }
            BloomError::InvalidErrorRate => write!(f, "error rate must be in (0, 1)"),
            BloomError::BitfieldLength { expected, actual } => {
                write!(f, "bitfield is {} bytes, expected {}", actual, expected)
            }
            BloomError::Wire(e) => write!(f, "bloom wire error: {}", e),
        }
    }
}

impl std::error::Error for BloomError {}

impl From<WireError> for BloomError {
    fn from(e: WireError) -> Self {
        BloomError::Wire(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashFamily {
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashFamily {
    fn for_length(needed: usize) -> Result<Self, BloomError> {
        match needed {
            0..=16 => Ok(HashFamily::Md5),
            17..=20 => Ok(HashFamily::Sha1),
            21..=32 => Ok(HashFamily::Sha256),
            33..=48 => Ok(HashFamily::Sha384),
            49..=64 => Ok(HashFamily::Sha512),
            _ => Err(BloomError::DigestTooShort { needed }),
        }
    }

    fn digest(self, prefix: &[u8], key: &[u8]) -> Vec<u8> {
        fn run<D: Digest>(prefix: &[u8], key: &[u8]) -> Vec<u8> {
            let mut hasher = D::new();
            hasher.update(prefix);
            hasher.update(key);
            hasher.finalize().to_vec()
        }
        match self {
            HashFamily::Md5 => run::<Md5>(prefix, key),
            HashFamily::Sha1 => run::<Sha1>(prefix, key),
            HashFamily::Sha256 => run::<Sha256>(prefix, key),
            HashFamily::Sha384 => run::<Sha384>(prefix, key),
            HashFamily::Sha512 => run::<Sha512>(prefix, key),
        }
    }
}

/// A fixed-size Bloom filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: u32,
    functions: u8,
    prefix: Vec<u8>,
    slice_bytes: usize,
    family: HashFamily,
    bitfield: Vec<u8>,
}

impl BloomFilter {
    /// Create an empty filter with `bits` bits and `functions` hash functions.
    pub fn new(bits: u32, functions: u8, prefix: Vec<u8>) -> Result<Self, BloomError> {
        if bits == 0 || bits % 8 != 0 || bits > MAX_BITS {
            return Err(BloomError::InvalidBits(bits));
        }
        if functions == 0 {
            return Err(BloomError::InvalidFunctions(functions));
        }
        if prefix.len() > u8::MAX as usize {
            return Err(BloomError::Wire(WireError::TooLong {
                len: prefix.len(),
                max: u8::MAX as usize,
            }));
        }

        let index_bits = 32 - (bits - 1).leading_zeros();
        let slice_bytes = (index_bits as usize).div_ceil(8).max(1);
        let family = HashFamily::for_length(slice_bytes * functions as usize)?;

        Ok(Self {
            bits,
            functions,
            prefix,
            slice_bytes,
            family,
            bitfield: vec![0; bits as usize / 8],
        })
    }

    /// Create an empty filter sized for a target false positive rate.
    ///
    /// The function count is `ceil(ln 2 * m / n)` where `n` is the capacity
    /// at that error rate.
    pub fn with_error_rate(bits: u32, error_rate: f64, prefix: Vec<u8>) -> Result<Self, BloomError> {
        let capacity = capacity_for(bits, error_rate)?;
        let functions = ((std::f64::consts::LN_2 * bits as f64) / capacity.max(1) as f64).ceil();
        let functions = functions.clamp(1.0, u8::MAX as f64) as u8;
        Self::new(bits, functions, prefix)
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn functions(&self) -> u8 {
        self.functions
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn add(&mut self, key: &[u8]) {
        for index in self.indexes(key) {
            self.bitfield[index / 8] |= 1 << (index % 8);
        }
    }

    /// Never returns a false negative.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.indexes(key)
            .into_iter()
            .all(|index| self.bitfield[index / 8] & (1 << (index % 8)) != 0)
    }

    pub fn clear(&mut self) {
        self.bitfield.iter_mut().for_each(|b| *b = 0);
    }

    /// Number of bits set
    pub fn bits_checked(&self) -> u32 {
        self.bitfield.iter().map(|b| b.count_ones()).sum()
    }

    /// Raw bitfield
    pub fn bytes(&self) -> &[u8] {
        &self.bitfield
    }

    /// Rebuild a filter from its configuration and raw bitfield.
    pub fn from_bytes(
        bits: u32,
        functions: u8,
        prefix: Vec<u8>,
        bitfield: &[u8],
    ) -> Result<Self, BloomError> {
        let mut filter = Self::new(bits, functions, prefix)?;
        if bitfield.len() != filter.bitfield.len() {
            return Err(BloomError::BitfieldLength {
                expected: filter.bitfield.len(),
                actual: bitfield.len(),
            });
        }
        filter.bitfield.copy_from_slice(bitfield);
        Ok(filter)
    }

    pub fn encode(&self, w: &mut Writer) {
        w.u8(self.functions);
        w.u16(self.bits as u16);
        w.u8(self.prefix.len() as u8);
        w.bytes(&self.prefix);
        w.bytes(&self.bitfield);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, BloomError> {
        let functions = r.u8()?;
        let bits = r.u16()? as u32;
        let prefix = r.short_bytes()?.to_vec();
        if bits == 0 || bits % 8 != 0 {
            return Err(BloomError::InvalidBits(bits));
        }
        let bitfield = r.bytes(bits as usize / 8)?;
        Self::from_bytes(bits, functions, prefix, bitfield)
    }

    fn indexes(&self, key: &[u8]) -> Vec<usize> {
        let digest = self.family.digest(&self.prefix, key);
        digest
            .chunks_exact(self.slice_bytes)
            .take(self.functions as usize)
            .map(|slice| {
                let value = slice.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64);
                (value % self.bits as u64) as usize
            })
            .collect()
    }
}

/// Number of keys a filter of `bits` holds at `error_rate`: `m (ln 2)^2 / |ln f|`.
pub fn capacity_for(bits: u32, error_rate: f64) -> Result<usize, BloomError> {
    if !(error_rate > 0.0 && error_rate < 1.0) {
        return Err(BloomError::InvalidErrorRate);
    }
    let ln2 = std::f64::consts::LN_2;
    Ok((bits as f64 * ln2 * ln2 / error_rate.ln().abs()).floor() as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let mut filter = BloomFilter::with_error_rate(8192, 0.01, vec![0x42]).unwrap();
        let keys: Vec<Vec<u8>> = (0u32..500).map(|i| i.to_be_bytes().to_vec()).collect();
        for key in &keys {
            filter.add(key);
        }
        for key in &keys {
            assert!(filter.contains(key));
        }
    }

    #[test]
    fn test_false_positive_rate_is_reasonable() {
        let mut filter = BloomFilter::with_error_rate(8192, 0.01, vec![]).unwrap();
        for i in 0u32..500 {
            filter.add(&i.to_be_bytes());
        }
        let false_positives = (10_000u32..20_000)
            .filter(|i| filter.contains(&i.to_be_bytes()))
            .count();
        assert!(false_positives < 300, "{} false positives", false_positives);
    }

    #[test]
    fn test_function_count_from_error_rate() {
        let filter = BloomFilter::with_error_rate(8192, 0.01, vec![]).unwrap();
        assert_eq!(filter.functions(), 7);
        assert_eq!(capacity_for(8192, 0.01).unwrap(), 854);
    }

    #[test]
    fn test_prefix_changes_positions() {
        let mut a = BloomFilter::new(1024, 3, vec![1]).unwrap();
        let mut b = BloomFilter::new(1024, 3, vec![2]).unwrap();
        a.add(b"packet");
        b.add(b"packet");
        assert_ne!(a.bytes(), b.bytes());
    }

    #[test]
    fn test_invalid_configurations() {
        assert_eq!(BloomFilter::new(0, 1, vec![]).unwrap_err(), BloomError::InvalidBits(0));
        assert_eq!(BloomFilter::new(12, 1, vec![]).unwrap_err(), BloomError::InvalidBits(12));
        assert_eq!(
            BloomFilter::new(65536, 1, vec![]).unwrap_err(),
            BloomError::InvalidBits(65536)
        );
        assert_eq!(BloomFilter::new(8, 0, vec![]).unwrap_err(), BloomError::InvalidFunctions(0));
        assert_eq!(
            BloomFilter::new(65528, 40, vec![]).unwrap_err(),
            BloomError::DigestTooShort { needed: 80 }
        );
        assert_eq!(
            BloomFilter::with_error_rate(64, 1.5, vec![]).unwrap_err(),
            BloomError::InvalidErrorRate
        );
    }

    #[test]
    fn test_wire_form() {
        let mut filter = BloomFilter::new(64, 2, vec![9]).unwrap();
        filter.add(b"x");

        let mut w = Writer::new();
        filter.encode(&mut w);
        let bytes = w.into_bytes();
        assert_eq!(&bytes[..5], &[2, 0, 64, 1, 9]);
        assert_eq!(bytes.len(), 5 + 8);

        let decoded = BloomFilter::decode(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(decoded, filter);
        assert!(decoded.contains(b"x"));
    }

    #[test]
    fn test_decode_rejects_truncated_bitfield() {
        let bytes = [2u8, 0, 64, 0, 0, 0];
        assert!(matches!(
            BloomFilter::decode(&mut Reader::new(&bytes)),
            Err(BloomError::Wire(WireError::TooShort { .. }))
        ));
    }

    #[test]
    fn test_clear() {
        let mut filter = BloomFilter::new(64, 2, vec![]).unwrap();
        filter.add(b"x");
        assert!(filter.bits_checked() > 0);
        filter.clear();
        assert_eq!(filter.bits_checked(), 0);
        assert!(!filter.contains(b"x"));
    }
}
