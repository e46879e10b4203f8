//! Big-endian wire reader and writer shared by every packet codec.
//!
//! Integers are big-endian, addresses are 4-byte IPv4 followed by a 2-byte
//! port, short strings carry a 1-byte length and longer binary a 2-byte
//! length.

use std::net::{Ipv4Addr, SocketAddrV4};

/// Length of an encoded address
pub const ADDRESS_LEN: usize = 6;

/// Errors when reading or writing wire fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Input ended before a field was complete.
    TooShort { needed: usize, remaining: usize },
    /// Bytes left over after the last field.
    TrailingBytes(usize),
    /// A length does not fit its length prefix.
    TooLong { len: usize, max: usize },
    /// A field holds a value outside its domain.
    InvalidValue(&'static str),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::TooShort { needed, remaining } => {
                write!(f, "field needs {} bytes, {} remaining", needed, remaining)
            }
            WireError::TrailingBytes(n) => write!(f, "{} trailing bytes", n),
            WireError::TooLong { len, max } => write!(f, "length {} exceeds {}", len, max),
            WireError::InvalidValue(what) => write!(f, "invalid {}", what),
        }
    }
}

impl std::error::Error for WireError {}

/// Cursor over a received byte slice.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    /// Current position from the start of the input.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < len {
            return Err(WireError::TooShort {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let slice = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub fn address(&mut self) -> Result<SocketAddrV4, WireError> {
        let ip: [u8; 4] = self.array()?;
        let port = self.u16()?;
        Ok(SocketAddrV4::new(Ipv4Addr::from(ip), port))
    }

    /// Bytes with a 1-byte length prefix.
    pub fn short_bytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.u8()? as usize;
        self.bytes(len)
    }

    /// Bytes with a 2-byte length prefix.
    pub fn long_bytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.u16()? as usize;
        self.bytes(len)
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.bytes[self.offset..];
        self.offset = self.bytes.len();
        slice
    }

    /// Require that the input is fully consumed.
    pub fn finish(&self) -> Result<(), WireError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(WireError::TrailingBytes(n)),
        }
    }
}

/// Growable output buffer.
#[derive(Debug, Clone, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.bytes(&value.to_be_bytes())
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.bytes(&value.to_be_bytes())
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.bytes(&value.to_be_bytes())
    }

    pub fn address(&mut self, address: &SocketAddrV4) -> &mut Self {
        self.bytes(&address.ip().octets());
        self.u16(address.port())
    }

    pub fn short_bytes(&mut self, bytes: &[u8]) -> Result<&mut Self, WireError> {
        let len = u8::try_from(bytes.len()).map_err(|_| WireError::TooLong {
            len: bytes.len(),
            max: u8::MAX as usize,
        })?;
        self.u8(len);
        Ok(self.bytes(bytes))
    }

    pub fn long_bytes(&mut self, bytes: &[u8]) -> Result<&mut Self, WireError> {
        let len = u16::try_from(bytes.len()).map_err(|_| WireError::TooLong {
            len: bytes.len(),
            max: u16::MAX as usize,
        })?;
        self.u16(len);
        Ok(self.bytes(bytes))
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// The unspecified address used when a field has no value.
pub fn no_address() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)
}

/// Whether an address can be sent to.
pub fn is_valid_address(address: &SocketAddrV4) -> bool {
    !address.ip().is_unspecified() && !address.ip().is_broadcast() && address.port() != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers_are_big_endian() {
        let mut w = Writer::new();
        w.u8(1).u16(0x0203).u32(0x04050607).u64(0x08090a0b0c0d0e0f);
        let bytes = w.into_bytes();
        assert_eq!(bytes, (1u8..=15).collect::<Vec<_>>());

        let mut r = Reader::new(&bytes);
        assert_eq!(r.u8().unwrap(), 1);
        assert_eq!(r.u16().unwrap(), 0x0203);
        assert_eq!(r.u32().unwrap(), 0x04050607);
        assert_eq!(r.u64().unwrap(), 0x08090a0b0c0d0e0f);
        r.finish().unwrap();
    }

    #[test]
    fn test_address_layout() {
        let address = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 2), 0x1f90);
        let mut w = Writer::new();
        w.address(&address);
        let bytes = w.into_bytes();
        assert_eq!(bytes, vec![192, 168, 1, 2, 0x1f, 0x90]);
        assert_eq!(Reader::new(&bytes).address().unwrap(), address);
    }

    #[test]
    fn test_length_prefixed() {
        let mut w = Writer::new();
        w.short_bytes(b"abc").unwrap();
        w.long_bytes(&[7; 300]).unwrap();
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        assert_eq!(r.short_bytes().unwrap(), b"abc");
        assert_eq!(r.long_bytes().unwrap().len(), 300);
        assert!(r.is_empty());
    }

    #[test]
    fn test_short_bytes_rejects_long_input() {
        let mut w = Writer::new();
        assert_eq!(
            w.short_bytes(&[0; 256]).unwrap_err(),
            WireError::TooLong { len: 256, max: 255 }
        );
    }

    #[test]
    fn test_too_short() {
        let mut r = Reader::new(&[1, 2, 3]);
        assert_eq!(
            r.u32().unwrap_err(),
            WireError::TooShort { needed: 4, remaining: 3 }
        );
    }

    #[test]
    fn test_trailing_bytes() {
        let mut r = Reader::new(&[1, 2]);
        r.u8().unwrap();
        assert_eq!(r.finish().unwrap_err(), WireError::TrailingBytes(1));
        assert_eq!(r.rest(), &[2]);
        r.finish().unwrap();
    }

    #[test]
    fn test_valid_address() {
        assert!(!is_valid_address(&no_address()));
        assert!(is_valid_address(&SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 5)));
        assert!(!is_valid_address(&SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 0)));
    }
}
