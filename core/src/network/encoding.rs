//! Self-describing payload encoding
//!
//! Values are packed as `<decimal length><type char><bytes>` behind a single
//! version byte `a`. Containers carry their element count as the length.
//!
//! | char | value                         |
//! |------|-------------------------------|
//! | `i`  | integer, decimal digits       |
//! | `f`  | float, decimal text           |
//! | `s`  | UTF-8 string                  |
//! | `b`  | raw bytes                     |
//! | `t`  | tuple                         |
//! | `l`  | list                          |
//! | `d`  | dict, pairs sorted by key     |
//! | `n`  | none (length 0)               |
//! | `T`  | true (length 0)               |
//! | `F`  | false (length 0)              |

/// Version tag prefixing every stream
pub const VERSION: u8 = b'a';

/// Maximum container nesting accepted by the decoder
pub const MAX_DEPTH: usize = 32;

/// A decoded value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    /// Pairs are kept sorted by encoded key
    Dict(Vec<(Value, Value)>),
}

impl Value {
    /// Build a dict from pairs, sorting them into wire order.
    pub fn dict<I>(pairs: I) -> Value
    where
        I: IntoIterator<Item = (Value, Value)>,
    {
        let mut pairs: Vec<(Value, Value)> = pairs.into_iter().collect();
        pairs.sort_by_cached_key(|(key, _)| encode_value_bytes(key));
        Value::Dict(pairs)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    /// Look up a string key in a dict.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dict(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// Errors when decoding an encoded stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Stream does not start with a known version byte
    UnknownVersion(Option<u8>),
    /// Input ended inside a value
    UnexpectedEnd,
    /// Length prefix is missing or not decimal
    InvalidLength,
    /// Unknown type character
    UnknownType(u8),
    /// String bytes are not UTF-8
    InvalidUtf8,
    /// Integer or float text does not parse
    InvalidNumber,
    /// Containers nested deeper than `MAX_DEPTH`
    TooDeep,
    /// Bytes left after the top-level value
    TrailingBytes(usize),
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::UnknownVersion(Some(v)) => write!(f, "unknown encoding version {:#04x}", v),
            EncodingError::UnknownVersion(None) => write!(f, "empty encoding stream"),
            EncodingError::UnexpectedEnd => write!(f, "unexpected end of encoding stream"),
            EncodingError::InvalidLength => write!(f, "invalid length prefix"),
            EncodingError::UnknownType(c) => write!(f, "unknown type character {:?}", *c as char),
            EncodingError::InvalidUtf8 => write!(f, "string is not valid UTF-8"),
            EncodingError::InvalidNumber => write!(f, "invalid number"),
            EncodingError::TooDeep => write!(f, "containers nested too deep"),
            EncodingError::TrailingBytes(n) => write!(f, "{} trailing bytes", n),
        }
    }
}

impl std::error::Error for EncodingError {}

/// Encode a value behind the version byte.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = vec![VERSION];
    encode_into(value, &mut out);
    out
}

/// Decode a complete stream.
pub fn decode(bytes: &[u8]) -> Result<Value, EncodingError> {
    let (value, used) = decode_prefix(bytes)?;
    match bytes.len() - used {
        0 => Ok(value),
        n => Err(EncodingError::TrailingBytes(n)),
    }
}

/// Decode the value at the start of `bytes`, returning it and the bytes used.
pub fn decode_prefix(bytes: &[u8]) -> Result<(Value, usize), EncodingError> {
    match bytes.first() {
        Some(&VERSION) => {}
        other => return Err(EncodingError::UnknownVersion(other.copied())),
    }
    let mut parser = Parser {
        bytes,
        offset: 1,
    };
    let value = parser.value(0)?;
    Ok((value, parser.offset))
}

fn encode_value_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn header(out: &mut Vec<u8>, len: usize, kind: u8) {
    out.extend_from_slice(len.to_string().as_bytes());
    out.push(kind);
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::None => header(out, 0, b'n'),
        Value::Bool(true) => header(out, 0, b'T'),
        Value::Bool(false) => header(out, 0, b'F'),
        Value::Int(v) => {
            let text = v.to_string();
            header(out, text.len(), b'i');
            out.extend_from_slice(text.as_bytes());
        }
        Value::Float(v) => {
            let text = format!("{:?}", v);
            header(out, text.len(), b'f');
            out.extend_from_slice(text.as_bytes());
        }
        Value::Str(v) => {
            header(out, v.len(), b's');
            out.extend_from_slice(v.as_bytes());
        }
        Value::Bytes(v) => {
            header(out, v.len(), b'b');
            out.extend_from_slice(v);
        }
        Value::Tuple(items) | Value::List(items) => {
            let kind = if matches!(value, Value::Tuple(_)) { b't' } else { b'l' };
            header(out, items.len(), kind);
            for item in items {
                encode_into(item, out);
            }
        }
        Value::Dict(pairs) => {
            let mut encoded: Vec<(Vec<u8>, &Value)> = pairs
                .iter()
                .map(|(k, v)| (encode_value_bytes(k), v))
                .collect();
            encoded.sort_by(|a, b| a.0.cmp(&b.0));
            header(out, encoded.len(), b'd');
            for (key, item) in encoded {
                out.extend_from_slice(&key);
                encode_into(item, out);
            }
        }
    }
}

struct Parser<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Parser<'a> {
    fn value(&mut self, depth: usize) -> Result<Value, EncodingError> {
        if depth > MAX_DEPTH {
            return Err(EncodingError::TooDeep);
        }

        let len = self.length()?;
        let kind = self.take(1)?[0];
        match kind {
            b'n' | b'T' | b'F' => {
                if len != 0 {
                    return Err(EncodingError::InvalidLength);
                }
                Ok(match kind {
                    b'n' => Value::None,
                    b'T' => Value::Bool(true),
                    _ => Value::Bool(false),
                })
            }
            b'i' => {
                let text = std::str::from_utf8(self.take(len)?)
                    .map_err(|_| EncodingError::InvalidNumber)?;
                text.parse().map(Value::Int).map_err(|_| EncodingError::InvalidNumber)
            }
            b'f' => {
                let text = std::str::from_utf8(self.take(len)?)
                    .map_err(|_| EncodingError::InvalidNumber)?;
                text.parse().map(Value::Float).map_err(|_| EncodingError::InvalidNumber)
            }
            b's' => {
                let bytes = self.take(len)?;
                String::from_utf8(bytes.to_vec())
                    .map(Value::Str)
                    .map_err(|_| EncodingError::InvalidUtf8)
            }
            b'b' => Ok(Value::Bytes(self.take(len)?.to_vec())),
            b't' | b'l' => {
                // Every element needs at least two bytes
                if len > self.remaining() / 2 {
                    return Err(EncodingError::UnexpectedEnd);
                }
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.value(depth + 1)?);
                }
                Ok(if kind == b't' { Value::Tuple(items) } else { Value::List(items) })
            }
            b'd' => {
                if len > self.remaining() / 4 {
                    return Err(EncodingError::UnexpectedEnd);
                }
                let mut pairs = Vec::with_capacity(len);
                for _ in 0..len {
                    let key = self.value(depth + 1)?;
                    let value = self.value(depth + 1)?;
                    pairs.push((key, value));
                }
                Ok(Value::dict(pairs))
            }
            other => Err(EncodingError::UnknownType(other)),
        }
    }

    fn length(&mut self) -> Result<usize, EncodingError> {
        let start = self.offset;
        while self.offset < self.bytes.len() && self.bytes[self.offset].is_ascii_digit() {
            self.offset += 1;
            if self.offset - start > 10 {
                return Err(EncodingError::InvalidLength);
            }
        }
        if self.offset == start {
            return if self.offset >= self.bytes.len() {
                Err(EncodingError::UnexpectedEnd)
            } else {
                Err(EncodingError::InvalidLength)
            };
        }
        std::str::from_utf8(&self.bytes[start..self.offset])
            .ok()
            .and_then(|text| text.parse().ok())
            .ok_or(EncodingError::InvalidLength)
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], EncodingError> {
        if self.remaining() < len {
            return Err(EncodingError::UnexpectedEnd);
        }
        let slice = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_layout() {
        assert_eq!(encode(&Value::Int(42)), b"a2i42");
        assert_eq!(encode(&Value::Int(-7)), b"a2i-7");
        assert_eq!(encode(&Value::from("hé")), "a3shé".as_bytes());
        assert_eq!(encode(&Value::Bytes(vec![0, 1])), b"a2b\x00\x01");
        assert_eq!(encode(&Value::None), b"a0n");
        assert_eq!(encode(&Value::Bool(true)), b"a0T");
    }

    #[test]
    fn test_dict_keys_sorted() {
        let value = Value::dict(vec![
            (Value::from("text"), Value::from("hello")),
            (Value::from("amount"), Value::Int(5)),
        ]);
        assert_eq!(encode(&value), b"a2d4stext5shello6samount1i5");
        assert_eq!(value.get("amount"), Some(&Value::Int(5)));
    }

    #[test]
    fn test_nested_round_trip() {
        let value = Value::Tuple(vec![
            Value::List(vec![Value::Int(1), Value::Float(2.5), Value::Bool(false)]),
            Value::dict(vec![(Value::Int(3), Value::Bytes(b"abc".to_vec()))]),
            Value::None,
        ]);
        assert_eq!(decode(&encode(&value)).unwrap(), value);
    }

    #[test]
    fn test_decode_prefix_reports_consumed() {
        let mut bytes = encode(&Value::Int(5));
        bytes.extend_from_slice(b"tail");
        let (value, used) = decode_prefix(&bytes).unwrap();
        assert_eq!(value, Value::Int(5));
        assert_eq!(used, 4);
        assert_eq!(decode(&bytes).unwrap_err(), EncodingError::TrailingBytes(4));
    }

    #[test]
    fn test_malformed_input() {
        assert_eq!(decode(b"").unwrap_err(), EncodingError::UnknownVersion(None));
        assert_eq!(decode(b"b1i1").unwrap_err(), EncodingError::UnknownVersion(Some(b'b')));
        assert_eq!(decode(b"a").unwrap_err(), EncodingError::UnexpectedEnd);
        assert_eq!(decode(b"ai1").unwrap_err(), EncodingError::InvalidLength);
        assert_eq!(decode(b"a5s12").unwrap_err(), EncodingError::UnexpectedEnd);
        assert_eq!(decode(b"a1x1").unwrap_err(), EncodingError::UnknownType(b'x'));
        assert_eq!(decode(b"a2s\xff\xfe").unwrap_err(), EncodingError::InvalidUtf8);
        assert_eq!(decode(b"a2i1x").unwrap_err(), EncodingError::InvalidNumber);
        assert_eq!(decode(b"a1n").unwrap_err(), EncodingError::InvalidLength);
        assert_eq!(decode(b"a99999999999i").unwrap_err(), EncodingError::InvalidLength);
    }

    #[test]
    fn test_depth_limit() {
        let mut bytes = vec![b'a'];
        for _ in 0..(MAX_DEPTH + 2) {
            bytes.extend_from_slice(b"1l");
        }
        bytes.extend_from_slice(b"0n");
        assert_eq!(decode(&bytes).unwrap_err(), EncodingError::TooDeep);
    }

    #[test]
    fn test_container_count_bounded_by_input() {
        assert_eq!(decode(b"a1000000l0n").unwrap_err(), EncodingError::UnexpectedEnd);
    }
}
