// src/keys.rs
// Typed key values and order-preserving key encoding for the physical index.

use serde::{Deserialize, Serialize};

/// A single typed value inside an index key.
///
/// Ordering is type-bracketed: MinKey < Null < Bool < Int < Float < String < MaxKey.
/// MinKey/MaxKey are sentinels used for open cursor bounds and never appear in
/// stored documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyValue {
    MinKey,
    Null,
    Bool(bool),
    Int(i64),
    Float(OrderedFloat),
    String(String),
    MaxKey,
}

/// OrderedFloat wrapper for f64 to enable Ord. NaN sorts greater than
/// every other float so the byte encoding and the comparator agree.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderedFloat(pub f64);

impl PartialEq for OrderedFloat {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for OrderedFloat {}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self.0.is_nan(), other.0.is_nan()) {
            (true, true) => std::cmp::Ordering::Equal,
            (true, false) => std::cmp::Ordering::Greater,
            (false, true) => std::cmp::Ordering::Less,
            (false, false) => self.0.partial_cmp(&other.0).unwrap_or(std::cmp::Ordering::Equal),
        }
    }
}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use KeyValue::*;
        fn rank(v: &KeyValue) -> u8 {
            match v {
                MinKey => 0,
                Null => 1,
                Bool(_) => 2,
                Int(_) => 3,
                Float(_) => 4,
                String(_) => 5,
                MaxKey => 6,
            }
        }
        match (self, other) {
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.cmp(b),
            (String(a), String(b)) => a.cmp(b),
            (a, b) => rank(a).cmp(&rank(b)),
        }
    }
}

/// Convert serde_json::Value to KeyValue. Arrays and objects index as Null.
impl From<&serde_json::Value> for KeyValue {
    fn from(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => KeyValue::Null,
            serde_json::Value::Bool(b) => KeyValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    KeyValue::Int(i)
                } else if let Some(f) = n.as_f64() {
                    KeyValue::Float(OrderedFloat(f))
                } else {
                    KeyValue::Null
                }
            }
            serde_json::Value::String(s) => KeyValue::String(s.clone()),
            _ => KeyValue::Null,
        }
    }
}

// Type tags, spaced so the byte order matches KeyValue's Ord.
const TAG_MIN: u8 = 0x00;
const TAG_NULL: u8 = 0x05;
const TAG_BOOL: u8 = 0x10;
const TAG_INT: u8 = 0x20;
const TAG_FLOAT: u8 = 0x30;
const TAG_STRING: u8 = 0x40;
const TAG_MAX: u8 = 0xff;

impl KeyValue {
    /// Append the order-preserving encoding of this value to `buf`.
    ///
    /// The encoding is self-delimiting, which lets a non-clustering index
    /// store `key-bytes ++ pk-bytes` in one physical key and split them back
    /// apart by decoding a known number of values.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            KeyValue::MinKey => buf.push(TAG_MIN),
            KeyValue::Null => buf.push(TAG_NULL),
            KeyValue::Bool(b) => {
                buf.push(TAG_BOOL);
                buf.push(u8::from(*b));
            }
            KeyValue::Int(i) => {
                buf.push(TAG_INT);
                // flip the sign bit so negative sorts before positive bytewise
                buf.extend_from_slice(&((*i as u64) ^ (1 << 63)).to_be_bytes());
            }
            KeyValue::Float(f) => {
                buf.push(TAG_FLOAT);
                let bits = f.0.to_bits();
                let ordered = if bits & (1 << 63) != 0 { !bits } else { bits ^ (1 << 63) };
                buf.extend_from_slice(&ordered.to_be_bytes());
            }
            KeyValue::String(s) => {
                buf.push(TAG_STRING);
                // escape embedded NULs (0x00 -> 0x00 0xff), terminate with 0x00 0x00
                for &b in s.as_bytes() {
                    if b == 0x00 {
                        buf.push(0x00);
                        buf.push(0xff);
                    } else {
                        buf.push(b);
                    }
                }
                buf.push(0x00);
                buf.push(0x00);
            }
            KeyValue::MaxKey => buf.push(TAG_MAX),
        }
    }

    /// Decode one value from the front of `buf`, returning it and the number
    /// of bytes consumed.
    pub fn decode_from(buf: &[u8]) -> crate::error::Result<(KeyValue, usize)> {
        use crate::error::FerroBaseError;
        let corrupt = || FerroBaseError::Engine("truncated key encoding".to_string());
        let tag = *buf.first().ok_or_else(corrupt)?;
        match tag {
            TAG_MIN => Ok((KeyValue::MinKey, 1)),
            TAG_NULL => Ok((KeyValue::Null, 1)),
            TAG_MAX => Ok((KeyValue::MaxKey, 1)),
            TAG_BOOL => {
                let b = *buf.get(1).ok_or_else(corrupt)?;
                Ok((KeyValue::Bool(b != 0), 2))
            }
            TAG_INT => {
                let raw: [u8; 8] = buf.get(1..9).ok_or_else(corrupt)?.try_into().unwrap();
                let i = (u64::from_be_bytes(raw) ^ (1 << 63)) as i64;
                Ok((KeyValue::Int(i), 9))
            }
            TAG_FLOAT => {
                let raw: [u8; 8] = buf.get(1..9).ok_or_else(corrupt)?.try_into().unwrap();
                let ordered = u64::from_be_bytes(raw);
                let bits = if ordered & (1 << 63) != 0 { ordered ^ (1 << 63) } else { !ordered };
                Ok((KeyValue::Float(OrderedFloat(f64::from_bits(bits))), 9))
            }
            TAG_STRING => {
                let mut s = Vec::new();
                let mut i = 1;
                loop {
                    let b = *buf.get(i).ok_or_else(corrupt)?;
                    if b == 0x00 {
                        let next = *buf.get(i + 1).ok_or_else(corrupt)?;
                        i += 2;
                        match next {
                            0x00 => break,
                            0xff => s.push(0x00),
                            _ => return Err(corrupt()),
                        }
                    } else {
                        s.push(b);
                        i += 1;
                    }
                }
                let s = String::from_utf8(s)
                    .map_err(|_| FerroBaseError::Engine("non-utf8 key string".to_string()))?;
                Ok((KeyValue::String(s), i))
            }
            _ => Err(corrupt()),
        }
    }
}

/// An ordered tuple of key values: one entry per indexed field.
/// Comparison is lexicographic; a strict prefix sorts before its extensions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexKey(pub Vec<KeyValue>);

impl IndexKey {
    pub fn new(values: Vec<KeyValue>) -> Self {
        IndexKey(values)
    }

    /// Single-sentinel key sorting before every real key.
    pub fn min() -> Self {
        IndexKey(vec![KeyValue::MinKey])
    }

    /// Single-sentinel key sorting after every real key.
    pub fn max() -> Self {
        IndexKey(vec![KeyValue::MaxKey])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Order-preserving byte encoding of the whole tuple.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for v in &self.0 {
            v.encode_into(&mut buf);
        }
        buf
    }

    /// Append another tuple's encoding (used to build composite
    /// secondary-index keys: key-bytes ++ pk-bytes).
    pub fn encode_with_suffix(&self, suffix: &IndexKey) -> Vec<u8> {
        let mut buf = self.encode();
        for v in &suffix.0 {
            v.encode_into(&mut buf);
        }
        buf
    }

    /// Decode exactly `n` values from the front of `buf`, returning the tuple
    /// and the remaining bytes.
    pub fn decode_n(buf: &[u8], n: usize) -> crate::error::Result<(IndexKey, &[u8])> {
        let mut values = Vec::with_capacity(n);
        let mut rest = buf;
        for _ in 0..n {
            let (v, used) = KeyValue::decode_from(rest)?;
            values.push(v);
            rest = &rest[used..];
        }
        Ok((IndexKey(values), rest))
    }

    /// Decode every value in `buf`.
    pub fn decode_all(buf: &[u8]) -> crate::error::Result<IndexKey> {
        let mut values = Vec::new();
        let mut rest = buf;
        while !rest.is_empty() {
            let (v, used) = KeyValue::decode_from(rest)?;
            values.push(v);
            rest = &rest[used..];
        }
        Ok(IndexKey(values))
    }
}

impl From<KeyValue> for IndexKey {
    fn from(v: KeyValue) -> Self {
        IndexKey(vec![v])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_value_ordering() {
        assert!(KeyValue::MinKey < KeyValue::Null);
        assert!(KeyValue::Null < KeyValue::Bool(false));
        assert!(KeyValue::Bool(false) < KeyValue::Bool(true));
        assert!(KeyValue::Bool(true) < KeyValue::Int(0));
        assert!(KeyValue::Int(5) < KeyValue::Int(10));
        assert!(KeyValue::Int(10) < KeyValue::Float(OrderedFloat(1.5)));
        assert!(KeyValue::Float(OrderedFloat(10.5)) < KeyValue::String("a".to_string()));
        assert!(KeyValue::String("a".to_string()) < KeyValue::String("b".to_string()));
        assert!(KeyValue::String("z".to_string()) < KeyValue::MaxKey);
    }

    #[test]
    fn test_encoding_preserves_order() {
        let samples = vec![
            KeyValue::MinKey,
            KeyValue::Null,
            KeyValue::Bool(false),
            KeyValue::Bool(true),
            KeyValue::Int(i64::MIN),
            KeyValue::Int(-7),
            KeyValue::Int(0),
            KeyValue::Int(42),
            KeyValue::Int(i64::MAX),
            KeyValue::Float(OrderedFloat(f64::NEG_INFINITY)),
            KeyValue::Float(OrderedFloat(-2.5)),
            KeyValue::Float(OrderedFloat(0.0)),
            KeyValue::Float(OrderedFloat(3.75)),
            KeyValue::Float(OrderedFloat(f64::INFINITY)),
            KeyValue::String(String::new()),
            KeyValue::String("abc".to_string()),
            KeyValue::String("abd".to_string()),
            KeyValue::MaxKey,
        ];
        for pair in samples.windows(2) {
            let a = IndexKey::from(pair[0].clone()).encode();
            let b = IndexKey::from(pair[1].clone()).encode();
            assert!(a < b, "{:?} should encode below {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_round_trip() {
        let key = IndexKey(vec![
            KeyValue::Int(-3),
            KeyValue::String("a\0b".to_string()),
            KeyValue::Float(OrderedFloat(1.25)),
            KeyValue::Null,
        ]);
        let decoded = IndexKey::decode_all(&key.encode()).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_composite_split() {
        let key = IndexKey(vec![KeyValue::Int(5), KeyValue::String("x".to_string())]);
        let pk = IndexKey(vec![KeyValue::Int(99)]);
        let physical = key.encode_with_suffix(&pk);

        let (decoded_key, rest) = IndexKey::decode_n(&physical, 2).unwrap();
        assert_eq!(decoded_key, key);
        let decoded_pk = IndexKey::decode_all(rest).unwrap();
        assert_eq!(decoded_pk, pk);
    }

    #[test]
    fn test_string_escaping_orders_correctly() {
        // "a" < "a\0" < "a\0a" < "ab"
        let ks = ["a", "a\0", "a\0a", "ab"];
        let encoded: Vec<_> = ks
            .iter()
            .map(|s| IndexKey::from(KeyValue::String(s.to_string())).encode())
            .collect();
        for pair in encoded.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_key_value_from_json() {
        use serde_json::json;
        assert_eq!(KeyValue::from(&json!(42)), KeyValue::Int(42));
        assert_eq!(KeyValue::from(&json!("test")), KeyValue::String("test".to_string()));
        assert_eq!(KeyValue::from(&json!(true)), KeyValue::Bool(true));
        assert_eq!(KeyValue::from(&json!(null)), KeyValue::Null);
        assert_eq!(KeyValue::from(&json!([1, 2])), KeyValue::Null);
    }
}
