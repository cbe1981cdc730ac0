//! Self-describing binary serialization of heterogeneous structured values.
//!
//! Every value is framed as a one-byte type tag followed by a type-specific
//! payload. The format is defined exhaustively so that any two conforming
//! encoders/decoders agree byte-for-byte.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CodecError;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_DOUBLE: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_LIST: u8 = 5;
const TAG_MAP: u8 = 6;
const TAG_DATETIME: u8 = 7;
const TAG_BYTESTRING: u8 = 8;
const TAG_BIGINT: u8 = 9;

/// An arbitrary-precision integer, stored as its UTF-8 decimal
/// representation. This crate never performs arithmetic on it; it only
/// validates that the digits are well-formed and preserves them exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigInt(String);

impl BigInt {
    /// Builds a `BigInt` from a decimal string, validating the digits.
    ///
    /// Accepts an optional leading `-` followed by one or more ASCII digits.
    pub fn parse(digits: impl Into<String>) -> Result<Self, CodecError> {
        let digits = digits.into();
        let body = digits.strip_prefix('-').unwrap_or(&digits);
        if body.is_empty() || !body.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CodecError::InvalidBigInt(digits));
        }
        Ok(Self(digits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BigInt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A heterogeneous structured value: the unit of storage for one tag.
///
/// `Map` preserves insertion order, matching the ordered-mapping semantics
/// the storage engine's data model calls for.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Bytes(Bytes),
    /// Milliseconds since the Unix epoch.
    DateTime(i64),
    BigInt(BigInt),
    List(Vec<Value>),
    Map(Vec<(String, Value)>),
}

impl Value {
    /// Looks up a key in a `Map` value; returns `None` for any other variant
    /// or a missing key. Used by compare-and-swap to read the field under
    /// comparison.
    pub fn get_field(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Deep equality used by compare-and-swap: reference/scalar equality
    /// for scalars, byte-level equality for strings and byte-strings, and
    /// `Null` matching only `Null`.
    pub fn cas_eq(&self, other: &Value) -> bool {
        self == other
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Value::Null => buf.put_u8(TAG_NULL),
            Value::Bool(b) => {
                buf.put_u8(TAG_BOOL);
                buf.put_u8(u8::from(*b));
            }
            Value::Int(i) => {
                buf.put_u8(TAG_INT);
                buf.put_i64_le(*i);
            }
            Value::Double(d) => {
                buf.put_u8(TAG_DOUBLE);
                buf.put_f64_le(*d);
            }
            Value::String(s) => {
                buf.put_u8(TAG_STRING);
                put_len_prefixed(buf, s.as_bytes());
            }
            Value::Bytes(b) => {
                buf.put_u8(TAG_BYTESTRING);
                put_len_prefixed(buf, b);
            }
            Value::DateTime(ms) => {
                buf.put_u8(TAG_DATETIME);
                buf.put_i64_le(*ms);
            }
            Value::BigInt(b) => {
                buf.put_u8(TAG_BIGINT);
                put_len_prefixed(buf, b.as_str().as_bytes());
            }
            Value::List(items) => {
                buf.put_u8(TAG_LIST);
                buf.put_u32_le(items.len() as u32);
                for item in items {
                    item.encode_into(buf);
                }
            }
            Value::Map(entries) => {
                buf.put_u8(TAG_MAP);
                buf.put_u32_le(entries.len() as u32);
                for (key, value) in entries {
                    buf.put_u8(TAG_STRING);
                    put_len_prefixed(buf, key.as_bytes());
                    value.encode_into(buf);
                }
            }
        }
    }

    pub fn decode(data: &[u8]) -> Result<Value, CodecError> {
        let mut cursor = Cursor::new(data);
        let value = decode_one(&mut cursor)?;
        Ok(value)
    }
}

fn put_len_prefixed(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32_le(bytes.len() as u32);
    buf.put_slice(bytes);
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + n > self.data.len() {
            return Err(CodecError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn take_u32_le(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn take_i64_le(&mut self) -> Result<i64, CodecError> {
        let bytes = self.take(8)?;
        Ok(i64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn take_f64_le(&mut self) -> Result<f64, CodecError> {
        let bytes = self.take(8)?;
        Ok(f64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn take_len_prefixed(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.take_u32_le()? as usize;
        self.take(len)
    }

    fn take_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.take_len_prefixed()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }
}

fn decode_one(cursor: &mut Cursor<'_>) -> Result<Value, CodecError> {
    let tag = cursor.take_u8()?;
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_BOOL => Ok(Value::Bool(cursor.take_u8()? != 0)),
        TAG_INT => Ok(Value::Int(cursor.take_i64_le()?)),
        TAG_DOUBLE => Ok(Value::Double(cursor.take_f64_le()?)),
        TAG_STRING => Ok(Value::String(cursor.take_string()?)),
        TAG_BYTESTRING => Ok(Value::Bytes(Bytes::copy_from_slice(
            cursor.take_len_prefixed()?,
        ))),
        TAG_DATETIME => Ok(Value::DateTime(cursor.take_i64_le()?)),
        TAG_BIGINT => {
            let digits = cursor.take_string()?;
            Ok(Value::BigInt(BigInt::parse(digits)?))
        }
        TAG_LIST => {
            let count = cursor.take_u32_le()?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(decode_one(cursor)?);
            }
            Ok(Value::List(items))
        }
        TAG_MAP => {
            let count = cursor.take_u32_le()?;
            let mut entries = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let key_tag = cursor.take_u8()?;
                if key_tag != TAG_STRING {
                    return Err(CodecError::NonStringMapKey(key_tag));
                }
                let key = cursor.take_string()?;
                let value = decode_one(cursor)?;
                entries.push((key, value));
            }
            Ok(Value::Map(entries))
        }
        other => Err(CodecError::UnknownTypeTag(other)),
    }
}
