// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tagged value codec for arguments crossing the writer channel.
//!
//! Every [`Value`] becomes an [`Envelope`]: a one-byte kind tag plus either a
//! flat byte payload or, for arrays, a list of nested envelopes. Payloads are
//! fixed per kind:
//!
//! | tag | kind    | payload                                 |
//! |-----|---------|-----------------------------------------|
//! | 1   | null    | empty                                   |
//! | 2   | bool    | one byte, `0` or `1`                    |
//! | 3   | integer | eight bytes, big-endian two's complement|
//! | 4   | float   | exact hexadecimal text (`0x1.8p+1`)     |
//! | 5   | string  | UTF-8 bytes                             |
//! | 6   | bytes   | raw bytes                               |
//! | 7   | array   | nested envelopes, order preserved       |

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

pub const TAG_NULL: u8 = 1;
pub const TAG_BOOL: u8 = 2;
pub const TAG_INTEGER: u8 = 3;
pub const TAG_FLOAT: u8 = 4;
pub const TAG_STRING: u8 = 5;
pub const TAG_BYTES: u8 = 6;
pub const TAG_ARRAY: u8 = 7;

/// A value that can be bound to a statement or carried as an argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Array(Vec<Value>),
}

/// Wire form of a [`Value`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub tag: u8,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<Envelope>,
}

impl Envelope {
    fn flat(tag: u8, data: Vec<u8>) -> Self {
        Self {
            tag,
            data,
            items: Vec::new(),
        }
    }
}

/// Encode a value. Total over [`Value`]; arrays recurse.
pub fn encode(value: &Value) -> Envelope {
    match value {
        Value::Null => Envelope::flat(TAG_NULL, Vec::new()),
        Value::Bool(b) => Envelope::flat(TAG_BOOL, vec![u8::from(*b)]),
        Value::Integer(i) => Envelope::flat(TAG_INTEGER, i.to_be_bytes().to_vec()),
        Value::Real(f) => Envelope::flat(TAG_FLOAT, float_to_hex(*f).into_bytes()),
        Value::Text(s) => Envelope::flat(TAG_STRING, s.as_bytes().to_vec()),
        Value::Blob(b) => Envelope::flat(TAG_BYTES, b.clone()),
        Value::Array(values) => Envelope {
            tag: TAG_ARRAY,
            data: Vec::new(),
            items: values.iter().map(encode).collect(),
        },
    }
}

/// Decode an envelope, rejecting unknown tags and malformed payloads.
pub fn decode(envelope: &Envelope) -> Result<Value, CodecError> {
    let tag = envelope.tag;
    let data = envelope.data.as_slice();
    if tag != TAG_ARRAY && !envelope.items.is_empty() {
        return Err(CodecError::payload(tag, "nested items on a scalar"));
    }
    match tag {
        TAG_NULL if data.is_empty() => Ok(Value::Null),
        TAG_NULL => Err(CodecError::payload(tag, "null carries no payload")),
        TAG_BOOL => match data {
            [0] => Ok(Value::Bool(false)),
            [1] => Ok(Value::Bool(true)),
            _ => Err(CodecError::payload(tag, "bool must be a single 0 or 1 byte")),
        },
        TAG_INTEGER => {
            let bytes: [u8; 8] = data
                .try_into()
                .map_err(|_| CodecError::payload(tag, "integer must be 8 bytes"))?;
            Ok(Value::Integer(i64::from_be_bytes(bytes)))
        }
        TAG_FLOAT => {
            let text = std::str::from_utf8(data)
                .map_err(|_| CodecError::payload(tag, "float text is not UTF-8"))?;
            float_from_hex(text).map(Value::Real)
        }
        TAG_STRING => String::from_utf8(data.to_vec())
            .map(Value::Text)
            .map_err(|e| CodecError::payload(tag, e.to_string())),
        TAG_BYTES => Ok(Value::Blob(data.to_vec())),
        TAG_ARRAY if data.is_empty() => envelope
            .items
            .iter()
            .map(decode)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        TAG_ARRAY => Err(CodecError::payload(tag, "array carries items, not bytes")),
        other => Err(CodecError::UnknownTag(other)),
    }
}

/// Exact hexadecimal rendering of an `f64`.
///
/// Normal numbers render as `[-]0x1.<13 hex digits>p<exp>`, subnormals as
/// `[-]0x0.<13 hex digits>p-1022`, zero as `[-]0x0.0p+0`. Non-finite values
/// render as `inf`, `-inf` and `nan`.
pub fn float_to_hex(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    let sign = if value.is_sign_negative() { "-" } else { "" };
    if value.is_infinite() {
        return format!("{sign}inf");
    }

    let bits = value.to_bits();
    let exponent = ((bits >> 52) & 0x7ff) as i64;
    let mantissa = bits & MANTISSA_MASK;
    match (exponent, mantissa) {
        (0, 0) => format!("{sign}0x0.0p+0"),
        (0, m) => format!("{sign}0x0.{m:013x}p-1022"),
        (e, m) => format!("{sign}0x1.{m:013x}p{:+}", e - EXPONENT_BIAS),
    }
}

const MANTISSA_MASK: u64 = (1 << 52) - 1;
const EXPONENT_BIAS: i64 = 1023;

/// Parse text produced by [`float_to_hex`].
///
/// Shorter fractions (`0x1.8p+1`) are accepted; anything that would need
/// rounding is rejected.
pub fn float_from_hex(text: &str) -> Result<f64, CodecError> {
    let invalid = || CodecError::InvalidFloat(text.to_string());

    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let magnitude = match body {
        "inf" => f64::INFINITY,
        "nan" if !negative => return Ok(f64::NAN),
        _ => {
            let hex = body.strip_prefix("0x").ok_or_else(invalid)?;
            let (significand, exponent) = hex.split_once('p').ok_or_else(invalid)?;
            let (lead, fraction) = significand.split_once('.').ok_or_else(invalid)?;
            let exponent: i64 = exponent.parse().map_err(|_| invalid())?;
            if fraction.is_empty()
                || fraction.len() > 13
                || !fraction.bytes().all(|b| b.is_ascii_hexdigit())
            {
                return Err(invalid());
            }
            let mantissa = u64::from_str_radix(&format!("{fraction:0<13}"), 16)
                .map_err(|_| invalid())?;

            let bits = match (lead, mantissa) {
                ("0", 0) => 0,
                ("0", m) if exponent == -1022 => m,
                ("1", m) if (-1022..=1023).contains(&exponent) => {
                    (((exponent + EXPONENT_BIAS) as u64) << 52) | m
                }
                _ => return Err(invalid()),
            };
            f64::from_bits(bits)
        }
    };
    Ok(if negative { -magnitude } else { magnitude })
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Self::Blob(v.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::Array(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl TryFrom<u64> for Value {
    type Error = CodecError;

    fn try_from(v: u64) -> Result<Self, Self::Error> {
        i64::try_from(v)
            .map(Self::Integer)
            .map_err(|_| CodecError::Unsupported(format!("integer {v} does not fit in 64 signed bits")))
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = CodecError;

    fn try_from(v: serde_json::Value) -> Result<Self, Self::Error> {
        use serde_json::Value as Json;

        match v {
            Json::Null => Ok(Self::Null),
            Json::Bool(b) => Ok(Self::Bool(b)),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Integer(i))
                } else if let Some(u) = n.as_u64() {
                    Self::try_from(u)
                } else {
                    n.as_f64()
                        .map(Self::Real)
                        .ok_or_else(|| CodecError::Unsupported(format!("number {n}")))
                }
            }
            Json::String(s) => Ok(Self::Text(s)),
            Json::Array(items) => items
                .into_iter()
                .map(Self::try_from)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Array),
            Json::Object(_) => Err(CodecError::Unsupported(
                "mappings cannot be sent to the writer".to_string(),
            )),
        }
    }
}

/// Build a `Vec<Value>` from heterogeneous bindings.
///
/// ```
/// use scribe_wire::{values, Value};
///
/// let params = values!["a", 1_i64, None::<String>];
/// assert_eq!(params, vec![Value::Text("a".into()), Value::Integer(1), Value::Null]);
/// ```
#[macro_export]
macro_rules! values {
    () => { ::std::vec::Vec::<$crate::Value>::new() };
    ($($v:expr),+ $(,)?) => { vec![$($crate::Value::from($v)),+] };
}
