// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request and reply records exchanged with the writer.
//!
//! Both are CBOR documents (via `ciborium`) inside one frame each. An empty
//! reply frame is the acknowledgement for control calls.

use std::collections::BTreeMap;

use scribe_core::{ConnectionKind, DatabaseIdentity, ErrorKind};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

use crate::codec::{self, Envelope, Value};
use crate::error::CodecError;

/// The closed set of operations the writer performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DbMethod {
    Initialize,
    Execute,
    ExecuteMany,
    ExecuteScript,
    Commit,
    Rollback,
    OpenCursor,
    CloseCursor,
    Close,
}

impl DbMethod {
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::Initialize => 1,
            Self::Execute => 2,
            Self::ExecuteMany => 3,
            Self::ExecuteScript => 4,
            Self::Commit => 5,
            Self::Rollback => 6,
            Self::OpenCursor => 7,
            Self::CloseCursor => 8,
            Self::Close => 9,
        }
    }

    pub const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Initialize),
            2 => Some(Self::Execute),
            3 => Some(Self::ExecuteMany),
            4 => Some(Self::ExecuteScript),
            5 => Some(Self::Commit),
            6 => Some(Self::Rollback),
            7 => Some(Self::OpenCursor),
            8 => Some(Self::CloseCursor),
            9 => Some(Self::Close),
            _ => None,
        }
    }

    /// Control calls are answered with an empty acknowledgement frame.
    pub const fn is_control(self) -> bool {
        matches!(
            self,
            Self::Initialize | Self::OpenCursor | Self::CloseCursor
        )
    }
}

/// One request to the writer.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub identity: DatabaseIdentity,
    pub cursor_name: Option<String>,
    pub method: DbMethod,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

#[derive(Serialize, Deserialize)]
struct CallEnvelope {
    connection_kind: u8,
    db_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cursor_name: Option<String>,
    method: u8,
    #[serde(default)]
    args: Vec<Envelope>,
    #[serde(default)]
    kwargs: BTreeMap<String, Envelope>,
}

impl Call {
    pub fn new(identity: DatabaseIdentity, method: DbMethod) -> Self {
        Self {
            identity,
            cursor_name: None,
            method,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    pub fn cursor(mut self, name: Option<&str>) -> Self {
        self.cursor_name = name.map(str::to_string);
        self
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.args.extend(values);
        self
    }

    pub fn kwarg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.to_string(), value.into());
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let envelope = CallEnvelope {
            connection_kind: self.identity.kind.to_u8(),
            db_path: self.identity.path.clone(),
            cursor_name: self.cursor_name.clone(),
            method: self.method.to_u8(),
            args: self.args.iter().map(codec::encode).collect(),
            kwargs: self
                .kwargs
                .iter()
                .map(|(k, v)| (k.clone(), codec::encode(v)))
                .collect(),
        };
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&envelope, &mut bytes)
            .map_err(|err| CodecError::Serialization(err.to_string()))?;
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let envelope: CallEnvelope = ciborium::de::from_reader(bytes)
            .map_err(|err| CodecError::Serialization(err.to_string()))?;
        let kind = ConnectionKind::from_u8(envelope.connection_kind).ok_or(
            CodecError::UnknownEnum {
                field: "connection kind",
                tag: envelope.connection_kind,
            },
        )?;
        let method = DbMethod::from_u8(envelope.method).ok_or(CodecError::UnknownEnum {
            field: "method",
            tag: envelope.method,
        })?;
        Ok(Self {
            identity: DatabaseIdentity::new(envelope.db_path, kind),
            cursor_name: envelope.cursor_name,
            method,
            args: envelope
                .args
                .iter()
                .map(codec::decode)
                .collect::<Result<_, _>>()?,
            kwargs: envelope
                .kwargs
                .iter()
                .map(|(k, v)| codec::decode(v).map(|v| (k.clone(), v)))
                .collect::<Result<_, _>>()?,
        })
    }
}

/// One reply from the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Empty frame answering a control call.
    Ack,
    /// Statement outcome.
    Done {
        lastrowid: Option<i64>,
        rowcount: Option<i64>,
    },
    /// A classified fault.
    Error { kind: ErrorKind, message: String },
}

#[derive(Serialize, Deserialize)]
enum ResultEnvelope {
    #[serde(rename = "result")]
    Result {
        lastrowid: Option<i64>,
        rowcount: Option<i64>,
    },
    #[serde(rename = "error")]
    Error { kind: u8, message: String },
}

impl Reply {
    pub fn done(lastrowid: i64, rowcount: i64) -> Self {
        Self::Done {
            lastrowid: Some(lastrowid),
            rowcount: Some(rowcount),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let envelope = match self {
            Self::Ack => return Ok(Vec::new()),
            Self::Done {
                lastrowid,
                rowcount,
            } => ResultEnvelope::Result {
                lastrowid: *lastrowid,
                rowcount: *rowcount,
            },
            Self::Error { kind, message } => ResultEnvelope::Error {
                kind: kind.to_u8(),
                message: message.clone(),
            },
        };
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&envelope, &mut bytes)
            .map_err(|err| CodecError::Serialization(err.to_string()))?;
        Ok(bytes)
    }

    /// Parse a reply frame. A kind tag this build does not know is kept as
    /// [`ErrorKind::Unknown`] so the message still reaches the caller.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.is_empty() {
            return Ok(Self::Ack);
        }
        let envelope: ResultEnvelope = ciborium::de::from_reader(bytes)
            .map_err(|err| CodecError::Serialization(err.to_string()))?;
        Ok(match envelope {
            ResultEnvelope::Result {
                lastrowid,
                rowcount,
            } => Self::Done {
                lastrowid,
                rowcount,
            },
            ResultEnvelope::Error { kind, message } => Self::Error {
                kind: ErrorKind::from_u8(kind).unwrap_or(ErrorKind::Unknown),
                message,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    fn identity() -> DatabaseIdentity {
        DatabaseIdentity::new("/data/user.db", ConnectionKind::User)
    }

    #[test]
    fn method_tags_roundtrip() {
        for method in DbMethod::iter() {
            assert_eq!(DbMethod::from_u8(method.to_u8()), Some(method));
        }
        assert_eq!(DbMethod::from_u8(0), None);
        assert_eq!(DbMethod::ExecuteMany.to_string(), "EXECUTE_MANY");
    }

    #[test]
    fn call_roundtrip_keeps_every_field() {
        let call = Call::new(identity(), DbMethod::Execute)
            .cursor(Some("sp1"))
            .arg("INSERT INTO t(name) VALUES(?)")
            .arg(Value::Array(vec![Value::Text("a".into())]))
            .kwarg("password", "hunter2");
        let bytes = call.to_bytes().unwrap();
        assert_eq!(Call::from_bytes(&bytes).unwrap(), call);
    }

    #[test]
    fn unknown_method_tag_rejected() {
        let envelope = CallEnvelope {
            connection_kind: 1,
            db_path: "x".into(),
            cursor_name: None,
            method: 99,
            args: vec![],
            kwargs: BTreeMap::new(),
        };
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&envelope, &mut bytes).unwrap();
        let err = Call::from_bytes(&bytes).unwrap_err();
        assert_eq!(
            err,
            CodecError::UnknownEnum {
                field: "method",
                tag: 99
            }
        );
    }

    #[test]
    fn garbage_call_is_a_codec_error() {
        assert!(matches!(
            Call::from_bytes(&[0xff, 0x00, 0x13]),
            Err(CodecError::Serialization(_))
        ));
    }

    #[test]
    fn replies_roundtrip() {
        assert_eq!(Reply::Ack.to_bytes().unwrap(), Vec::<u8>::new());
        for reply in [
            Reply::Ack,
            Reply::done(7, 1),
            Reply::Done {
                lastrowid: None,
                rowcount: None,
            },
            Reply::Error {
                kind: ErrorKind::DbWrite,
                message: "UNIQUE constraint failed: t.name".into(),
            },
        ] {
            let bytes = reply.to_bytes().unwrap();
            assert_eq!(Reply::from_bytes(&bytes).unwrap(), reply);
        }
    }

    #[test]
    fn unknown_error_kind_degrades_to_unknown() {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(
            &ResultEnvelope::Error {
                kind: 77,
                message: "boom".into(),
            },
            &mut bytes,
        )
        .unwrap();
        assert_eq!(
            Reply::from_bytes(&bytes).unwrap(),
            Reply::Error {
                kind: ErrorKind::Unknown,
                message: "boom".into()
            }
        );
    }
}
