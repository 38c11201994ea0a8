//! Tagged value encoding for SET and RTA payloads.
//!
//! The first payload byte selects the scalar kind, the remainder is the
//! body. An empty payload stands for "no value" and is produced for GET
//! and SUB replies on tags nobody has written yet.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::ProtocolError;

const KIND_INT: u8 = 0;
const KIND_FLOAT: u8 = 1;
const KIND_TEXT: u8 = 2;
const KIND_BYTES: u8 = 3;
const KIND_JSON: u8 = 4;

/// A bus value. Mappings and sequences both travel as canonical JSON
/// (kind 4); the declared tag kind distinguishes them at the edges.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Bytes),
    Json(serde_json::Value),
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Serialise to a SET/RTA payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Value::Null => {}
            Value::Int(v) => {
                buf.put_u8(KIND_INT);
                buf.put_i64(*v);
            }
            Value::Float(v) => {
                buf.put_u8(KIND_FLOAT);
                buf.put_f64(*v);
            }
            Value::Text(v) => {
                buf.put_u8(KIND_TEXT);
                buf.put_u32(v.len() as u32);
                buf.put_slice(v.as_bytes());
            }
            Value::Bytes(v) => {
                buf.put_u8(KIND_BYTES);
                buf.put_u32(v.len() as u32);
                buf.put_slice(v);
            }
            Value::Json(v) => {
                let body = serde_json::to_vec(v).unwrap_or_default();
                buf.put_u8(KIND_JSON);
                buf.put_u32(body.len() as u32);
                buf.put_slice(&body);
            }
        }
        buf.freeze()
    }

    /// Parse a SET/RTA payload. Rejects truncated and over-long bodies.
    pub fn decode(payload: &[u8]) -> Result<Value, ProtocolError> {
        if payload.is_empty() {
            return Ok(Value::Null);
        }
        let mut buf = payload;
        let kind = buf.get_u8();
        match kind {
            KIND_INT => {
                if buf.remaining() != 8 {
                    return Err(ProtocolError::Truncated);
                }
                Ok(Value::Int(buf.get_i64()))
            }
            KIND_FLOAT => {
                if buf.remaining() != 8 {
                    return Err(ProtocolError::Truncated);
                }
                Ok(Value::Float(buf.get_f64()))
            }
            KIND_TEXT | KIND_BYTES | KIND_JSON => {
                if buf.remaining() < 4 {
                    return Err(ProtocolError::Truncated);
                }
                let len = buf.get_u32() as usize;
                if buf.remaining() != len {
                    return Err(ProtocolError::Truncated);
                }
                match kind {
                    KIND_TEXT => {
                        let text =
                            std::str::from_utf8(buf).map_err(|_| ProtocolError::Utf8)?;
                        Ok(Value::Text(text.to_owned()))
                    }
                    KIND_BYTES => Ok(Value::Bytes(Bytes::copy_from_slice(buf))),
                    _ => Ok(Value::Json(serde_json::from_slice(buf)?)),
                }
            }
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }

    /// Requester cookie carried by an RTA request or response.
    ///
    /// Two conventions coexist on real buses: JSON payloads carry an
    /// `__rta_id__` member, binary payloads lead with a 2 byte big-endian
    /// cookie. Cookie 0 marks a broadcast response.
    pub fn cookie(&self) -> Option<u16> {
        match self {
            Value::Json(serde_json::Value::Object(map)) => map
                .get("__rta_id__")
                .and_then(|v| v.as_u64())
                .map(|v| v as u16),
            Value::Bytes(blob) if blob.len() >= 2 => {
                Some(u16::from_be_bytes([blob[0], blob[1]]))
            }
            _ => None,
        }
    }

    /// Stamp a JSON request with the given cookie if it does not carry one.
    /// Non-JSON values pass through untouched, the caller owns their prefix.
    pub fn with_cookie(self, cookie: u16) -> Value {
        match self {
            Value::Json(serde_json::Value::Object(mut map)) => {
                map.entry("__rta_id__")
                    .or_insert_with(|| serde_json::Value::from(cookie));
                Value::Json(serde_json::Value::Object(map))
            }
            other => other,
        }
    }

    /// Build a binary RTA response: 2 byte big-endian cookie, then the blob.
    pub fn bytes_response(cookie: u16, blob: &[u8]) -> Value {
        let mut buf = BytesMut::with_capacity(2 + blob.len());
        buf.put_u16(cookie);
        buf.put_slice(blob);
        Value::Bytes(buf.freeze())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Text(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Value {
        Value::Json(v)
    }
}
