// Copyright 2020 - 2021 Alex Dukhno
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The injectable type map: encode/decode between Postgres OIDs and
//! application values. Parsing and planning are the embedding application's
//! job; this crate only needs a uniform way to turn bytes into values and
//! back at the wire boundary.

use crate::column::FormatCode;
use crate::error::WireError;
use std::sync::Arc;

/// Opaque scalar value threaded between the application handler and the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Text(String),
    Bytes(Vec<u8>),
}

/// Encodes/decodes values for a set of OIDs. The default implementation
/// covers the handful of built-in types the crate's own tests exercise;
/// embedding applications are expected to supply their own for anything
/// beyond that.
pub trait TypeMap: Send + Sync {
    fn encode(&self, oid: i32, format: FormatCode, value: &Value) -> Result<Vec<u8>, WireError>;
    fn decode(&self, oid: i32, format: FormatCode, bytes: &[u8]) -> Result<Value, WireError>;
}

pub const BOOL: i32 = 16;
pub const CHAR: i32 = 18;
pub const INT8: i32 = 20;
pub const INT2: i32 = 21;
pub const INT4: i32 = 23;
pub const TEXT: i32 = 25;
pub const TIMESTAMP: i32 = 1114;
pub const TIMESTAMPTZ: i32 = 1184;
pub const VARCHAR: i32 = 1043;

/// A type map covering `bool`/`int2`/`int4`/`int8`/`text`/`varchar` in both
/// text and binary format.
#[derive(Default)]
pub struct BuiltinTypeMap;

impl TypeMap for BuiltinTypeMap {
    fn encode(&self, oid: i32, format: FormatCode, value: &Value) -> Result<Vec<u8>, WireError> {
        match (oid, format, value) {
            (_, _, Value::Null) => Ok(Vec::new()),
            (BOOL, FormatCode::Text, Value::Bool(b)) => Ok(if *b { b"t".to_vec() } else { b"f".to_vec() }),
            (BOOL, FormatCode::Binary, Value::Bool(b)) => Ok(vec![*b as u8]),
            (INT2, FormatCode::Text, Value::Int16(v)) => Ok(v.to_string().into_bytes()),
            (INT2, FormatCode::Binary, Value::Int16(v)) => Ok(v.to_be_bytes().to_vec()),
            (INT4, FormatCode::Text, Value::Int32(v)) => Ok(v.to_string().into_bytes()),
            (INT4, FormatCode::Binary, Value::Int32(v)) => Ok(v.to_be_bytes().to_vec()),
            (INT8, FormatCode::Text, Value::Int64(v)) => Ok(v.to_string().into_bytes()),
            (INT8, FormatCode::Binary, Value::Int64(v)) => Ok(v.to_be_bytes().to_vec()),
            (TEXT, _, Value::Text(s)) | (VARCHAR, _, Value::Text(s)) | (CHAR, _, Value::Text(s)) => Ok(s.clone().into_bytes()),
            (_, _, Value::Bytes(b)) => Ok(b.clone()),
            (_, _, Value::Text(s)) => Ok(s.clone().into_bytes()),
            (oid, format, value) => Err(WireError::feature_not_supported(format!(
                "no encoder for oid {} format {:?} value {:?}",
                oid, format, value
            ))),
        }
    }

    fn decode(&self, oid: i32, format: FormatCode, bytes: &[u8]) -> Result<Value, WireError> {
        // A zero-length slice is a valid empty string/bytea, not NULL: NULL is
        // carried out-of-band as a -1 length by `Parameter`/`Payload::get_bytes`
        // and never reaches this function as `bytes`.
        match (oid, format) {
            (BOOL, FormatCode::Text) => Ok(Value::Bool(bytes == b"t")),
            (BOOL, FormatCode::Binary) => Ok(Value::Bool(bytes[0] != 0)),
            (INT2, FormatCode::Text) | (INT4, FormatCode::Text) | (INT8, FormatCode::Text) => {
                let s = std::str::from_utf8(bytes)
                    .map_err(|_| WireError::syntax("invalid utf8 in integer parameter"))?;
                let v: i64 = s.parse().map_err(|_| WireError::syntax("invalid integer literal"))?;
                Ok(match oid {
                    INT2 => Value::Int16(v as i16),
                    INT4 => Value::Int32(v as i32),
                    _ => Value::Int64(v),
                })
            }
            (INT2, FormatCode::Binary) => Ok(Value::Int16(i16::from_be_bytes(bytes.try_into().unwrap_or([0, 0])))),
            (INT4, FormatCode::Binary) => Ok(Value::Int32(i32::from_be_bytes(bytes.try_into().unwrap_or([0; 4])))),
            (INT8, FormatCode::Binary) => Ok(Value::Int64(i64::from_be_bytes(bytes.try_into().unwrap_or([0; 8])))),
            (TEXT, _) | (VARCHAR, _) | (CHAR, _) => {
                Ok(Value::Text(String::from_utf8_lossy(bytes).into_owned()))
            }
            _ => Ok(Value::Bytes(bytes.to_vec())),
        }
    }
}

/// A single bound parameter. Decoding is deferred until the handler asks for
/// it via [`Parameter::scan`].
#[derive(Clone)]
pub struct Parameter {
    format: FormatCode,
    raw: Option<Vec<u8>>,
    type_map: Arc<dyn TypeMap>,
}

impl Parameter {
    pub fn new(format: FormatCode, raw: Option<Vec<u8>>, type_map: Arc<dyn TypeMap>) -> Self {
        Self { format, raw, type_map }
    }

    pub fn is_null(&self) -> bool {
        self.raw.is_none()
    }

    pub fn format(&self) -> FormatCode {
        self.format
    }

    /// Decodes the parameter as `oid`, scanning on demand rather than eagerly.
    pub fn scan(&self, oid: i32) -> Result<Value, WireError> {
        match &self.raw {
            None => Ok(Value::Null),
            Some(bytes) => self.type_map.decode(oid, self.format, bytes),
        }
    }
}

impl std::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parameter")
            .field("format", &self.format)
            .field("raw_len", &self.raw.as_ref().map(|b| b.len()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_map_round_trips_int4_text() {
        let map = BuiltinTypeMap::default();
        let encoded = map.encode(INT4, FormatCode::Text, &Value::Int32(42)).unwrap();
        assert_eq!(encoded, b"42");
        let decoded = map.decode(INT4, FormatCode::Text, &encoded).unwrap();
        assert_eq!(decoded, Value::Int32(42));
    }

    #[test]
    fn builtin_map_round_trips_bool_binary() {
        let map = BuiltinTypeMap::default();
        let encoded = map.encode(BOOL, FormatCode::Binary, &Value::Bool(true)).unwrap();
        assert_eq!(encoded, vec![1]);
        let decoded = map.decode(BOOL, FormatCode::Binary, &encoded).unwrap();
        assert_eq!(decoded, Value::Bool(true));
    }

    #[test]
    fn null_parameter_scans_to_null() {
        let map: Arc<dyn TypeMap> = Arc::new(BuiltinTypeMap::default());
        let param = Parameter::new(FormatCode::Text, None, map);
        assert!(param.is_null());
        assert_eq!(param.scan(INT4).unwrap(), Value::Null);
    }
}
