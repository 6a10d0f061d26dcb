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

//! COPY IN readers. A `CopyReader` is fully materialized by the live data
//! writer before the handler ever sees it: the command loop drains `CopyData`
//! frames off the socket until `CopyDone`, decoding rows as they arrive, so a
//! handler only ever iterates over already-buffered rows and never touches
//! the socket itself.

use byteorder::{ByteOrder, NetworkEndian};
use std::sync::Arc;

use crate::column::{Columns, FormatCode};
use crate::error::WireError;
use crate::types::{TypeMap, Value};

const BINARY_SIGNATURE: &[u8] = b"PGCOPY\n\xff\r\n\0";

/// Decoded COPY IN rows, consumed in order by the application handler.
pub trait CopyReader: Send {
    fn next_row(&mut self) -> Result<Option<Vec<Value>>, WireError>;
}

pub struct MaterializedCopyReader {
    rows: std::vec::IntoIter<Vec<Value>>,
}

impl MaterializedCopyReader {
    pub fn new(rows: Vec<Vec<Value>>) -> Self {
        Self { rows: rows.into_iter() }
    }
}

impl CopyReader for MaterializedCopyReader {
    fn next_row(&mut self) -> Result<Option<Vec<Value>>, WireError> {
        Ok(self.rows.next())
    }
}

/// Decodes a complete binary-format COPY IN stream (`PGCOPY` header, flags,
/// header extension, then per-row `(int16 field count, (int32 length, bytes)*)`).
pub fn decode_binary(data: &[u8], columns: &Columns, type_map: &Arc<dyn TypeMap>) -> Result<Vec<Vec<Value>>, WireError> {
    let mut pos = 0usize;
    if data.starts_with(BINARY_SIGNATURE) {
        pos += BINARY_SIGNATURE.len();
        pos += 4; // flags
        if data.len() < pos + 4 {
            return Err(WireError::bad_copy_file_format("truncated COPY header extension length"));
        }
        let ext_len = NetworkEndian::read_i32(&data[pos..pos + 4]) as usize;
        pos += 4 + ext_len;
    }

    let mut rows = Vec::new();
    while pos < data.len() {
        if data.len() < pos + 2 {
            return Err(WireError::bad_copy_file_format("truncated row field count"));
        }
        let field_count = NetworkEndian::read_i16(&data[pos..pos + 2]);
        pos += 2;
        if field_count == -1 {
            break; // trailer
        }
        if field_count as usize != columns.len() {
            return Err(WireError::bad_copy_file_format(format!(
                "row has {} fields, expected {}",
                field_count,
                columns.len()
            )));
        }
        let mut row = Vec::with_capacity(field_count as usize);
        for column in &columns.0 {
            if data.len() < pos + 4 {
                return Err(WireError::bad_copy_file_format("truncated field length"));
            }
            let len = NetworkEndian::read_i32(&data[pos..pos + 4]);
            pos += 4;
            if len < 0 {
                row.push(Value::Null);
                continue;
            }
            let len = len as usize;
            if data.len() < pos + len {
                return Err(WireError::bad_copy_file_format("truncated field value"));
            }
            let value = type_map.decode(column.type_oid, FormatCode::Binary, &data[pos..pos + len])?;
            row.push(value);
            pos += len;
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Decodes a text/CSV-format COPY IN stream. `null_sentinel` is the literal
/// text (default `"\N"`) denoting SQL NULL for an unquoted field. Postgres's
/// `\"` escape is normalized to RFC-4180 `""` before splitting fields.
pub fn decode_text(
    data: &[u8],
    columns: &Columns,
    type_map: &Arc<dyn TypeMap>,
    null_sentinel: &str,
) -> Result<Vec<Vec<Value>>, WireError> {
    let text = String::from_utf8_lossy(data).replace("\\\"", "\"\"");
    let mut rows = Vec::new();
    for line in text.lines().filter(|l| !l.is_empty()) {
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != columns.len() {
            return Err(WireError::bad_copy_file_format(format!(
                "line has {} fields, expected {}",
                fields.len(),
                columns.len()
            )));
        }
        let mut row = Vec::with_capacity(fields.len());
        for (field, column) in fields.iter().zip(&columns.0) {
            if *field == null_sentinel {
                row.push(Value::Null);
                continue;
            }
            let unquoted = field.trim_matches('"');
            row.push(type_map.decode(column.type_oid, FormatCode::Text, unquoted.as_bytes())?);
        }
        rows.push(row);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::Column;
    use crate::types::{BuiltinTypeMap, INT4, TEXT};

    fn columns() -> Columns {
        Columns::new(vec![Column::new("id", INT4, 4), Column::new("name", TEXT, -1)])
    }

    #[test]
    fn decodes_text_rows_with_null_sentinel() {
        let map: Arc<dyn TypeMap> = Arc::new(BuiltinTypeMap::default());
        let rows = decode_text(b"1,alice\n2,\\N\n", &columns(), &map, "\\N").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec![Value::Int32(1), Value::Text("alice".into())]);
        assert_eq!(rows[1][1], Value::Null);
    }

    #[test]
    fn decodes_binary_rows_without_header() {
        let map: Arc<dyn TypeMap> = Arc::new(BuiltinTypeMap::default());
        let mut body = Vec::new();
        body.extend_from_slice(&2i16.to_be_bytes());
        body.extend_from_slice(&4i32.to_be_bytes());
        body.extend_from_slice(&7i32.to_be_bytes());
        body.extend_from_slice(&3i32.to_be_bytes());
        body.extend_from_slice(b"bob");
        body.extend_from_slice(&(-1i16).to_be_bytes());

        let rows = decode_binary(&body, &columns(), &map).unwrap();
        assert_eq!(rows, vec![vec![Value::Int32(7), Value::Text("bob".into())]]);
    }

    #[test]
    fn mismatched_field_count_is_bad_copy_format() {
        let map: Arc<dyn TypeMap> = Arc::new(BuiltinTypeMap::default());
        let err = decode_text(b"1\n", &columns(), &map, "\\N").unwrap_err();
        assert_eq!(err.code, "22P04");
    }
}
