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

//! Column metadata and the RowDescription/DataRow/CopyIn wire encoders.

use crate::frame::Writer;
use crate::messages;
use crate::types::{TIMESTAMP, TIMESTAMPTZ};
use std::io::{self, Write};

/// Text or binary wire representation, per column or per parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatCode {
    Text,
    Binary,
}

impl FormatCode {
    pub fn from_i16(code: i16) -> Self {
        if code == 1 {
            FormatCode::Binary
        } else {
            FormatCode::Text
        }
    }

    pub fn as_i16(self) -> i16 {
        match self {
            FormatCode::Text => 0,
            FormatCode::Binary => 1,
        }
    }
}

/// Descriptor for a single result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub table_oid: i32,
    pub attr_number: i16,
    pub type_oid: i32,
    pub type_size: i16,
}

impl Column {
    pub fn new(name: impl Into<String>, type_oid: i32, type_size: i16) -> Self {
        Self {
            name: name.into(),
            table_oid: 0,
            attr_number: 0,
            type_oid,
            type_size,
        }
    }
}

/// Ordered column list backing a RowDescription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Columns(pub Vec<Column>);

impl Columns {
    pub fn new(columns: Vec<Column>) -> Self {
        Self(columns)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Resolves the effective format for column `index` out of `count`, applying
/// the protocol's format-array fold rule:
/// empty -> Text for every column; length 1 -> that format for every column;
/// length >= 2 -> per-column, falling back to Text past the end of the array.
pub fn fold_format(formats: &[FormatCode], index: usize) -> FormatCode {
    match formats.len() {
        0 => FormatCode::Text,
        1 => formats[0],
        _ => formats.get(index).copied().unwrap_or(FormatCode::Text),
    }
}

/// Resolves the effective format for result column `index`, applying
/// [`fold_format`] and then, when the client left the format array empty and
/// `promote_datetime` is set, promoting `timestamp`/`timestamptz` columns to
/// Binary. The promotion never applies once the client has stated any format
/// explicitly.
pub fn resolve_result_format(formats: &[FormatCode], index: usize, type_oid: i32, promote_datetime: bool) -> FormatCode {
    if formats.is_empty() && promote_datetime && matches!(type_oid, TIMESTAMP | TIMESTAMPTZ) {
        return FormatCode::Binary;
    }
    fold_format(formats, index)
}

/// Writes a RowDescription ('T') message for `columns`, resolving per-column
/// format codes via [`resolve_result_format`].
pub fn write_row_description<W: Write>(
    out: &mut W,
    writer: &mut Writer,
    columns: &Columns,
    formats: &[FormatCode],
    promote_datetime: bool,
) -> io::Result<()> {
    writer.start(messages::ROW_DESCRIPTION);
    writer.i16(columns.len() as i16);
    for (i, column) in columns.0.iter().enumerate() {
        let format = resolve_result_format(formats, i, column.type_oid, promote_datetime);
        writer
            .cstr(&column.name)
            .i32(column.table_oid)
            .i16(column.attr_number)
            .i32(column.type_oid)
            .i16(column.type_size)
            .i32(-1)
            .i16(format.as_i16());
    }
    writer.end(out)
}

/// Writes a ParameterDescription ('t') message for a statement's declared
/// parameter OIDs.
pub fn write_parameter_description<W: Write>(out: &mut W, writer: &mut Writer, parameter_oids: &[i32]) -> io::Result<()> {
    writer.start(messages::PARAMETER_DESCRIPTION);
    writer.i16(parameter_oids.len() as i16);
    for oid in parameter_oids {
        writer.i32(*oid);
    }
    writer.end(out)
}

/// Writes a NoData ('n') message.
pub fn write_no_data<W: Write>(out: &mut W, writer: &mut Writer) -> io::Result<()> {
    writer.start(messages::NO_DATA);
    writer.end(out)
}

/// Writes a DataRow ('D') message for pre-encoded column values. Each value
/// is `None` for SQL NULL.
pub fn write_data_row<W: Write>(out: &mut W, writer: &mut Writer, values: &[Option<Vec<u8>>]) -> io::Result<()> {
    writer.start(messages::DATA_ROW);
    writer.i16(values.len() as i16);
    for value in values {
        writer.sized_bytes(value.as_deref());
    }
    writer.end(out)
}

/// Writes a CommandComplete ('C') message.
pub fn write_command_complete<W: Write>(out: &mut W, writer: &mut Writer, tag: &str) -> io::Result<()> {
    writer.start(messages::COMMAND_COMPLETE);
    writer.cstr(tag);
    writer.end(out)
}

/// Writes an EmptyQueryResponse ('I') message.
pub fn write_empty_query_response<W: Write>(out: &mut W, writer: &mut Writer) -> io::Result<()> {
    writer.start(messages::EMPTY_QUERY_RESPONSE);
    writer.end(out)
}

/// Writes a CopyInResponse ('G') message.
pub fn write_copy_in_response<W: Write>(
    out: &mut W,
    writer: &mut Writer,
    overall_format: FormatCode,
    column_formats: &[FormatCode],
) -> io::Result<()> {
    writer.start(messages::COPY_IN_RESPONSE);
    writer.byte(overall_format.as_i16() as u8);
    writer.i16(column_formats.len() as i16);
    for format in column_formats {
        writer.i16(format.as_i16());
    }
    writer.end(out)
}
