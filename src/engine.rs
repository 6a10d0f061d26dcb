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

//! The command loop and extended-query engine: dispatches typed messages to
//! Parse/Bind/Describe/Execute/Flush/Sync/Close/Terminate handling, backed by
//! the statement/portal caches, with an optional parallel-pipeline mode that
//! overlaps handler execution with client I/O while preserving strict
//! per-client response ordering.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;

pub use crate::cache::Statement as PreparedStatement;
use crate::column::{self, fold_format, Columns, FormatCode};
use crate::connection::{Channel, Plain, Secure};
use crate::copy::{self, CopyReader};
use crate::error::{write_error_response, WireError, WireResult};
use crate::frame::{Payload, Reader, Writer};
use crate::messages;
use crate::session::{Session, SessionState};
use crate::types::{Parameter, TypeMap, Value};

/// Application query handler: writes rows/completion into `DataWriter`, given
/// the bound parameters.
pub type Handler = dyn Fn(&mut dyn DataWriter, &[Parameter]) -> Result<(), WireError> + Send + Sync;

/// Parses query text into zero or more prepared statements. The engine never
/// inspects query text itself beyond whitespace-trimming the empty-query case.
pub type ParseCallback = dyn Fn(&SessionState, &str) -> Result<Vec<PreparedStatement>, WireError> + Send + Sync;

/// The contract a query handler writes results through. Two implementations
/// exist: [`LiveDataWriter`] streams directly to the socket; [`QueuedDataWriter`]
/// buffers for later replay in pipeline mode.
pub trait DataWriter {
    fn row(&mut self, values: Vec<Value>) -> Result<(), WireError>;
    fn empty(&mut self) -> Result<(), WireError>;
    fn complete(&mut self, tag: &str) -> Result<(), WireError>;
    fn copy_in(&mut self, overall_format: FormatCode, column_formats: &[FormatCode]) -> Result<Box<dyn CopyReader>, WireError>;
    fn written(&self) -> usize;
}

/// Streams DataRow/CommandComplete frames directly to the socket as the
/// handler calls `row`/`complete`. Holds the connection's single `Reader` so
/// reads (for COPY IN) and writes (everything else) never alias each other.
pub struct LiveDataWriter<'a, R> {
    reader: &'a mut Reader<R>,
    writer: Writer,
    columns: Columns,
    formats: Vec<FormatCode>,
    type_map: Arc<dyn TypeMap>,
    promote_datetime: bool,
    written: usize,
}

impl<'a, R: Read + Write> LiveDataWriter<'a, R> {
    pub fn new(reader: &'a mut Reader<R>, columns: &Columns, formats: &[FormatCode], type_map: Arc<dyn TypeMap>) -> Self {
        Self::with_promotion(reader, columns, formats, type_map, false)
    }

    pub fn with_promotion(reader: &'a mut Reader<R>, columns: &Columns, formats: &[FormatCode], type_map: Arc<dyn TypeMap>, promote_datetime: bool) -> Self {
        Self {
            reader,
            writer: Writer::new(),
            columns: columns.clone(),
            formats: formats.to_vec(),
            type_map,
            promote_datetime,
            written: 0,
        }
    }
}

impl<'a, R: Read + Write> DataWriter for LiveDataWriter<'a, R> {
    fn row(&mut self, values: Vec<Value>) -> Result<(), WireError> {
        let mut encoded = Vec::with_capacity(values.len());
        for (i, value) in values.iter().enumerate() {
            let oid = self.columns.0.get(i).map(|c| c.type_oid).unwrap_or(0);
            let format = column::resolve_result_format(&self.formats, i, oid, self.promote_datetime);
            let bytes = match value {
                Value::Null => None,
                other => Some(self.type_map.encode(oid, format, other)?),
            };
            encoded.push(bytes);
        }
        column::write_data_row(self.reader.get_mut(), &mut self.writer, &encoded)?;
        self.written += 1;
        Ok(())
    }

    fn empty(&mut self) -> Result<(), WireError> {
        column::write_empty_query_response(self.reader.get_mut(), &mut self.writer)?;
        Ok(())
    }

    fn complete(&mut self, tag: &str) -> Result<(), WireError> {
        column::write_command_complete(self.reader.get_mut(), &mut self.writer, tag)?;
        Ok(())
    }

    fn copy_in(&mut self, overall_format: FormatCode, column_formats: &[FormatCode]) -> Result<Box<dyn CopyReader>, WireError> {
        column::write_copy_in_response(self.reader.get_mut(), &mut self.writer, overall_format, column_formats)?;

        let mut buf = Vec::new();
        loop {
            let (tag, payload) = self.reader.read_typed_msg()?;
            match tag {
                messages::COPY_DATA => buf.extend_from_slice(&payload),
                messages::COPY_DONE => break,
                messages::COPY_FAIL => {
                    let mut p = Payload::new(&payload);
                    let reason = p.get_str().unwrap_or_default();
                    return Err(WireError::uncategorized(format!("COPY FAIL: {}", reason)));
                }
                messages::FLUSH | messages::SYNC => continue,
                _ => return Err(WireError::protocol_violation("unexpected message during COPY IN")),
            }
        }
        let rows = match overall_format {
            FormatCode::Binary => copy::decode_binary(&buf, &self.columns, &self.type_map)?,
            FormatCode::Text => copy::decode_text(&buf, &self.columns, &self.type_map, "\\N")?,
        };
        Ok(Box::new(copy::MaterializedCopyReader::new(rows)))
    }

    fn written(&self) -> usize {
        self.written
    }
}

/// Buffers rows for deferred emission in pipeline mode. `copy_in` always
/// fails: pipeline mode does not support COPY IN.
pub struct QueuedDataWriter {
    columns: Columns,
    formats: Vec<FormatCode>,
    type_map: Arc<dyn TypeMap>,
    promote_datetime: bool,
    rows: Vec<Vec<Value>>,
    tag: Option<String>,
    empty: bool,
    error: Option<WireError>,
    written: usize,
}

impl QueuedDataWriter {
    pub fn new(columns: Columns, formats: Vec<FormatCode>, type_map: Arc<dyn TypeMap>) -> Self {
        Self::with_promotion(columns, formats, type_map, false)
    }

    pub fn with_promotion(columns: Columns, formats: Vec<FormatCode>, type_map: Arc<dyn TypeMap>, promote_datetime: bool) -> Self {
        Self {
            columns,
            formats,
            type_map,
            promote_datetime,
            rows: Vec::new(),
            tag: None,
            empty: false,
            error: None,
            written: 0,
        }
    }

    pub fn take_error(&mut self) -> Option<WireError> {
        self.error.take()
    }

    /// Streams the buffered rows and completion out through a live writer.
    pub fn replay<W: Write>(&self, out: &mut W, writer: &mut Writer) -> io::Result<()> {
        for row in &self.rows {
            let mut encoded = Vec::with_capacity(row.len());
            for (i, value) in row.iter().enumerate() {
                let oid = self.columns.0.get(i).map(|c| c.type_oid).unwrap_or(0);
                let format = column::resolve_result_format(&self.formats, i, oid, self.promote_datetime);
                let bytes = match value {
                    Value::Null => None,
                    other => Some(
                        self.type_map
                            .encode(oid, format, other)
                            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?,
                    ),
                };
                encoded.push(bytes);
            }
            column::write_data_row(out, writer, &encoded)?;
        }
        if self.empty {
            column::write_empty_query_response(out, writer)?;
        }
        if let Some(tag) = &self.tag {
            column::write_command_complete(out, writer, tag)?;
        }
        Ok(())
    }
}

impl DataWriter for QueuedDataWriter {
    fn row(&mut self, values: Vec<Value>) -> Result<(), WireError> {
        self.rows.push(values);
        self.written += 1;
        Ok(())
    }

    fn empty(&mut self) -> Result<(), WireError> {
        self.empty = true;
        Ok(())
    }

    fn complete(&mut self, tag: &str) -> Result<(), WireError> {
        self.tag = Some(tag.to_string());
        Ok(())
    }

    fn copy_in(&mut self, _overall_format: FormatCode, _column_formats: &[FormatCode]) -> Result<Box<dyn CopyReader>, WireError> {
        Err(WireError::feature_not_supported("COPY IN is not supported in pipeline mode"))
    }

    fn written(&self) -> usize {
        self.written
    }
}

fn poisoned(mut queued: QueuedDataWriter, err: WireError) -> QueuedDataWriter {
    queued.error = Some(err);
    queued
}

/// A deferred response produced while the session is pipelining.
pub enum ResponseEvent {
    ParseComplete,
    BindComplete,
    CloseComplete,
    StmtDescribe { parameter_oids: Vec<i32>, columns: Columns },
    PortalDescribe { columns: Columns, formats: Vec<FormatCode> },
    Execute { receiver: Receiver<QueuedDataWriter> },
}

/// Ordered, session-owned queue of not-yet-flushed responses. Only the
/// session's own command-loop thread ever enqueues or drains it.
#[derive(Default)]
pub struct ResponseQueue {
    events: VecDeque<ResponseEvent>,
    promote_datetime: bool,
}

impl ResponseQueue {
    pub fn new(promote_datetime: bool) -> Self {
        Self {
            events: VecDeque::new(),
            promote_datetime,
        }
    }

    pub fn push(&mut self, event: ResponseEvent) {
        self.events.push_back(event);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drains every queued event in order, emitting each as it resolves.
    /// Stops at (and does not emit) the first Execute whose handler failed;
    /// everything emitted before that point has already reached `out`.
    pub fn drain_sync<W: Write>(&mut self, out: &mut W, writer: &mut Writer) -> WireResult<()> {
        while let Some(event) = self.events.pop_front() {
            match event {
                ResponseEvent::ParseComplete => {
                    writer.start(messages::PARSE_COMPLETE);
                    writer.end(out)?;
                }
                ResponseEvent::BindComplete => {
                    writer.start(messages::BIND_COMPLETE);
                    writer.end(out)?;
                }
                ResponseEvent::CloseComplete => {
                    writer.start(messages::CLOSE_COMPLETE);
                    writer.end(out)?;
                }
                ResponseEvent::StmtDescribe { parameter_oids, columns } => {
                    column::write_parameter_description(out, writer, &parameter_oids)?;
                    if columns.is_empty() {
                        column::write_no_data(out, writer)?;
                    } else {
                        column::write_row_description(out, writer, &columns, &[], self.promote_datetime)?;
                    }
                }
                ResponseEvent::PortalDescribe { columns, formats } => {
                    if columns.is_empty() {
                        column::write_no_data(out, writer)?;
                    } else {
                        column::write_row_description(out, writer, &columns, &formats, self.promote_datetime)?;
                    }
                }
                ResponseEvent::Execute { receiver } => {
                    let mut queued = receiver.recv().map_err(|_| WireError::handler_panicked())?;
                    if let Some(err) = queued.take_error() {
                        return Err(err);
                    }
                    queued.replay(out, writer)?;
                }
            }
        }
        Ok(())
    }

    /// Drops every queued event without emitting it (used after an error has
    /// already been reported, so stale results are not sent on the next Sync).
    pub fn clear(&mut self) {
        self.events.clear();
    }
}

/// Which portion of the extended-query state machine the session is in.
#[derive(PartialEq, Eq, Clone, Copy)]
enum Mode {
    Idle,
    Extended,
    ExtendedError,
}

enum Dispatch {
    Continue,
    Sync,
}

/// Runs the per-connection command loop until `Terminate`, EOF, or a fatal
/// error. `parse_callback` turns query text into handlers; the session owns
/// its statement/portal caches and pipelining configuration.
pub fn run_connection<P: Plain, S: Secure>(channel: Channel<P, S>, mut session: Session, parse_callback: &ParseCallback) -> io::Result<()> {
    let mut reader = Reader::new(channel);
    let mut writer = Writer::new();
    let mut mode = Mode::Idle;

    ready_for_query(reader.get_mut(), &mut writer)?;

    loop {
        let (tag, payload) = match reader.read_typed_msg() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => {
                let err = WireError::from(e);
                if err.code == "54000" {
                    log::warn!("oversize message recovered: {}", err);
                    write_error_response(reader.get_mut(), &mut writer, messages::ERROR_RESPONSE, &err)?;
                    continue;
                }
                return Err(io::Error::new(io::ErrorKind::Other, err));
            }
        };
        let mut p = Payload::new(&payload);

        if tag == messages::TERMINATE {
            log::debug!("client sent Terminate, closing connection");
            return Ok(());
        }

        if mode == Mode::ExtendedError && tag != messages::SYNC {
            continue; // discard everything but Sync while in the error state
        }

        log::debug!("dispatching message '{}'", tag as char);
        let outcome = dispatch(tag, &mut p, &mut reader, &mut writer, &mut session, parse_callback, mode);

        match outcome {
            Ok(Dispatch::Continue) => {
                if tag == messages::QUERY {
                    ready_for_query(reader.get_mut(), &mut writer)?;
                } else if matches!(tag, messages::PARSE | messages::BIND | messages::DESCRIBE | messages::EXECUTE | messages::CLOSE) {
                    mode = Mode::Extended;
                }
            }
            Ok(Dispatch::Sync) => {
                match session.queue.drain_sync(reader.get_mut(), &mut writer) {
                    Ok(()) => {}
                    Err(err) => {
                        log::warn!("pipeline batch drained with an error: {}", err);
                        write_error_response(reader.get_mut(), &mut writer, messages::ERROR_RESPONSE, &err)?;
                        session.queue.clear();
                    }
                }
                mode = Mode::Idle;
                ready_for_query(reader.get_mut(), &mut writer)?;
            }
            Err(err) => {
                if !session.queue.is_empty() {
                    if let Err(drain_err) = session.queue.drain_sync(reader.get_mut(), &mut writer) {
                        write_error_response(reader.get_mut(), &mut writer, messages::ERROR_RESPONSE, &drain_err)?;
                    }
                    session.queue.clear();
                }
                log::error!("message '{}' failed: {}", tag as char, err);
                write_error_response(reader.get_mut(), &mut writer, messages::ERROR_RESPONSE, &err)?;
                if tag == messages::QUERY {
                    ready_for_query(reader.get_mut(), &mut writer)?;
                    mode = Mode::Idle;
                } else {
                    mode = Mode::ExtendedError;
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn dispatch<R: Read + Write>(
    tag: u8,
    payload: &mut Payload,
    reader: &mut Reader<R>,
    writer: &mut Writer,
    session: &mut Session,
    parse_callback: &ParseCallback,
    mode: Mode,
) -> WireResult<Dispatch> {
    match tag {
        messages::QUERY => {
            simple_query(payload, reader, writer, session, parse_callback)?;
            Ok(Dispatch::Continue)
        }
        messages::PARSE => {
            handle_parse(payload, session, parse_callback)?;
            if session.pipelining {
                session.queue.push(ResponseEvent::ParseComplete);
            } else {
                writer.start(messages::PARSE_COMPLETE);
                writer.end(reader.get_mut())?;
            }
            Ok(Dispatch::Continue)
        }
        messages::BIND => {
            handle_bind(payload, session)?;
            if session.pipelining {
                session.queue.push(ResponseEvent::BindComplete);
            } else {
                writer.start(messages::BIND_COMPLETE);
                writer.end(reader.get_mut())?;
            }
            Ok(Dispatch::Continue)
        }
        messages::DESCRIBE => {
            handle_describe(payload, reader, writer, session)?;
            Ok(Dispatch::Continue)
        }
        messages::EXECUTE => {
            handle_execute(payload, reader, session)?;
            Ok(Dispatch::Continue)
        }
        messages::FLUSH => {
            if session.pipelining {
                session.queue.drain_sync(reader.get_mut(), writer)?;
            }
            Ok(Dispatch::Continue)
        }
        messages::SYNC => Ok(Dispatch::Sync),
        messages::CLOSE => {
            let _ = payload.get_u8()?;
            let _name = payload.get_str()?;
            // No state is removed: Close is acknowledged but left a no-op on
            // the statement/portal caches (see SPEC_FULL.md's Close resolution).
            if session.pipelining {
                session.queue.push(ResponseEvent::CloseComplete);
            } else {
                writer.start(messages::CLOSE_COMPLETE);
                writer.end(reader.get_mut())?;
            }
            Ok(Dispatch::Continue)
        }
        messages::COPY_DATA | messages::COPY_DONE | messages::COPY_FAIL => Ok(Dispatch::Continue),
        _ if mode == Mode::ExtendedError => Ok(Dispatch::Continue),
        other => Err(WireError::protocol_violation(format!("unexpected message type '{}'", other as char))),
    }
}

fn ready_for_query<W: Write>(out: &mut W, writer: &mut Writer) -> io::Result<()> {
    writer.start(messages::READY_FOR_QUERY).byte(b'I');
    writer.end(out)
}

fn simple_query<R: Read + Write>(
    payload: &mut Payload,
    reader: &mut Reader<R>,
    writer: &mut Writer,
    session: &mut Session,
    parse_callback: &ParseCallback,
) -> WireResult<()> {
    let query = payload.get_str()?;
    if query.trim().is_empty() {
        column::write_empty_query_response(reader.get_mut(), writer)?;
        return Ok(());
    }
    let promote_datetime = session.state.promote_binary_datetime_on_empty_format;
    let statements = parse_callback(&session.state, &query)?;
    for statement in statements {
        if statement.columns.is_empty() {
            column::write_no_data(reader.get_mut(), writer)?;
        } else {
            column::write_row_description(reader.get_mut(), writer, &statement.columns, &[], promote_datetime)?;
        }
        let type_map = Arc::clone(&session.state.type_map);
        let mut live = LiveDataWriter::with_promotion(reader, &statement.columns, &[], type_map, promote_datetime);
        (statement.handler)(&mut live, &[])?;
    }
    Ok(())
}

fn handle_parse(payload: &mut Payload, session: &mut Session, parse_callback: &ParseCallback) -> WireResult<()> {
    let name = payload.get_str()?;
    let query = payload.get_str()?;
    let param_count = payload.get_u16()?;
    let mut declared_oids = Vec::with_capacity(param_count as usize);
    for _ in 0..param_count {
        declared_oids.push(payload.get_i32()?);
    }

    let mut statements = parse_callback(&session.state, &query)?;
    if statements.len() != 1 {
        return Err(WireError::syntax(if statements.is_empty() {
            "Parse produced no statement"
        } else {
            "Parse produced multiple commands"
        }));
    }
    let mut statement = statements.remove(0);
    if !declared_oids.is_empty() {
        statement.parameter_oids = declared_oids;
    }
    session.statements.set(name, statement);
    Ok(())
}

fn handle_bind(payload: &mut Payload, session: &mut Session) -> WireResult<()> {
    let portal_name = payload.get_str()?;
    let statement_name = payload.get_str()?;

    let format_count = payload.get_u16()?;
    let mut param_formats = Vec::with_capacity(format_count as usize);
    for _ in 0..format_count {
        param_formats.push(FormatCode::from_i16(payload.get_u16()? as i16));
    }

    let statement = session
        .statements
        .get(&statement_name)
        .ok_or_else(|| WireError::invalid_prepared_statement(&statement_name))?;

    let value_count = payload.get_u16()?;
    let type_map = Arc::clone(&session.state.type_map);
    let mut params = Vec::with_capacity(value_count as usize);
    for i in 0..value_count as usize {
        let len = payload.get_i32()?;
        let raw = payload.get_bytes(len)?;
        let format = fold_format(&param_formats, i);
        params.push(Parameter::new(format, raw, Arc::clone(&type_map)));
    }

    let result_format_count = payload.get_u16()?;
    let mut result_formats = Vec::with_capacity(result_format_count as usize);
    for _ in 0..result_format_count {
        result_formats.push(FormatCode::from_i16(payload.get_u16()? as i16));
    }

    session.portals.bind(portal_name, statement, params, result_formats);
    Ok(())
}

fn handle_describe<R: Read + Write>(payload: &mut Payload, reader: &mut Reader<R>, writer: &mut Writer, session: &mut Session) -> WireResult<()> {
    let kind = payload.get_u8()?;
    let name = payload.get_str()?;
    match kind {
        b'S' => {
            let statement = session
                .statements
                .get(&name)
                .ok_or_else(|| WireError::invalid_prepared_statement(&name))?;
            if session.pipelining {
                session.queue.push(ResponseEvent::StmtDescribe {
                    parameter_oids: statement.parameter_oids.clone(),
                    columns: statement.columns.clone(),
                });
            } else {
                column::write_parameter_description(reader.get_mut(), writer, &statement.parameter_oids)?;
                if statement.columns.is_empty() {
                    column::write_no_data(reader.get_mut(), writer)?;
                } else {
                    column::write_row_description(reader.get_mut(), writer, &statement.columns, &[], session.state.promote_binary_datetime_on_empty_format)?;
                }
            }
        }
        b'P' => {
            let portal = session.portals.get(&name).ok_or_else(|| WireError::invalid_cursor_name(&name))?;
            if session.pipelining {
                session.queue.push(ResponseEvent::PortalDescribe {
                    columns: portal.statement.columns.clone(),
                    formats: portal.result_formats.clone(),
                });
            } else if portal.statement.columns.is_empty() {
                column::write_no_data(reader.get_mut(), writer)?;
            } else {
                column::write_row_description(
                    reader.get_mut(),
                    writer,
                    &portal.statement.columns,
                    &portal.result_formats,
                    session.state.promote_binary_datetime_on_empty_format,
                )?;
            }
        }
        other => return Err(WireError::protocol_violation(format!("unknown Describe target '{}'", other as char))),
    }
    Ok(())
}

fn handle_execute<R: Read + Write>(payload: &mut Payload, reader: &mut Reader<R>, session: &mut Session) -> WireResult<()> {
    let name = payload.get_str()?;
    let _row_limit = payload.get_u32()?;
    let portal = session.portals.get(&name).ok_or_else(|| WireError::invalid_cursor_name(&name))?;
    let promote_datetime = session.state.promote_binary_datetime_on_empty_format;

    if session.pipelining {
        let (tx, rx) = sync_channel(1);
        let handler = Arc::clone(&portal.statement.handler);
        let params = portal.params.clone();
        let columns = portal.statement.columns.clone();
        let formats = portal.result_formats.clone();
        let type_map = Arc::clone(&session.state.type_map);
        let cancel = Arc::clone(&session.cancel);
        std::thread::spawn(move || {
            if cancel.load(Ordering::SeqCst) {
                let queued = QueuedDataWriter::with_promotion(columns, formats, type_map, promote_datetime);
                let _ = tx.send(poisoned(queued, WireError::query_canceled()));
                return;
            }
            let mut queued = QueuedDataWriter::with_promotion(columns, formats, type_map, promote_datetime);
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (handler)(&mut queued, &params)));
            let queued = match result {
                Ok(Ok(())) => queued,
                Ok(Err(err)) => poisoned(queued, err),
                Err(_) => poisoned(queued, WireError::handler_panicked()),
            };
            let _ = tx.send(queued);
        });
        session.queue.push(ResponseEvent::Execute { receiver: rx });
    } else {
        let type_map = Arc::clone(&session.state.type_map);
        let columns = portal.statement.columns.clone();
        let formats = portal.result_formats.clone();
        let mut live = LiveDataWriter::with_promotion(reader, &columns, &formats, type_map, promote_datetime);
        session.portals.execute(&name, &mut live)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests;
