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

//! End-to-end scenarios driven straight through [`run_connection`], bypassing
//! handshake and auth: simple query, extended query with bound parameters,
//! pipelining, pipeline error recovery, and protocol-violation recovery.

use super::*;
use crate::cache::{InMemoryPortalCache, InMemoryStatementCache, Statement};
use crate::column::Column;
use crate::connection::Channel;
use crate::session::SessionState;
use crate::test_support::DuplexSocket;
use crate::types::{BuiltinTypeMap, INT4};

fn frame(tag: u8, build: impl FnOnce(&mut Writer)) -> Vec<u8> {
    let mut w = Writer::new();
    w.start(tag);
    build(&mut w);
    w.finish()
}

fn session(pipelining: bool) -> Session {
    let state = Arc::new(SessionState::new(Arc::new(BuiltinTypeMap::default()), Default::default(), Default::default(), None));
    Session::with_caches(state, pipelining, Arc::new(InMemoryStatementCache::default()), Arc::new(InMemoryPortalCache::default()))
}

fn channel(server: DuplexSocket) -> Channel<DuplexSocket, DuplexSocket> {
    Channel::Plain(server)
}

fn select_one_callback(_state: &SessionState, query: &str) -> WireResult<Vec<PreparedStatement>> {
    match query.trim() {
        "SELECT 1" => Ok(vec![Statement::new(
            Arc::new(|writer: &mut dyn DataWriter, _: &[Parameter]| {
                writer.row(vec![Value::Int32(1)])?;
                writer.complete("SELECT 1")
            }),
            vec![],
            Columns::new(vec![Column::new("?column?", crate::types::INT4, 4)]),
        )]),
        other => Err(WireError::syntax(format!("unsupported query: {}", other))),
    }
}

#[test]
fn simple_query_emits_row_and_command_complete() {
    let (client, server) = DuplexSocket::pair();
    let mut c = client.clone();
    c.write_all(&frame(messages::QUERY, |w| {
        w.cstr("SELECT 1");
    }))
    .unwrap();

    run_connection(channel(server), session(false), &select_one_callback).unwrap();

    let out = client.take_written();
    assert_eq!(out[0], messages::READY_FOR_QUERY);
    assert!(out.iter().any(|&b| b == messages::ROW_DESCRIPTION));
    assert!(out.iter().any(|&b| b == messages::DATA_ROW));
    assert!(out.iter().any(|&b| b == messages::COMMAND_COMPLETE));
}

fn echo_param_callback(_state: &SessionState, query: &str) -> WireResult<Vec<PreparedStatement>> {
    match query.trim() {
        "ECHO" => Ok(vec![Statement::new(
            Arc::new(|writer: &mut dyn DataWriter, params: &[Parameter]| {
                let value = params[0].scan(INT4)?;
                writer.row(vec![value])?;
                writer.complete("SELECT 1")
            }),
            vec![INT4],
            Columns::new(vec![Column::new("echo", INT4, 4)]),
        )]),
        other => Err(WireError::syntax(format!("unsupported query: {}", other))),
    }
}

#[test]
fn extended_query_round_trips_a_bound_parameter() {
    let (client, server) = DuplexSocket::pair();
    let mut c = client.clone();

    c.write_all(&frame(messages::PARSE, |w| {
        w.cstr("s1").cstr("ECHO").u16(0);
    }))
    .unwrap();
    c.write_all(&frame(messages::BIND, |w| {
        w.cstr("p1").cstr("s1").u16(0).u16(1).i32(2).bytes(b"42").u16(0);
    }))
    .unwrap();
    c.write_all(&frame(messages::DESCRIBE, |w| {
        w.byte(b'P').cstr("p1");
    }))
    .unwrap();
    c.write_all(&frame(messages::EXECUTE, |w| {
        w.cstr("p1").u32(0);
    }))
    .unwrap();
    c.write_all(&frame(messages::SYNC, |_| {})).unwrap();

    run_connection(channel(server), session(false), &echo_param_callback).unwrap();

    let out = client.take_written();
    assert!(out.iter().any(|&b| b == messages::PARSE_COMPLETE));
    assert!(out.iter().any(|&b| b == messages::BIND_COMPLETE));
    assert!(out.iter().any(|&b| b == messages::ROW_DESCRIPTION));
    assert!(out.iter().any(|&b| b == messages::DATA_ROW));
    assert!(out.iter().any(|&b| b == messages::COMMAND_COMPLETE));
    assert_eq!(out.iter().filter(|&&b| b == messages::READY_FOR_QUERY).count(), 2);
}

#[test]
fn pipeline_mode_defers_responses_until_sync() {
    let (client, server) = DuplexSocket::pair();
    let mut c = client.clone();

    c.write_all(&frame(messages::PARSE, |w| {
        w.cstr("s1").cstr("ECHO").u16(0);
    }))
    .unwrap();
    c.write_all(&frame(messages::BIND, |w| {
        w.cstr("p1").cstr("s1").u16(0).u16(1).i32(2).bytes(b"42").u16(0);
    }))
    .unwrap();
    c.write_all(&frame(messages::EXECUTE, |w| {
        w.cstr("p1").u32(0);
    }))
    .unwrap();
    c.write_all(&frame(messages::SYNC, |_| {})).unwrap();

    run_connection(channel(server), session(true), &echo_param_callback).unwrap();

    let out = client.take_written();
    // Only the initial ReadyForQuery precedes Sync; everything else is
    // flushed in one shot once the batch drains.
    assert_eq!(out[0], messages::READY_FOR_QUERY);
    assert!(out.iter().any(|&b| b == messages::PARSE_COMPLETE));
    assert!(out.iter().any(|&b| b == messages::DATA_ROW));
    assert_eq!(out.iter().filter(|&&b| b == messages::READY_FOR_QUERY).count(), 2);
}

fn fallible_callback(_state: &SessionState, query: &str) -> WireResult<Vec<PreparedStatement>> {
    let ok = query.trim() == "OK";
    let columns = Columns::new(vec![Column::new("n", INT4, 4)]);
    if ok {
        Ok(vec![Statement::new(
            Arc::new(|writer: &mut dyn DataWriter, _: &[Parameter]| {
                writer.row(vec![Value::Int32(1)])?;
                writer.complete("SELECT 1")
            }),
            vec![],
            columns,
        )])
    } else {
        Ok(vec![Statement::new(
            Arc::new(|_: &mut dyn DataWriter, _: &[Parameter]| Err(WireError::uncategorized("boom"))),
            vec![],
            columns,
        )])
    }
}

#[test]
fn pipeline_error_after_success_reports_error_and_drops_the_rest() {
    let (client, server) = DuplexSocket::pair();
    let mut c = client.clone();

    for (stmt, portal, query) in [("s1", "p1", "OK"), ("s2", "p2", "FAIL")] {
        c.write_all(&frame(messages::PARSE, |w| {
            w.cstr(stmt).cstr(query).u16(0);
        }))
        .unwrap();
        c.write_all(&frame(messages::BIND, |w| {
            w.cstr(portal).cstr(stmt).u16(0).u16(0).u16(0);
        }))
        .unwrap();
        c.write_all(&frame(messages::EXECUTE, |w| {
            w.cstr(portal).u32(0);
        }))
        .unwrap();
    }
    c.write_all(&frame(messages::SYNC, |_| {})).unwrap();

    run_connection(channel(server), session(true), &fallible_callback).unwrap();

    let out = client.take_written();
    assert!(out.iter().any(|&b| b == messages::DATA_ROW), "the first Execute's row should still be flushed");
    assert!(out.iter().any(|&b| b == messages::ERROR_RESPONSE));
    assert_eq!(out.iter().filter(|&&b| b == messages::READY_FOR_QUERY).count(), 2);
}

#[test]
fn unknown_message_type_is_reported_and_connection_recovers() {
    let (client, server) = DuplexSocket::pair();
    let mut c = client.clone();
    c.write_all(&frame(b'~', |_| {})).unwrap();

    run_connection(channel(server), session(false), &select_one_callback).unwrap();

    let out = client.take_written();
    assert_eq!(out[0], messages::READY_FOR_QUERY);
    assert!(out.iter().any(|&b| b == messages::ERROR_RESPONSE));
}
