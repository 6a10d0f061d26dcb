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

//! End-to-end test driving a real `postgres` client against a loopback
//! listener, exercising the whole handshake -> auth -> simple query path.

use std::sync::atomic::Ordering;
use std::time::Duration;

use postgres::{Client, NoTls, SimpleQueryMessage};
use wire_protocol::cache::Statement;
use wire_protocol::column::{Column, Columns};
use wire_protocol::error::WireError;
use wire_protocol::server::{Server, ServerOptions};
use wire_protocol::types::{Value, INT4};

fn parse_select_1(_state: &wire_protocol::session::SessionState, query: &str) -> Result<Vec<Statement>, WireError> {
    if query.trim() != "SELECT 1" {
        return Err(WireError::syntax(format!("unsupported query: {}", query)));
    }
    let handler = std::sync::Arc::new(|writer: &mut dyn wire_protocol::engine::DataWriter, _: &[wire_protocol::types::Parameter]| {
        writer.row(vec![Value::Int32(1)])?;
        writer.complete("SELECT 1")
    });
    Ok(vec![Statement::new(handler, vec![], Columns::new(vec![Column::new("?column?", INT4, 4)]))])
}

#[test]
fn non_secure_simple_query_round_trip() {
    let server = Server::bind("127.0.0.1:0", ServerOptions::default()).unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle();

    let handle = std::thread::spawn(move || server.serve(parse_select_1));

    let mut client = Client::connect(&format!("host=127.0.0.1 port={} user=wire_protocol", addr.port()), NoTls).unwrap();

    let messages = client.simple_query("SELECT 1").unwrap();
    let mut saw_row = false;
    for message in messages {
        if let SimpleQueryMessage::Row(row) = message {
            assert_eq!(row.get(0), Some("1"));
            saw_row = true;
        }
    }
    assert!(saw_row, "expected a single row back from SELECT 1");

    client.close().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    shutdown.store(true, Ordering::SeqCst);
    handle.join().unwrap().unwrap();
}
