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

//! Server side of the PostgreSQL frontend/backend wire protocol, version 3.0:
//! the connection state machine, the extended-query engine, wire framing, and
//! the SQLSTATE-carrying error type. SQL parsing, planning, and storage are
//! left to the embedding application through [`engine::ParseCallback`] and
//! [`types::TypeMap`].

#[macro_use]
extern crate log;

pub mod auth;
pub mod cache;
pub mod column;
pub mod connection;
pub mod copy;
pub mod engine;
pub mod error;
pub mod frame;
pub mod messages;
pub mod server;
pub mod session;
pub mod test_support;
pub mod types;

pub use error::{WireError, WireResult};
pub use server::{Server, ServerOptions};
