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

//! Per-connection session state: caches, parameter maps, and the pipelining
//! configuration carried from `ServerOptions` into a single connection's
//! lifetime.

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use crate::cache::{InMemoryPortalCache, InMemoryStatementCache, PortalCache, StatementCache};
use crate::engine::ResponseQueue;
use crate::types::TypeMap;

/// Configuration and parameter state shared by one connection's session.
/// Immutable after the handshake completes.
pub struct SessionState {
    pub type_map: Arc<dyn TypeMap>,
    pub client_params: HashMap<String, String>,
    pub server_params: HashMap<String, String>,
    pub remote_addr: Option<SocketAddr>,
    /// Promotes `timestamp`/`timestamptz` result columns to Binary when the
    /// client left the result-format array empty. Off by default; set from
    /// `ServerOptions::with_promote_binary_datetime_on_empty_format`.
    pub promote_binary_datetime_on_empty_format: bool,
    attributes: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
}

impl SessionState {
    pub fn new(type_map: Arc<dyn TypeMap>, client_params: HashMap<String, String>, server_params: HashMap<String, String>, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            type_map,
            client_params,
            server_params,
            remote_addr,
            promote_binary_datetime_on_empty_format: false,
            attributes: Mutex::new(HashMap::new()),
        }
    }

    /// Builder-style setter used by the server's session construction; kept
    /// separate from `new` so existing call sites (and tests) are unaffected.
    pub fn with_promote_binary_datetime_on_empty_format(mut self, promote: bool) -> Self {
        self.promote_binary_datetime_on_empty_format = promote;
        self
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Any + Send + Sync) {
        self.attributes.lock().expect("to acquire lock").insert(key.into(), Box::new(value));
    }

    pub fn attribute<T: Clone + 'static>(&self, key: &str) -> Option<T> {
        self.attributes
            .lock()
            .expect("to acquire lock")
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }
}

/// Per-connection session: caches are fresh for every new connection (no
/// cross-session sharing), matching the teacher's one-supervisor-per-connection
/// posture.
pub struct Session {
    pub state: Arc<SessionState>,
    pub statements: Arc<dyn StatementCache>,
    pub portals: Arc<dyn PortalCache>,
    pub pipelining: bool,
    pub queue: ResponseQueue,
    pub cancel: Arc<AtomicBool>,
}

impl Session {
    pub fn new(state: Arc<SessionState>, pipelining: bool) -> Self {
        let queue = ResponseQueue::new(state.promote_binary_datetime_on_empty_format);
        Self {
            state,
            statements: Arc::new(InMemoryStatementCache::default()),
            portals: Arc::new(InMemoryPortalCache::default()),
            pipelining,
            queue,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_caches(state: Arc<SessionState>, pipelining: bool, statements: Arc<dyn StatementCache>, portals: Arc<dyn PortalCache>) -> Self {
        let queue = ResponseQueue::new(state.promote_binary_datetime_on_empty_format);
        Self {
            state,
            statements,
            portals,
            pipelining,
            queue,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}
