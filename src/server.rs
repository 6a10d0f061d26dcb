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

//! The accept loop and per-connection lifecycle: binds a listener, upgrades
//! each accepted socket through the handshake and authentication, exchanges
//! server parameters, then hands the connection to the command loop.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use native_tls::{Identity, TlsAcceptor, TlsStream};

use crate::auth::AuthStrategy;
use crate::cache::{InMemoryPortalCache, InMemoryStatementCache, PortalCache, StatementCache};
use crate::connection::{perform_handshake, Channel, HandshakeOutcome, Plain, Secure};
use crate::engine::{self, ParseCallback};
use crate::error::{write_error_response, WireError, WireResult};
use crate::frame::{Reader, Writer};
use crate::messages;
use crate::session::{Session, SessionState};
use crate::types::{BuiltinTypeMap, TypeMap};

/// Allocates `(process id, secret key)` pairs for BackendKeyData and answers
/// whether a `(pid, key)` pair presented in a CancelRequest is still live.
/// Mirrors the teacher's `ConnSupervisor` id-allocation idiom, adapted to
/// also carry the per-connection cancellation flag CancelRequest needs to set.
#[derive(Default)]
pub struct CancelRegistry {
    next_id: AtomicI32,
    live: Mutex<HashMap<i32, (i32, Arc<AtomicBool>)>>,
}

impl CancelRegistry {
    /// Allocates a `(process_id, secret_key)` pair via `generator` if one is
    /// supplied (`ServerOptions::backend_key_generator`), else via the
    /// built-in incrementing counter plus `rand::random`.
    fn register(&self, cancel_flag: Arc<AtomicBool>, generator: Option<&Arc<dyn Fn() -> (i32, i32) + Send + Sync>>) -> (i32, i32) {
        let (process_id, secret_key) = match generator {
            Some(generate) => generate(),
            None => (self.next_id.fetch_add(1, Ordering::SeqCst) + 1, rand::random::<i32>().abs()),
        };
        self.live.lock().expect("to acquire lock").insert(process_id, (secret_key, cancel_flag));
        (process_id, secret_key)
    }

    fn unregister(&self, process_id: i32) {
        self.live.lock().expect("to acquire lock").remove(&process_id);
    }

    /// The default cancel-request handler: sets the flag registered for
    /// `(process_id, secret_key)`, if one is still live.
    pub fn cancel(&self, process_id: i32, secret_key: i32) {
        if let Some((expected_key, flag)) = self.live.lock().expect("to acquire lock").get(&process_id) {
            if *expected_key == secret_key {
                flag.store(true, Ordering::SeqCst);
            }
        }
    }
}

/// Configuration shared read-only by every session, built once per [`Server`].
pub struct ServerOptions {
    pub tls_identity: Option<Identity>,
    pub max_message_size: usize,
    pub server_params: HashMap<String, String>,
    pub server_version: Option<String>,
    pub auth_strategy: AuthStrategy,
    pub type_map: Arc<dyn TypeMap>,
    pub pipelining: bool,
    pub emit_backend_key_data: bool,
    /// Promotes `timestamp`/`timestamptz` result columns to Binary when the
    /// client leaves the result-format array empty. Off by default.
    pub promote_binary_datetime_on_empty_format: bool,
    pub statement_cache_factory: Arc<dyn Fn() -> Arc<dyn StatementCache> + Send + Sync>,
    pub portal_cache_factory: Arc<dyn Fn() -> Arc<dyn PortalCache> + Send + Sync>,
    pub session_hook: Option<Arc<dyn Fn(&SessionState) + Send + Sync>>,
    pub terminate_hook: Option<Arc<dyn Fn(&SessionState) + Send + Sync>>,
    /// Overrides the default in-process `CancelRegistry` routing: given the
    /// `(process_id, secret_key)` pair carried by a CancelRequest, forwards it
    /// to an application-supplied cancel callback instead. When unset, the
    /// built-in registry handles cancellation entirely on its own.
    pub cancel_handler: Option<Arc<dyn Fn(i32, i32) + Send + Sync>>,
    /// Overrides how `(process_id, secret_key)` pairs are generated for
    /// BackendKeyData. When unset, the built-in registry generates both via
    /// an incrementing counter and `rand::random`.
    pub backend_key_generator: Option<Arc<dyn Fn() -> (i32, i32) + Send + Sync>>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            tls_identity: None,
            max_message_size: crate::frame::DEFAULT_MAX_MESSAGE_SIZE,
            server_params: HashMap::new(),
            server_version: None,
            auth_strategy: AuthStrategy::default(),
            type_map: Arc::new(BuiltinTypeMap::default()),
            pipelining: false,
            emit_backend_key_data: true,
            promote_binary_datetime_on_empty_format: false,
            statement_cache_factory: Arc::new(|| Arc::new(InMemoryStatementCache::default()) as Arc<dyn StatementCache>),
            portal_cache_factory: Arc::new(|| Arc::new(InMemoryPortalCache::default()) as Arc<dyn PortalCache>),
            session_hook: None,
            terminate_hook: None,
            cancel_handler: None,
            backend_key_generator: None,
        }
    }
}

impl ServerOptions {
    pub fn with_tls_identity(mut self, identity: Identity) -> Self {
        self.tls_identity = Some(identity);
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_server_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.server_params.insert(key.into(), value.into());
        self
    }

    pub fn with_server_version(mut self, version: impl Into<String>) -> Self {
        self.server_version = Some(version.into());
        self
    }

    pub fn with_auth_strategy(mut self, strategy: AuthStrategy) -> Self {
        self.auth_strategy = strategy;
        self
    }

    pub fn with_type_map(mut self, type_map: Arc<dyn TypeMap>) -> Self {
        self.type_map = type_map;
        self
    }

    pub fn with_pipelining(mut self, enabled: bool) -> Self {
        self.pipelining = enabled;
        self
    }

    pub fn with_promote_binary_datetime_on_empty_format(mut self, enabled: bool) -> Self {
        self.promote_binary_datetime_on_empty_format = enabled;
        self
    }

    /// Routes CancelRequest's `(process_id, secret_key)` to an
    /// application-supplied callback instead of the built-in registry.
    pub fn with_cancel_handler(mut self, handler: impl Fn(i32, i32) + Send + Sync + 'static) -> Self {
        self.cancel_handler = Some(Arc::new(handler));
        self
    }

    /// Overrides how `(process_id, secret_key)` pairs are generated for
    /// BackendKeyData and later CancelRequest matching.
    pub fn with_backend_key_generator(mut self, generator: impl Fn() -> (i32, i32) + Send + Sync + 'static) -> Self {
        self.backend_key_generator = Some(Arc::new(generator));
        self
    }
}

/// Accepts connections on a bound listener and drives each through the
/// handshake, authentication, and command loop on its own OS thread.
pub struct Server {
    listener: TcpListener,
    options: Arc<ServerOptions>,
    closing: Arc<AtomicBool>,
    cancel_registry: Arc<CancelRegistry>,
}

impl Server {
    pub fn bind(address: impl ToSocketAddrs, options: ServerOptions) -> io::Result<Self> {
        let listener = TcpListener::bind(address)?;
        Ok(Self {
            listener,
            options: Arc::new(options),
            closing: Arc::new(AtomicBool::new(false)),
            cancel_registry: Arc::new(CancelRegistry::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Signals the accept loop to stop taking new connections. Already
    /// established sessions finish their current message before `serve`
    /// returns.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closing)
    }

    /// Runs the accept loop until [`shutdown_handle`] is flipped. `Arc`s the
    /// parse callback so every spawned session thread can share it.
    pub fn serve<F>(&self, parse_callback: F) -> io::Result<()>
    where
        F: Fn(&SessionState, &str) -> WireResult<Vec<crate::engine::PreparedStatement>> + Send + Sync + 'static,
    {
        let parse_callback: Arc<ParseCallback> = Arc::new(parse_callback);
        let tls_acceptor = match &self.options.tls_identity {
            Some(identity) => Some(TlsAcceptor::new(identity.clone()).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?),
            None => None,
        };
        self.listener.set_nonblocking(true)?;
        let mut handles = Vec::new();

        while !self.closing.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    stream.set_nonblocking(false)?;
                    let options = Arc::clone(&self.options);
                    let parse_callback = Arc::clone(&parse_callback);
                    let registry = Arc::clone(&self.cancel_registry);
                    let tls_acceptor = tls_acceptor.clone();
                    handles.retain(|h: &thread::JoinHandle<()>| !h.is_finished());
                    handles.push(thread::spawn(move || {
                        if let Err(e) = serve_connection(stream, addr, options, parse_callback, registry, tls_acceptor.as_ref()) {
                            log::error!("connection from {} ended with an error: {}", addr, e);
                        }
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(20));
                }
                Err(e) => return Err(e),
            }
        }

        for handle in handles {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn serve_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    options: Arc<ServerOptions>,
    parse_callback: Arc<ParseCallback>,
    registry: Arc<CancelRegistry>,
    tls_acceptor: Option<&TlsAcceptor>,
) -> io::Result<()> {
    log::debug!("accepted connection from {}", remote_addr);
    match perform_handshake(stream, tls_acceptor)? {
        HandshakeOutcome::CancelRequest { process_id, secret_key } => {
            log::debug!("cancel request for pid {}", process_id);
            match &options.cancel_handler {
                Some(handler) => handler(process_id, secret_key),
                None => registry.cancel(process_id, secret_key),
            }
            Ok(())
        }
        HandshakeOutcome::Startup { channel, client_params } => {
            let cancel_flag = Arc::new(AtomicBool::new(false));
            let (process_id, secret_key) = registry.register(Arc::clone(&cancel_flag), options.backend_key_generator.as_ref());
            let result = run_authenticated_session(channel, Some(remote_addr), client_params, &options, &parse_callback, cancel_flag, process_id, secret_key);
            registry.unregister(process_id);
            result
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_authenticated_session<P: Plain>(
    channel: Channel<P, TlsStream<P>>,
    remote_addr: Option<SocketAddr>,
    client_params: HashMap<String, String>,
    options: &ServerOptions,
    parse_callback: &ParseCallback,
    cancel_flag: Arc<AtomicBool>,
    process_id: i32,
    secret_key: i32,
) -> io::Result<()> {
    let mut reader = Reader::with_max_message_size(channel, options.max_message_size);
    let mut writer = Writer::new();

    if let Err(err) = authenticate(&mut reader, &mut writer, &options.auth_strategy, &client_params) {
        log::warn!("authentication failed for {:?}: {}", remote_addr, err);
        write_error_response(reader.get_mut(), &mut writer, messages::ERROR_RESPONSE, &err)?;
        return Ok(());
    }

    for (key, value) in server_parameters(options, &client_params) {
        writer.start(messages::PARAMETER_STATUS).cstr(&key).cstr(&value);
        writer.end(reader.get_mut())?;
    }

    if options.emit_backend_key_data {
        writer.start(messages::BACKEND_KEY_DATA).i32(process_id).i32(secret_key);
        writer.end(reader.get_mut())?;
    }

    let state = Arc::new(
        SessionState::new(Arc::clone(&options.type_map), client_params, options.server_params.clone(), remote_addr)
            .with_promote_binary_datetime_on_empty_format(options.promote_binary_datetime_on_empty_format),
    );
    if let Some(hook) = &options.session_hook {
        hook(&state);
    }

    let statements = (options.statement_cache_factory)();
    let portals = (options.portal_cache_factory)();
    let mut session = Session::with_caches(Arc::clone(&state), options.pipelining, statements, portals);
    session.cancel = cancel_flag;

    let channel = reader.into_inner();
    let result = catch_unwind(AssertUnwindSafe(|| engine::run_connection(channel, session, parse_callback)));

    if let Some(hook) = &options.terminate_hook {
        hook(&state);
    }

    match result {
        Ok(r) => r,
        Err(_) => Err(io::Error::new(io::ErrorKind::Other, WireError::handler_panicked())),
    }
}

fn authenticate<RW: Read + Write>(reader: &mut Reader<RW>, writer: &mut Writer, strategy: &AuthStrategy, client_params: &HashMap<String, String>) -> WireResult<()> {
    match strategy {
        AuthStrategy::Ok => {
            writer.start(messages::AUTHENTICATION).i32(0);
            writer.end(reader.get_mut())?;
            Ok(())
        }
        AuthStrategy::CleartextPassword(validator) => {
            writer.start(messages::AUTHENTICATION).i32(3);
            writer.end(reader.get_mut())?;

            let (tag, payload) = reader.read_typed_msg()?;
            if tag != messages::PASSWORD {
                return Err(WireError::protocol_violation("expected a Password message"));
            }
            let mut p = crate::frame::Payload::new(&payload);
            let password = p.get_str()?;

            let database = client_params.get("database").map(String::as_str).unwrap_or("");
            let user = client_params.get("user").map(String::as_str).unwrap_or("");
            if validator.validate(database, user, &password) {
                writer.start(messages::AUTHENTICATION).i32(0);
                writer.end(reader.get_mut())?;
                Ok(())
            } else {
                Err(WireError::invalid_password())
            }
        }
    }
}

fn server_parameters(options: &ServerOptions, client_params: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut params = vec![
        ("server_encoding".to_string(), "UTF8".to_string()),
        ("client_encoding".to_string(), "UTF8".to_string()),
        ("is_superuser".to_string(), "off".to_string()),
    ];
    if let Some(user) = client_params.get("user") {
        params.push(("session_authorization".to_string(), user.clone()));
    }
    if let Some(version) = &options.server_version {
        params.push(("server_version".to_string(), version.clone()));
    }
    for (key, value) in &options.server_params {
        params.push((key.clone(), value.clone()));
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{Column, Columns, FormatCode};
    use crate::engine::DataWriter;
    use crate::test_support::DuplexSocket;
    use crate::types::Parameter;
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    #[test]
    fn ok_strategy_sends_authentication_ok_and_params() {
        let (client, server) = DuplexSocket::pair();
        let mut reader = Reader::new(server);
        let mut writer = Writer::new();
        authenticate(&mut reader, &mut writer, &AuthStrategy::Ok, &HashMap::new()).unwrap();
        let bytes = client.take_written();
        assert_eq!(bytes[0], messages::AUTHENTICATION);
    }

    #[test]
    fn cleartext_password_rejects_wrong_password() {
        let (client, server) = DuplexSocket::pair();
        let mut w = Writer::new();
        w.start(messages::PASSWORD).cstr("wrong");
        let mut client_for_write = client.clone();
        w.end(&mut client_for_write).unwrap();

        let mut reader = Reader::new(server);
        let mut writer = Writer::new();
        let validator: Arc<dyn crate::auth::PasswordValidator> = Arc::new(|_: &str, _: &str, password: &str| password == "secret");
        let err = authenticate(&mut reader, &mut writer, &AuthStrategy::CleartextPassword(validator), &HashMap::new()).unwrap_err();
        assert_eq!(err.code, "28P01");
    }

    fn handler() -> Arc<crate::engine::Handler> {
        Arc::new(|writer: &mut dyn DataWriter, _: &[Parameter]| {
            writer.row(vec![crate::types::Value::Int32(1)])?;
            writer.complete("SELECT 1")
        })
    }

    #[test]
    fn cancel_registry_sets_flag_on_matching_pair() {
        let registry = CancelRegistry::default();
        let flag = Arc::new(StdAtomicBool::new(false));
        let (pid, key) = registry.register(Arc::clone(&flag), None);
        registry.cancel(pid, key);
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_registry_ignores_wrong_secret() {
        let registry = CancelRegistry::default();
        let flag = Arc::new(StdAtomicBool::new(false));
        let (pid, _key) = registry.register(Arc::clone(&flag), None);
        registry.cancel(pid, 0);
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn register_uses_supplied_backend_key_generator() {
        let registry = CancelRegistry::default();
        let flag = Arc::new(StdAtomicBool::new(false));
        let generator: Arc<dyn Fn() -> (i32, i32) + Send + Sync> = Arc::new(|| (42, 99));
        let (pid, key) = registry.register(Arc::clone(&flag), Some(&generator));
        assert_eq!((pid, key), (42, 99));
        registry.cancel(42, 99);
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_handler_override_is_called_instead_of_the_registry() {
        let seen = Arc::new(Mutex::new(None));
        let seen_in_closure = Arc::clone(&seen);
        let options = ServerOptions::default().with_cancel_handler(move |pid, key| {
            *seen_in_closure.lock().expect("to acquire lock") = Some((pid, key));
        });
        (options.cancel_handler.as_ref().unwrap())(7, 11);
        assert_eq!(*seen.lock().expect("to acquire lock"), Some((7, 11)));
    }

    #[test]
    fn server_options_default_columns_smoke() {
        let _ = handler();
        let _ = Columns::new(vec![Column::new("n", crate::types::INT4, 4)]);
        let _ = FormatCode::Text;
    }
}
