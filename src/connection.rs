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

//! The handshake: startup packet parsing, optional TLS upgrade, and the
//! `Plain`/`Secure` channel abstraction the rest of the crate reads and
//! writes through without caring which one it got.

use byteorder::{ByteOrder, NetworkEndian};
use native_tls::{TlsAcceptor, TlsStream};
use std::collections::HashMap;
use std::io::{self, Read, Write};

use crate::error::WireError;
use crate::messages;

/// An unencrypted transport. Blanket-implemented for anything `Read + Write`
/// a listener could hand us, including the in-memory test duplex.
pub trait Plain: Read + Write + Send + 'static {}
impl<T: Read + Write + Send + 'static> Plain for T {}

/// A TLS-wrapped transport, distinguished from `Plain` only by which
/// [`Channel`] variant carries it.
pub trait Secure: Read + Write + Send + 'static {}
impl<T: Read + Write + Send + 'static> Secure for T {}

/// Either leg of a connection after the SSLRequest negotiation. The command
/// loop is generic over both and never needs to know which one it has.
pub enum Channel<P: Plain, S: Secure> {
    Plain(P),
    Secure(S),
}

impl<P: Plain, S: Secure> Read for Channel<P, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Channel::Plain(s) => s.read(buf),
            Channel::Secure(s) => s.read(buf),
        }
    }
}

impl<P: Plain, S: Secure> Write for Channel<P, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Channel::Plain(s) => s.write(buf),
            Channel::Secure(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Channel::Plain(s) => s.flush(),
            Channel::Secure(s) => s.flush(),
        }
    }
}

/// What the handshake produced once the startup packet carries protocol 3.0,
/// or the short-circuit for a CancelRequest pseudo-startup.
pub enum HandshakeOutcome<P: Plain, S: Secure> {
    CancelRequest { process_id: i32, secret_key: i32 },
    Startup {
        channel: Channel<P, S>,
        client_params: HashMap<String, String>,
    },
}

/// Drives the startup sequence (§4.2): reads the untyped startup packet,
/// handles SSLRequest/GSSENCRequest/CancelRequest, and upgrades to TLS when
/// the client asks and the server has a certificate configured.
pub fn perform_handshake<P: Plain>(stream: P, tls_acceptor: Option<&TlsAcceptor>) -> io::Result<HandshakeOutcome<P, TlsStream<P>>> {
    let mut channel: Channel<P, TlsStream<P>> = Channel::Plain(stream);
    let mut ssl_negotiated = false;

    loop {
        let (version, body) = read_startup_packet(&mut channel)?;
        match version {
            messages::VERSION_3 => {
                let client_params = parse_params(&body)?;
                return Ok(HandshakeOutcome::Startup { channel, client_params });
            }
            messages::VERSION_CANCEL => {
                if body.len() < 8 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        WireError::insufficient_data(8 - body.len()),
                    ));
                }
                let process_id = NetworkEndian::read_i32(&body[0..4]);
                let secret_key = NetworkEndian::read_i32(&body[4..8]);
                return Ok(HandshakeOutcome::CancelRequest { process_id, secret_key });
            }
            messages::VERSION_SSL => {
                if ssl_negotiated {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        WireError::protocol_violation("SSLRequest repeated after TLS was already negotiated"),
                    ));
                }
                channel = match (channel, tls_acceptor) {
                    (Channel::Plain(mut socket), Some(acceptor)) => {
                        socket.write_all(&[messages::ACCEPT_SSL])?;
                        socket.flush()?;
                        let secure = acceptor
                            .accept(socket)
                            .map_err(|e| io::Error::new(io::ErrorKind::Other, WireError::protocol_violation(format!("TLS handshake failed: {}", e))))?;
                        ssl_negotiated = true;
                        Channel::Secure(secure)
                    }
                    (mut channel, _) => {
                        channel.write_all(&[messages::REJECT_SSL])?;
                        channel.flush()?;
                        channel
                    }
                };
            }
            messages::VERSION_GSSENC => {
                channel.write_all(&[messages::REJECT_SSL])?;
                channel.flush()?;
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    WireError::protocol_violation(format!("unsupported startup code {}", other)),
                ))
            }
        }
    }
}

/// Reads the length-prefixed, untyped startup packet and splits it into the
/// 4-byte version/magic code and whatever follows.
fn read_startup_packet<R: Read>(channel: &mut R) -> io::Result<(i32, Vec<u8>)> {
    let mut len_buf = [0u8; 4];
    channel.read_exact(&mut len_buf)?;
    let declared = NetworkEndian::read_i32(&len_buf);
    if declared < 8 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            WireError::protocol_violation(format!("invalid startup message length {}", declared)),
        ));
    }
    let mut version_buf = [0u8; 4];
    channel.read_exact(&mut version_buf)?;
    let version = NetworkEndian::read_i32(&version_buf);
    let remaining = (declared - 8) as usize;
    let mut body = vec![0u8; remaining];
    channel.read_exact(&mut body)?;
    Ok((version, body))
}

/// Parses `key\0value\0...\0` pairs up to the terminating empty key.
fn parse_params(body: &[u8]) -> io::Result<HashMap<String, String>> {
    let mut params = HashMap::new();
    let mut rest = body;
    loop {
        let (key, after_key) = read_cstr(rest)?;
        if key.is_empty() {
            break;
        }
        let (value, after_value) = read_cstr(after_key)?;
        params.insert(key, value);
        rest = after_value;
    }
    Ok(params)
}

fn read_cstr(buf: &[u8]) -> io::Result<(String, &[u8])> {
    let pos = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, WireError::missing_nul_terminator()))?;
    let s = String::from_utf8_lossy(&buf[..pos]).into_owned();
    Ok((s, &buf[pos + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::DuplexSocket;

    fn startup_packet(version: i32, kv: &[(&str, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (k, v) in kv {
            body.extend_from_slice(k.as_bytes());
            body.push(0);
            body.extend_from_slice(v.as_bytes());
            body.push(0);
        }
        body.push(0);
        let mut out = Vec::new();
        let len = 8 + body.len() as i32;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&version.to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    fn write_raw(socket: &DuplexSocket, bytes: &[u8]) {
        let mut socket = socket.clone();
        socket.write_all(bytes).unwrap();
    }

    #[test]
    fn plain_startup_reads_client_params() {
        let (client, server) = DuplexSocket::pair();
        write_raw(&client, &startup_packet(messages::VERSION_3, &[("user", "alice"), ("database", "postgres")]));

        match perform_handshake(server, None).unwrap() {
            HandshakeOutcome::Startup { client_params, .. } => {
                assert_eq!(client_params.get("user"), Some(&"alice".to_string()));
                assert_eq!(client_params.get("database"), Some(&"postgres".to_string()));
            }
            HandshakeOutcome::CancelRequest { .. } => panic!("expected Startup"),
        }
    }

    #[test]
    fn cancel_request_short_circuits() {
        let (client, server) = DuplexSocket::pair();
        let mut body = Vec::new();
        body.extend_from_slice(&42i32.to_be_bytes());
        body.extend_from_slice(&99i32.to_be_bytes());
        let mut packet = Vec::new();
        packet.extend_from_slice(&(8 + body.len() as i32).to_be_bytes());
        packet.extend_from_slice(&messages::VERSION_CANCEL.to_be_bytes());
        packet.extend_from_slice(&body);
        write_raw(&client, &packet);

        match perform_handshake(server, None).unwrap() {
            HandshakeOutcome::CancelRequest { process_id, secret_key } => {
                assert_eq!(process_id, 42);
                assert_eq!(secret_key, 99);
            }
            HandshakeOutcome::Startup { .. } => panic!("expected CancelRequest"),
        }
    }

    #[test]
    fn ssl_request_without_cert_is_rejected_then_plaintext_continues() {
        let (client, server) = DuplexSocket::pair();
        write_raw(&client, &startup_packet(messages::VERSION_SSL, &[]));
        write_raw(&client, &startup_packet(messages::VERSION_3, &[("user", "bob")]));

        match perform_handshake(server, None).unwrap() {
            HandshakeOutcome::Startup { client_params, .. } => {
                assert_eq!(client_params.get("user"), Some(&"bob".to_string()));
            }
            HandshakeOutcome::CancelRequest { .. } => panic!("expected Startup"),
        }
        let reply = client.take_written();
        assert_eq!(reply, vec![messages::REJECT_SSL]);
    }

    #[test]
    fn gssenc_request_is_rejected_then_startup_continues() {
        let (client, server) = DuplexSocket::pair();
        write_raw(&client, &startup_packet(messages::VERSION_GSSENC, &[]));
        write_raw(&client, &startup_packet(messages::VERSION_3, &[]));

        match perform_handshake(server, None).unwrap() {
            HandshakeOutcome::Startup { client_params, .. } => assert!(client_params.is_empty()),
            HandshakeOutcome::CancelRequest { .. } => panic!("expected Startup"),
        }
        assert_eq!(client.take_written(), vec![messages::REJECT_SSL]);
    }
}
