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

//! Length-prefixed message framing: reading typed/untyped messages off a
//! stream and assembling typed messages for the wire.

use byteorder::{ByteOrder, NetworkEndian};
use std::io::{self, Read, Write};

use crate::error::WireError;

/// Default ceiling on a single message payload (excluding the 4 length bytes).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Reads typed and untyped frames off a byte stream, and decodes fixed-width
/// and variable-width fields out of a payload buffer.
pub struct Reader<R> {
    inner: R,
    max_message_size: usize,
}

impl<R: Read> Reader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_max_message_size(inner: R, max_message_size: usize) -> Self {
        Self { inner, max_message_size }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Unwraps the reader, handing the underlying transport back to the
    /// caller (used once the handshake/auth phase is done reading through a
    /// temporary `Reader` and the command loop wants to build its own).
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Reads a single type byte followed by an untyped message.
    pub fn read_typed_msg(&mut self) -> io::Result<(u8, Vec<u8>)> {
        let mut tag = [0u8; 1];
        self.inner.read_exact(&mut tag)?;
        let payload = self.read_untyped_msg()?;
        Ok((tag[0], payload))
    }

    /// Reads the 4-byte length (inclusive of itself) and the payload that follows.
    /// On oversize messages the remainder is drained from the stream so the
    /// connection can recover; the caller is expected to emit an ErrorResponse.
    pub fn read_untyped_msg(&mut self) -> io::Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        self.inner.read_exact(&mut len_buf)?;
        let declared = NetworkEndian::read_i32(&len_buf);
        if declared < 4 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                WireError::protocol_violation(format!("invalid message length {}", declared)),
            ));
        }
        let size = (declared - 4) as usize;
        if size > self.max_message_size {
            self.drain(size)?;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                WireError::message_size_exceeded(self.max_message_size, size),
            ));
        }
        let mut payload = vec![0u8; size];
        self.inner.read_exact(&mut payload)?;
        Ok(payload)
    }

    fn drain(&mut self, mut remaining: usize) -> io::Result<()> {
        let mut chunk = vec![0u8; self.max_message_size.min(65536)];
        while remaining > 0 {
            let n = remaining.min(chunk.len());
            self.inner.read_exact(&mut chunk[..n])?;
            remaining -= n;
        }
        Ok(())
    }
}

/// Cursor over an already-read payload buffer, decoding protocol fields.
pub struct Payload<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Payload<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn get_u8(&mut self) -> io::Result<u8> {
        if self.remaining() < 1 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, WireError::insufficient_data(1)));
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn get_u16(&mut self) -> io::Result<u16> {
        if self.remaining() < 2 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, WireError::insufficient_data(2)));
        }
        let v = NetworkEndian::read_u16(&self.buf[self.pos..]);
        self.pos += 2;
        Ok(v)
    }

    pub fn get_i32(&mut self) -> io::Result<i32> {
        if self.remaining() < 4 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, WireError::insufficient_data(4)));
        }
        let v = NetworkEndian::read_i32(&self.buf[self.pos..]);
        self.pos += 4;
        Ok(v)
    }

    pub fn get_u32(&mut self) -> io::Result<u32> {
        if self.remaining() < 4 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, WireError::insufficient_data(4)));
        }
        let v = NetworkEndian::read_u32(&self.buf[self.pos..]);
        self.pos += 4;
        Ok(v)
    }

    /// Reads a NUL-terminated UTF-8 string, copying it out of the buffer.
    pub fn get_str(&mut self) -> io::Result<String> {
        let start = self.pos;
        let rel = self.buf[start..]
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, WireError::missing_nul_terminator()))?;
        let s = String::from_utf8_lossy(&self.buf[start..start + rel]).into_owned();
        self.pos = start + rel + 1;
        Ok(s)
    }

    /// Reads `len` bytes, or `None` when `len == -1` (the protocol's NULL marker).
    pub fn get_bytes(&mut self, len: i32) -> io::Result<Option<Vec<u8>>> {
        if len < 0 {
            return Ok(None);
        }
        let len = len as usize;
        if self.remaining() < len {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, WireError::insufficient_data(len)));
        }
        let out = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(Some(out))
    }

    pub fn rest(&self) -> &[u8] {
        &self.buf[self.pos..]
    }
}

/// Assembles a single typed message, back-patching its length prefix on `end`.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
    len_pos: usize,
    error: Option<WireError>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, tag: u8) -> &mut Self {
        self.buf.clear();
        self.error = None;
        self.buf.push(tag);
        self.len_pos = self.buf.len();
        self.buf.extend_from_slice(&[0u8; 4]);
        self
    }

    pub fn byte(&mut self, b: u8) -> &mut Self {
        self.buf.push(b);
        self
    }

    pub fn i16(&mut self, v: i16) -> &mut Self {
        let mut tmp = [0u8; 2];
        NetworkEndian::write_i16(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        let mut tmp = [0u8; 2];
        NetworkEndian::write_u16(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
        self
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        let mut tmp = [0u8; 4];
        NetworkEndian::write_i32(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        let mut tmp = [0u8; 4];
        NetworkEndian::write_u32(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
        self
    }

    pub fn bytes(&mut self, b: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(b);
        self
    }

    /// Writes `bytes.len()` as an `i32` length prefix followed by the bytes,
    /// or `-1` and nothing else when `bytes` is `None` (SQL NULL).
    pub fn sized_bytes(&mut self, bytes: Option<&[u8]>) -> &mut Self {
        match bytes {
            Some(b) => {
                self.i32(b.len() as i32);
                self.bytes(b);
            }
            None => {
                self.i32(-1);
            }
        }
        self
    }

    pub fn cstr(&mut self, s: &str) -> &mut Self {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        self
    }

    pub fn set_error(&mut self, err: WireError) -> &mut Self {
        self.error = Some(err);
        self
    }

    /// Back-patches the length, flushes to `out`, and resets internal state.
    pub fn end<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        let err = self.error.take();
        let len = (self.buf.len() - self.len_pos) as i32;
        NetworkEndian::write_i32(&mut self.buf[self.len_pos..self.len_pos + 4], len);
        let result = out.write_all(&self.buf);
        self.buf.clear();
        if let Some(err) = err {
            return Err(io::Error::new(io::ErrorKind::Other, err));
        }
        result
    }

    /// Returns the assembled bytes without flushing (used by `QueuedDataWriter`
    /// and by tests asserting exact wire bytes).
    pub fn finish(&mut self) -> Vec<u8> {
        let len = (self.buf.len() - self.len_pos) as i32;
        NetworkEndian::write_i32(&mut self.buf[self.len_pos..self.len_pos + 4], len);
        std::mem::take(&mut self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trips_typed_message() {
        let mut w = Writer::new();
        w.start(b'Q').cstr("select 1;");
        let bytes = w.finish();

        let mut r = Reader::new(Cursor::new(bytes));
        let (tag, payload) = r.read_typed_msg().unwrap();
        assert_eq!(tag, b'Q');
        let mut p = Payload::new(&payload);
        assert_eq!(p.get_str().unwrap(), "select 1;");
    }

    #[test]
    fn oversize_message_is_drained_and_reported() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[b'Q']);
        let mut len_buf = [0u8; 4];
        NetworkEndian::write_i32(&mut len_buf, 4 + 10);
        bytes.extend_from_slice(&len_buf);
        bytes.extend_from_slice(&[0u8; 10]);
        bytes.extend_from_slice(b"Q");
        let mut len_buf2 = [0u8; 4];
        NetworkEndian::write_i32(&mut len_buf2, 4 + 1);
        bytes.extend_from_slice(&len_buf2);
        bytes.push(b'0');

        let mut r = Reader::with_max_message_size(Cursor::new(bytes), 4);
        let err = r.read_typed_msg().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let (tag, payload) = r.read_typed_msg().unwrap();
        assert_eq!(tag, b'Q');
        assert_eq!(payload, vec![b'0']);
    }

    #[test]
    fn null_value_decodes_as_none() {
        let mut p = Payload::new(&[]);
        assert!(p.get_bytes(-1).unwrap().is_none());
    }
}
