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

//! In-memory duplex socket standing in for a TCP connection in unit tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct DuplexSocket {
    inbox: Arc<Mutex<VecDeque<u8>>>,
    outbox: Arc<Mutex<VecDeque<u8>>>,
}

impl DuplexSocket {
    pub fn pair() -> (DuplexSocket, DuplexSocket) {
        let a = Arc::new(Mutex::new(VecDeque::new()));
        let b = Arc::new(Mutex::new(VecDeque::new()));
        (
            DuplexSocket {
                inbox: a.clone(),
                outbox: b.clone(),
            },
            DuplexSocket { inbox: b, outbox: a },
        )
    }

    /// Drains and returns everything the peer has written to this end.
    pub fn take_written(&self) -> Vec<u8> {
        self.inbox.lock().unwrap().drain(..).collect()
    }
}

impl Read for DuplexSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = self.inbox.lock().unwrap();
        if guard.is_empty() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no more data queued"));
        }
        let n = buf.len().min(guard.len());
        for slot in buf.iter_mut().take(n) {
            *slot = guard.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for DuplexSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outbox.lock().unwrap().extend(buf.iter().copied());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
