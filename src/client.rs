// TCP reactor server framework.
//
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddrV4, TcpStream};
use std::time::Duration;

use crate::addr::Address;
use crate::MAX_BUFFER_SIZE;

/// Synchronous reference client for the server's wire contract: requests go
/// out as raw bytes, replies come back as a 4-byte native-endian length
/// header followed by exactly that many payload bytes.
///
/// Intended for tests and simple tooling; a blocking [`TcpStream`]
/// underneath, no pooling, no concurrency.
pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub fn connect(addr: Address) -> io::Result<Client> {
        let stream = TcpStream::connect(SocketAddrV4::from(addr))?;
        stream.set_nodelay(true)?;
        Ok(Client { stream })
    }

    /// Bounds every blocking receive; `None` blocks forever.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    /// Sends `data` verbatim — the server reads raw bytes on ingress.
    pub fn send_raw(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data)
    }

    /// Reads one framed reply: length header, then payload. Replies larger
    /// than [`MAX_BUFFER_SIZE`] are rejected as corrupt framing.
    pub fn recv_reply(&mut self) -> io::Result<Vec<u8>> {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header)?;
        let len = u32::from_ne_bytes(header) as usize;
        if len > MAX_BUFFER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("reply length {len} exceeds maximum {MAX_BUFFER_SIZE}"),
            ));
        }
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Raw receive, for observing server-initiated closes (`Ok(0)`).
    pub fn recv_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    /// Half-closes the write side so the server observes EOF.
    pub fn shutdown_write(&self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Write)
    }
}
