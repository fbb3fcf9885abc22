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

use std::mem;

/// Append-only byte buffer with prefix erase, used as both the input and the
/// output side of a connection.
///
/// [`Buffer::append_framed`] prepends the 4-byte native-endian length header
/// which forms the reply framing contract of the server:
///
/// ```
/// use netreactor::Buffer;
///
/// let mut buf = Buffer::default();
/// buf.append_framed(b"hello");
/// assert_eq!(&buf.data()[..4], &5u32.to_ne_bytes());
/// assert_eq!(&buf.data()[4..], b"hello");
/// ```
#[derive(Default, Debug)]
pub struct Buffer {
    buf: Vec<u8>,
}

impl Buffer {
    pub fn new() -> Self { Buffer { buf: vec![] } }

    pub fn append(&mut self, data: &[u8]) { self.buf.extend_from_slice(data); }

    /// Appends `data` preceded by its length as a 4-byte native-endian
    /// header. Payloads longer than `u32::MAX` are truncated in the header;
    /// the framework never produces them.
    pub fn append_framed(&mut self, data: &[u8]) {
        let len = data.len() as u32;
        self.buf.extend_from_slice(&len.to_ne_bytes());
        self.buf.extend_from_slice(data);
    }

    /// Drops the first `n` bytes (saturating at the buffer length).
    pub fn erase_prefix(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.drain(..n);
    }

    pub fn clear(&mut self) { self.buf.clear(); }

    /// Removes and returns the whole contents, leaving the buffer empty.
    pub fn take_all(&mut self) -> Vec<u8> { mem::take(&mut self.buf) }

    pub fn size(&self) -> usize { self.buf.len() }

    pub fn is_empty(&self) -> bool { self.buf.is_empty() }

    pub fn data(&self) -> &[u8] { &self.buf }
}
