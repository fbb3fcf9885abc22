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

//! Platform-portable readiness multiplexer.
//!
//! [`Poller`] pairs a kernel backend (epoll on Linux, kqueue elsewhere) with
//! a locked `{fd → Channel}` map holding the strong channel references. The
//! kernel event payload is never trusted as a pointer: after a wait returns,
//! every ready descriptor is looked up in the map under the same lock that
//! guards registration, and only that lookup produces the reference used for
//! dispatch. A descriptor whose channel raced with removal is silently
//! dropped from the batch.

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(not(target_os = "linux"))]
mod kqueue;

#[cfg(target_os = "linux")]
use epoll::EpollBackend as Backend;
#[cfg(not(target_os = "linux"))]
use kqueue::KqueueBackend as Backend;

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use crate::channel::Channel;

/// Portable interest / readiness mask.
///
/// `READ` interest always implies `PEER_CLOSED`, so an orderly remote
/// shutdown is reported even when no payload bytes precede it. On kqueue
/// backends `READ` and `WRITE` become distinct filters and `EDGE_TRIGGERED`
/// maps to `EV_CLEAR`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct Events(u32);

impl Events {
    pub const NONE: Events = Events(0);
    /// Data available for reading.
    pub const READ: Events = Events(0b000_0001);
    /// Ready for write operations.
    pub const WRITE: Events = Events(0b000_0010);
    /// Edge-triggered notification; every readiness must be drained to
    /// `EAGAIN` or the event never re-fires.
    pub const EDGE_TRIGGERED: Events = Events(0b000_0100);
    /// Peer closed its end of the connection.
    pub const PEER_CLOSED: Events = Events(0b000_1000);
    /// Hangup on the descriptor.
    pub const HANG_UP: Events = Events(0b001_0000);
    /// Error condition.
    pub const ERROR: Events = Events(0b010_0000);
    /// Priority (out-of-band) data.
    pub const PRIORITY: Events = Events(0b100_0000);

    pub fn is_empty(self) -> bool { self.0 == 0 }

    /// `true` iff every bit of `other` is set in `self`.
    pub fn contains(self, other: Events) -> bool { self.0 & other.0 == other.0 }

    /// `true` iff any bit of `other` is set in `self`.
    pub fn intersects(self, other: Events) -> bool { self.0 & other.0 != 0 }

    pub(crate) fn bits(self) -> u32 { self.0 }

    pub(crate) fn from_bits(bits: u32) -> Events { Events(bits) }
}

impl BitOr for Events {
    type Output = Events;

    fn bitor(self, rhs: Events) -> Events { Events(self.0 | rhs.0) }
}

impl BitOrAssign for Events {
    fn bitor_assign(&mut self, rhs: Events) { self.0 |= rhs.0 }
}

impl BitAnd for Events {
    type Output = Events;

    fn bitand(self, rhs: Events) -> Events { Events(self.0 & rhs.0) }
}

impl Display for Events {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names = [
            (Events::READ, "read"),
            (Events::WRITE, "write"),
            (Events::EDGE_TRIGGERED, "edge"),
            (Events::PEER_CLOSED, "peer-closed"),
            (Events::HANG_UP, "hang-up"),
            (Events::ERROR, "error"),
            (Events::PRIORITY, "priority"),
        ];
        let mut first = true;
        for (bit, name) in names {
            if self.contains(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result { Display::fmt(self, f) }
}

/// Readiness multiplexer owning the strong `{fd → Channel}` map.
///
/// All three operations are called only from the owning dispatcher thread;
/// the internal lock exists because `update`/`remove` may also run inline
/// from other threads before the loop has started, and because the map is
/// the line of defense against dispatching into a just-dropped channel.
pub struct Poller {
    backend: Backend,
    channels: Mutex<HashMap<RawFd, Arc<Channel>>>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        Ok(Poller {
            backend: Backend::new()?,
            channels: Mutex::new(empty!()),
        })
    }

    /// Registers or re-registers `channel` with its current interest mask.
    ///
    /// Succeeds silently on a closed channel or an invalid descriptor.
    /// `EBADF`, `ENOENT` and `EEXIST` are races with a concurrent close and
    /// are swallowed; any other backend failure is returned and is fatal for
    /// the current loop iteration only.
    pub(crate) fn update(&self, channel: &Arc<Channel>) -> io::Result<()> {
        if channel.is_closed() {
            return Ok(());
        }
        let fd = channel.fd();
        if fd < 0 {
            return Ok(());
        }
        let interest = channel.interest();
        let fresh = !channel.is_registered();
        let res = if fresh {
            self.backend.add(fd, interest)
        } else {
            self.backend.modify(fd, interest)
        };
        match res {
            Ok(()) => {
                if fresh {
                    channel.set_registered(true);
                    self.channels
                        .lock()
                        .expect("poller map lock poisoned")
                        .insert(fd, channel.clone());
                }
                Ok(())
            }
            Err(err) if is_registration_race(&err) => {
                log::trace!(target: "poller", "Swallowing {err} while updating fd {fd}");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Deregisters `fd` and drops the strong channel reference.
    ///
    /// Must run before the descriptor is closed, otherwise a kernel fd reuse
    /// would deliver the next events to the wrong channel.
    pub(crate) fn remove(&self, fd: RawFd) {
        if let Err(err) = self.backend.delete(fd) {
            match err.raw_os_error() {
                Some(libc::EBADF) | Some(libc::ENOENT) => {
                    log::trace!(target: "poller", "Swallowing {err} while removing fd {fd}")
                }
                _ => log::warn!(target: "poller", "Failed to deregister fd {fd}: {err}"),
            }
        }
        self.channels
            .lock()
            .expect("poller map lock poisoned")
            .remove(&fd);
    }

    /// Blocks up to `timeout_ms` and returns the channels with readiness,
    /// their received masks already assigned. `EINTR` yields an empty batch.
    pub(crate) fn wait(&self, timeout_ms: i32) -> io::Result<Vec<Arc<Channel>>> {
        let raw = self.backend.wait(timeout_ms)?;
        if raw.is_empty() {
            return Ok(vec![]);
        }
        let map = self.channels.lock().expect("poller map lock poisoned");
        let mut ready = Vec::with_capacity(raw.len());
        for (fd, events) in raw {
            if let Some(channel) = map.get(&fd) {
                channel.set_received(events);
                ready.push(channel.clone());
            } else {
                log::trace!(target: "poller", "Dropping event {events} for vanished fd {fd}");
            }
        }
        Ok(ready)
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.channels.lock().expect("poller map lock poisoned").len()
    }
}

fn is_registration_race(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EBADF) | Some(libc::ENOENT) | Some(libc::EEXIST)
    )
}
