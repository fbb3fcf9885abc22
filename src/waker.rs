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

//! Cross-thread wake descriptor for dispatcher event loops: an `eventfd` on
//! Linux, a non-blocking socket pair elsewhere.
//!
//! The readable end is registered as a read-interest channel inside the
//! owning dispatcher's poller; that channel takes over closing the
//! descriptor, so the waker itself never closes the readable end.

use std::io;
use std::os::unix::io::RawFd;

#[cfg(not(target_os = "linux"))]
use std::io::Write;
#[cfg(not(target_os = "linux"))]
use std::os::unix::io::IntoRawFd;
#[cfg(not(target_os = "linux"))]
use std::os::unix::net::UnixStream;
#[cfg(not(target_os = "linux"))]
use std::sync::Mutex;

#[cfg(target_os = "linux")]
pub(crate) struct Waker {
    fd: RawFd,
}

#[cfg(target_os = "linux")]
impl Waker {
    pub fn new() -> io::Result<Waker> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Waker { fd })
    }

    /// Descriptor to register for read interest.
    pub fn fd(&self) -> RawFd { self.fd }

    /// Wakes the owning event loop. A saturated eventfd counter still wakes
    /// the reader, so `EAGAIN` counts as success.
    pub fn wake(&self) -> io::Result<()> {
        let one: u64 = 1;
        let n = unsafe { libc::write(self.fd, &one as *const u64 as *const libc::c_void, 8) };
        if n == 8 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => Ok(()),
            io::ErrorKind::Interrupted => self.wake(),
            _ => Err(err),
        }
    }

    /// Consumes pending wakeups on the loop thread.
    pub fn drain(&self) {
        let mut counter = 0u64;
        loop {
            let n = unsafe {
                libc::read(self.fd, &mut counter as *mut u64 as *mut libc::c_void, 8)
            };
            if n != 8 {
                break;
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) struct Waker {
    read_fd: RawFd,
    writer: Mutex<UnixStream>,
}

#[cfg(not(target_os = "linux"))]
impl Waker {
    pub fn new() -> io::Result<Waker> {
        let (writer, reader) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Waker {
            read_fd: reader.into_raw_fd(),
            writer: Mutex::new(writer),
        })
    }

    pub fn fd(&self) -> RawFd { self.read_fd }

    pub fn wake(&self) -> io::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| io::Error::from(io::ErrorKind::WouldBlock))?;
        match writer.write_all(&[0x1]) {
            Ok(()) => Ok(()),
            // A full pipe already has a pending wakeup in flight.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn drain(&self) {
        let mut buf = [0u8; 4096];
        loop {
            let n = unsafe {
                libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wake_makes_fd_readable() {
        let waker = Waker::new().unwrap();
        waker.wake().unwrap();
        let mut fds = libc::pollfd {
            fd: waker.fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let n = unsafe { libc::poll(&mut fds, 1, 100) };
        assert_eq!(n, 1);
        assert_ne!(fds.revents & libc::POLLIN, 0);
        waker.drain();
        unsafe { libc::close(waker.fd()) };
    }

    #[test]
    fn repeated_wakes_never_fail() {
        let waker = Waker::new().unwrap();
        for _ in 0..10_000 {
            waker.wake().unwrap();
        }
        waker.drain();
        unsafe { libc::close(waker.fd()) };
    }
}
