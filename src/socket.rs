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

use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::addr::Address;

/// Uniquely owned, non-blocking TCP socket descriptor.
///
/// A `Socket` closes its descriptor exactly once on drop. Ownership of the
/// descriptor can be moved out with [`Socket::into_raw_fd`], after which the
/// drop is a no-op; this is how a descriptor is handed over to the
/// [`crate::Channel`] that manages it inside an event loop.
#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
    peer: Option<Address>,
}

impl Socket {
    /// Creates a new non-blocking TCP socket.
    pub fn new_tcp() -> io::Result<Socket> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, libc::IPPROTO_TCP) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        if let Err(err) = set_nonblocking(fd) {
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(Socket { fd, peer: None })
    }

    /// Wraps a descriptor produced by `accept`, carrying the remote address.
    pub(crate) fn from_accepted(fd: RawFd, peer: Address) -> Socket {
        Socket { fd, peer: Some(peer) }
    }

    pub fn fd(&self) -> RawFd { self.fd }

    /// Remote endpoint; populated only for accepted sockets.
    pub fn peer_addr(&self) -> Option<Address> { self.peer }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        set_opt(self.fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on as libc::c_int)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        set_opt(self.fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, on as libc::c_int)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        set_opt(self.fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on as libc::c_int)
    }

    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        set_opt(self.fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as libc::c_int)
    }

    pub fn bind(&self, addr: Address) -> io::Result<()> {
        let sin = addr.to_sockaddr();
        let ret = unsafe {
            libc::bind(
                self.fd,
                &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        if unsafe { libc::listen(self.fd, backlog) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Accepts one pending connection.
    ///
    /// Returns `Ok(None)` when the accept queue is drained (`EAGAIN`);
    /// `EINTR` is retried internally. The accepted socket is non-blocking.
    pub fn accept(&self) -> io::Result<Option<Socket>> { accept_raw(self.fd) }

    /// Locally bound address, as reported by the kernel. Useful after
    /// binding port 0.
    pub fn local_addr(&self) -> io::Result<Address> {
        let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(
                self.fd,
                &mut sin as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Address::from_sockaddr(&sin))
    }

    /// Moves the descriptor out; the socket will no longer close it.
    pub(crate) fn into_raw_fd(mut self) -> RawFd {
        let fd = self.fd;
        self.fd = -1;
        fd
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd { self.fd }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }
}

/// Accepts one connection from a listening descriptor, draining-friendly:
/// `EAGAIN`/`EWOULDBLOCK` map to `Ok(None)` and `EINTR` retries.
pub(crate) fn accept_raw(listen_fd: RawFd) -> io::Result<Option<Socket>> {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    loop {
        let fd = unsafe {
            accept_nonblock(
                listen_fd,
                &mut sin as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        };
        if fd >= 0 {
            let peer = Address::from_sockaddr(&sin);
            let socket = Socket::from_accepted(fd, peer);
            #[cfg(not(target_os = "linux"))]
            {
                set_nonblocking(fd)?;
                // No MSG_NOSIGNAL on BSD sockets; suppress SIGPIPE per fd.
                set_opt(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1)?;
            }
            return Ok(Some(socket));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(None),
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err),
        }
    }
}

#[cfg(target_os = "linux")]
unsafe fn accept_nonblock(
    fd: RawFd,
    addr: *mut libc::sockaddr,
    len: *mut libc::socklen_t,
) -> RawFd {
    libc::accept4(fd, addr, len, libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC)
}

#[cfg(not(target_os = "linux"))]
unsafe fn accept_nonblock(
    fd: RawFd,
    addr: *mut libc::sockaddr,
    len: *mut libc::socklen_t,
) -> RawFd {
    libc::accept(fd, addr, len)
}

/// Non-blocking read into `buf`; returns the raw syscall result with errno
/// left for the caller to inspect.
pub(crate) fn recv_into(fd: RawFd, buf: &mut [u8]) -> isize {
    unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) }
}

/// Non-blocking send from `buf`, never raising `SIGPIPE`.
pub(crate) fn send_from(fd: RawFd, buf: &[u8]) -> isize {
    #[cfg(target_os = "linux")]
    let flags = libc::MSG_NOSIGNAL;
    #[cfg(not(target_os = "linux"))]
    let flags = 0;
    unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags) }
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn bind_listen_and_report_local_addr() {
        let socket = Socket::new_tcp().unwrap();
        socket.set_reuse_addr(true).unwrap();
        socket.bind(Address::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        socket.listen(16).unwrap();
        let local = socket.local_addr().unwrap();
        assert_eq!(local.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn accept_on_empty_queue_would_block() {
        let socket = Socket::new_tcp().unwrap();
        socket.set_reuse_addr(true).unwrap();
        socket.bind(Address::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        socket.listen(16).unwrap();
        assert!(socket.accept().unwrap().is_none());
    }

    #[test]
    fn into_raw_fd_disarms_drop() {
        let socket = Socket::new_tcp().unwrap();
        let fd = socket.into_raw_fd();
        assert!(fd >= 0);
        // The descriptor is still alive; we own it now.
        assert_eq!(unsafe { libc::close(fd) }, 0);
    }
}
