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

//! kqueue backend for macOS and the BSDs.
//!
//! kqueue splits read and write interest into distinct filters and is
//! edge-triggered through `EV_CLEAR`. Multiple filter events for the same
//! descriptor within one wakeup are coalesced into a single entry carrying
//! the union mask, so the portable layer sees the same shape as epoll.

use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

use crate::poller::Events;
use crate::MAX_EVENT_NUMS;

pub(super) struct KqueueBackend {
    kq: RawFd,
}

impl KqueueBackend {
    pub fn new() -> io::Result<KqueueBackend> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(KqueueBackend { kq })
    }

    pub fn add(&self, fd: RawFd, interest: Events) -> io::Result<()> {
        self.apply(fd, interest)
    }

    pub fn modify(&self, fd: RawFd, interest: Events) -> io::Result<()> {
        self.apply(fd, interest)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let read_res = self.change(fd, libc::EVFILT_READ, libc::EV_DELETE);
        let write_res = self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE);
        match (read_res, write_res) {
            (Ok(()), _) | (_, Ok(())) => Ok(()),
            (Err(err), Err(_)) => Err(err),
        }
    }

    pub fn wait(&self, timeout_ms: i32) -> io::Result<Vec<(RawFd, Events)>> {
        let timeout = libc::timespec {
            tv_sec: (timeout_ms / 1000) as libc::time_t,
            tv_nsec: ((timeout_ms % 1000) as libc::c_long) * 1_000_000,
        };
        let mut events = vec![empty_kevent(); MAX_EVENT_NUMS];
        let n = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                events.as_mut_ptr(),
                MAX_EVENT_NUMS as libc::c_int,
                &timeout,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(vec![]);
            }
            return Err(err);
        }
        let mut ready: Vec<(RawFd, Events)> = Vec::with_capacity(n as usize);
        for ev in &events[..n as usize] {
            let fd = ev.ident as RawFd;
            let mask = decode(ev);
            match ready.iter_mut().find(|(seen, _)| *seen == fd) {
                Some((_, joined)) => *joined |= mask,
                None => ready.push((fd, mask)),
            }
        }
        Ok(ready)
    }

    /// One `kevent` change per filter: a filter present in the interest mask
    /// is (re-)added, an absent one is deleted. `ENOENT` while deleting just
    /// means the filter was never set.
    fn apply(&self, fd: RawFd, interest: Events) -> io::Result<()> {
        let mut base = libc::EV_ADD | libc::EV_ENABLE;
        if interest.contains(Events::EDGE_TRIGGERED) {
            base |= libc::EV_CLEAR;
        }
        for (filter, wanted) in [
            (libc::EVFILT_READ, interest.contains(Events::READ)),
            (libc::EVFILT_WRITE, interest.contains(Events::WRITE)),
        ] {
            let res = if wanted {
                self.change(fd, filter, base)
            } else {
                self.change(fd, filter, libc::EV_DELETE)
            };
            match res {
                Ok(()) => {}
                Err(err) if !wanted && err.raw_os_error() == Some(libc::ENOENT) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn change(&self, fd: RawFd, filter: i16, flags: u16) -> io::Result<()> {
        let ev = libc::kevent {
            ident: fd as libc::uintptr_t,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: ptr::null_mut(),
        };
        let ret = unsafe { libc::kevent(self.kq, &ev, 1, ptr::null_mut(), 0, ptr::null()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for KqueueBackend {
    fn drop(&mut self) {
        unsafe { libc::close(self.kq) };
    }
}

fn empty_kevent() -> libc::kevent {
    libc::kevent {
        ident: 0,
        filter: 0,
        flags: 0,
        fflags: 0,
        data: 0,
        udata: ptr::null_mut(),
    }
}

fn decode(ev: &libc::kevent) -> Events {
    let mut events = Events::NONE;
    match ev.filter {
        libc::EVFILT_READ => {
            events |= Events::READ;
            if ev.flags & libc::EV_EOF != 0 {
                events |= Events::PEER_CLOSED;
            }
        }
        libc::EVFILT_WRITE => {
            events |= Events::WRITE;
            if ev.flags & libc::EV_EOF != 0 {
                events |= Events::HANG_UP;
            }
        }
        _ => {}
    }
    if ev.flags & libc::EV_ERROR != 0 {
        events |= Events::ERROR;
    }
    events
}

#[cfg(test)]
mod test {
    use super::*;

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn readable_pipe_reports_read() {
        let backend = KqueueBackend::new().unwrap();
        let (rx, tx) = pipe_pair();
        backend.add(rx, Events::READ).unwrap();
        assert!(backend.wait(0).unwrap().is_empty());

        let one = [1u8];
        assert_eq!(
            unsafe { libc::write(tx, one.as_ptr() as *const libc::c_void, 1) },
            1
        );
        let ready = backend.wait(100).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, rx);
        assert!(ready[0].1.contains(Events::READ));

        backend.delete(rx).unwrap();
        unsafe {
            libc::close(rx);
            libc::close(tx);
        }
    }
}
