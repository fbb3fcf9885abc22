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

//! Linux epoll backend.

use std::io;
use std::os::unix::io::RawFd;

use crate::poller::Events;
use crate::MAX_EVENT_NUMS;

pub(super) struct EpollBackend {
    epfd: RawFd,
}

impl EpollBackend {
    pub fn new() -> io::Result<EpollBackend> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollBackend { epfd })
    }

    pub fn add(&self, fd: RawFd, interest: Events) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
    }

    pub fn modify(&self, fd: RawFd, interest: Events) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let ret = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Waits for readiness; epoll reports one event per descriptor, so the
    /// returned pairs are already coalesced. `EINTR` yields an empty batch.
    pub fn wait(&self, timeout_ms: i32) -> io::Result<Vec<(RawFd, Events)>> {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENT_NUMS];
        let n = unsafe {
            libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENT_NUMS as i32, timeout_ms)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(vec![]);
            }
            return Err(err);
        }
        let mut ready = Vec::with_capacity(n as usize);
        for ev in &events[..n as usize] {
            let fd = ev.u64 as RawFd;
            let mask = ev.events;
            ready.push((fd, decode(mask)));
        }
        Ok(ready)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Events) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: encode(interest),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

fn encode(interest: Events) -> u32 {
    let mut mask = 0u32;
    if interest.contains(Events::READ) {
        mask |= libc::EPOLLIN as u32;
    }
    if interest.contains(Events::WRITE) {
        mask |= libc::EPOLLOUT as u32;
    }
    if interest.contains(Events::EDGE_TRIGGERED) {
        mask |= libc::EPOLLET as u32;
    }
    if interest.contains(Events::PEER_CLOSED) {
        mask |= libc::EPOLLRDHUP as u32;
    }
    if interest.contains(Events::PRIORITY) {
        mask |= libc::EPOLLPRI as u32;
    }
    mask
}

fn decode(mask: u32) -> Events {
    let mut events = Events::NONE;
    if mask & libc::EPOLLIN as u32 != 0 {
        events |= Events::READ;
    }
    if mask & libc::EPOLLOUT as u32 != 0 {
        events |= Events::WRITE;
    }
    if mask & libc::EPOLLRDHUP as u32 != 0 {
        events |= Events::PEER_CLOSED;
    }
    if mask & libc::EPOLLHUP as u32 != 0 {
        events |= Events::HANG_UP;
    }
    if mask & libc::EPOLLERR as u32 != 0 {
        events |= Events::ERROR;
    }
    if mask & libc::EPOLLPRI as u32 != 0 {
        events |= Events::PRIORITY;
    }
    events
}
