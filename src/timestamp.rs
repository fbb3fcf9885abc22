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
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// Monotonic last-activity marker.
///
/// ```
/// use std::time::Duration;
/// use netreactor::TimeStamp;
///
/// let ts = TimeStamp::now();
/// assert!(!ts.is_older_than(Duration::from_secs(60)));
/// ```
#[derive(Copy, Clone, Debug)]
pub struct TimeStamp(Instant);

impl Default for TimeStamp {
    fn default() -> Self { TimeStamp::now() }
}

impl TimeStamp {
    pub fn now() -> Self { TimeStamp(Instant::now()) }

    /// Resets the marker to the current instant.
    pub fn touch(&mut self) { self.0 = Instant::now(); }

    pub fn elapsed(&self) -> Duration { self.0.elapsed() }

    /// `true` iff strictly more than `duration` has passed since the marker
    /// was captured or last touched.
    pub fn is_older_than(&self, duration: Duration) -> bool { self.0.elapsed() > duration }

    /// Creates a kernel timer descriptor firing every `interval`.
    ///
    /// The returned descriptor becomes readable on each expiry and must be
    /// re-armed with [`TimeStamp::rearm_timer_fd`] once the expiry has been
    /// handled. On Linux this is a periodic `timerfd`; on kqueue platforms a
    /// dedicated kqueue with a periodic `EVFILT_TIMER` whose descriptor polls
    /// readable while expiries are pending.
    #[cfg(target_os = "linux")]
    pub fn new_timer_fd(interval: Duration) -> io::Result<RawFd> {
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let spec = libc::itimerspec {
            it_interval: duration_to_timespec(interval),
            it_value: duration_to_timespec(interval),
        };
        if unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(fd)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn new_timer_fd(interval: Duration) -> io::Result<RawFd> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        let ev = libc::kevent {
            ident: 1,
            filter: libc::EVFILT_TIMER,
            flags: libc::EV_ADD | libc::EV_ENABLE,
            fflags: 0,
            data: interval.as_millis() as isize,
            udata: std::ptr::null_mut(),
        };
        if unsafe { libc::kevent(kq, &ev, 1, std::ptr::null_mut(), 0, std::ptr::null()) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(kq) };
            return Err(err);
        }
        Ok(kq)
    }

    /// Consumes pending expirations so the descriptor stops polling readable
    /// until the next interval elapses.
    #[cfg(target_os = "linux")]
    pub fn rearm_timer_fd(fd: RawFd) {
        let mut expirations = 0u64;
        loop {
            let n = unsafe {
                libc::read(fd, &mut expirations as *mut u64 as *mut libc::c_void, 8)
            };
            if n != 8 {
                break;
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn rearm_timer_fd(fd: RawFd) {
        let zero = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        let mut fired = [libc::kevent {
            ident: 0,
            filter: 0,
            flags: 0,
            fflags: 0,
            data: 0,
            udata: std::ptr::null_mut(),
        }; 8];
        loop {
            let n = unsafe { libc::kevent(fd, std::ptr::null(), 0, fired.as_mut_ptr(), 8, &zero) };
            if n <= 0 {
                break;
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn duration_to_timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    }
}
