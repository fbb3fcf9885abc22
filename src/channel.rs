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

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::dispatcher::Dispatcher;
use crate::poller::Events;

/// Callback invoked on a channel readiness event. Implementations capture
/// only weak references to their owner and upgrade for the duration of the
/// call, so a channel callback can never keep a dropped connection alive.
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    read: Option<EventCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

/// Per-descriptor state machine bridging the poller's raw readiness to
/// user-level callbacks.
///
/// A channel is affine to one [`Dispatcher`] for its entire life: every
/// interest mutation is routed through [`Dispatcher::update_channel`], which
/// executes it on the owning loop thread. The channel owns the descriptor it
/// was created with and closes it exactly once.
///
/// States: `Idle` → `Registered` (first `enable_*` call) → `Closed`
/// ([`Channel::close`], idempotent through a compare-and-swap on the closed
/// flag). Once closed the descriptor is `-1` and both masks are empty.
pub struct Channel {
    weak_self: Weak<Channel>,
    fd: AtomicI32,
    dispatcher: Weak<Dispatcher>,
    /// Interest mask the descriptor is (to be) registered with.
    interest: AtomicU32,
    /// Readiness mask assigned by the poller for the current event.
    received: AtomicU32,
    /// Whether the descriptor currently sits in the poller.
    registered: AtomicBool,
    closed: AtomicBool,
    callbacks: RwLock<Callbacks>,
}

impl Channel {
    /// Creates a channel owned by `dispatcher` for descriptor `fd`.
    ///
    /// The dispatcher is referenced weakly: the strong reference lives in
    /// the dispatcher's poller map from the first `enable_*` call on, never
    /// the other way around.
    pub fn new(dispatcher: &Arc<Dispatcher>, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|weak_self| Channel {
            weak_self: weak_self.clone(),
            fd: AtomicI32::new(fd),
            dispatcher: Arc::downgrade(dispatcher),
            interest: AtomicU32::new(0),
            received: AtomicU32::new(0),
            registered: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            callbacks: RwLock::new(Callbacks::default()),
        })
    }

    /// Descriptor number, `-1` once the channel is closed.
    pub fn fd(&self) -> RawFd { self.fd.load(Ordering::Acquire) }

    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }

    pub fn interest(&self) -> Events { Events::from_bits(self.interest.load(Ordering::Acquire)) }

    pub fn received(&self) -> Events { Events::from_bits(self.received.load(Ordering::Acquire)) }

    pub(crate) fn is_registered(&self) -> bool { self.registered.load(Ordering::Acquire) }

    pub(crate) fn set_registered(&self, on: bool) { self.registered.store(on, Ordering::Release) }

    pub(crate) fn set_received(&self, events: Events) {
        self.received.store(events.bits(), Ordering::Release)
    }

    pub fn set_read_callback(&self, f: impl Fn() + Send + Sync + 'static) {
        self.callbacks.write().expect("channel callbacks poisoned").read = Some(Arc::new(f));
    }

    pub fn set_write_callback(&self, f: impl Fn() + Send + Sync + 'static) {
        self.callbacks.write().expect("channel callbacks poisoned").write = Some(Arc::new(f));
    }

    pub fn set_close_callback(&self, f: impl Fn() + Send + Sync + 'static) {
        self.callbacks.write().expect("channel callbacks poisoned").close = Some(Arc::new(f));
    }

    pub fn set_error_callback(&self, f: impl Fn() + Send + Sync + 'static) {
        self.callbacks.write().expect("channel callbacks poisoned").error = Some(Arc::new(f));
    }

    /// Marks the channel edge-triggered. Takes effect on the next interest
    /// push, so call it before `enable_reading`.
    pub fn enable_edge_triggered(&self) {
        if self.is_closed() {
            return;
        }
        self.interest.fetch_or(Events::EDGE_TRIGGERED.bits(), Ordering::AcqRel);
    }

    pub fn is_edge_triggered(&self) -> bool { self.interest().contains(Events::EDGE_TRIGGERED) }

    /// Requests read readiness. `PEER_CLOSED` always rides along so an
    /// orderly remote shutdown reaches the close path.
    pub fn enable_reading(&self) {
        if self.is_closed() {
            return;
        }
        self.interest
            .fetch_or((Events::READ | Events::PEER_CLOSED).bits(), Ordering::AcqRel);
        self.push_update();
    }

    pub fn disable_reading(&self) {
        if self.is_closed() {
            return;
        }
        self.interest
            .fetch_and(!(Events::READ | Events::PEER_CLOSED).bits(), Ordering::AcqRel);
        self.push_update();
    }

    pub fn is_reading_enabled(&self) -> bool { self.interest().contains(Events::READ) }

    pub fn enable_writing(&self) {
        if self.is_closed() {
            return;
        }
        self.interest.fetch_or(Events::WRITE.bits(), Ordering::AcqRel);
        self.push_update();
    }

    pub fn disable_writing(&self) {
        if self.is_closed() {
            return;
        }
        self.interest.fetch_and(!Events::WRITE.bits(), Ordering::AcqRel);
        self.push_update();
    }

    pub fn is_writing_enabled(&self) -> bool { self.interest().contains(Events::WRITE) }

    /// Delivers the received readiness mask to the installed callbacks in
    /// strict priority order.
    ///
    /// A hangup or peer close supersedes everything else and closes the
    /// channel (which fires the close callback exactly once). Otherwise read
    /// runs before write before error; the callbacks must tolerate a
    /// `close()` triggered from within an earlier one in the same delivery.
    pub fn handle_event(&self) {
        if self.is_closed() {
            return;
        }
        let received = self.received();

        if received.intersects(Events::PEER_CLOSED | Events::HANG_UP) {
            self.close();
            return;
        }

        if received.intersects(Events::READ | Events::PRIORITY) {
            if let Some(cb) = self.callback(|c| c.read.clone()) {
                cb();
            }
        }
        if received.contains(Events::WRITE) {
            if let Some(cb) = self.callback(|c| c.write.clone()) {
                cb();
            }
        }
        if received.contains(Events::ERROR) {
            if let Some(cb) = self.callback(|c| c.error.clone()) {
                cb();
            }
        }
    }

    /// Closes the channel exactly once.
    ///
    /// On the winning call: the descriptor is deregistered from the owning
    /// poller *before* the kernel close (running on the dispatcher thread,
    /// routed if necessary — closing first would let a kernel fd reuse
    /// deliver events to the wrong channel), both masks are cleared, the fd
    /// becomes `-1` and the close callback fires. Every later call is a
    /// no-op.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let fd = self.fd.swap(-1, Ordering::AcqRel);
        let registered = self.registered.swap(false, Ordering::AcqRel);
        self.interest.store(0, Ordering::Release);
        self.received.store(0, Ordering::Release);

        if fd >= 0 {
            match self.dispatcher.upgrade() {
                Some(dispatcher) => dispatcher.unregister_and_close(fd, registered),
                None => {
                    unsafe { libc::close(fd) };
                }
            }
        }

        log::debug!(target: "channel", "Closed channel for fd {fd}");
        if let Some(cb) = self.callback(|c| c.close.clone()) {
            cb();
        }
    }

    fn callback(&self, pick: impl FnOnce(&Callbacks) -> Option<EventCallback>) -> Option<EventCallback> {
        pick(&self.callbacks.read().expect("channel callbacks poisoned"))
    }

    fn push_update(&self) {
        let (Some(dispatcher), Some(me)) = (self.dispatcher.upgrade(), self.weak_self.upgrade())
        else {
            return;
        };
        dispatcher.update_channel(&me);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Wake and timer channels own their descriptor outright and may be
        // dropped without an explicit close when their dispatcher goes away.
        let fd = self.fd.load(Ordering::Acquire);
        if !self.closed.load(Ordering::Acquire) && fd >= 0 {
            unsafe { libc::close(fd) };
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn close_is_idempotent_and_clears_state() {
        let dispatcher = Dispatcher::new().unwrap();
        dispatcher.init();
        let (rx, tx) = pipe_pair();
        let channel = Channel::new(&dispatcher, rx);
        channel.enable_reading();
        assert!(channel.is_reading_enabled());

        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        channel.set_close_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        channel.close();
        channel.close();
        channel.close();

        assert!(channel.is_closed());
        assert_eq!(channel.fd(), -1);
        assert!(channel.interest().is_empty());
        assert!(channel.received().is_empty());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        // The pipe read end is gone; only the write end is left to clean.
        unsafe { libc::close(tx) };
    }

    #[test]
    fn enable_disable_toggle_interest() {
        let dispatcher = Dispatcher::new().unwrap();
        dispatcher.init();
        let (rx, tx) = pipe_pair();
        let channel = Channel::new(&dispatcher, rx);

        channel.enable_edge_triggered();
        channel.enable_reading();
        assert!(channel.interest().contains(Events::READ | Events::PEER_CLOSED));
        assert!(channel.is_edge_triggered());

        channel.enable_writing();
        assert!(channel.is_writing_enabled());
        channel.disable_writing();
        assert!(!channel.is_writing_enabled());

        channel.disable_reading();
        assert!(!channel.is_reading_enabled());

        channel.close();
        unsafe { libc::close(tx) };
    }

    #[test]
    fn peer_close_event_fires_close_once() {
        let dispatcher = Dispatcher::new().unwrap();
        dispatcher.init();
        let (rx, tx) = pipe_pair();
        let channel = Channel::new(&dispatcher, rx);
        channel.enable_reading();

        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        channel.set_close_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        channel.set_received(Events::READ | Events::HANG_UP);
        channel.handle_event();
        channel.handle_event(); // second delivery is ignored

        assert!(channel.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        unsafe { libc::close(tx) };
    }

    #[test]
    fn event_priority_read_before_write() {
        let dispatcher = Dispatcher::new().unwrap();
        dispatcher.init();
        let (rx, tx) = pipe_pair();
        let channel = Channel::new(&dispatcher, rx);
        channel.enable_reading();

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o = order.clone();
        channel.set_read_callback(move || o.lock().unwrap().push("read"));
        let o = order.clone();
        channel.set_write_callback(move || o.lock().unwrap().push("write"));

        channel.set_received(Events::READ | Events::WRITE);
        channel.handle_event();
        assert_eq!(*order.lock().unwrap(), vec!["read", "write"]);

        channel.close();
        unsafe { libc::close(tx) };
    }
}
