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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use crate::addr::Address;
use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::dispatcher::Dispatcher;
use crate::socket::{self, Socket};
use crate::timestamp::TimeStamp;
use crate::MAX_BUFFER_SIZE;

/// Callback receiving a connection handle.
pub type ConnectionCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// Callback receiving a connection handle and the accumulated ingress
/// bytes. The contract is consume-all-or-none: the framework clears its
/// input buffer after the call, so partial framing is the application's
/// responsibility.
pub type MessageCallback = Arc<dyn Fn(&Arc<Connection>, &mut Vec<u8>) + Send + Sync>;

#[derive(Default)]
struct UserCallbacks {
    message: Option<MessageCallback>,
    send_complete: Option<ConnectionCallback>,
    close: Option<ConnectionCallback>,
    error: Option<ConnectionCallback>,
}

/// Per-client connection driver.
///
/// Owns the input and output buffers and the [`Channel`] for the accepted
/// descriptor (the socket's fd is moved into the channel at construction, so
/// the channel is the sole closer). The connection is affine to one
/// dispatcher: reads and writes happen on that loop thread, and
/// [`Connection::send`] from any other thread reroutes itself through the
/// dispatcher's task queue.
///
/// Construction is two-phase, like the dispatcher's: [`Connection::new`]
/// wires the plumbing, and [`Connection::register_callbacks`] — which must
/// run once the handle is shared — installs the weak-self closures on the
/// channel and enables edge-triggered read interest.
pub struct Connection {
    weak_self: Weak<Connection>,
    dispatcher: Arc<Dispatcher>,
    fd: RawFd,
    peer: Option<Address>,
    channel: Arc<Channel>,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    last_active: Mutex<TimeStamp>,
    closing: AtomicBool,
    callbacks: RwLock<UserCallbacks>,
}

impl Connection {
    pub fn new(dispatcher: Arc<Dispatcher>, socket: Socket) -> Arc<Connection> {
        let peer = socket.peer_addr();
        let fd = socket.into_raw_fd();
        Arc::new_cyclic(|weak_self| {
            let channel = Channel::new(&dispatcher, fd);
            Connection {
                weak_self: weak_self.clone(),
                dispatcher,
                fd,
                peer,
                channel,
                input: Mutex::new(Buffer::new()),
                output: Mutex::new(Buffer::new()),
                last_active: Mutex::new(TimeStamp::now()),
                closing: AtomicBool::new(false),
                callbacks: RwLock::new(UserCallbacks::default()),
            }
        })
    }

    /// Installs the channel callbacks and enables edge-triggered read
    /// interest. The closures capture only a weak self-reference, which is
    /// why construction hands out an `Arc` before any callback can fire.
    pub fn register_callbacks(&self) {
        let weak = self.weak_self.clone();
        self.channel.set_read_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.on_readable();
            }
        });
        let weak = self.weak_self.clone();
        self.channel.set_write_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.on_writable();
            }
        });
        let weak = self.weak_self.clone();
        self.channel.set_close_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_close();
            }
        });
        let weak = self.weak_self.clone();
        self.channel.set_error_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        });

        self.channel.enable_edge_triggered();
        self.channel.enable_reading();
    }

    /// Descriptor number at accept time; stable as a map key even after the
    /// channel has closed the descriptor.
    pub fn fd(&self) -> RawFd { self.fd }

    /// Remote endpoint of the accepted socket.
    pub fn peer_addr(&self) -> Option<Address> { self.peer }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.channel.is_closed()
    }

    /// `true` iff no message arrived and nothing was sent for longer than
    /// `timeout`.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_active.lock().expect("activity stamp poisoned").is_older_than(timeout)
    }

    /// Queues `data` for transmission, framed with the 4-byte native-endian
    /// length header.
    ///
    /// The bytes are copied immediately; when called off the owning loop
    /// thread the copy travels through the dispatcher's task queue. Sending
    /// on a closing connection is a silent drop.
    pub fn send(&self, data: &[u8]) {
        if self.is_closed() {
            log::trace!(target: "connection", "Dropping send on closed fd {}", self.fd);
            return;
        }
        self.last_active.lock().expect("activity stamp poisoned").touch();

        let owned = data.to_vec();
        if self.dispatcher.is_loop_thread() {
            self.do_send(&owned);
        } else {
            let weak = self.weak_self.clone();
            self.dispatcher.run_in_loop(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.do_send(&owned);
                }
            });
        }
    }

    fn do_send(&self, data: &[u8]) {
        if self.channel.is_closed() {
            return;
        }
        self.output.lock().expect("output buffer poisoned").append_framed(data);
        self.channel.enable_writing();
    }

    /// Read-readiness handler: drains the socket to `EAGAIN` (mandatory
    /// under edge-triggered notification), then hands the accumulated bytes
    /// to the message callback and clears the input buffer.
    fn on_readable(&self) {
        if self.channel.is_closed() {
            return;
        }

        let mut buf = [0u8; MAX_BUFFER_SIZE];
        loop {
            let n = socket::recv_into(self.fd, &mut buf);
            if n > 0 {
                self.input
                    .lock()
                    .expect("input buffer poisoned")
                    .append(&buf[..n as usize]);
                continue;
            }
            if n == 0 {
                // Orderly shutdown by the peer.
                self.channel.close();
                break;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => break,
                io::ErrorKind::Interrupted => continue,
                _ => {
                    log::debug!(target: "connection", "Read error on fd {}: {err}", self.fd);
                    self.channel.close();
                    break;
                }
            }
        }

        if self.input.lock().expect("input buffer poisoned").is_empty() {
            return;
        }
        // Without a message callback the bytes stay buffered; they are
        // delivered on the first readable batch after one is installed.
        let callback = self.callbacks.read().expect("connection callbacks poisoned").message.clone();
        if let (Some(callback), Some(me)) = (callback, self.weak_self.upgrade()) {
            self.last_active.lock().expect("activity stamp poisoned").touch();
            let mut message = self.input.lock().expect("input buffer poisoned").take_all();
            callback(&me, &mut message);
        }
    }

    /// Write-readiness handler: pushes as much of the output buffer as the
    /// kernel accepts; once drained, drops write interest and reports
    /// completion. Every erased prefix corresponds to one successful kernel
    /// write of exactly that size.
    fn on_writable(&self) {
        if self.channel.is_closed() || !self.channel.is_writing_enabled() {
            return;
        }

        let drained = {
            let mut output = self.output.lock().expect("output buffer poisoned");
            if !output.is_empty() {
                let n = socket::send_from(self.fd, output.data());
                if n > 0 {
                    output.erase_prefix(n as usize);
                } else if n < 0 {
                    let err = io::Error::last_os_error();
                    match err.kind() {
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {}
                        _ => {
                            log::debug!(
                                target: "connection",
                                "Write error on fd {}: {err}", self.fd
                            );
                            drop(output);
                            self.channel.close();
                            return;
                        }
                    }
                }
            }
            output.is_empty()
        };

        if drained {
            self.channel.disable_writing();
            let callback = self
                .callbacks
                .read()
                .expect("connection callbacks poisoned")
                .send_complete
                .clone();
            if let (Some(callback), Some(me)) = (callback, self.weak_self.upgrade()) {
                callback(&me);
            }
        }
    }

    /// Close path, reachable from the channel's close callback (peer close,
    /// hangup, read/write error, EOF) and from [`Connection::close`]. Runs
    /// exactly once: a strong self-reference is captured for the duration of
    /// the callback chain, the channel is closed, then the user close
    /// callback fires.
    fn handle_close(&self) {
        if self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        // Keep the connection alive for the whole callback chain even if
        // the server map entry goes away inside the user callback. During a
        // plain drop the upgrade fails and only the channel teardown runs.
        let keep_alive = self.weak_self.upgrade();
        self.channel.close();
        let callback = self.callbacks.read().expect("connection callbacks poisoned").close.clone();
        if let (Some(callback), Some(me)) = (callback, keep_alive) {
            callback(&me);
        }
    }

    fn handle_error(&self) {
        log::debug!(target: "connection", "Error event on fd {}", self.fd);
        let callback = self.callbacks.read().expect("connection callbacks poisoned").error.clone();
        if let (Some(callback), Some(me)) = (callback, self.weak_self.upgrade()) {
            callback(&me);
        }
    }

    /// Application-initiated close; safe from any thread.
    pub fn close(&self) { self.handle_close(); }

    pub fn set_message_callback(
        &self,
        f: impl Fn(&Arc<Connection>, &mut Vec<u8>) + Send + Sync + 'static,
    ) {
        self.callbacks.write().expect("connection callbacks poisoned").message =
            Some(Arc::new(f));
    }

    pub fn set_send_complete_callback(
        &self,
        f: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) {
        self.callbacks.write().expect("connection callbacks poisoned").send_complete =
            Some(Arc::new(f));
    }

    pub fn set_close_callback(&self, f: impl Fn(&Arc<Connection>) + Send + Sync + 'static) {
        self.callbacks.write().expect("connection callbacks poisoned").close = Some(Arc::new(f));
    }

    pub fn set_error_callback(&self, f: impl Fn(&Arc<Connection>) + Send + Sync + 'static) {
        self.callbacks.write().expect("connection callbacks poisoned").error = Some(Arc::new(f));
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // The channel close is idempotent; this covers connections dropped
        // from the server map without going through the close path.
        self.channel.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;

    fn socket_pair() -> (Socket, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(ret, 0);
        socket::set_nonblocking(fds[0]).unwrap();
        let peer = Address::new(Ipv4Addr::LOCALHOST, 0);
        (Socket::from_accepted(fds[0], peer), fds[1])
    }

    #[test]
    fn framed_send_lands_in_output_buffer() {
        let dispatcher = Dispatcher::new().unwrap();
        dispatcher.init();
        let (local, remote) = socket_pair();
        let conn = Connection::new(dispatcher, local);
        conn.register_callbacks();

        conn.send(b"hello");
        {
            let output = conn.output.lock().unwrap();
            // Written straight out by the writable handler only after the
            // loop runs; inline here the buffer still holds header+payload.
            assert_eq!(output.size(), 4 + 5);
            assert_eq!(&output.data()[..4], &5u32.to_ne_bytes());
        }

        conn.close();
        unsafe { libc::close(remote) };
    }

    #[test]
    fn close_fires_user_callback_exactly_once() {
        let dispatcher = Dispatcher::new().unwrap();
        dispatcher.init();
        let (local, remote) = socket_pair();
        let conn = Connection::new(dispatcher, local);
        conn.register_callbacks();

        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        conn.set_close_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        // Sends after close are silently dropped.
        conn.send(b"late");
        assert!(conn.output.lock().unwrap().is_empty());
        unsafe { libc::close(remote) };
    }

    #[test]
    fn eof_read_closes_and_notifies() {
        let dispatcher = Dispatcher::new().unwrap();
        dispatcher.init();
        let (local, remote) = socket_pair();
        let conn = Connection::new(dispatcher, local);
        conn.register_callbacks();

        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        conn.set_close_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        unsafe { libc::close(remote) };
        conn.on_readable();

        assert!(conn.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn message_callback_receives_drained_bytes() {
        let dispatcher = Dispatcher::new().unwrap();
        dispatcher.init();
        let (local, remote) = socket_pair();
        let conn = Connection::new(dispatcher, local);
        conn.register_callbacks();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        conn.set_message_callback(move |_, bytes| {
            sink.lock().unwrap().extend_from_slice(bytes);
        });

        let payload = b"TestMessage";
        let n = unsafe {
            libc::write(remote, payload.as_ptr() as *const libc::c_void, payload.len())
        };
        assert_eq!(n, payload.len() as isize);
        conn.on_readable();

        assert_eq!(seen.lock().unwrap().as_slice(), payload);
        assert!(conn.input.lock().unwrap().is_empty());

        conn.close();
        unsafe { libc::close(remote) };
    }

    #[test]
    fn bytes_read_before_callback_installation_are_retained() {
        let dispatcher = Dispatcher::new().unwrap();
        dispatcher.init();
        let (local, remote) = socket_pair();
        let conn = Connection::new(dispatcher, local);
        conn.register_callbacks();

        // Data arrives while no message callback is installed; the batch
        // must stay buffered rather than being discarded.
        let early = b"early";
        let n = unsafe { libc::write(remote, early.as_ptr() as *const libc::c_void, early.len()) };
        assert_eq!(n, early.len() as isize);
        conn.on_readable();
        assert_eq!(conn.input.lock().unwrap().data(), early.as_slice());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let batches = Arc::new(AtomicUsize::new(0));
        let sink = seen.clone();
        let counter = batches.clone();
        conn.set_message_callback(move |_, bytes| {
            counter.fetch_add(1, Ordering::SeqCst);
            sink.lock().unwrap().extend_from_slice(bytes);
        });

        // The next readable batch delivers the retained bytes together with
        // the new ones, in one callback invocation.
        let late = b"-late";
        let n = unsafe { libc::write(remote, late.as_ptr() as *const libc::c_void, late.len()) };
        assert_eq!(n, late.len() as isize);
        conn.on_readable();

        assert_eq!(batches.load(Ordering::SeqCst), 1);
        assert_eq!(seen.lock().unwrap().as_slice(), b"early-late");
        assert!(conn.input.lock().unwrap().is_empty());

        conn.close();
        unsafe { libc::close(remote) };
    }

    #[test]
    fn large_send_drains_across_multiple_writable_events() {
        let dispatcher = Dispatcher::new().unwrap();
        dispatcher.init();
        let (local, remote) = socket_pair();
        socket::set_nonblocking(remote).unwrap();
        // Shrink the kernel send buffer so one writable event cannot flush
        // the whole payload.
        let small: libc::c_int = 4096;
        unsafe {
            libc::setsockopt(
                local.fd(),
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &small as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
        let conn = Connection::new(dispatcher, local);
        conn.register_callbacks();

        let completions = Arc::new(AtomicUsize::new(0));
        let counter = completions.clone();
        conn.set_send_complete_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let payload = vec![0xA5u8; 64 * 1024];
        conn.send(&payload);

        let mut received = Vec::new();
        let mut buf = [0u8; 8192];
        for _ in 0..100_000 {
            conn.on_writable();
            loop {
                let n = unsafe {
                    libc::read(remote, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if n <= 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n as usize]);
            }
            if conn.output.lock().unwrap().is_empty() {
                break;
            }
        }

        // Every erased prefix was a successful kernel write: the remote end
        // observes header + payload, byte for byte.
        assert_eq!(received.len(), 4 + payload.len());
        assert_eq!(&received[..4], &(payload.len() as u32).to_ne_bytes());
        assert_eq!(&received[4..], payload.as_slice());
        assert!(!conn.channel.is_writing_enabled());
        assert_eq!(completions.load(Ordering::SeqCst), 1);

        conn.close();
        unsafe { libc::close(remote) };
    }

    #[test]
    fn one_message_callback_per_readable_batch_with_data() {
        let dispatcher = Dispatcher::new().unwrap();
        dispatcher.init();
        let (local, remote) = socket_pair();
        let conn = Connection::new(dispatcher, local);
        conn.register_callbacks();

        let batches = Arc::new(AtomicUsize::new(0));
        let counter = batches.clone();
        conn.set_message_callback(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // A readable event with no pending bytes produces no callback.
        conn.on_readable();
        assert_eq!(batches.load(Ordering::SeqCst), 0);

        for _ in 0..2 {
            let n = unsafe { libc::write(remote, b"x".as_ptr() as *const libc::c_void, 1) };
            assert_eq!(n, 1);
            conn.on_readable();
        }
        assert_eq!(batches.load(Ordering::SeqCst), 2);

        conn.close();
        unsafe { libc::close(remote) };
    }

    #[test]
    fn idle_tracking_follows_activity() {
        let dispatcher = Dispatcher::new().unwrap();
        dispatcher.init();
        let (local, remote) = socket_pair();
        let conn = Connection::new(dispatcher, local);
        conn.register_callbacks();

        assert!(!conn.is_idle(Duration::from_secs(1)));
        std::thread::sleep(Duration::from_millis(30));
        assert!(conn.is_idle(Duration::from_millis(10)));
        conn.send(b"ping");
        assert!(!conn.is_idle(Duration::from_millis(10)));

        conn.close();
        unsafe { libc::close(remote) };
    }
}
