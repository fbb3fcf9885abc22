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
use std::sync::{Arc, RwLock, Weak};

use crate::addr::Address;
use crate::channel::Channel;
use crate::dispatcher::Dispatcher;
use crate::socket::{self, Socket};
use crate::{Error, MAX_CONNECTIONS};

/// Receives every kernel-accepted socket.
pub type AcceptCallback = Arc<dyn Fn(Socket) + Send + Sync>;

/// Owns the listening socket and publishes accepted client sockets.
///
/// The listener is bound with `SO_REUSEADDR`, `SO_REUSEPORT`,
/// `SO_KEEPALIVE` and `TCP_NODELAY`, non-blocking, with a backlog of
/// [`MAX_CONNECTIONS`]. Its descriptor is wrapped in an edge-triggered
/// read channel on the acceptor dispatcher; a single readiness can carry an
/// unbounded number of pending connections, so [`Acceptor::drain`] loops
/// until the accept queue reports `EAGAIN`.
pub struct Acceptor {
    weak_self: Weak<Acceptor>,
    listen_fd: RawFd,
    local: Address,
    channel: Arc<Channel>,
    on_accept: RwLock<Option<AcceptCallback>>,
}

impl Acceptor {
    /// Creates, configures, binds and listens; the descriptor ends up owned
    /// by the acceptor channel on `dispatcher`.
    pub fn bind(dispatcher: &Arc<Dispatcher>, addr: Address) -> Result<Arc<Acceptor>, Error> {
        let listener = Socket::new_tcp().map_err(Error::SocketCreate)?;
        listener.set_reuse_addr(true).map_err(Error::SocketCreate)?;
        listener.set_reuse_port(true).map_err(Error::SocketCreate)?;
        listener.set_keep_alive(true).map_err(Error::SocketCreate)?;
        listener.set_nodelay(true).map_err(Error::SocketCreate)?;

        listener.bind(addr).map_err(Error::Bind)?;
        listener.listen(MAX_CONNECTIONS).map_err(Error::Listen)?;
        let local = listener.local_addr().map_err(Error::Bind)?;
        log::debug!(target: "acceptor", "Listening on {local}");

        let listen_fd = listener.into_raw_fd();
        let channel = Channel::new(dispatcher, listen_fd);
        Ok(Arc::new_cyclic(|weak_self| Acceptor {
            weak_self: weak_self.clone(),
            listen_fd,
            local,
            channel,
            on_accept: RwLock::new(None),
        }))
    }

    /// Wires the drain loop to the listener channel and enables
    /// edge-triggered read interest. Call after the accept callback is set.
    pub fn register(&self) {
        let weak = self.weak_self.clone();
        self.channel.set_read_callback(move || {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.drain();
            }
        });
        self.channel.enable_edge_triggered();
        self.channel.enable_reading();
    }

    pub fn set_accept_callback(&self, f: impl Fn(Socket) + Send + Sync + 'static) {
        *self.on_accept.write().expect("accept callback poisoned") = Some(Arc::new(f));
    }

    /// Bound address as reported by the kernel (resolves port 0).
    pub fn local_addr(&self) -> Address { self.local }

    /// Accepts until the kernel queue is empty.
    ///
    /// Transient failures (`ECONNABORTED`, descriptor or buffer exhaustion)
    /// end the current drain but never close the listener; the next
    /// readiness retries.
    pub fn drain(&self) {
        let callback = self.on_accept.read().expect("accept callback poisoned").clone();
        let Some(callback) = callback else {
            return;
        };
        loop {
            match socket::accept_raw(self.listen_fd) {
                Ok(Some(client)) => {
                    log::trace!(
                        target: "acceptor",
                        "Accepted fd {} from {:?}", client.fd(), client.peer_addr()
                    );
                    callback(client);
                }
                Ok(None) => break,
                Err(err) => {
                    match err.raw_os_error() {
                        Some(
                            libc::ECONNABORTED
                            | libc::EMFILE
                            | libc::ENFILE
                            | libc::ENOBUFS
                            | libc::ENOMEM,
                        ) => {
                            log::warn!(target: "acceptor", "Transient accept failure: {err}")
                        }
                        _ => log::error!(target: "acceptor", "Accept failed: {err}"),
                    }
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::{Ipv4Addr, TcpStream};
    use std::sync::Mutex;

    #[test]
    fn drain_accepts_every_pending_connection() {
        let dispatcher = Dispatcher::new().unwrap();
        dispatcher.init();
        let acceptor =
            Acceptor::bind(&dispatcher, Address::new(Ipv4Addr::LOCALHOST, 0)).unwrap();

        let accepted = Arc::new(Mutex::new(Vec::new()));
        let sink = accepted.clone();
        acceptor.set_accept_callback(move |client| {
            sink.lock().unwrap().push(client.fd());
        });
        acceptor.register();

        let local = acceptor.local_addr();
        let mut clients = Vec::new();
        for _ in 0..10 {
            clients.push(TcpStream::connect(std::net::SocketAddrV4::from(local)).unwrap());
        }
        // Connections sit in the backlog; one drain must take them all.
        std::thread::sleep(std::time::Duration::from_millis(100));
        acceptor.drain();

        assert_eq!(accepted.lock().unwrap().len(), 10);
    }

    #[test]
    fn bind_to_same_port_twice_is_allowed_by_reuseport() {
        let dispatcher = Dispatcher::new().unwrap();
        dispatcher.init();
        let first = Acceptor::bind(&dispatcher, Address::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let second = Acceptor::bind(&dispatcher, first.local_addr());
        assert!(second.is_ok());
    }
}
