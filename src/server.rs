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

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::time::Duration;

use crate::acceptor::Acceptor;
use crate::addr::Address;
use crate::connection::{Connection, ConnectionCallback, MessageCallback};
use crate::dispatcher::{Dispatcher, TickCallback};
use crate::pool::{Task, ThreadPool};
use crate::socket::Socket;
use crate::Error;

/// Server construction parameters.
///
/// `io_workers` defaults to half the hardware parallelism (at least one);
/// the idle timer sweeps every `timer_interval` and evicts connections
/// silent for longer than `connection_timeout`.
#[derive(Copy, Clone, Debug)]
pub struct ServerConfig {
    pub addr: Address,
    pub io_workers: usize,
    pub timer_interval: Duration,
    pub connection_timeout: Duration,
}

impl ServerConfig {
    pub fn new(addr: Address) -> ServerConfig {
        let io_workers = thread::available_parallelism()
            .map(|n| n.get() / 2)
            .unwrap_or(1)
            .max(1);
        ServerConfig {
            addr,
            io_workers,
            timer_interval: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Default)]
struct ServerCallbacks {
    new_connection: Option<ConnectionCallback>,
    close_connection: Option<ConnectionCallback>,
    error: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    send_complete: Option<ConnectionCallback>,
    timer: Option<TickCallback>,
}

/// Multi-reactor TCP server.
///
/// Composes one acceptor [`Dispatcher`] (run on the thread that calls
/// [`Server::start`]), N I/O dispatchers executed as long-running tasks on a
/// [`ThreadPool`], and the shared connection map holding the strong
/// [`Connection`] references. Accepted descriptors are assigned to an I/O
/// dispatcher by `fd mod N` and stay pinned there.
///
/// All callback setters may be used before `start()`; the handles they
/// receive stay valid until the close callback has fired, after which
/// further sends on the connection are silently dropped.
pub struct Server {
    weak_self: Weak<Server>,
    config: ServerConfig,
    local: Address,
    acceptor_dispatcher: Arc<Dispatcher>,
    io_dispatchers: Mutex<Vec<Arc<Dispatcher>>>,
    acceptor: Arc<Acceptor>,
    pool: ThreadPool,
    connections: Mutex<HashMap<RawFd, Arc<Connection>>>,
    callbacks: RwLock<ServerCallbacks>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Server {
    /// Binds the listener and wires the acceptor; no threads run yet.
    pub fn bind(config: ServerConfig) -> Result<Arc<Server>, Error> {
        let acceptor_dispatcher = Dispatcher::new()?;
        acceptor_dispatcher.init();
        let acceptor = Acceptor::bind(&acceptor_dispatcher, config.addr)?;
        let local = acceptor.local_addr();
        let pool = ThreadPool::new(config.io_workers);

        let server = Arc::new_cyclic(|weak_self| Server {
            weak_self: weak_self.clone(),
            config,
            local,
            acceptor_dispatcher,
            io_dispatchers: Mutex::new(vec![]),
            acceptor,
            pool,
            connections: Mutex::new(empty!()),
            callbacks: RwLock::new(ServerCallbacks::default()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });

        let weak = server.weak_self.clone();
        server.acceptor.set_accept_callback(move |socket| {
            if let Some(server) = weak.upgrade() {
                server.on_new_connection(socket);
            }
        });
        server.acceptor.register();
        Ok(server)
    }

    /// Bound address; resolves a port-0 bind to the real port.
    pub fn local_addr(&self) -> Address { self.local }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().expect("connection map poisoned").len()
    }

    /// Spins up the I/O dispatchers on the pool and runs the acceptor loop
    /// on the calling thread. Blocks until [`Server::stop`].
    pub fn start(&self) -> Result<(), Error> {
        if self.started.swap(true, Ordering::AcqRel) {
            log::warn!(target: "server", "start() called more than once; ignoring");
            return Ok(());
        }
        if self.stopped.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut dispatchers = Vec::with_capacity(self.pool.size());
        for _ in 0..self.pool.size() {
            let dispatcher = Dispatcher::with_idle_timer(
                self.config.timer_interval,
                self.config.connection_timeout,
            )?;
            dispatcher.init();
            let weak = self.weak_self.clone();
            dispatcher.set_expire_callback(move |fd| {
                if let Some(server) = weak.upgrade() {
                    server.remove_connection(fd);
                }
            });
            let weak = self.weak_self.clone();
            dispatcher.set_tick_callback(move |dispatcher| {
                if let Some(server) = weak.upgrade() {
                    server.handle_tick(dispatcher);
                }
            });
            dispatchers.push(dispatcher);
        }
        *self.io_dispatchers.lock().expect("dispatcher list poisoned") = dispatchers.clone();

        self.pool.start()?;
        for dispatcher in &dispatchers {
            let runner = dispatcher.clone();
            self.pool.add_task(Task::new(move || {
                runner.run_event_loop();
                0
            }))?;
        }

        log::info!(
            target: "server",
            "Listening on {} with {} I/O worker(s)", self.local, dispatchers.len()
        );
        self.acceptor_dispatcher.run_event_loop();
        Ok(())
    }

    /// Thread-safe, idempotent shutdown: drops every connection, stops the
    /// I/O dispatchers and the acceptor loop, then joins the pool workers.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!(target: "server", "Shutting down");

        let drained: Vec<_> = self
            .connections
            .lock()
            .expect("connection map poisoned")
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        // Each drop closes its channel on the owning dispatcher thread via
        // the routed remove-then-close sequence.
        drop(drained);

        for dispatcher in self.io_dispatchers.lock().expect("dispatcher list poisoned").iter() {
            dispatcher.stop();
        }
        self.acceptor_dispatcher.stop();
        self.pool.stop();
        log::info!(target: "server", "Shutdown complete");
    }

    pub fn set_new_connection_callback(
        &self,
        f: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) {
        self.callbacks.write().expect("server callbacks poisoned").new_connection =
            Some(Arc::new(f));
    }

    pub fn set_close_callback(&self, f: impl Fn(&Arc<Connection>) + Send + Sync + 'static) {
        self.callbacks.write().expect("server callbacks poisoned").close_connection =
            Some(Arc::new(f));
    }

    pub fn set_error_callback(&self, f: impl Fn(&Arc<Connection>) + Send + Sync + 'static) {
        self.callbacks.write().expect("server callbacks poisoned").error = Some(Arc::new(f));
    }

    /// Handler for every accumulated ingress batch. The handler may reply
    /// via [`Connection::send`] directly: on the connection's own loop
    /// thread the send is inlined, from a compute-pool thread it reroutes
    /// through the dispatcher's task queue.
    pub fn set_message_callback(
        &self,
        f: impl Fn(&Arc<Connection>, &mut Vec<u8>) + Send + Sync + 'static,
    ) {
        self.callbacks.write().expect("server callbacks poisoned").message = Some(Arc::new(f));
    }

    pub fn set_send_complete_callback(
        &self,
        f: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) {
        self.callbacks.write().expect("server callbacks poisoned").send_complete =
            Some(Arc::new(f));
    }

    /// Fires on every zero-event poll wakeup of each I/O dispatcher.
    pub fn set_timer_callback(&self, f: impl Fn(&Arc<Dispatcher>) + Send + Sync + 'static) {
        self.callbacks.write().expect("server callbacks poisoned").timer = Some(Arc::new(f));
    }

    /// Acceptor hook: builds the connection, pins it to `fd mod N`, wires
    /// the server-side hooks and publishes it in the connection map.
    fn on_new_connection(&self, socket: Socket) {
        let dispatcher = {
            let dispatchers = self.io_dispatchers.lock().expect("dispatcher list poisoned");
            if dispatchers.is_empty() {
                log::warn!(target: "server", "Connection before start(); dropping");
                return;
            }
            let fd = socket.fd();
            dispatchers[fd as usize % dispatchers.len()].clone()
        };

        let fd = socket.fd();
        let peer = socket.peer_addr();
        let conn = Connection::new(dispatcher.clone(), socket);

        let weak = self.weak_self.clone();
        conn.set_close_callback(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.handle_close_connection(conn);
            }
        });
        let weak = self.weak_self.clone();
        conn.set_error_callback(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.handle_error_connection(conn);
            }
        });
        let weak = self.weak_self.clone();
        conn.set_message_callback(move |conn, bytes| {
            if let Some(server) = weak.upgrade() {
                server.handle_message(conn, bytes);
            }
        });
        let weak = self.weak_self.clone();
        conn.set_send_complete_callback(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.handle_send_complete(conn);
            }
        });

        conn.register_callbacks();
        dispatcher.add_connection(&conn);
        self.connections
            .lock()
            .expect("connection map poisoned")
            .insert(fd, conn.clone());
        log::debug!(target: "server", "New connection fd {fd} from {peer:?}");

        let callback = self
            .callbacks
            .read()
            .expect("server callbacks poisoned")
            .new_connection
            .clone();
        if let Some(callback) = callback {
            callback(&conn);
        }
    }

    fn handle_close_connection(&self, conn: &Arc<Connection>) {
        let callback = self
            .callbacks
            .read()
            .expect("server callbacks poisoned")
            .close_connection
            .clone();
        if let Some(callback) = callback {
            callback(conn);
        }
        log::debug!(target: "server", "Connection fd {} disconnected", conn.fd());
        self.connections
            .lock()
            .expect("connection map poisoned")
            .remove(&conn.fd());
    }

    fn handle_error_connection(&self, conn: &Arc<Connection>) {
        let callback = self.callbacks.read().expect("server callbacks poisoned").error.clone();
        if let Some(callback) = callback {
            callback(conn);
        }
        log::debug!(target: "server", "Connection fd {} errored", conn.fd());
        self.connections
            .lock()
            .expect("connection map poisoned")
            .remove(&conn.fd());
    }

    fn handle_message(&self, conn: &Arc<Connection>, bytes: &mut Vec<u8>) {
        let callback = self.callbacks.read().expect("server callbacks poisoned").message.clone();
        if let Some(callback) = callback {
            callback(conn, bytes);
        }
    }

    fn handle_send_complete(&self, conn: &Arc<Connection>) {
        let callback = self
            .callbacks
            .read()
            .expect("server callbacks poisoned")
            .send_complete
            .clone();
        if let Some(callback) = callback {
            callback(conn);
        }
    }

    fn handle_tick(&self, dispatcher: &Arc<Dispatcher>) {
        let callback = self.callbacks.read().expect("server callbacks poisoned").timer.clone();
        if let Some(callback) = callback {
            callback(dispatcher);
        }
    }

    /// Idle-timer hook: drops the connection from the map; the drop closes
    /// channel and descriptor on the owning dispatcher thread.
    fn remove_connection(&self, fd: RawFd) {
        let removed = self
            .connections
            .lock()
            .expect("connection map poisoned")
            .remove(&fd);
        if let Some(conn) = removed {
            log::debug!(
                target: "server",
                "Evicting idle connection fd {fd} (peer {:?})", conn.peer_addr()
            );
        }
    }
}
