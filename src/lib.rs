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

//! Multi-reactor TCP server framework.
//!
//! The crate implements the one-acceptor / N-I/O-workers / M-task-workers
//! pattern on top of the platform readiness APIs (epoll on Linux, kqueue
//! elsewhere). A [`Server`] runs one [`Dispatcher`] event loop for accepting
//! connections on the calling thread and a fixed set of I/O dispatchers on a
//! [`ThreadPool`]; every accepted connection is pinned to one I/O dispatcher
//! for its whole life and all its channel mutations are routed through that
//! dispatcher's task queue.
//!
//! Applications register callbacks on the [`Server`] and talk to clients
//! through [`Connection`] handles:
//!
//! ```no_run
//! use netreactor::{Address, Server, ServerConfig};
//!
//! let config = ServerConfig::new(Address::new([127, 0, 0, 1].into(), 8888));
//! let server = Server::bind(config).unwrap();
//! server.set_message_callback(|conn, bytes| {
//!     let mut reply = b"[Server Reply]: ".to_vec();
//!     reply.extend_from_slice(bytes);
//!     conn.send(&reply);
//! });
//! server.start().unwrap(); // blocks until `server.stop()`
//! ```
//!
//! Ingress bytes are delivered raw; replies sent through
//! [`Connection::send`] are framed with a 4-byte native-endian length
//! header which the bundled [`Client`] knows how to read.

#[macro_use]
extern crate amplify;

mod addr;
mod buffer;
mod timestamp;
mod socket;
mod waker;
pub mod poller;
mod channel;
mod dispatcher;
mod connection;
mod acceptor;
mod pool;
mod server;
mod client;

use std::io;

pub use acceptor::{AcceptCallback, Acceptor};
pub use addr::Address;
pub use buffer::Buffer;
pub use channel::{Channel, EventCallback};
pub use client::Client;
pub use connection::{Connection, ConnectionCallback, MessageCallback};
pub use dispatcher::{Dispatcher, ExpireCallback, TickCallback};
pub use poller::{Events, Poller};
pub use pool::{Task, TaskError, ThreadPool};
pub use server::{Server, ServerConfig};
pub use socket::Socket;
pub use timestamp::TimeStamp;

/// Read-chunk size used when draining a readable socket, and the largest
/// reply payload the bundled [`Client`] accepts.
pub const MAX_BUFFER_SIZE: usize = 1024;

/// Maximum number of readiness events collected per poll wakeup.
pub const MAX_EVENT_NUMS: usize = 1000;

/// Listen backlog; the kernel accept queue scales past `FD_SETSIZE` on the
/// supported poller backends.
pub const MAX_CONNECTIONS: i32 = 10000;

/// Startup failures. Everything here is fatal for the component being
/// constructed; recoverable per-connection errors stay [`io::Error`] and are
/// handled where they occur.
#[derive(Debug, Display, Error)]
#[display(doc_comments)]
pub enum Error {
    /// creating the listener socket failed. Details: {0:?}
    SocketCreate(io::Error),

    /// binding the listener socket failed. Details: {0:?}
    Bind(io::Error),

    /// listening on the bound socket failed. Details: {0:?}
    Listen(io::Error),

    /// creating the readiness poller failed. Details: {0:?}
    PollerCreate(io::Error),

    /// creating the wake descriptor failed. Details: {0:?}
    WakerCreate(io::Error),

    /// creating the idle-timer descriptor failed. Details: {0:?}
    TimerCreate(io::Error),

    /// the worker pool cannot start without workers
    NoWorkers,

    /// the worker pool is already running
    PoolRunning,

    /// the worker pool is not running
    PoolStopped,
}
