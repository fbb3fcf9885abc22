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

//! End-to-end scenarios driving a real echo server over loopback TCP with
//! the bundled synchronous client.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use netreactor::{Address, Client, Server, ServerConfig};

const REPLY_PREFIX: &[u8] = b"[Server Reply]: ";

struct EchoServer {
    server: Arc<Server>,
    runner: Option<JoinHandle<()>>,
}

impl EchoServer {
    /// Binds to an ephemeral loopback port, installs the echo handler and
    /// runs the acceptor loop on a background thread.
    fn launch(configure: impl FnOnce(&mut ServerConfig)) -> EchoServer {
        let mut config = ServerConfig::new(Address::new(Ipv4Addr::LOCALHOST, 0));
        configure(&mut config);
        let server = Server::bind(config).expect("server must bind");
        server.set_message_callback(|conn, bytes| {
            let mut reply = REPLY_PREFIX.to_vec();
            reply.extend_from_slice(bytes);
            conn.send(&reply);
        });
        let runner = {
            let server = server.clone();
            thread::spawn(move || server.start().expect("server must start"))
        };
        EchoServer {
            server,
            runner: Some(runner),
        }
    }

    fn addr(&self) -> Address { self.server.local_addr() }

    fn shutdown(mut self) -> Duration {
        let started = Instant::now();
        self.server.stop();
        let elapsed = started.elapsed();
        if let Some(runner) = self.runner.take() {
            runner.join().expect("server thread must exit cleanly");
        }
        elapsed
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.server.stop();
        if let Some(runner) = self.runner.take() {
            let _ = runner.join();
        }
    }
}

fn echo_once(addr: Address, payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut client = Client::connect(addr)?;
    client.set_timeout(Some(Duration::from_secs(5)))?;
    client.send_raw(payload)?;
    client.recv_reply()
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}

#[test]
fn single_echo_roundtrip() {
    let server = EchoServer::launch(|_| {});

    let reply = echo_once(server.addr(), b"TestMessage").expect("echo must succeed");
    assert_eq!(reply.len(), 27);
    assert_eq!(&reply[..REPLY_PREFIX.len()], REPLY_PREFIX);
    assert_eq!(&reply[REPLY_PREFIX.len()..], b"TestMessage");

    server.shutdown();
}

#[test]
fn burst_of_simultaneous_clients_all_get_echoed() {
    let server = EchoServer::launch(|_| {});
    let addr = server.addr();

    let handles: Vec<_> = (0..10)
        .map(|i| {
            thread::spawn(move || {
                let payload = format!("Client{i}");
                let reply = echo_once(addr, payload.as_bytes())?;
                let mut expected = REPLY_PREFIX.to_vec();
                expected.extend_from_slice(payload.as_bytes());
                assert_eq!(reply, expected);
                Ok::<(), std::io::Error>(())
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("client thread").expect("client echo");
    }

    server.shutdown();
}

#[test]
fn rapid_connect_disconnect_is_handled_cleanly() {
    let server = EchoServer::launch(|_| {});
    let closes = Arc::new(AtomicUsize::new(0));
    {
        let closes = closes.clone();
        server.server.set_close_callback(move |_| {
            closes.fetch_add(1, Ordering::SeqCst);
        });
    }
    let addr = server.addr();

    for _ in 0..50 {
        let client = Client::connect(addr).expect("connect must succeed");
        drop(client);
    }

    // At least 80 % of the disconnects must surface as clean closes, and
    // the map must drain completely.
    assert!(
        wait_until(Duration::from_secs(5), || closes.load(Ordering::SeqCst) >= 40),
        "only {} clean closes observed",
        closes.load(Ordering::SeqCst)
    );
    assert!(wait_until(Duration::from_secs(5), || {
        server.server.connection_count() == 0
    }));

    // The server must still be fully functional afterwards.
    let reply = echo_once(addr, b"still-alive").expect("echo after churn");
    assert_eq!(&reply[REPLY_PREFIX.len()..], b"still-alive");

    server.shutdown();
}

#[test]
fn silent_connection_is_evicted_by_idle_timer() {
    let server = EchoServer::launch(|config| {
        config.timer_interval = Duration::from_secs(1);
        config.connection_timeout = Duration::from_secs(2);
    });

    let mut client = Client::connect(server.addr()).expect("connect must succeed");
    client
        .set_timeout(Some(Duration::from_secs(10)))
        .expect("timeout must apply");

    // Stay silent; the server must close us. A blocked recv observing the
    // eviction returns 0 bytes.
    let mut buf = [0u8; 16];
    let n = client.recv_raw(&mut buf).expect("recv must observe server close");
    assert_eq!(n, 0);

    assert!(wait_until(Duration::from_secs(2), || {
        server.server.connection_count() == 0
    }));

    server.shutdown();
}

#[test]
fn hundred_concurrent_clients_mostly_succeed() {
    let server = EchoServer::launch(|_| {});
    let addr = server.addr();
    let successes = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..100)
        .map(|i| {
            let successes = successes.clone();
            thread::spawn(move || {
                let payload = format!("Stress{i}");
                if let Ok(reply) = echo_once(addr, payload.as_bytes()) {
                    if reply.ends_with(payload.as_bytes()) {
                        successes.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("client thread");
    }

    let ok = successes.load(Ordering::SeqCst);
    assert!(ok >= 95, "only {ok}/100 clients succeeded");

    // New connections are still accepted after the burst.
    let reply = echo_once(addr, b"after-stress").expect("echo after stress");
    assert_eq!(&reply[REPLY_PREFIX.len()..], b"after-stress");

    server.shutdown();
}

#[test]
fn stop_under_load_returns_quickly_and_joins_workers() {
    let server = EchoServer::launch(|_| {});
    let addr = server.addr();

    // 30 clients mid-flight: connected, some with data on the wire.
    let mut clients = Vec::new();
    for i in 0..30 {
        let mut client = Client::connect(addr).expect("connect must succeed");
        if i % 2 == 0 {
            let _ = client.send_raw(b"in-flight");
        }
        clients.push(client);
    }
    thread::sleep(Duration::from_millis(100));

    // `shutdown` joins the acceptor thread, which in turn only exits after
    // the pool workers were joined inside `Server::stop`.
    let elapsed = server.shutdown();
    assert!(
        elapsed < Duration::from_secs(2),
        "stop() took {elapsed:?}"
    );
    drop(clients);
}
