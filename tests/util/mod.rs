// Not all helpers are used by all tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use muxio::{EventLoop, LoopHandle, ServerOption, TcpServer};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// A `TcpServer` running its base loop on a dedicated thread.
///
/// The server object is shared with the test body (its inspection methods
/// are thread-safe); the last strong reference is always dropped by the
/// base-loop thread, which is where a server must be torn down.
pub struct ServerHarness {
    pub addr: SocketAddr,
    pub server: Option<Arc<TcpServer>>,
    base: LoopHandle,
    thread: Option<thread::JoinHandle<()>>,
}

/// Starts a server with `num_threads` workers on an ephemeral port,
/// letting `configure` install the test's callbacks before `start()`.
pub fn start_server<F>(num_threads: usize, configure: F) -> ServerHarness
where
    F: FnOnce(&TcpServer) + Send + 'static,
{
    init();

    let (tx, rx) = mpsc::channel();
    let thread = thread::Builder::new()
        .name("base-loop".to_string())
        .spawn(move || {
            let mut base = EventLoop::new().unwrap();
            let server = TcpServer::new(
                &base.handle(),
                "127.0.0.1:0".parse().unwrap(),
                "test",
                ServerOption::NoReusePort,
            )
            .unwrap();
            server.set_thread_num(num_threads);
            configure(&server);
            server.start();

            let server = Arc::new(server);
            tx.send((server.local_addr(), base.handle(), server.clone()))
                .unwrap();
            base.run();
            // The base thread holds the last reference; the server tears
            // down here, on its own thread.
            drop(server);
        })
        .unwrap();

    let (addr, base, server) = rx.recv().unwrap();
    ServerHarness {
        addr,
        server: Some(server),
        base,
        thread: Some(thread),
    }
}

impl ServerHarness {
    pub fn server(&self) -> &TcpServer {
        self.server.as_ref().unwrap()
    }
}

impl Drop for ServerHarness {
    fn drop(&mut self) {
        // Release our reference before quitting so the base thread's drop
        // is the final one.
        drop(self.server.take());
        self.base.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Spins until `predicate` holds, panicking after five seconds.
pub fn await_condition(what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}

/// Spins until `counter` reaches `expected`.
pub fn await_count(what: &str, counter: &Arc<AtomicUsize>, expected: usize) {
    await_condition(what, || counter.load(Ordering::SeqCst) == expected);
}
