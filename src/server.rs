use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use log::{error, info};

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::callbacks::{
    ConnectionCallback, MessageCallback, TcpConnectionRef, ThreadInitCallback,
    WriteCompleteCallback,
};
use crate::connection::TcpConnection;
use crate::event_loop::LoopHandle;
use crate::sys::Socket;
use crate::thread_pool::EventLoopThreadPool;

/// Whether the listening socket sets `SO_REUSEPORT`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ServerOption {
    /// Bind exclusively.
    NoReusePort,
    /// Allow other sockets to bind the same address and port.
    ReusePort,
}

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    thread_init: Option<ThreadInitCallback>,
}

struct ServerInner {
    base: LoopHandle,
    name: String,
    ip_port: String,
    local_addr: SocketAddr,
    acceptor: Mutex<Acceptor>,
    pool: Mutex<EventLoopThreadPool>,
    callbacks: Mutex<Callbacks>,
    started: AtomicUsize,
    next_conn_id: AtomicU64,
    connections: Mutex<HashMap<String, TcpConnectionRef>>,
}

/// The public façade of the framework.
///
/// A `TcpServer` accepts connections on the base loop and distributes each
/// one round-robin to a pool of worker loops; from then on all reads,
/// writes and close handling for that connection happen on its worker.
///
/// Configure the callbacks and thread count, then [`start`] the server and
/// run the base loop. The base loop, `start` and drop must all happen on
/// the thread that created the base loop.
///
/// # Examples
///
/// An echo server:
///
/// ```no_run
/// use muxio::{EventLoop, ServerOption, TcpServer};
///
/// # fn main() -> std::io::Result<()> {
/// let mut base = EventLoop::new()?;
/// let server = TcpServer::new(
///     &base.handle(),
///     "127.0.0.1:7000".parse().unwrap(),
///     "echo",
///     ServerOption::NoReusePort,
/// )?;
/// server.set_thread_num(4);
/// server.set_message_callback(|conn, buffer, _receive_time| {
///     let bytes = buffer.retrieve_all_as_bytes();
///     conn.send(&bytes);
/// });
/// server.start();
/// base.run();
/// # Ok(())
/// # }
/// ```
///
/// [`start`]: TcpServer::start
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

impl TcpServer {
    /// Creates the server and binds its listening socket to `listen_addr`.
    ///
    /// Binding happens eagerly so bootstrap failures (bad address, port in
    /// use) surface here rather than inside the loop.
    pub fn new(
        base: &LoopHandle,
        listen_addr: SocketAddr,
        name: &str,
        option: ServerOption,
    ) -> io::Result<TcpServer> {
        let acceptor = Acceptor::new(
            base.clone(),
            listen_addr,
            option == ServerOption::ReusePort,
        )?;
        let local_addr = acceptor.local_addr();

        let inner = Arc::new(ServerInner {
            base: base.clone(),
            name: name.to_string(),
            ip_port: local_addr.to_string(),
            local_addr,
            acceptor: Mutex::new(acceptor),
            pool: Mutex::new(EventLoopThreadPool::new(base.clone(), name)),
            callbacks: Mutex::new(Callbacks::default()),
            started: AtomicUsize::new(0),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .acceptor
            .lock()
            .unwrap()
            .set_new_connection_callback(move |socket, peer_addr| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(socket, peer_addr);
                }
            });

        Ok(TcpServer { inner })
    }

    /// The server name, as used in connection names and logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The listen address as text, as used in connection names.
    pub fn ip_port(&self) -> &str {
        &self.inner.ip_port
    }

    /// The resolved listen address (real port when bound to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Number of currently tracked connections.
    pub fn num_connections(&self) -> usize {
        self.inner.connections.lock().unwrap().len()
    }

    /// Sets the number of worker loops; 0 keeps everything on the base
    /// loop. Must be called before [`start`](TcpServer::start).
    pub fn set_thread_num(&self, num_threads: usize) {
        self.inner.pool.lock().unwrap().set_thread_num(num_threads);
    }

    /// Callback fired on connection establish and close.
    pub fn set_connection_callback(
        &self,
        cb: impl Fn(&TcpConnectionRef) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().unwrap().connection = Some(Arc::new(cb));
    }

    /// Callback fired when bytes arrive in a connection's input buffer.
    pub fn set_message_callback(
        &self,
        cb: impl Fn(&TcpConnectionRef, &mut Buffer, SystemTime) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().unwrap().message = Some(Arc::new(cb));
    }

    /// Callback fired when a connection's output buffer drains to empty.
    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&TcpConnectionRef) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().unwrap().write_complete = Some(Arc::new(cb));
    }

    /// Callback fired once in every pool thread as its loop comes up.
    pub fn set_thread_init_callback(
        &self,
        cb: impl Fn(&LoopHandle) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().unwrap().thread_init = Some(Arc::new(cb));
    }

    /// Starts the worker pool and schedules the listen on the base loop.
    /// Idempotent; only the first call does anything.
    pub fn start(&self) {
        if self.inner.started.fetch_add(1, Ordering::AcqRel) == 0 {
            let init = self.inner.callbacks.lock().unwrap().thread_init.clone();
            self.inner.pool.lock().unwrap().start(init);

            info!(
                "TcpServer [{}] starts listening on {}",
                self.inner.name, self.inner.ip_port
            );
            let inner = self.inner.clone();
            self.inner
                .base
                .run_in_loop(move || inner.acceptor.lock().unwrap().listen());
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let connections: Vec<TcpConnectionRef> = {
            let mut table = self.inner.connections.lock().unwrap();
            table.drain().map(|(_, conn)| conn).collect()
        };
        // Destruction runs on each connection's worker so it serialises
        // after any dispatch currently executing there.
        for conn in connections {
            let owned = conn.clone();
            conn.owner_loop()
                .run_in_loop(move || owned.connect_destroyed());
        }
    }
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServer")
            .field("name", &self.inner.name)
            .field("ip_port", &self.inner.ip_port)
            .finish()
    }
}

impl ServerInner {
    /// Runs on the base loop whenever the acceptor hands over a socket.
    fn new_connection(self: &Arc<Self>, socket: Socket, peer_addr: SocketAddr) {
        self.base.assert_in_loop_thread();

        let io_loop = self.pool.lock().unwrap().get_next_loop();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, conn_id);
        info!(
            "TcpServer::new_connection [{}] - new connection [{}] from {}",
            self.name, conn_name, peer_addr
        );

        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                error!("getsockname for [{}] failed: {}", conn_name, err);
                self.local_addr
            }
        };

        let conn = TcpConnection::new(io_loop, conn_name.clone(), socket, local_addr, peer_addr);
        {
            let callbacks = self.callbacks.lock().unwrap();
            if let Some(cb) = callbacks.connection.clone() {
                conn.set_connection_callback(cb);
            }
            if let Some(cb) = callbacks.message.clone() {
                conn.set_message_callback(cb);
            }
            if let Some(cb) = callbacks.write_complete.clone() {
                conn.set_write_complete_callback(cb);
            }
        }
        let weak: Weak<ServerInner> = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |conn: &TcpConnectionRef| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        self.connections
            .lock()
            .unwrap()
            .insert(conn_name, conn.clone());

        let established = conn.clone();
        conn.owner_loop()
            .run_in_loop(move || established.connect_established());
    }

    /// Invoked on a worker thread out of `handle_close`; bounces to the
    /// base loop which owns the connection table.
    fn remove_connection(self: &Arc<Self>, conn: &TcpConnectionRef) {
        let server = self.clone();
        let conn = conn.clone();
        self.base
            .run_in_loop(move || server.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(self: &Arc<Self>, conn: &TcpConnectionRef) {
        self.base.assert_in_loop_thread();
        info!(
            "TcpServer::remove_connection_in_loop [{}] - connection [{}]",
            self.name,
            conn.name()
        );
        self.connections.lock().unwrap().remove(conn.name());

        // Queued, never run inline: the destroy task must stay behind the
        // event dispatch that triggered the close.
        let owned = conn.clone();
        conn.owner_loop()
            .queue_in_loop(move || owned.connect_destroyed());
    }
}
