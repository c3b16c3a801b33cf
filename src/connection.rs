use std::any::Any;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use log::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    WriteCompleteCallback,
};
use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::sys::{self, Socket};

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            3 => State::Disconnected,
            _ => unreachable!("invalid connection state {}", value),
        }
    }
}

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

/// One accepted TCP connection, pinned to a worker loop for life.
///
/// The connection is handed to application callbacks as a shared
/// [`TcpConnectionRef`] handle; the handle itself keeps the connection
/// alive through any in-flight dispatch, while the channel only holds a
/// weak back-reference, so a readiness event that fires during teardown is
/// dropped instead of reaching freed state.
///
/// All I/O and state transitions happen on the owning loop's thread.
/// [`send`] and [`shutdown`] may be called from any thread; they hop onto
/// the owning loop when needed.
///
/// The state machine runs forward only:
///
/// ```text
/// Connecting -> Connected -> Disconnecting -> Disconnected
///                    \___________________________/
/// ```
///
/// [`TcpConnectionRef`]: crate::TcpConnectionRef
/// [`send`]: TcpConnection::send
/// [`shutdown`]: TcpConnection::shutdown
pub struct TcpConnection {
    owner: LoopHandle,
    name: String,
    state: AtomicU8,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    callbacks: Mutex<Callbacks>,
}

impl TcpConnection {
    pub(crate) fn new(
        owner: LoopHandle,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<TcpConnection> {
        if let Err(err) = socket.set_keepalive(true) {
            warn!("SO_KEEPALIVE on [{}] failed: {}", name, err);
        }
        let fd = socket.as_raw_fd();

        let conn = Arc::new_cyclic(|conn: &Weak<TcpConnection>| {
            let channel = Channel::new(owner.clone(), fd);

            let weak = conn.clone();
            channel.set_read_callback(move |receive_time| {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read(receive_time);
                }
            });
            let weak = conn.clone();
            channel.set_write_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            });
            let weak = conn.clone();
            channel.set_close_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            });
            let weak = conn.clone();
            channel.set_error_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_error();
                }
            });

            TcpConnection {
                owner,
                name,
                state: AtomicU8::new(State::Connecting as u8),
                socket,
                channel,
                local_addr,
                peer_addr,
                input_buffer: Mutex::new(Buffer::new()),
                output_buffer: Mutex::new(Buffer::new()),
                high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
                callbacks: Mutex::new(Callbacks::default()),
            }
        });
        debug!("TcpConnection::new [{}] fd={}", conn.name, fd);
        conn
    }

    /// The server-assigned connection name, unique per server instance.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The local address of the accepted socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The peer's address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The worker loop this connection lives on.
    pub fn owner_loop(&self) -> &LoopHandle {
        &self.owner
    }

    /// Whether the connection is currently established.
    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    /// Whether the output side still has buffered bytes in flight.
    pub fn is_writing(&self) -> bool {
        self.channel.is_writing()
    }

    /// Enables or disables Nagle's algorithm.
    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(err) = self.socket.set_nodelay(on) {
            error!("TCP_NODELAY on [{}] failed: {}", self.name, err);
        }
    }

    /// Installs the backpressure callback and its threshold in bytes.
    pub fn set_high_water_mark_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>, usize) + Send + Sync + 'static,
        high_water_mark: usize,
    ) {
        self.callbacks.lock().unwrap().high_water_mark = Some(Arc::new(cb));
        self.high_water_mark
            .store(high_water_mark, Ordering::Relaxed);
    }

    pub(crate) fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().unwrap().connection = Some(cb);
    }

    pub(crate) fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().unwrap().message = Some(cb);
    }

    pub(crate) fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.callbacks.lock().unwrap().write_complete = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        self.callbacks.lock().unwrap().close = Some(cb);
    }

    /// Sends `data`, from any thread.
    ///
    /// On the owning loop the bytes are written (or buffered) immediately;
    /// from a foreign thread an owned copy is queued onto the owning loop.
    /// Data sent while not connected is dropped.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }
        if self.owner.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.clone();
            let data = data.to_vec();
            self.owner.run_in_loop(move || conn.send_in_loop(&data));
        }
    }

    /// Closes the write half once the output buffer has drained.
    ///
    /// With bytes still in flight the connection parks in `Disconnecting`
    /// and the write-readiness path issues the `shutdown(2)` after the last
    /// byte left.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == State::Connected {
            self.set_state(State::Disconnecting);
            let conn = self.clone();
            self.owner.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    /// Actively closes both halves, without waiting for pending output.
    pub fn force_close(self: &Arc<Self>) {
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.set_state(State::Disconnecting);
            let conn = self.clone();
            self.owner.queue_in_loop(move || conn.force_close_in_loop());
        }
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Completes establishment on the owning loop: ties the channel, arms
    /// reading and delivers the first connection callback.
    pub(crate) fn connect_established(self: &Arc<Self>) {
        self.owner.assert_in_loop_thread();
        assert_eq!(self.state(), State::Connecting);
        self.set_state(State::Connected);

        let tie: Arc<dyn Any + Send + Sync> = self.clone();
        self.channel.tie(&tie);
        self.channel.enable_reading();

        let cb = self.callbacks.lock().unwrap().connection.clone();
        if let Some(cb) = cb {
            cb(self);
        }
    }

    /// Final teardown, scheduled by the server after removal from its
    /// table. Idempotent; also covers connections that never saw
    /// `handle_close` (server drop with live connections).
    pub(crate) fn connect_destroyed(self: &Arc<Self>) {
        self.owner.assert_in_loop_thread();
        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            self.channel.disable_all();
            let cb = self.callbacks.lock().unwrap().connection.clone();
            if let Some(cb) = cb {
                cb(self);
            }
        }
        self.channel.remove();
    }

    fn handle_read(self: &Arc<Self>, receive_time: SystemTime) {
        self.owner.assert_in_loop_thread();
        let mut input = self.input_buffer.lock().unwrap();
        match input.read_fd(self.channel.fd()) {
            // EOF from the peer.
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(_n) => {
                let cb = self.callbacks.lock().unwrap().message.clone();
                if let Some(cb) = cb {
                    cb(self, &mut *input, receive_time);
                }
            }
            Err(ref err) if is_benign(err) => {}
            Err(err) => {
                drop(input);
                error!("TcpConnection::handle_read [{}]: {}", self.name, err);
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.owner.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!("connection [{}] is down, no more writing", self.name);
            return;
        }
        let mut output = self.output_buffer.lock().unwrap();
        match output.write_fd(self.channel.fd()) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    // Stop write-readiness from spinning on an empty buffer.
                    self.channel.disable_writing();
                    let cb = self.callbacks.lock().unwrap().write_complete.clone();
                    if let Some(cb) = cb {
                        let conn = self.clone();
                        self.owner.queue_in_loop(move || cb(&conn));
                    }
                    if self.state() == State::Disconnecting {
                        drop(output);
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(ref err) if is_benign(err) => {}
            Err(err) => error!("TcpConnection::handle_write [{}]: {}", self.name, err),
        }
    }

    fn handle_close(self: &Arc<Self>) {
        self.owner.assert_in_loop_thread();
        debug!(
            "TcpConnection::handle_close [{}] state={:?}",
            self.name,
            self.state()
        );
        assert!(matches!(
            self.state(),
            State::Connected | State::Disconnecting
        ));
        self.set_state(State::Disconnected);
        self.channel.disable_all();

        let (connection_cb, close_cb) = {
            let callbacks = self.callbacks.lock().unwrap();
            (callbacks.connection.clone(), callbacks.close.clone())
        };
        if let Some(cb) = connection_cb {
            cb(self);
        }
        // The server's removal trampoline.
        if let Some(cb) = close_cb {
            cb(self);
        }
    }

    fn handle_error(&self) {
        let err = match self.socket.take_error() {
            Ok(Some(err)) => err,
            Ok(None) => return,
            Err(err) => err,
        };
        error!("TcpConnection::handle_error [{}]: SO_ERROR={}", self.name, err);
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.owner.assert_in_loop_thread();
        if self.state() == State::Disconnected {
            warn!("TcpConnection::send_in_loop [{}]: disconnected, give up writing", self.name);
            return;
        }

        let mut wrote = 0;
        let mut remaining = data.len();
        let mut fault = false;
        let mut output = self.output_buffer.lock().unwrap();

        // Nothing queued and not yet interested in write-readiness: try the
        // socket directly before falling back to the buffer.
        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            match sys::write(self.channel.fd(), data) {
                Ok(n) => {
                    wrote = n;
                    remaining = data.len() - n;
                    if remaining == 0 {
                        let cb = self.callbacks.lock().unwrap().write_complete.clone();
                        if let Some(cb) = cb {
                            let conn = self.clone();
                            self.owner.queue_in_loop(move || cb(&conn));
                        }
                    }
                }
                Err(err) => {
                    if !is_benign(&err) {
                        error!("TcpConnection::send_in_loop [{}]: {}", self.name, err);
                        if matches!(
                            err.raw_os_error(),
                            Some(libc::EPIPE) | Some(libc::ECONNRESET)
                        ) {
                            // The close surfaces through the next readiness
                            // report; don't buffer onto a dead socket.
                            fault = true;
                        }
                    }
                }
            }
        }

        if !fault && remaining > 0 {
            let queued = output.readable_bytes();
            let high_water_mark = self.high_water_mark.load(Ordering::Relaxed);
            if queued + remaining >= high_water_mark && queued < high_water_mark {
                let cb = self.callbacks.lock().unwrap().high_water_mark.clone();
                if let Some(cb) = cb {
                    let conn = self.clone();
                    let size = queued + remaining;
                    self.owner.queue_in_loop(move || cb(&conn, size));
                }
            }
            output.append(&data[wrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn shutdown_in_loop(&self) {
        self.owner.assert_in_loop_thread();
        if !self.channel.is_writing() {
            if let Err(err) = self.socket.shutdown_write() {
                error!("TcpConnection::shutdown_in_loop [{}]: {}", self.name, err);
            }
        }
    }

    fn force_close_in_loop(self: &Arc<Self>) {
        self.owner.assert_in_loop_thread();
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.handle_close();
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(
            "TcpConnection::drop [{}] fd={} state={:?}",
            self.name,
            self.socket.as_raw_fd(),
            self.state()
        );
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

fn is_benign(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
