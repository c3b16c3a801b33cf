use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

use log::{debug, error};

use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::sys::{self, Socket};

// Matches the kernel's usual somaxconn ceiling.
const LISTEN_BACKLOG: libc::c_int = 1024;

type NewConnectionCallback = Box<dyn FnMut(Socket, SocketAddr) + Send>;

/// Owns the listening socket on the base loop and ingests new connections.
///
/// Construction creates a non-blocking close-on-exec socket and binds it;
/// [`listen`](Acceptor::listen) arms the accept channel. Each readiness
/// report accepts one connection and hands `(socket, peer address)` to the
/// new-connection callback; without a callback installed the accepted fd is
/// closed again on the spot.
pub(crate) struct Acceptor {
    channel: Arc<Channel>,
    socket: Socket,
    local_addr: SocketAddr,
    new_connection_callback: Arc<Mutex<Option<NewConnectionCallback>>>,
    listening: bool,
}

impl Acceptor {
    pub(crate) fn new(
        owner: LoopHandle,
        listen_addr: SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Acceptor> {
        let socket = Socket::new_stream(&listen_addr)?;
        socket.set_reuse_address(true)?;
        socket.set_reuse_port(reuse_port)?;
        socket.bind(listen_addr)?;
        let local_addr = socket.local_addr()?;

        let channel = Channel::new(owner, socket.as_raw_fd());
        let new_connection_callback: Arc<Mutex<Option<NewConnectionCallback>>> =
            Arc::new(Mutex::new(None));

        let listen_fd = socket.as_raw_fd();
        let callback = new_connection_callback.clone();
        channel.set_read_callback(move |_receive_time| {
            Acceptor::handle_read(listen_fd, &callback);
        });

        debug!("acceptor bound to {}", local_addr);
        Ok(Acceptor {
            channel,
            socket,
            local_addr,
            new_connection_callback,
            listening: false,
        })
    }

    pub(crate) fn set_new_connection_callback(
        &mut self,
        cb: impl FnMut(Socket, SocketAddr) + Send + 'static,
    ) {
        *self.new_connection_callback.lock().unwrap() = Some(Box::new(cb));
    }

    /// The bound address, with the real port when bound to port 0.
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Issues `listen(2)` and starts reacting to incoming connections.
    /// Base-loop thread only.
    pub(crate) fn listen(&mut self) {
        self.channel.owner_loop().assert_in_loop_thread();
        if self.listening {
            return;
        }
        if let Err(err) = self.socket.listen(LISTEN_BACKLOG) {
            error!("listen on {} failed: {}", self.local_addr, err);
            panic!("Acceptor::listen on {}: {}", self.local_addr, err);
        }
        self.listening = true;
        self.channel.enable_reading();
        debug!("acceptor listening on {}", self.local_addr);
    }

    fn handle_read(listen_fd: RawFd, callback: &Arc<Mutex<Option<NewConnectionCallback>>>) {
        match sys::accept(listen_fd) {
            Ok((socket, peer_addr)) => {
                let mut slot = callback.lock().unwrap();
                match slot.as_mut() {
                    Some(cb) => cb(socket, peer_addr),
                    // No receiver; drop (close) the fd.
                    None => drop(socket),
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                error!("accept failed: {}", err);
                if err.raw_os_error() == Some(libc::EMFILE) {
                    error!("accept hit the process fd limit");
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
    }
}
