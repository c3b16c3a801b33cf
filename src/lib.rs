//! Multi-reactor non-blocking TCP server framework.
//!
//! Muxio serves TCP connections with a pool of thread-pinned event loops:
//! the base [`EventLoop`] owns the listening socket and accepts, each new
//! connection is handed round-robin to a worker loop, and from then on all
//! reads, writes and close handling for that connection run on the worker
//! that owns it. Application code registers connection, message,
//! write-complete and high-water-mark callbacks on a [`TcpServer`]; the
//! framework moves bytes through per-connection [`Buffer`]s.
//!
//! Readiness is level-triggered `epoll(7)`; Linux and Android are the
//! supported targets. Alternative multiplexer backends can be plugged in
//! through the [`Poller`] trait.
//!
//! # Threading model
//!
//! One loop per thread, no work stealing: a connection is pinned to its
//! worker for life, so per-connection state needs no synchronisation
//! beyond what the framework provides. Callbacks run inline on the owning
//! loop's thread and must not block; hand blocking work to your own
//! executor and come back with [`TcpConnection::send`], which is safe from
//! any thread.
//!
//! # Examples
//!
//! A four-worker echo server:
//!
//! ```no_run
//! use muxio::{EventLoop, ServerOption, TcpServer};
//!
//! # fn main() -> std::io::Result<()> {
//! let mut base = EventLoop::new()?;
//! let server = TcpServer::new(
//!     &base.handle(),
//!     "127.0.0.1:7000".parse().unwrap(),
//!     "echo",
//!     ServerOption::NoReusePort,
//! )?;
//! server.set_thread_num(4);
//! server.set_connection_callback(|conn| {
//!     println!(
//!         "{} -> {} is {}",
//!         conn.peer_addr(),
//!         conn.local_addr(),
//!         if conn.connected() { "up" } else { "down" },
//!     );
//! });
//! server.set_message_callback(|conn, buffer, _receive_time| {
//!     let bytes = buffer.retrieve_all_as_bytes();
//!     conn.send(&bytes);
//! });
//! server.start();
//! base.run();
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports,
    dead_code
)]

mod acceptor;
mod buffer;
mod callbacks;
mod channel;
mod connection;
mod event_loop;
mod poller;
mod server;
mod sys;
mod thread_pool;

pub use buffer::Buffer;
pub use callbacks::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnectionRef,
    ThreadInitCallback, WriteCompleteCallback,
};
pub use channel::Channel;
pub use connection::TcpConnection;
pub use event_loop::{EventLoop, LoopHandle};
pub use poller::{EpollPoller, Poller, CHANNEL_ADDED, CHANNEL_DELETED, CHANNEL_NEW};
pub use server::{ServerOption, TcpServer};
pub use thread_pool::{EventLoopThread, EventLoopThreadPool};
