//! Callback signatures shared between [`TcpServer`](crate::TcpServer) and
//! [`TcpConnection`](crate::TcpConnection).
//!
//! Callbacks are reference-counted so the server can hand one user closure
//! to every connection it creates. They all run inline on a reactor thread
//! and must not block.

use std::sync::Arc;
use std::time::SystemTime;

use crate::buffer::Buffer;
use crate::connection::TcpConnection;
use crate::event_loop::LoopHandle;

/// Shared handle to a connection, as passed to every callback.
pub type TcpConnectionRef = Arc<TcpConnection>;

/// Fired on establish and on close; distinguish with
/// [`connected`](TcpConnection::connected).
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;

/// Fired when bytes arrived in the input buffer; the handler drains
/// whatever it consumes.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionRef, &mut Buffer, SystemTime) + Send + Sync>;

/// Fired when the output buffer drained to empty after having been
/// non-empty.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;

/// Fired with the output-buffer size on the transition from below to
/// at/above the high-water mark.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionRef, usize) + Send + Sync>;

/// Framework-internal close notification (the server's removal trampoline).
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;

/// Fired once in each pool thread right after its loop is created.
pub type ThreadInitCallback = Arc<dyn Fn(&LoopHandle) + Send + Sync>;
