//! The readiness multiplexer behind an [`EventLoop`].
//!
//! [`Poller`] is the seam between the loop and the kernel: the epoll
//! backend is the default on Linux, and an alternative backend (`poll(2)`,
//! kqueue) plugs in behind the same four operations.
//!
//! [`EventLoop`]: crate::EventLoop

use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use crate::channel::Channel;

mod epoll;

pub use self::epoll::EpollPoller;

// Poller-side registration states stored on the channel.

/// The channel has never been registered with the poller.
pub const CHANNEL_NEW: i32 = -1;
/// The channel is registered and attached to the kernel.
pub const CHANNEL_ADDED: i32 = 1;
/// The channel is in the table but detached from the kernel (its interest
/// mask went empty).
pub const CHANNEL_DELETED: i32 = 2;

/// A level-triggered readiness multiplexer over registered [`Channel`]s.
///
/// Every method is called from the owning loop's thread only; the loop
/// enforces this before forwarding.
pub trait Poller: Send {
    /// Blocks for up to `timeout_ms` milliseconds and appends every channel
    /// with ready events to `active_channels`, with its returned-events
    /// mask set. Returns the wall-clock time the wait returned.
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<Arc<Channel>>) -> SystemTime;

    /// Registers a new channel or applies an interest-mask change of an
    /// already registered one. A registered channel whose interest mask
    /// became empty is detached from the kernel but keeps its table entry.
    fn update_channel(&mut self, channel: &Arc<Channel>);

    /// Drops a channel from the table (and the kernel, when still
    /// attached).
    fn remove_channel(&mut self, channel: &Arc<Channel>);

    /// Whether `channel` is the one registered under its fd.
    fn has_channel(&self, channel: &Arc<Channel>) -> bool;
}

/// The default backend for this platform.
pub(crate) fn new_default_poller() -> io::Result<Box<dyn Poller>> {
    EpollPoller::new().map(|poller| Box::new(poller) as Box<dyn Poller>)
}
