use std::any::Any;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use log::trace;

use crate::event_loop::LoopHandle;
use crate::poller;

pub(crate) const NONE_EVENT: u32 = 0;
pub(crate) const READ_EVENT: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
pub(crate) const WRITE_EVENT: u32 = libc::EPOLLOUT as u32;

type ReadCallback = Box<dyn FnMut(SystemTime) + Send>;
type EventCallback = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct Handlers {
    read: Option<ReadCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

/// Binds one file descriptor to an interest-event mask and four event
/// callbacks, and dispatches poller-reported readiness to them.
///
/// A channel never owns its fd; the owner (acceptor, connection, event
/// loop) keeps the fd alive for at least as long as the channel is
/// registered. A channel belongs to exactly one [`EventLoop`] and its
/// interest mask and dispatch are only ever touched from that loop's
/// thread.
///
/// When the owner is itself kept alive by shared ownership, [`tie`] stores
/// a weak back-reference that [`handle_event`] upgrades before dispatching;
/// an event that fires after the owner was dropped is silently discarded.
///
/// [`EventLoop`]: crate::EventLoop
/// [`tie`]: Channel::tie
/// [`handle_event`]: Channel::handle_event
pub struct Channel {
    owner: LoopHandle,
    fd: RawFd,
    events: AtomicU32,
    revents: AtomicU32,
    // Registration bookkeeping owned by the poller.
    poller_state: AtomicI32,
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    handlers: Mutex<Handlers>,
}

impl Channel {
    /// Creates an unregistered channel for `fd` owned by `owner`.
    pub fn new(owner: LoopHandle, fd: RawFd) -> Arc<Channel> {
        Arc::new(Channel {
            owner,
            fd,
            events: AtomicU32::new(NONE_EVENT),
            revents: AtomicU32::new(NONE_EVENT),
            poller_state: AtomicI32::new(poller::CHANNEL_NEW),
            tie: Mutex::new(None),
            handlers: Mutex::new(Handlers::default()),
        })
    }

    /// The file descriptor this channel watches.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The current interest mask, in `poll(2)`-compatible bits.
    pub fn events(&self) -> u32 {
        self.events.load(Ordering::Relaxed)
    }

    /// Records the returned-events mask for the next
    /// [`handle_event`](Channel::handle_event); called by the poller.
    pub fn set_revents(&self, revents: u32) {
        self.revents.store(revents, Ordering::Relaxed);
    }

    /// Whether the interest mask is empty.
    pub fn is_none_event(&self) -> bool {
        self.events() == NONE_EVENT
    }

    /// Whether read-readiness is currently of interest.
    pub fn is_reading(&self) -> bool {
        self.events() & READ_EVENT != 0
    }

    /// Whether write-readiness is currently of interest.
    pub fn is_writing(&self) -> bool {
        self.events() & WRITE_EVENT != 0
    }

    /// The poller's registration bookkeeping for this channel; one of the
    /// [`CHANNEL_NEW`](crate::CHANNEL_NEW) family of states.
    pub fn poller_state(&self) -> i32 {
        self.poller_state.load(Ordering::Relaxed)
    }

    /// Updates the registration bookkeeping; called by the poller.
    pub fn set_poller_state(&self, state: i32) {
        self.poller_state.store(state, Ordering::Relaxed);
    }

    /// The loop this channel belongs to.
    pub fn owner_loop(&self) -> &LoopHandle {
        &self.owner
    }

    /// Installs the read callback, invoked with the poll return time.
    pub fn set_read_callback(&self, cb: impl FnMut(SystemTime) + Send + 'static) {
        self.handlers.lock().unwrap().read = Some(Box::new(cb));
    }

    /// Installs the write-readiness callback.
    pub fn set_write_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.handlers.lock().unwrap().write = Some(Box::new(cb));
    }

    /// Installs the close callback.
    pub fn set_close_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.handlers.lock().unwrap().close = Some(Box::new(cb));
    }

    /// Installs the error callback.
    pub fn set_error_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.handlers.lock().unwrap().error = Some(Box::new(cb));
    }

    /// Ties this channel to the shared owner behind its callbacks.
    ///
    /// [`handle_event`](Channel::handle_event) upgrades the weak reference
    /// before dispatching and drops the event when the upgrade fails, so a
    /// readiness report that was already in flight while the owner was
    /// being destroyed never reaches a dangling callback.
    pub fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        *self.tie.lock().unwrap() = Some(Arc::downgrade(owner));
    }

    /// Adds read interest and pushes the change to the poller.
    pub fn enable_reading(self: &Arc<Self>) {
        self.events.fetch_or(READ_EVENT, Ordering::Relaxed);
        self.update();
    }

    /// Drops read interest and pushes the change to the poller.
    pub fn disable_reading(self: &Arc<Self>) {
        self.events.fetch_and(!READ_EVENT, Ordering::Relaxed);
        self.update();
    }

    /// Adds write interest and pushes the change to the poller.
    pub fn enable_writing(self: &Arc<Self>) {
        self.events.fetch_or(WRITE_EVENT, Ordering::Relaxed);
        self.update();
    }

    /// Drops write interest and pushes the change to the poller.
    pub fn disable_writing(self: &Arc<Self>) {
        self.events.fetch_and(!WRITE_EVENT, Ordering::Relaxed);
        self.update();
    }

    /// Clears the whole interest mask; required before
    /// [`remove`](Channel::remove).
    pub fn disable_all(self: &Arc<Self>) {
        self.events.store(NONE_EVENT, Ordering::Relaxed);
        self.update();
    }

    fn update(self: &Arc<Self>) {
        self.owner.update_channel(self);
    }

    /// Unregisters this channel from the owning loop's poller. The channel
    /// must be disabled ([`disable_all`](Channel::disable_all)) first.
    pub fn remove(self: &Arc<Self>) {
        self.owner.remove_channel(self);
    }

    /// Dispatches the readiness reported by the last poll.
    pub fn handle_event(&self, receive_time: SystemTime) {
        let tie = self.tie.lock().unwrap().clone();
        let _guard: Option<Arc<dyn Any + Send + Sync>> = match tie {
            Some(weak) => match weak.upgrade() {
                Some(owner) => Some(owner),
                // Owner already destroyed; drop the event.
                None => return,
            },
            None => None,
        };
        self.handle_event_with_guard(receive_time);
    }

    fn handle_event_with_guard(&self, receive_time: SystemTime) {
        let revents = self.revents.load(Ordering::Relaxed);
        trace!("channel fd={} handling revents {:#x}", self.fd, revents);

        // A hangup with nothing left to read is a close; a hangup with
        // pending input is delivered through the read path first so the
        // last bytes still reach the application.
        if revents & libc::EPOLLHUP as u32 != 0 && revents & libc::EPOLLIN as u32 == 0 {
            self.run_close();
        }
        if revents & libc::EPOLLERR as u32 != 0 {
            self.run_error();
        }
        if revents & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0 {
            self.run_read(receive_time);
        }
        if revents & libc::EPOLLOUT as u32 != 0 {
            self.run_write();
        }
    }

    // Callbacks are taken out of the slot for the duration of the call so
    // they can re-enter the channel (enable/disable/tie) without holding
    // the handlers lock.
    fn run_read(&self, receive_time: SystemTime) {
        let taken = self.handlers.lock().unwrap().read.take();
        if let Some(mut cb) = taken {
            cb(receive_time);
            let mut handlers = self.handlers.lock().unwrap();
            if handlers.read.is_none() {
                handlers.read = Some(cb);
            }
        }
    }

    fn run_write(&self) {
        let taken = self.handlers.lock().unwrap().write.take();
        if let Some(mut cb) = taken {
            cb();
            let mut handlers = self.handlers.lock().unwrap();
            if handlers.write.is_none() {
                handlers.write = Some(cb);
            }
        }
    }

    fn run_close(&self) {
        let taken = self.handlers.lock().unwrap().close.take();
        if let Some(mut cb) = taken {
            cb();
            let mut handlers = self.handlers.lock().unwrap();
            if handlers.close.is_none() {
                handlers.close = Some(cb);
            }
        }
    }

    fn run_error(&self) {
        let taken = self.handlers.lock().unwrap().error.take();
        if let Some(mut cb) = taken {
            cb();
            let mut handlers = self.handlers.lock().unwrap();
            if handlers.error.is_none() {
                handlers.error = Some(cb);
            }
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("events", &self.events())
            .field("revents", &self.revents.load(Ordering::Relaxed))
            .field("poller_state", &self.poller_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicBool;

    use crate::event_loop::EventLoop;

    #[test]
    fn tied_channel_drops_event_after_owner_is_gone() {
        let event_loop = EventLoop::new().unwrap();
        let channel = Channel::new(event_loop.handle(), -1);

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        channel.set_read_callback(move |_| flag.store(true, Ordering::SeqCst));

        let owner: Arc<dyn Any + Send + Sync> = Arc::new(0u32);
        channel.tie(&owner);
        drop(owner);

        channel.set_revents(READ_EVENT);
        channel.handle_event(SystemTime::now());
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn tied_channel_dispatches_while_owner_lives() {
        let event_loop = EventLoop::new().unwrap();
        let channel = Channel::new(event_loop.handle(), -1);

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        channel.set_read_callback(move |_| flag.store(true, Ordering::SeqCst));

        let owner: Arc<dyn Any + Send + Sync> = Arc::new(0u32);
        channel.tie(&owner);

        channel.set_revents(READ_EVENT);
        channel.handle_event(SystemTime::now());
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn dispatch_order_is_close_error_read_write() {
        let event_loop = EventLoop::new().unwrap();
        let channel = Channel::new(event_loop.handle(), -1);

        let order = Arc::new(Mutex::new(Vec::new()));
        let recorder = order.clone();
        channel.set_close_callback(move || recorder.lock().unwrap().push("close"));
        let recorder = order.clone();
        channel.set_error_callback(move || recorder.lock().unwrap().push("error"));
        let recorder = order.clone();
        channel.set_read_callback(move |_| recorder.lock().unwrap().push("read"));
        let recorder = order.clone();
        channel.set_write_callback(move || recorder.lock().unwrap().push("write"));

        channel.set_revents((libc::EPOLLHUP | libc::EPOLLERR | libc::EPOLLOUT) as u32);
        channel.handle_event(SystemTime::now());
        assert_eq!(*order.lock().unwrap(), ["close", "error", "write"]);

        // Pending input holds the close back so the read path can deliver
        // the last bytes first.
        order.lock().unwrap().clear();
        channel.set_revents((libc::EPOLLHUP | libc::EPOLLIN) as u32);
        channel.handle_event(SystemTime::now());
        assert_eq!(*order.lock().unwrap(), ["read"]);
    }

    #[test]
    fn callbacks_may_reenter_the_channel() {
        let event_loop = EventLoop::new().unwrap();
        let channel = Channel::new(event_loop.handle(), -1);

        let inner = channel.clone();
        channel.set_read_callback(move |_| {
            assert!(!inner.is_writing());
        });

        channel.set_revents(READ_EVENT);
        channel.handle_event(SystemTime::now());
    }

    #[test]
    fn interest_mask_toggles() {
        let event_loop = EventLoop::new().unwrap();
        let channel = Channel::new(event_loop.handle(), -1);
        assert!(channel.is_none_event());

        // Mask arithmetic without poller registration.
        channel.events.fetch_or(READ_EVENT, Ordering::Relaxed);
        assert!(channel.is_reading());
        assert!(!channel.is_writing());

        channel.events.fetch_or(WRITE_EVENT, Ordering::Relaxed);
        assert!(channel.is_writing());

        channel.events.fetch_and(!WRITE_EVENT, Ordering::Relaxed);
        assert!(channel.is_reading());
        assert!(!channel.is_writing());
    }
}
