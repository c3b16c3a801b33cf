use std::cell::Cell;
use std::fmt;
use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use log::{error, info, trace};

use crate::channel::Channel;
use crate::poller::{self, Poller};
use crate::sys::Waker;

/// How long one poll may block before the loop comes up for air.
const POLL_TIME_MS: i32 = 10_000;

type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static LOOP_IN_THREAD: Cell<bool> = Cell::new(false);
}

struct Inner {
    thread_id: ThreadId,
    // Loop-thread only; guarded by assert_in_loop_thread.
    poller: Mutex<Box<dyn Poller>>,
    waker: Waker,
    pending_tasks: Mutex<Vec<Task>>,
    quit: AtomicBool,
    looping: AtomicBool,
    calling_pending_tasks: AtomicBool,
}

/// A thread-pinned reactor: one poller, one wakeup fd, one queue of
/// cross-thread tasks.
///
/// At most one `EventLoop` may exist per thread, and almost all of its
/// operations must run on the thread that created it — the loop panics on
/// violations rather than racing. The only thread-safe surface is the
/// cloneable [`LoopHandle`]: [`run_in_loop`], [`queue_in_loop`], [`wakeup`]
/// and [`quit`].
///
/// Each pass of [`run`] blocks on the poller, dispatches every ready
/// channel, then drains the pending-task queue. A foreign thread posting a
/// task writes one word to the loop's eventfd, which is registered on the
/// loop's own poller, so the poll returns promptly.
///
/// An `EventLoop` must be dropped on its own thread.
///
/// [`run`]: EventLoop::run
/// [`run_in_loop`]: LoopHandle::run_in_loop
/// [`queue_in_loop`]: LoopHandle::queue_in_loop
/// [`wakeup`]: LoopHandle::wakeup
/// [`quit`]: LoopHandle::quit
pub struct EventLoop {
    inner: Arc<Inner>,
    wakeup_channel: Arc<Channel>,
}

/// Cloneable, thread-safe handle to an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    inner: Arc<Inner>,
}

impl EventLoop {
    /// Creates the loop for the current thread with the default poller.
    ///
    /// # Panics
    ///
    /// Panics if this thread already hosts an `EventLoop`.
    pub fn new() -> io::Result<EventLoop> {
        let poller = poller::new_default_poller()?;
        EventLoop::with_poller(poller)
    }

    /// Creates the loop for the current thread with a caller-supplied
    /// multiplexer backend.
    pub fn with_poller(poller: Box<dyn Poller>) -> io::Result<EventLoop> {
        LOOP_IN_THREAD.with(|exists| {
            if exists.get() {
                panic!(
                    "another EventLoop already exists on thread {:?}",
                    thread::current().id()
                );
            }
            exists.set(true);
        });

        let inner = Arc::new(Inner {
            thread_id: thread::current().id(),
            poller: Mutex::new(poller),
            waker: Waker::new()?,
            pending_tasks: Mutex::new(Vec::new()),
            quit: AtomicBool::new(false),
            looping: AtomicBool::new(false),
            calling_pending_tasks: AtomicBool::new(false),
        });

        let wakeup_channel = Channel::new(LoopHandle::new(&inner), inner.waker.as_raw_fd());
        let weak = Arc::downgrade(&inner);
        wakeup_channel.set_read_callback(move |_receive_time| {
            if let Some(inner) = weak.upgrade() {
                inner.waker.drain();
            }
        });
        wakeup_channel.enable_reading();

        trace!(
            "event loop created on {:?}, wakeup fd={}",
            inner.thread_id,
            wakeup_channel.fd()
        );
        Ok(EventLoop {
            inner,
            wakeup_channel,
        })
    }

    /// Returns a thread-safe handle to this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle::new(&self.inner)
    }

    /// Runs the loop until [`quit`](LoopHandle::quit): poll, dispatch ready
    /// channels, drain pending tasks, repeat.
    ///
    /// # Panics
    ///
    /// Panics when called from a thread other than the one that created
    /// the loop.
    pub fn run(&mut self) {
        self.inner.assert_in_loop_thread();
        assert!(!self.inner.looping.load(Ordering::Acquire));
        self.inner.looping.store(true, Ordering::Release);
        info!("event loop on {:?} start looping", self.inner.thread_id);

        let mut active_channels: Vec<Arc<Channel>> = Vec::new();
        while !self.inner.quit.load(Ordering::Acquire) {
            active_channels.clear();
            let receive_time = self
                .inner
                .poller
                .lock()
                .unwrap()
                .poll(POLL_TIME_MS, &mut active_channels);
            for channel in &active_channels {
                channel.handle_event(receive_time);
            }
            self.inner.run_pending_tasks();
        }

        info!("event loop on {:?} stop looping", self.inner.thread_id);
        self.inner.looping.store(false, Ordering::Release);
    }

    /// See [`LoopHandle::run_in_loop`].
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.run_in_loop(task);
    }

    /// See [`LoopHandle::queue_in_loop`].
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.queue_in_loop(Box::new(task));
    }

    /// See [`LoopHandle::quit`].
    pub fn quit(&self) {
        self.inner.quit();
    }

    /// Whether the caller is on this loop's thread.
    pub fn is_in_loop_thread(&self) -> bool {
        self.inner.is_in_loop_thread()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.wakeup_channel.disable_all();
        self.wakeup_channel.remove();
        LOOP_IN_THREAD.with(|exists| exists.set(false));
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread_id", &self.inner.thread_id)
            .field("looping", &self.inner.looping.load(Ordering::Relaxed))
            .finish()
    }
}

impl LoopHandle {
    fn new(inner: &Arc<Inner>) -> LoopHandle {
        LoopHandle {
            inner: inner.clone(),
        }
    }

    /// Runs `task` synchronously when called on the owning thread,
    /// otherwise queues it onto the loop.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.run_in_loop(task);
    }

    /// Queues `task` for the end of the current (or next) loop iteration
    /// and wakes the loop when the caller is foreign or the loop is
    /// already mid-drain. Tasks run in FIFO order.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.queue_in_loop(Box::new(task));
    }

    /// Forces the loop out of its poll by writing to its eventfd.
    pub fn wakeup(&self) {
        self.inner.wakeup();
    }

    /// Makes the loop stop after the iteration in progress; wakes it when
    /// called from a foreign thread.
    pub fn quit(&self) {
        self.inner.quit();
    }

    /// Whether the caller is on the owning thread.
    pub fn is_in_loop_thread(&self) -> bool {
        self.inner.is_in_loop_thread()
    }

    /// Panics unless called on the owning thread.
    pub fn assert_in_loop_thread(&self) {
        self.inner.assert_in_loop_thread();
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.inner.assert_in_loop_thread();
        self.inner.poller.lock().unwrap().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        self.inner.assert_in_loop_thread();
        self.inner.poller.lock().unwrap().remove_channel(channel);
    }

    /// Whether `channel` is registered with this loop's poller. Owning
    /// thread only.
    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.inner.assert_in_loop_thread();
        self.inner.poller.lock().unwrap().has_channel(channel)
    }
}

impl PartialEq for LoopHandle {
    fn eq(&self, other: &LoopHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for LoopHandle {}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("thread_id", &self.inner.thread_id)
            .finish()
    }
}

impl Inner {
    fn is_in_loop_thread(&self) -> bool {
        self.thread_id == thread::current().id()
    }

    fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "EventLoop owned by {:?} was touched from {:?}",
                self.thread_id,
                thread::current().id()
            );
        }
    }

    fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(Box::new(task));
        }
    }

    fn queue_in_loop(&self, task: Task) {
        self.pending_tasks.lock().unwrap().push(task);
        // A task posted mid-drain would otherwise sit a full poll timeout
        // away; the posting loop thread wakes itself too.
        if !self.is_in_loop_thread() || self.calling_pending_tasks.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    fn wakeup(&self) {
        if let Err(err) = self.waker.wake() {
            error!("failed to wake event loop on {:?}: {}", self.thread_id, err);
        }
    }

    fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    fn run_pending_tasks(&self) {
        self.calling_pending_tasks.store(true, Ordering::Release);
        // Swap the queue out and run with the lock released: a task is free
        // to queue further tasks without deadlocking, and they are seen by
        // a later iteration.
        let tasks = {
            let mut pending = self.pending_tasks.lock().unwrap();
            mem::take(&mut *pending)
        };
        let count = tasks.len();
        for task in tasks {
            task();
        }
        if count > 0 {
            trace!("ran {} pending tasks on {:?}", count, self.thread_id);
        }
        self.calling_pending_tasks.store(false, Ordering::Release);
    }
}
