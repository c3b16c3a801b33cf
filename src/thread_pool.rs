use std::fmt;
use std::sync::mpsc;
use std::thread;

use log::debug;

use crate::callbacks::ThreadInitCallback;
use crate::event_loop::{EventLoop, LoopHandle};

/// A thread hosting exactly one [`EventLoop`].
///
/// [`start`](EventLoopThread::start) blocks until the worker has created
/// its loop and published a handle. Dropping quits the loop and joins the
/// thread.
pub struct EventLoopThread {
    thread: Option<thread::JoinHandle<()>>,
    loop_handle: Option<LoopHandle>,
}

impl EventLoopThread {
    /// Creates the holder; nothing runs until
    /// [`start`](EventLoopThread::start).
    pub fn new() -> EventLoopThread {
        EventLoopThread {
            thread: None,
            loop_handle: None,
        }
    }

    /// Spawns the worker thread and returns its loop handle once the loop
    /// exists. `init` runs on the worker, before the loop starts.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to spawn the thread or the worker dies
    /// before publishing its loop.
    pub fn start(&mut self, name: String, init: Option<ThreadInitCallback>) -> LoopHandle {
        assert!(self.thread.is_none());

        let (tx, rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let mut event_loop =
                    EventLoop::new().expect("failed to create worker event loop");
                if let Some(init) = init {
                    init(&event_loop.handle());
                }
                tx.send(event_loop.handle())
                    .expect("event loop starter went away");
                event_loop.run();
            })
            .expect("failed to spawn event loop thread");

        let loop_handle = rx
            .recv()
            .expect("worker thread died before publishing its event loop");
        self.thread = Some(thread);
        self.loop_handle = Some(loop_handle.clone());
        loop_handle
    }
}

impl Default for EventLoopThread {
    fn default() -> EventLoopThread {
        EventLoopThread::new()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(loop_handle) = &self.loop_handle {
            loop_handle.quit();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl fmt::Debug for EventLoopThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopThread")
            .field("started", &self.thread.is_some())
            .finish()
    }
}

/// The worker reactors behind a [`TcpServer`](crate::TcpServer).
///
/// With zero threads the pool degenerates to the base loop and everything
/// stays single-threaded. Round-robin selection state is only touched on
/// the base loop's thread.
pub struct EventLoopThreadPool {
    base: LoopHandle,
    name: String,
    started: bool,
    num_threads: usize,
    next: usize,
    threads: Vec<EventLoopThread>,
    loops: Vec<LoopHandle>,
}

impl EventLoopThreadPool {
    /// Creates an empty pool owned by `base`.
    pub fn new(base: LoopHandle, name: &str) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base,
            name: name.to_string(),
            started: false,
            num_threads: 0,
            next: 0,
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    /// Sets the number of worker threads; only meaningful before
    /// [`start`](EventLoopThreadPool::start).
    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    /// Spawns the workers. In single-threaded mode the init callback runs
    /// for the base loop instead.
    pub fn start(&mut self, init: Option<ThreadInitCallback>) {
        assert!(!self.started);
        self.base.assert_in_loop_thread();
        self.started = true;

        for i in 0..self.num_threads {
            let mut worker = EventLoopThread::new();
            let loop_handle = worker.start(format!("{}{}", self.name, i), init.clone());
            self.threads.push(worker);
            self.loops.push(loop_handle);
        }
        debug!("pool {} started {} worker loops", self.name, self.num_threads);

        if self.num_threads == 0 {
            if let Some(init) = init {
                init(&self.base);
            }
        }
    }

    /// Picks the next worker loop round-robin; the base loop when the pool
    /// has no workers. Base-loop thread only.
    pub fn get_next_loop(&mut self) -> LoopHandle {
        self.base.assert_in_loop_thread();
        if self.loops.is_empty() {
            return self.base.clone();
        }
        let loop_handle = self.loops[self.next].clone();
        self.next = (self.next + 1) % self.loops.len();
        loop_handle
    }

    /// All worker loops; just the base loop when the pool has none.
    pub fn get_all_loops(&self) -> Vec<LoopHandle> {
        if self.loops.is_empty() {
            vec![self.base.clone()]
        } else {
            self.loops.clone()
        }
    }

    /// Whether [`start`](EventLoopThreadPool::start) already ran.
    pub fn started(&self) -> bool {
        self.started
    }

    /// The pool name used as the worker thread name prefix.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for EventLoopThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopThreadPool")
            .field("name", &self.name)
            .field("started", &self.started)
            .field("num_threads", &self.num_threads)
            .finish()
    }
}
