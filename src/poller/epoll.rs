use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::SystemTime;

use log::{error, trace};

use crate::channel::Channel;
use crate::poller::{Poller, CHANNEL_ADDED, CHANNEL_DELETED, CHANNEL_NEW};
use crate::sys::syscall;

const INIT_EVENT_LIST_SIZE: usize = 16;

/// [`Poller`] backed by Linux `epoll(7)`, registering level-triggered.
///
/// The kernel-side token is the raw fd; readiness reports are resolved back
/// to channels through the registration table.
pub struct EpollPoller {
    ep: OwnedFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl EpollPoller {
    /// Creates the epoll instance.
    pub fn new() -> io::Result<EpollPoller> {
        let ep = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(EpollPoller {
            // SAFETY: `epoll_create1(2)` returned a valid fd.
            ep: unsafe { OwnedFd::from_raw_fd(ep) },
            events: Vec::with_capacity(INIT_EVENT_LIST_SIZE),
            channels: HashMap::new(),
        })
    }

    fn fill_active_channels(&self, active_channels: &mut Vec<Arc<Channel>>) {
        for event in &self.events {
            let fd = event.u64 as RawFd;
            if let Some(channel) = self.channels.get(&fd) {
                channel.set_revents(event.events);
                active_channels.push(channel.clone());
            }
        }
    }

    fn ctl(&self, op: libc::c_int, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let mut event = libc::epoll_event {
            events: channel.events(),
            u64: fd as u64,
        };
        if let Err(err) = syscall!(epoll_ctl(self.ep.as_raw_fd(), op, fd, &mut event)) {
            if op == libc::EPOLL_CTL_DEL {
                // The kernel may already have dropped the fd.
                error!("epoll_ctl DEL fd={} failed: {}", fd, err);
            } else {
                error!("epoll_ctl op={} fd={} failed: {}", op, fd, err);
                panic!("EpollPoller: epoll_ctl op={} fd={}: {}", op, fd, err);
            }
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<Arc<Channel>>) -> SystemTime {
        trace!("polling {} registered fds", self.channels.len());

        self.events.clear();
        let res = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            self.events.as_mut_ptr(),
            self.events.capacity() as libc::c_int,
            timeout_ms,
        ));
        let now = SystemTime::now();

        match res {
            Ok(num_events) => {
                let num_events = num_events as usize;
                // SAFETY: `epoll_wait` initialised `num_events` entries.
                unsafe { self.events.set_len(num_events) };
                if num_events > 0 {
                    trace!("{} events happened", num_events);
                    self.fill_active_channels(active_channels);
                    if num_events == self.events.capacity() {
                        self.events.reserve(self.events.capacity());
                    }
                }
            }
            Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => {}
            Err(err) => {
                error!("epoll_wait failed: {}", err);
                panic!("EpollPoller::poll: {}", err);
            }
        }
        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let state = channel.poller_state();
        trace!(
            "update channel fd={} events={:#x} state={}",
            channel.fd(),
            channel.events(),
            state
        );
        if state == CHANNEL_NEW || state == CHANNEL_DELETED {
            if state == CHANNEL_NEW {
                self.channels.insert(channel.fd(), channel.clone());
            }
            channel.set_poller_state(CHANNEL_ADDED);
            self.ctl(libc::EPOLL_CTL_ADD, channel);
        } else if channel.is_none_event() {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
            channel.set_poller_state(CHANNEL_DELETED);
        } else {
            self.ctl(libc::EPOLL_CTL_MOD, channel);
        }
    }

    fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        trace!("remove channel fd={}", fd);
        debug_assert!(channel.is_none_event());
        self.channels.remove(&fd);
        if channel.poller_state() == CHANNEL_ADDED {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_poller_state(CHANNEL_NEW);
    }

    fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels
            .get(&channel.fd())
            .map_or(false, |registered| Arc::ptr_eq(registered, channel))
    }
}

impl fmt::Debug for EpollPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpollPoller")
            .field("ep", &self.ep)
            .field("channels", &self.channels.len())
            .finish()
    }
}
