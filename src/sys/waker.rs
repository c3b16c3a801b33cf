use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::warn;

use crate::sys::syscall;

/// Cross-thread wakeup primitive backed by `eventfd`.
///
/// `eventfd` is effectively a 64 bit counter. All writes must be of 8 bytes
/// (64 bits) and are converted (native endian) into a 64 bit unsigned
/// integer and added to the count. Reads must also be 8 bytes and reset the
/// count to 0, returning the count.
#[derive(Debug)]
pub(crate) struct Waker {
    fd: OwnedFd,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        Ok(Waker {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match syscall!(write(
            self.fd.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
        )) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Writing only blocks if the counter is going to overflow,
                // so reset it to 0 and wake again.
                self.drain();
                self.wake()
            }
            Err(err) => Err(err),
        }
    }

    /// Reset the counter to 0. Called from the owning loop when the wakeup
    /// channel reports readable.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 8];
        match syscall!(read(
            self.fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )) {
            Ok(n) if n as usize == buf.len() => {}
            Ok(n) => warn!("waker drained {} bytes instead of 8", n),
            // Not woken yet; nothing to drain.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => warn!("waker drain failed: {}", err),
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_then_drain() {
        let waker = Waker::new().unwrap();
        waker.wake().unwrap();
        waker.wake().unwrap();
        waker.drain();
        // Counter is back at zero; a second drain sees nothing.
        waker.drain();
    }
}
