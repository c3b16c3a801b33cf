use std::io;
use std::os::fd::RawFd;

use crate::sys::syscall;

/// Growable byte buffer decoupling kernel I/O sizing from user consumption.
///
/// The underlying storage is split into three regions by two indices:
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// |                   |    (CONTENT)     |                  |
/// +-------------------+------------------+------------------+
/// |                   |                  |                  |
/// 0      <=      reader_index   <=   writer_index   <=    size
/// ```
///
/// A new buffer reserves [`Buffer::CHEAP_PREPEND`] bytes in front of the
/// content so a small length or type header can be [prepended] later
/// without copying the body.
///
/// Network input is pulled in with [`read_fd`], which reads into the
/// writable region plus a 64 KiB stack scratch in a single vectored read,
/// so cold connections don't pay for large pre-grown buffers while one
/// call can still move up to `writable + 65536` bytes.
///
/// [prepended]: Buffer::prepend
/// [`read_fd`]: Buffer::read_fd
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Buffer {
    /// Space reserved in front of the content for a cheap prepend.
    pub const CHEAP_PREPEND: usize = 8;
    /// Initial size of the content area.
    pub const INITIAL_SIZE: usize = 1024;

    /// Creates a buffer with the default initial size.
    pub fn new() -> Buffer {
        Buffer::with_capacity(Buffer::INITIAL_SIZE)
    }

    /// Creates a buffer whose content area starts at `initial_size` bytes.
    pub fn with_capacity(initial_size: usize) -> Buffer {
        Buffer {
            buf: vec![0; Buffer::CHEAP_PREPEND + initial_size],
            reader_index: Buffer::CHEAP_PREPEND,
            writer_index: Buffer::CHEAP_PREPEND,
        }
    }

    /// Number of bytes available to read.
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    /// Number of bytes that can be appended without growing.
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    /// Number of bytes in front of the content (at least
    /// [`Buffer::CHEAP_PREPEND`] right after a full retrieve).
    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// Borrows the readable region without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Consumes `len` readable bytes. Consuming everything resets both
    /// indices to the front so the prepend headroom is restored.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Consumes the whole readable region.
    pub fn retrieve_all(&mut self) {
        self.reader_index = Buffer::CHEAP_PREPEND;
        self.writer_index = Buffer::CHEAP_PREPEND;
    }

    /// Consumes and returns `len` readable bytes.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds [`readable_bytes`](Buffer::readable_bytes).
    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_bytes());
        let bytes = self.peek()[..len].to_vec();
        self.retrieve(len);
        bytes
    }

    /// Consumes and returns the entire readable region.
    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        self.retrieve_as_bytes(self.readable_bytes())
    }

    /// Makes room for at least `len` writable bytes, sliding the content
    /// forward instead of reallocating when the already-consumed front
    /// region is large enough.
    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    /// Appends `data` after the readable region, growing if needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        self.buf[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    /// Writes `data` immediately in front of the readable region.
    ///
    /// # Panics
    ///
    /// Panics if `data` exceeds
    /// [`prependable_bytes`](Buffer::prependable_bytes).
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader_index -= data.len();
        self.buf[self.reader_index..self.reader_index + data.len()].copy_from_slice(data);
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + Buffer::CHEAP_PREPEND {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            // Slide the readable bytes back to the front and re-anchor.
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader_index..self.writer_index, Buffer::CHEAP_PREPEND);
            self.reader_index = Buffer::CHEAP_PREPEND;
            self.writer_index = self.reader_index + readable;
        }
    }

    /// Reads from `fd` into the buffer with a single vectored read.
    ///
    /// The first iovec points at the writable region, the second at a
    /// 65,536-byte stack scratch; whatever lands in the scratch is appended
    /// afterwards. Returns the total byte count from `readv(2)`; `Ok(0)`
    /// means EOF.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extrabuf = [0u8; 65536];
        let writable = self.writable_bytes();

        let mut iovs = [
            libc::iovec {
                iov_base: unsafe { self.buf.as_mut_ptr().add(self.writer_index) }
                    as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extrabuf.as_mut_ptr() as *mut libc::c_void,
                iov_len: extrabuf.len(),
            },
        ];
        // When there is enough space in this buffer, don't read into the
        // scratch at all.
        let iovcnt: libc::c_int = if writable < extrabuf.len() { 2 } else { 1 };

        let n = syscall!(readv(fd, iovs.as_mut_ptr(), iovcnt))? as usize;
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extrabuf[..n - writable]);
        }
        Ok(n)
    }

    /// One best-effort `write(2)` of the readable region to `fd`.
    ///
    /// Does not consume anything; the caller retrieves after inspecting the
    /// returned count.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        syscall!(write(
            fd,
            self.peek().as_ptr() as *const libc::c_void,
            self.readable_bytes(),
        ))
        .map(|n| n as usize)
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn append_retrieve_round_trip() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND);

        buf.append(b"hello, world");
        assert_eq!(buf.readable_bytes(), 12);
        assert_eq!(buf.peek(), b"hello, world");

        assert_eq!(buf.retrieve_all_as_bytes(), b"hello, world");
        assert_eq!(buf.readable_bytes(), 0);
        // Full retrieval re-anchors both indices at the front.
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND);
        assert_eq!(buf.writable_bytes(), Buffer::INITIAL_SIZE);
    }

    #[test]
    fn partial_retrieve_keeps_remainder() {
        let mut buf = Buffer::new();
        buf.append(b"abcdef");
        assert_eq!(buf.retrieve_as_bytes(3), b"abc");
        assert_eq!(buf.peek(), b"def");
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND + 3);
    }

    #[test]
    fn grow_preserves_content() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(b"0123456789abcdef");
        let before = buf.peek().to_vec();

        buf.ensure_writable_bytes(4096);
        assert!(buf.writable_bytes() >= 4096);
        assert_eq!(buf.peek(), &before[..]);
    }

    #[test]
    fn make_space_slides_instead_of_growing() {
        let mut buf = Buffer::with_capacity(32);
        buf.append(&[b'x'; 28]);
        buf.retrieve(20);
        let len_before = buf.buf.len();

        // 8 readable bytes left; the consumed front region alone can hold
        // the request, so no reallocation happens.
        buf.ensure_writable_bytes(16);
        assert_eq!(buf.buf.len(), len_before);
        assert_eq!(buf.peek(), &[b'x'; 8]);
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND);
    }

    #[test]
    fn prepend_uses_reserved_headroom() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(&7u32.to_be_bytes());
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND - 4);
        let msg = buf.retrieve_all_as_bytes();
        assert_eq!(&msg[..4], &7u32.to_be_bytes());
        assert_eq!(&msg[4..], b"payload");
    }

    #[test]
    fn read_fd_overflows_into_scratch() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let data: Vec<u8> = (0..4096u32).flat_map(|i| i.to_ne_bytes()).collect();
        tx.write_all(&data).unwrap();

        // 16 writable bytes force almost everything through the scratch.
        let mut buf = Buffer::with_capacity(16);
        let first = buf.read_fd(rx.as_raw_fd()).unwrap();
        assert!(first > 16);
        while buf.readable_bytes() < data.len() {
            buf.read_fd(rx.as_raw_fd()).unwrap();
        }
        assert_eq!(buf.peek(), &data[..]);
    }

    #[test]
    fn read_fd_would_block_on_empty_socket() {
        let (_tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();

        let mut buf = Buffer::new();
        let err = buf.read_fd(rx.as_raw_fd()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn write_fd_does_not_consume() {
        let (tx, mut rx) = UnixStream::pair().unwrap();
        let mut buf = Buffer::new();
        buf.append(b"ping");

        let n = buf.write_fd(tx.as_raw_fd()).unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf.readable_bytes(), 4);
        buf.retrieve(n);
        assert_eq!(buf.readable_bytes(), 0);

        let mut got = [0u8; 4];
        use std::io::Read;
        rx.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"ping");
    }
}
