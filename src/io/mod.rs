//! Streaming I/O: polymorphic reader/writer contracts, pooled buffers, the
//! chained byte queue, in-process pipes, and fd-backed streams with
//! zero-copy transfer paths.
//!
//! All stream operations are asynchronous: they take a [`Task`] and report
//! through it. Reads deliver into a [`SharedBuf`]; writes and transfers
//! meter progress through a [`ByteCount`], which stays observable even when
//! an operation fails partway.
//!
//! [`Task`]: crate::task::Task

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub mod buffer;
pub mod chain;
pub mod options;
pub mod pipe;
pub mod reader;
pub mod util;
pub mod writer;

pub use buffer::{BufferPool, OwnedBuffer};
pub use chain::Chain;
pub use options::{get_manager, Options, TransferMode};
pub use pipe::{make_pipe, Pipe};
pub use reader::{
    buffer_reader, fd_reader, ignore_close_reader, limited_reader, null_reader, string_reader,
    zero_reader, ReadImpl, Reader,
};
pub use util::{copy, copy_n};
pub use writer::{
    discard_writer, fd_writer, full_writer, ignore_close_writer, shared_writer, WriteImpl, Writer,
};

/// Preferred block size when nothing is configured: 64 KiB.
pub const DEFAULT_BLOCK_SIZE: usize = 1 << 16;

/// Default cap on the number of buffers a chain may hold.
pub const DEFAULT_MAX_BUFFERS: usize = 16;

/// The destination of an asynchronous read.
///
/// The operation clears the buffer when it starts and appends as bytes
/// arrive, so the length doubles as the bytes-read count; it is observable
/// mid-flight and after a failure.
#[derive(Clone, Debug, Default)]
pub struct SharedBuf {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuf {
    pub fn new() -> SharedBuf {
        SharedBuf::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn append(&self, bytes: &[u8]) {
        self.inner.lock().unwrap().extend_from_slice(bytes);
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.lock().unwrap().clone()
    }

    /// Takes the contents, leaving the buffer empty.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.inner.lock().unwrap())
    }

    /// Runs `f` with exclusive access to the underlying bytes.
    pub fn with<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        f(&mut self.inner.lock().unwrap())
    }
}

/// A shared bytes-transferred meter for writes and transfers.
#[derive(Clone, Debug, Default)]
pub struct ByteCount {
    inner: Arc<AtomicUsize>,
}

impl ByteCount {
    pub fn new() -> ByteCount {
        ByteCount::default()
    }

    pub fn get(&self) -> usize {
        self.inner.load(Ordering::SeqCst)
    }

    pub fn set(&self, n: usize) {
        self.inner.store(n, Ordering::SeqCst);
    }

    pub fn add(&self, n: usize) {
        self.inner.fetch_add(n, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shared_buf_basics() {
        let buf = SharedBuf::new();
        assert!(buf.is_empty());
        buf.append(b"abc");
        buf.append(b"def");
        assert_eq!(buf.len(), 6);
        assert_eq!(buf.to_vec(), b"abcdef");
        assert_eq!(buf.take(), b"abcdef");
        assert!(buf.is_empty());
    }

    #[test]
    fn byte_count_basics() {
        let n = ByteCount::new();
        n.add(5);
        n.add(3);
        assert_eq!(n.get(), 8);
        n.set(0);
        assert_eq!(n.get(), 0);
    }
}
