//! The polymorphic byte-sink contract and its standard implementations.

use std::io;
use std::sync::{Arc, Mutex};

use crate::io::options::{get_manager, Options as IoOptions};
use crate::io::reader::{close_prologue, transfer_prologue, Reader};
use crate::io::{ByteCount, SharedBuf, DEFAULT_BLOCK_SIZE};
use crate::manager::{self, FdWatch};
use crate::options::Options;
use crate::status::Status;
use crate::sys::fd::FdHandle;
use crate::task::Task;

fn writer_closed() -> Status {
    Status::failed_precondition("writer is closed")
}

/// Shared entry check for writes: zeroes the meter and claims the task.
pub(crate) fn write_prologue(task: &Arc<Task>, n: &ByteCount) -> bool {
    n.set(0);
    task.start()
}

/// A byte sink.
///
/// Implementations must be safe to drive from any thread. `write` must
/// retry short writes internally: it completes only once all of `data` is
/// consumed or an error is terminal.
pub trait WriteImpl: Send + Sync {
    fn ideal_block_size(&self) -> usize {
        DEFAULT_BLOCK_SIZE
    }

    /// The I/O options this stream was built with.
    fn options(&self) -> IoOptions {
        IoOptions::default()
    }

    fn write(&self, task: &Arc<Task>, n: &ByteCount, data: &[u8], opts: &Options);

    /// Optional zero-copy input path; the default reports
    /// `NOT_IMPLEMENTED` and callers fall back to a copy loop.
    fn read_from(
        &self,
        task: &Arc<Task>,
        n: &ByteCount,
        _max: usize,
        _r: &Reader,
        _opts: &Options,
    ) {
        if transfer_prologue(task, n) {
            task.finish(Status::not_implemented());
        }
    }

    fn close(&self, task: &Arc<Task>, opts: &Options);

    /// The backing descriptor, when this sink is descriptor-backed; lets
    /// transfer paths reach for splice(2)/sendfile(2).
    fn writer_fd(&self) -> Option<FdHandle> {
        None
    }
}

/// A cheaply cloneable handle to a byte sink.
#[derive(Clone)]
pub struct Writer {
    imp: Arc<dyn WriteImpl>,
}

impl Writer {
    pub fn new(imp: Arc<dyn WriteImpl>) -> Writer {
        Writer { imp }
    }

    pub fn block_size(&self) -> usize {
        self.imp.ideal_block_size()
    }

    pub fn options(&self) -> IoOptions {
        self.imp.options()
    }

    /// Asynchronously writes all of `data`, retrying short writes.
    pub fn write(&self, task: &Arc<Task>, n: &ByteCount, data: &[u8], opts: &Options) {
        self.imp.write(task, n, data, opts);
    }

    /// Asynchronously pulls up to `max` bytes out of `r`.
    pub fn read_from(&self, task: &Arc<Task>, n: &ByteCount, max: usize, r: &Reader, opts: &Options) {
        self.imp.read_from(task, n, max, r, opts);
    }

    pub fn close(&self, task: &Arc<Task>, opts: &Options) {
        self.imp.close(task, opts);
    }

    pub fn writer_fd(&self) -> Option<FdHandle> {
        self.imp.writer_fd()
    }

    /// Blocking write; returns the status and bytes consumed.
    pub fn write_sync(&self, data: &[u8], opts: &Options) -> (Status, usize) {
        let task = Task::new();
        let n = ByteCount::new();
        self.write(&task, &n, data, opts);
        manager::wait(&get_manager(opts), &task);
        (task.result(), n.get())
    }

    /// Blocking transfer; returns the status and bytes moved.
    pub fn read_from_sync(&self, max: usize, r: &Reader, opts: &Options) -> (Status, usize) {
        let task = Task::new();
        let n = ByteCount::new();
        self.read_from(&task, &n, max, r, opts);
        manager::wait(&get_manager(opts), &task);
        (task.result(), n.get())
    }

    pub fn close_sync(&self, opts: &Options) -> Status {
        let task = Task::new();
        self.close(&task, opts);
        manager::wait(&get_manager(opts), &task);
        task.result()
    }
}

// CloseIgnoringWriter {{{

struct CloseIgnoringWriter {
    inner: Writer,
}

impl WriteImpl for CloseIgnoringWriter {
    fn ideal_block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn options(&self) -> IoOptions {
        self.inner.options()
    }

    fn write(&self, task: &Arc<Task>, n: &ByteCount, data: &[u8], opts: &Options) {
        self.inner.write(task, n, data, opts);
    }

    fn read_from(&self, task: &Arc<Task>, n: &ByteCount, max: usize, r: &Reader, opts: &Options) {
        self.inner.read_from(task, n, max, r, opts);
    }

    fn close(&self, task: &Arc<Task>, _opts: &Options) {
        if close_prologue(task) {
            task.finish_ok();
        }
    }

    fn writer_fd(&self) -> Option<FdHandle> {
        self.inner.writer_fd()
    }
}

/// Drops `close` but passes everything else through.
pub fn ignore_close_writer(w: Writer) -> Writer {
    Writer::new(Arc::new(CloseIgnoringWriter { inner: w }))
}

// }}}
// SharedBufWriter {{{

struct SharedBufWriter {
    buf: SharedBuf,
    closed: Mutex<bool>,
}

impl WriteImpl for SharedBufWriter {
    fn write(&self, task: &Arc<Task>, n: &ByteCount, data: &[u8], _opts: &Options) {
        if !write_prologue(task, n) {
            return;
        }
        if *self.closed.lock().unwrap() {
            task.finish(writer_closed());
            return;
        }
        self.buf.append(data);
        n.set(data.len());
        task.finish_ok();
    }

    fn close(&self, task: &Arc<Task>, _opts: &Options) {
        let mut closed = self.closed.lock().unwrap();
        let was = *closed;
        *closed = true;
        drop(closed);
        if close_prologue(task) {
            if was {
                task.finish(writer_closed());
            } else {
                task.finish_ok();
            }
        }
    }
}

/// Appends everything written into `buf`.
pub fn shared_writer(buf: SharedBuf) -> Writer {
    Writer::new(Arc::new(SharedBufWriter {
        buf,
        closed: Mutex::new(false),
    }))
}

// }}}
// DiscardWriter / FullWriter {{{

struct DiscardWriter {
    total: Option<ByteCount>,
    closed: Mutex<bool>,
}

impl WriteImpl for DiscardWriter {
    fn write(&self, task: &Arc<Task>, n: &ByteCount, data: &[u8], _opts: &Options) {
        if !write_prologue(task, n) {
            return;
        }
        if *self.closed.lock().unwrap() {
            task.finish(writer_closed());
            return;
        }
        if let Some(total) = &self.total {
            total.add(data.len());
        }
        n.set(data.len());
        task.finish_ok();
    }

    fn close(&self, task: &Arc<Task>, _opts: &Options) {
        let mut closed = self.closed.lock().unwrap();
        let was = *closed;
        *closed = true;
        drop(closed);
        if close_prologue(task) {
            if was {
                task.finish(writer_closed());
            } else {
                task.finish_ok();
            }
        }
    }
}

/// Swallows everything, optionally metering the running total.
pub fn discard_writer(total: Option<ByteCount>) -> Writer {
    Writer::new(Arc::new(DiscardWriter {
        total,
        closed: Mutex::new(false),
    }))
}

struct FullWriter {
    closed: Mutex<bool>,
}

impl WriteImpl for FullWriter {
    fn write(&self, task: &Arc<Task>, n: &ByteCount, data: &[u8], _opts: &Options) {
        if !write_prologue(task, n) {
            return;
        }
        if *self.closed.lock().unwrap() {
            task.finish(writer_closed());
            return;
        }
        if data.is_empty() {
            task.finish_ok();
        } else {
            task.finish(Status::from_errno(libc::ENOSPC, "write(2)"));
        }
    }

    fn close(&self, task: &Arc<Task>, _opts: &Options) {
        let mut closed = self.closed.lock().unwrap();
        let was = *closed;
        *closed = true;
        drop(closed);
        if close_prologue(task) {
            if was {
                task.finish(writer_closed());
            } else {
                task.finish_ok();
            }
        }
    }
}

/// A device that is always out of space.
pub fn full_writer() -> Writer {
    Writer::new(Arc::new(FullWriter {
        closed: Mutex::new(false),
    }))
}

// }}}
// FdWriter {{{

struct FdWriter {
    fd: FdHandle,
    opts: IoOptions,
}

impl WriteImpl for FdWriter {
    fn ideal_block_size(&self) -> usize {
        self.opts.block_size()
    }

    fn options(&self) -> IoOptions {
        self.opts.clone()
    }

    fn write(&self, task: &Arc<Task>, n: &ByteCount, data: &[u8], _opts: &Options) {
        if !write_prologue(task, n) {
            return;
        }
        let op = Arc::new(FdWriteOp {
            task: Arc::clone(task),
            n: n.clone(),
            data: data.to_vec(),
            fd: self.fd.clone(),
            manager: self.opts.manager(),
            watch: Mutex::new(None),
        });
        FdWriteOp::run(&op).expect_ok();
    }

    fn close(&self, task: &Arc<Task>, _opts: &Options) {
        if close_prologue(task) {
            task.finish(self.fd.close());
        }
    }

    fn writer_fd(&self) -> Option<FdHandle> {
        Some(self.fd.clone())
    }
}

/// Wraps a descriptor as a writer using the given I/O options.
pub fn fd_writer(fd: FdHandle, opts: IoOptions) -> Writer {
    Writer::new(Arc::new(FdWriter { fd, opts }))
}

struct FdWriteOp {
    task: Arc<Task>,
    n: ByteCount,
    data: Vec<u8>,
    fd: FdHandle,
    manager: manager::Manager,
    watch: Mutex<Option<FdWatch>>,
}

impl FdWriteOp {
    /// The write(2) loop. Short writes retry immediately; `EAGAIN` parks a
    /// writable watch that re-enters the loop.
    fn run(op: &Arc<FdWriteOp>) -> Status {
        let mut result = Status::ok();
        loop {
            if !op.task.is_running() {
                op.task.finish_cancel();
                *op.watch.lock().unwrap() = None;
                return Status::ok();
            }

            let n = op.n.get();
            if n >= op.data.len() {
                break;
            }

            let guard = op.fd.acquire();
            let raw = match guard.raw() {
                Ok(raw) => raw,
                Err(err) => {
                    drop(guard);
                    result = Status::from_io_error(&err, "write(2)");
                    break;
                }
            };
            trace!("FdWriteOp: fd={}, len={}, n={}", raw, op.data.len(), n);
            let written = unsafe {
                libc::write(
                    raw,
                    op.data[n..].as_ptr() as *const libc::c_void,
                    op.data.len() - n,
                )
            };
            let err_no = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            drop(guard);

            if written < 0 {
                if err_no == libc::EINTR {
                    continue;
                }
                if err_no == libc::EAGAIN || err_no == libc::EWOULDBLOCK {
                    let mut watch = op.watch.lock().unwrap();
                    if watch.is_none() {
                        let resume = Arc::clone(op);
                        let h = crate::event::handler(move |data| {
                            trace!("FdWriteOp woke, set={:?}", data.events);
                            FdWriteOp::run(&resume)
                        });
                        match op.manager.fd(raw, crate::ready::Ready::writable(), h) {
                            Ok(w) => *watch = Some(w),
                            Err(e) => {
                                drop(watch);
                                result = e;
                                break;
                            }
                        }
                    }
                    return Status::ok();
                }
                result = Status::from_errno(err_no, "write(2)");
                break;
            }
            op.n.add(written as usize);
        }
        op.task.finish(result);
        *op.watch.lock().unwrap() = None;
        Status::ok()
    }
}

// }}}
