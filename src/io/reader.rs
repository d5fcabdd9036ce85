//! The polymorphic byte-source contract and its standard implementations.

use std::io;
use std::sync::{Arc, Mutex};

use crate::io::options::{get_manager, Options as IoOptions, TransferMode};
use crate::io::writer::Writer;
use crate::io::{ByteCount, SharedBuf, DEFAULT_BLOCK_SIZE};
use crate::manager::{self, FdWatch};
use crate::options::Options;
use crate::status::Status;
use crate::sys::fd::FdHandle;
use crate::task::Task;

/// Ceiling on a single zero-copy transfer syscall: 4 MiB.
const XFER_MAX: usize = 4 << 20;

fn reader_closed() -> Status {
    Status::failed_precondition("reader is closed")
}

/// Shared entry check for reads: clears the destination and claims the
/// task.
pub(crate) fn read_prologue(task: &Arc<Task>, out: &SharedBuf, min: usize, max: usize) -> bool {
    debug_assert!(min <= max);
    out.clear();
    task.start()
}

/// Shared entry check for transfers: zeroes the meter and claims the task.
pub(crate) fn transfer_prologue(task: &Arc<Task>, n: &ByteCount) -> bool {
    n.set(0);
    task.start()
}

pub(crate) fn close_prologue(task: &Arc<Task>) -> bool {
    task.start()
}

/// A byte source.
///
/// Implementations must be safe to drive from any thread. `read` delivers
/// between `min` and `max` bytes into `out`; when `min == 0` no byte is
/// required but an attempt must still be made, and `EOF` is only reported
/// when `min > 0` and the stream is exhausted first.
pub trait ReadImpl: Send + Sync {
    fn ideal_block_size(&self) -> usize {
        DEFAULT_BLOCK_SIZE
    }

    /// The I/O options this stream was built with.
    fn options(&self) -> IoOptions {
        IoOptions::default()
    }

    fn read(&self, task: &Arc<Task>, out: &SharedBuf, min: usize, max: usize, opts: &Options);

    /// Optional zero-copy output path; the default reports
    /// `NOT_IMPLEMENTED` and callers fall back to a copy loop.
    fn write_to(
        &self,
        task: &Arc<Task>,
        n: &ByteCount,
        _max: usize,
        _w: &Writer,
        _opts: &Options,
    ) {
        if transfer_prologue(task, n) {
            task.finish(Status::not_implemented());
        }
    }

    fn close(&self, task: &Arc<Task>, opts: &Options);
}

/// A cheaply cloneable handle to a byte source.
#[derive(Clone)]
pub struct Reader {
    imp: Arc<dyn ReadImpl>,
}

impl Reader {
    pub fn new(imp: Arc<dyn ReadImpl>) -> Reader {
        Reader { imp }
    }

    pub fn block_size(&self) -> usize {
        self.imp.ideal_block_size()
    }

    pub fn options(&self) -> IoOptions {
        self.imp.options()
    }

    /// Asynchronously reads `min..=max` bytes into `out`.
    pub fn read(&self, task: &Arc<Task>, out: &SharedBuf, min: usize, max: usize, opts: &Options) {
        self.imp.read(task, out, min, max, opts);
    }

    /// Asynchronously copies up to `max` bytes into `w`, preferring
    /// zero-copy paths when both endpoints allow one.
    pub fn write_to(&self, task: &Arc<Task>, n: &ByteCount, max: usize, w: &Writer, opts: &Options) {
        self.imp.write_to(task, n, max, w, opts);
    }

    pub fn close(&self, task: &Arc<Task>, opts: &Options) {
        self.imp.close(task, opts);
    }

    /// Blocking read: appends the bytes read onto `out`.
    pub fn read_sync(
        &self,
        out: &mut Vec<u8>,
        min: usize,
        max: usize,
        opts: &Options,
    ) -> Status {
        let task = Task::new();
        let buf = SharedBuf::new();
        self.read(&task, &buf, min, max, opts);
        manager::wait(&get_manager(opts), &task);
        out.extend_from_slice(&buf.take());
        task.result()
    }

    /// Blocking transfer; returns the status and bytes moved.
    pub fn write_to_sync(&self, max: usize, w: &Writer, opts: &Options) -> (Status, usize) {
        let task = Task::new();
        let n = ByteCount::new();
        self.write_to(&task, &n, max, w, opts);
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

/// Resolves the transfer mode for a reader/writer pair: the slower of the
/// two endpoints' normalized preferences.
fn transfer_mode(ro: &IoOptions, wo: &IoOptions) -> TransferMode {
    let rxm = ro.transfer_mode.normalize();
    let wxm = wo.transfer_mode.normalize();
    rxm.min(wxm)
}

// CloseIgnoringReader {{{

struct CloseIgnoringReader {
    inner: Reader,
}

impl ReadImpl for CloseIgnoringReader {
    fn ideal_block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn options(&self) -> IoOptions {
        self.inner.options()
    }

    fn read(&self, task: &Arc<Task>, out: &SharedBuf, min: usize, max: usize, opts: &Options) {
        self.inner.read(task, out, min, max, opts);
    }

    fn write_to(&self, task: &Arc<Task>, n: &ByteCount, max: usize, w: &Writer, opts: &Options) {
        self.inner.write_to(task, n, max, w, opts);
    }

    fn close(&self, task: &Arc<Task>, _opts: &Options) {
        if close_prologue(task) {
            task.finish_ok();
        }
    }
}

/// Drops `close` but passes everything else through.
pub fn ignore_close_reader(r: Reader) -> Reader {
    Reader::new(Arc::new(CloseIgnoringReader { inner: r }))
}

// }}}
// LimitedReader {{{

struct LimitedReader {
    inner: Reader,
    remaining: Arc<Mutex<usize>>,
}

impl ReadImpl for LimitedReader {
    fn ideal_block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn options(&self) -> IoOptions {
        self.inner.options()
    }

    fn read(&self, task: &Arc<Task>, out: &SharedBuf, min: usize, max: usize, opts: &Options) {
        if !read_prologue(task, out, min, max) {
            return;
        }

        // Reserve the budget up front; the unread part is refunded on
        // completion.
        let mut rem = self.remaining.lock().unwrap();
        let amax = max.min(*rem);
        let amin = min.min(*rem);
        let eof = amax < min;
        *rem -= amax;
        drop(rem);

        let subtask = Task::new();
        task.add_subtask(&subtask);
        self.inner.read(&subtask, out, amin, amax, opts);

        let remaining = Arc::clone(&self.remaining);
        let task = Arc::clone(task);
        let sub = Arc::clone(&subtask);
        let out = out.clone();
        subtask.on_finished(move || {
            let n = out.len();
            *remaining.lock().unwrap() += amax - n;
            let r = sub.result();
            if !r.is_ok() {
                task.finish(r);
            } else if eof {
                task.finish(Status::eof());
            } else {
                task.finish_ok();
            }
        });
    }

    fn write_to(&self, task: &Arc<Task>, n: &ByteCount, max: usize, w: &Writer, opts: &Options) {
        let mut rem = self.remaining.lock().unwrap();
        let amax = max.min(*rem);
        *rem -= amax;
        drop(rem);

        self.inner.write_to(task, n, amax, w, opts);

        let remaining = Arc::clone(&self.remaining);
        let n = n.clone();
        task.on_finished(move || {
            *remaining.lock().unwrap() += amax - n.get();
        });
    }

    fn close(&self, task: &Arc<Task>, opts: &Options) {
        self.inner.close(task, opts);
    }
}

/// Enforces a byte budget over `r`, reporting `EOF` once it is spent.
pub fn limited_reader(r: Reader, max: usize) -> Reader {
    Reader::new(Arc::new(LimitedReader {
        inner: r,
        remaining: Arc::new(Mutex::new(max)),
    }))
}

// }}}
// BufferReader {{{

struct BufferReader {
    data: Arc<[u8]>,
    state: Arc<Mutex<BufferReaderState>>,
}

struct BufferReaderState {
    pos: usize,
    closed: bool,
}

impl ReadImpl for BufferReader {
    fn read(&self, task: &Arc<Task>, out: &SharedBuf, min: usize, max: usize, _opts: &Options) {
        if !read_prologue(task, out, min, max) {
            return;
        }

        let mut state = self.state.lock().unwrap();
        if state.closed {
            task.finish(reader_closed());
            return;
        }

        let len = (self.data.len() - state.pos).min(max);
        out.append(&self.data[state.pos..state.pos + len]);
        state.pos += len;
        drop(state);

        if min > len {
            task.finish(Status::eof());
        } else {
            task.finish_ok();
        }
    }

    fn write_to(&self, task: &Arc<Task>, n: &ByteCount, max: usize, w: &Writer, opts: &Options) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            drop(state);
            if task.start() {
                task.finish(reader_closed());
            }
            return;
        }
        // Claim the span up front; unwritten bytes are refunded when the
        // write settles.
        let pos = state.pos;
        let len = (self.data.len() - pos).min(max);
        state.pos += len;
        drop(state);

        w.write(task, n, &self.data[pos..pos + len], opts);

        let state = Arc::clone(&self.state);
        let n = n.clone();
        task.on_finished(move || {
            let written = n.get();
            state.lock().unwrap().pos -= len - written;
        });
    }

    fn close(&self, task: &Arc<Task>, _opts: &Options) {
        let mut state = self.state.lock().unwrap();
        let was = state.closed;
        state.closed = true;
        drop(state);
        if close_prologue(task) {
            if was {
                task.finish(reader_closed());
            } else {
                task.finish_ok();
            }
        }
    }
}

/// Yields the bytes of `data` from memory.
pub fn buffer_reader(data: Vec<u8>) -> Reader {
    Reader::new(Arc::new(BufferReader {
        data: data.into(),
        state: Arc::new(Mutex::new(BufferReaderState {
            pos: 0,
            closed: false,
        })),
    }))
}

/// Yields the bytes of `s` from memory.
pub fn string_reader(s: impl Into<String>) -> Reader {
    buffer_reader(s.into().into_bytes())
}

// }}}
// NullReader / ZeroReader {{{

struct NullReader {
    closed: Mutex<bool>,
}

impl ReadImpl for NullReader {
    fn read(&self, task: &Arc<Task>, out: &SharedBuf, min: usize, max: usize, _opts: &Options) {
        if !read_prologue(task, out, min, max) {
            return;
        }
        if *self.closed.lock().unwrap() {
            task.finish(reader_closed());
            return;
        }
        if min > 0 {
            task.finish(Status::eof());
        } else {
            task.finish_ok();
        }
    }

    fn write_to(&self, task: &Arc<Task>, n: &ByteCount, _max: usize, _w: &Writer, _opts: &Options) {
        if !transfer_prologue(task, n) {
            return;
        }
        task.finish_ok();
    }

    fn close(&self, task: &Arc<Task>, _opts: &Options) {
        let mut closed = self.closed.lock().unwrap();
        let was = *closed;
        *closed = true;
        drop(closed);
        if close_prologue(task) {
            if was {
                task.finish(reader_closed());
            } else {
                task.finish_ok();
            }
        }
    }
}

/// Always at EOF.
pub fn null_reader() -> Reader {
    Reader::new(Arc::new(NullReader {
        closed: Mutex::new(false),
    }))
}

struct ZeroReader {
    closed: Mutex<bool>,
}

impl ReadImpl for ZeroReader {
    fn read(&self, task: &Arc<Task>, out: &SharedBuf, min: usize, max: usize, _opts: &Options) {
        if !read_prologue(task, out, min, max) {
            return;
        }
        if *self.closed.lock().unwrap() {
            task.finish(reader_closed());
            return;
        }
        out.with(|vec| vec.resize(max, 0));
        task.finish_ok();
    }

    fn close(&self, task: &Arc<Task>, _opts: &Options) {
        let mut closed = self.closed.lock().unwrap();
        let was = *closed;
        *closed = true;
        drop(closed);
        if close_prologue(task) {
            if was {
                task.finish(reader_closed());
            } else {
                task.finish_ok();
            }
        }
    }
}

/// An endless supply of zero bytes.
pub fn zero_reader() -> Reader {
    Reader::new(Arc::new(ZeroReader {
        closed: Mutex::new(false),
    }))
}

// }}}
// FdReader {{{

struct FdReader {
    fd: FdHandle,
    opts: IoOptions,
}

impl ReadImpl for FdReader {
    fn ideal_block_size(&self) -> usize {
        self.opts.block_size()
    }

    fn options(&self) -> IoOptions {
        self.opts.clone()
    }

    fn read(&self, task: &Arc<Task>, out: &SharedBuf, min: usize, max: usize, _opts: &Options) {
        if !read_prologue(task, out, min, max) {
            return;
        }
        let op = Arc::new(FdReadOp {
            task: Arc::clone(task),
            out: out.clone(),
            min,
            max,
            fd: self.fd.clone(),
            manager: self.opts.manager(),
            pool: self.opts.pool(),
            watch: Mutex::new(None),
        });
        FdReadOp::run(&op).expect_ok();
    }

    fn write_to(&self, task: &Arc<Task>, n: &ByteCount, max: usize, w: &Writer, opts: &Options) {
        if !transfer_prologue(task, n) {
            return;
        }

        let mode = transfer_mode(&self.opts, &w.options());
        let wfd = w.writer_fd();
        if mode == TransferMode::ReadWrite || wfd.is_none() {
            let op = Arc::new(FdCopyOp {
                task: Arc::clone(task),
                n: n.clone(),
                max,
                fd: self.fd.clone(),
                manager: self.opts.manager(),
                pool: self.opts.pool(),
                writer: w.clone(),
                opts: opts.clone(),
                watch: Mutex::new(None),
            });
            FdCopyOp::step(&op);
            return;
        }

        let op = Arc::new(FdXferOp {
            task: Arc::clone(task),
            n: n.clone(),
            max,
            rfd: self.fd.clone(),
            wfd: wfd.unwrap(),
            rmgr: self.opts.manager(),
            wmgr: w.options().manager(),
            strategy: Mutex::new(mode),
            rwatch: Mutex::new(None),
            wwatch: Mutex::new(None),
            writer: w.clone(),
            pool: self.opts.pool(),
            opts: opts.clone(),
        });
        FdXferOp::run(&op).expect_ok();
    }

    fn close(&self, task: &Arc<Task>, _opts: &Options) {
        if close_prologue(task) {
            task.finish(self.fd.close());
        }
    }
}

/// Wraps a descriptor as a reader using the given I/O options.
pub fn fd_reader(fd: FdHandle, opts: IoOptions) -> Reader {
    Reader::new(Arc::new(FdReader { fd, opts }))
}

struct FdReadOp {
    task: Arc<Task>,
    out: SharedBuf,
    min: usize,
    max: usize,
    fd: FdHandle,
    manager: manager::Manager,
    pool: crate::io::buffer::BufferPool,
    watch: Mutex<Option<FdWatch>>,
}

impl FdReadOp {
    /// The read(2) loop. `EINTR` retries, `EAGAIN` either settles for what
    /// we have (past `min`) or parks a readable watch that re-enters the
    /// loop.
    fn run(op: &Arc<FdReadOp>) -> Status {
        let mut result = Status::ok();
        loop {
            if !op.task.is_running() {
                op.task.finish_cancel();
                *op.watch.lock().unwrap() = None;
                return Status::ok();
            }

            let n = op.out.len();
            if n >= op.max {
                break;
            }

            let mut scratch = op.pool.take();
            let want = (op.max - n).min(scratch.len());

            let guard = op.fd.acquire();
            let raw = match guard.raw() {
                Ok(raw) => raw,
                Err(err) => {
                    drop(guard);
                    op.pool.give(scratch);
                    result = Status::from_io_error(&err, "read(2)");
                    break;
                }
            };
            trace!("FdReadOp: fd={}, max={}, n={}", raw, op.max, n);
            let len = unsafe {
                libc::read(
                    raw,
                    scratch.data_mut().as_mut_ptr() as *mut libc::c_void,
                    want,
                )
            };
            let err_no = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            drop(guard);

            if len < 0 {
                op.pool.give(scratch);
                if err_no == libc::EINTR {
                    continue;
                }
                if err_no == libc::EAGAIN || err_no == libc::EWOULDBLOCK {
                    if n >= op.min {
                        break;
                    }
                    let mut watch = op.watch.lock().unwrap();
                    if watch.is_none() {
                        let resume = Arc::clone(op);
                        let h = crate::event::handler(move |data| {
                            trace!("FdReadOp woke, set={:?}", data.events);
                            FdReadOp::run(&resume)
                        });
                        match op.manager.fd(raw, crate::ready::Ready::readable(), h) {
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
                result = Status::from_errno(err_no, "read(2)");
                break;
            }
            if len == 0 {
                op.pool.give(scratch);
                if n < op.min {
                    result = Status::eof();
                }
                break;
            }
            op.out.append(&scratch.data()[..len as usize]);
            op.pool.give(scratch);
        }
        op.task.finish(result);
        *op.watch.lock().unwrap() = None;
        Status::ok()
    }
}

/// splice(2)/sendfile(2) transfer between two descriptors, downgrading to
/// the portable copy loop when the kernel rejects the pair.
struct FdXferOp {
    task: Arc<Task>,
    n: ByteCount,
    max: usize,
    rfd: FdHandle,
    wfd: FdHandle,
    rmgr: manager::Manager,
    wmgr: manager::Manager,
    strategy: Mutex<TransferMode>,
    rwatch: Mutex<Option<FdWatch>>,
    wwatch: Mutex<Option<FdWatch>>,
    writer: Writer,
    pool: crate::io::buffer::BufferPool,
    opts: Options,
}

impl FdXferOp {
    fn clear_watches(op: &Arc<FdXferOp>) {
        *op.rwatch.lock().unwrap() = None;
        *op.wwatch.lock().unwrap() = None;
    }

    fn downgrade_to_copy(op: &Arc<FdXferOp>) -> Status {
        FdXferOp::clear_watches(op);
        let copy = Arc::new(FdCopyOp {
            task: Arc::clone(&op.task),
            n: op.n.clone(),
            max: op.max,
            fd: op.rfd.clone(),
            manager: op.rmgr.clone(),
            pool: op.pool.clone(),
            writer: op.writer.clone(),
            opts: op.opts.clone(),
            watch: Mutex::new(None),
        });
        FdCopyOp::step(&copy);
        Status::ok()
    }

    fn run(op: &Arc<FdXferOp>) -> Status {
        let mut result = Status::ok();
        loop {
            if !op.task.is_running() {
                op.task.finish_cancel();
                FdXferOp::clear_watches(op);
                return Status::ok();
            }

            let n = op.n.get();
            if n >= op.max {
                break;
            }
            let cmax = (op.max - n).min(XFER_MAX);
            let strategy = *op.strategy.lock().unwrap();

            let wguard = op.wfd.acquire();
            let rguard = op.rfd.acquire();
            let (wraw, rraw) = match (wguard.raw(), rguard.raw()) {
                (Ok(w), Ok(r)) => (w, r),
                (Err(err), _) | (_, Err(err)) => {
                    result = Status::from_io_error(&err, "transfer");
                    break;
                }
            };
            trace!(
                "FdXferOp: {:?}: wfd={}, rfd={}, max={}, n={}, cmax={}",
                strategy,
                wraw,
                rraw,
                op.max,
                n,
                cmax
            );
            let sent = match strategy {
                TransferMode::Splice => unsafe {
                    libc::splice(
                        rraw,
                        std::ptr::null_mut(),
                        wraw,
                        std::ptr::null_mut(),
                        cmax,
                        libc::SPLICE_F_NONBLOCK,
                    )
                },
                _ => unsafe { libc::sendfile(wraw, rraw, std::ptr::null_mut(), cmax) },
            };
            let err_no = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            drop(rguard);
            drop(wguard);

            if sent < 0 {
                if err_no == libc::EINTR {
                    continue;
                }
                if err_no == libc::ENOSYS || err_no == libc::EINVAL {
                    // This pair of descriptors rejects the fast path;
                    // step down one strategy.
                    if strategy == TransferMode::Splice {
                        *op.strategy.lock().unwrap() = TransferMode::Sendfile;
                        continue;
                    }
                    return FdXferOp::downgrade_to_copy(op);
                }
                if err_no == libc::EAGAIN || err_no == libc::EWOULDBLOCK {
                    // Errno doesn't distinguish "reader is empty" from
                    // "writer is full", so schedule on both of them.
                    let mut wwatch = op.wwatch.lock().unwrap();
                    if wwatch.is_none() {
                        let resume = Arc::clone(op);
                        let h = crate::event::handler(move |data| {
                            trace!("FdXferOp woke, set={:?}", data.events);
                            FdXferOp::run(&resume)
                        });
                        match op.wmgr.fd(wraw, crate::ready::Ready::writable(), h) {
                            Ok(w) => *wwatch = Some(w),
                            Err(e) => {
                                drop(wwatch);
                                result = e;
                                break;
                            }
                        }
                        drop(wwatch);
                        let resume = Arc::clone(op);
                        let h = crate::event::handler(move |data| {
                            trace!("FdXferOp woke, set={:?}", data.events);
                            FdXferOp::run(&resume)
                        });
                        let mut rwatch = op.rwatch.lock().unwrap();
                        match op.rmgr.fd(rraw, crate::ready::Ready::readable(), h) {
                            Ok(w) => *rwatch = Some(w),
                            Err(e) => {
                                drop(rwatch);
                                result = e;
                                break;
                            }
                        }
                    }
                    return Status::ok();
                }
                result = Status::from_errno(
                    err_no,
                    if strategy == TransferMode::Splice {
                        "splice(2)"
                    } else {
                        "sendfile(2)"
                    },
                );
                break;
            }
            if sent == 0 {
                break;
            }
            op.n.add(sent as usize);
        }
        op.task.finish(result);
        FdXferOp::clear_watches(op);
        Status::ok()
    }
}

/// The portable transfer loop: read(2) into a pooled buffer, then hand the
/// bytes to the writer, repeating until the budget or the source runs out.
struct FdCopyOp {
    task: Arc<Task>,
    n: ByteCount,
    max: usize,
    fd: FdHandle,
    manager: manager::Manager,
    pool: crate::io::buffer::BufferPool,
    writer: Writer,
    opts: Options,
    watch: Mutex<Option<FdWatch>>,
}

impl FdCopyOp {
    fn step(op: &Arc<FdCopyOp>) {
        loop {
            if !op.task.is_running() {
                op.task.finish_cancel();
                *op.watch.lock().unwrap() = None;
                return;
            }

            let n = op.n.get();
            if n >= op.max {
                op.task.finish_ok();
                *op.watch.lock().unwrap() = None;
                return;
            }

            let mut scratch = op.pool.take();
            let want = (op.max - n).min(scratch.len());

            let guard = op.fd.acquire();
            let raw = match guard.raw() {
                Ok(raw) => raw,
                Err(err) => {
                    drop(guard);
                    op.pool.give(scratch);
                    op.task.finish(Status::from_io_error(&err, "read(2)"));
                    *op.watch.lock().unwrap() = None;
                    return;
                }
            };
            let len = unsafe {
                libc::read(
                    raw,
                    scratch.data_mut().as_mut_ptr() as *mut libc::c_void,
                    want,
                )
            };
            let err_no = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            drop(guard);

            if len < 0 {
                op.pool.give(scratch);
                if err_no == libc::EINTR {
                    continue;
                }
                if err_no == libc::EAGAIN || err_no == libc::EWOULDBLOCK {
                    let mut watch = op.watch.lock().unwrap();
                    if watch.is_none() {
                        let resume = Arc::clone(op);
                        let h = crate::event::handler(move |_data| {
                            FdCopyOp::step(&resume);
                            Status::ok()
                        });
                        match op.manager.fd(raw, crate::ready::Ready::readable(), h) {
                            Ok(w) => *watch = Some(w),
                            Err(e) => {
                                drop(watch);
                                op.task.finish(e);
                                *op.watch.lock().unwrap() = None;
                            }
                        }
                    }
                    return;
                }
                op.task.finish(Status::from_errno(err_no, "read(2)"));
                *op.watch.lock().unwrap() = None;
                return;
            }
            if len == 0 {
                // Source exhausted; the transfer stops short of `max`.
                op.task.finish_ok();
                *op.watch.lock().unwrap() = None;
                return;
            }

            let subtask = Task::new();
            op.task.add_subtask(&subtask);
            let wn = ByteCount::new();
            op.writer
                .write(&subtask, &wn, &scratch.data()[..len as usize], &op.opts);
            op.pool.give(scratch);

            let resume = Arc::clone(op);
            let sub = Arc::clone(&subtask);
            subtask.on_finished(move || {
                resume.n.add(wn.get());
                let r = sub.result();
                if !r.is_ok() {
                    resume.task.finish(r);
                    *resume.watch.lock().unwrap() = None;
                    return;
                }
                FdCopyOp::step(&resume);
            });
            return;
        }
    }
}

// }}}
