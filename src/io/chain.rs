//! The chained-buffer byte queue behind pipes and buffered streams.
//!
//! A [`Chain`] keeps an ordered spine of pooled buffers plus a read offset
//! `rdpos` and a write offset `wrpos`, maintaining
//! `0 <= rdpos <= wrpos <= spine_len * buffer_size` at all times. Fully
//! drained front buffers go back to the pool and both offsets are rebased
//! by whole buffer sizes. Pending reads and writes queue FIFO per
//! direction and are driven by [`Chain::process`], which also runs after
//! every mutation.
//!
//! When a pending operation cannot make progress the chain invokes the
//! owner's hungry/full notifier (with the lock dropped) so the owner can
//! `fill`, `drain`, or install a terminal error.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::io::buffer::{BufferPool, OwnedBuffer};
use crate::io::reader::read_prologue;
use crate::io::writer::write_prologue;
use crate::io::{ByteCount, SharedBuf, DEFAULT_BLOCK_SIZE, DEFAULT_MAX_BUFFERS};
use crate::options::Options;
use crate::status::Status;
use crate::task::Task;

/// A callback asking the chain's owner to produce or consume bytes.
///
/// In the `rdfn` role the goal is to satisfy a pending read, so the owner
/// should `fill` or `fail_reads`; in the `wrfn` role the goal is to satisfy
/// a pending write, so the owner should `drain` or `fail_writes`.
pub type Notifier = Arc<dyn Fn(&Options) + Send + Sync>;

struct ReadOp {
    task: Arc<Task>,
    out: SharedBuf,
    min: usize,
    max: usize,
    opts: Options,
}

struct WriteOp {
    task: Arc<Task>,
    n: ByteCount,
    data: Vec<u8>,
    opts: Options,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum Progress {
    None,
    Partial,
    Complete,
}

struct ChainState {
    bufs: VecDeque<OwnedBuffer>,
    rdpos: usize,
    wrpos: usize,
    rdq: VecDeque<ReadOp>,
    wrq: VecDeque<WriteOp>,
    rderr: Option<Status>,
    wrerr: Option<Status>,
    rdfn: Option<Notifier>,
    wrfn: Option<Notifier>,
    depth: usize,
}

pub struct Chain {
    pool: BufferPool,
    max: usize,
    state: Mutex<ChainState>,
}

/// Work discovered by one pass that must run with the lock dropped.
struct Deferred {
    done: Vec<(Arc<Task>, Status)>,
    notify: Option<(Notifier, Options)>,
}

impl Deferred {
    fn is_empty(&self) -> bool {
        self.done.is_empty() && self.notify.is_none()
    }

    fn run(self) {
        for (task, result) in self.done {
            task.finish(result);
        }
        if let Some((notifier, opts)) = self.notify {
            notifier(&opts);
        }
    }
}

impl Chain {
    pub fn new(pool: BufferPool, max_buffers: usize) -> Chain {
        assert!(pool.buffer_size() > 0);
        assert!(max_buffers >= 3);
        Chain {
            pool,
            max: max_buffers,
            state: Mutex::new(ChainState {
                bufs: VecDeque::with_capacity(max_buffers),
                rdpos: 0,
                wrpos: 0,
                rdq: VecDeque::new(),
                wrq: VecDeque::new(),
                rderr: None,
                wrerr: None,
                rdfn: None,
                wrfn: None,
                depth: 0,
            }),
        }
    }

    pub fn with_sizes(buffer_size: usize, max_buffers: usize) -> Chain {
        Chain::new(BufferPool::new(buffer_size), max_buffers)
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn set_rdfn(&self, rdfn: Notifier) {
        self.state.lock().unwrap().rdfn = Some(rdfn);
    }

    pub fn set_wrfn(&self, wrfn: Notifier) {
        self.state.lock().unwrap().wrfn = Some(wrfn);
    }

    /// Bytes currently queued.
    pub fn bytes_available(&self) -> usize {
        let st = self.state.lock().unwrap();
        st.wrpos - st.rdpos
    }

    /// The fill size that lands exactly on a buffer boundary.
    pub fn optimal_fill(&self) -> usize {
        let st = self.state.lock().unwrap();
        let (_, offset) = self.xlate(&st, st.wrpos);
        self.pool.buffer_size() - offset
    }

    /// The largest drain that stays within the current front buffer.
    pub fn optimal_drain(&self) -> usize {
        let st = self.state.lock().unwrap();
        let (_, offset) = self.xlate(&st, st.wrpos);
        (self.pool.buffer_size() - offset).min(st.wrpos - st.rdpos)
    }

    /// Appends up to `data.len()` bytes, bounded by spine capacity.
    /// Returns the number appended.
    pub fn fill(&self, data: &[u8]) -> usize {
        let mut st = self.state.lock().unwrap();
        self.fill_locked(&mut st, data)
    }

    /// Removes up to `out.len()` bytes into the front of `out`. Returns
    /// the number removed.
    pub fn drain(&self, out: &mut [u8]) -> usize {
        let mut st = self.state.lock().unwrap();
        self.drain_locked(&mut st, out)
    }

    /// Pushes bytes back at the read head. When the pushback exceeds the
    /// room before `rdpos`, fresh spine buffers are inserted at the front
    /// and both offsets are rebased by whole buffer sizes.
    pub fn undrain(&self, data: &[u8]) {
        let mut st = self.state.lock().unwrap();
        self.undrain_locked(&mut st, data);
    }

    /// Installs the terminal result future reads see once the queue runs
    /// dry. `r` must not be OK.
    pub fn fail_reads(&self, r: Status) {
        assert!(!r.is_ok());
        self.state.lock().unwrap().rderr = Some(r);
    }

    /// Installs the terminal result future writes see. `r` must not be OK.
    pub fn fail_writes(&self, r: Status) {
        assert!(!r.is_ok());
        self.state.lock().unwrap().wrerr = Some(r);
    }

    /// Drops all queued bytes. Only makes sense after `fail_reads`.
    pub fn flush(&self) {
        let mut st = self.state.lock().unwrap();
        while let Some(buf) = st.bufs.pop_back() {
            self.pool.give(buf);
        }
        st.rdpos = 0;
        st.wrpos = 0;
    }

    /// Runs the reactor over pending operations. MUST be called after each
    /// sequence of `fill`/`drain`/`fail_reads`/`fail_writes`/`flush`.
    pub fn process(&self) {
        let st = self.state.lock().unwrap();
        self.pump(st);
    }

    /// Queues an asynchronous read of `min..=max` bytes into `out`.
    pub fn read(&self, task: &Arc<Task>, out: &SharedBuf, min: usize, max: usize, opts: &Options) {
        if !read_prologue(task, out, min, max) {
            return;
        }
        let mut st = self.state.lock().unwrap();
        st.rdq.push_back(ReadOp {
            task: Arc::clone(task),
            out: out.clone(),
            min,
            max,
            opts: opts.clone(),
        });
        self.pump(st);
    }

    /// Queues an asynchronous write of all of `data`. The pending
    /// operation owns a copy of the unconsumed remainder.
    pub fn write(&self, task: &Arc<Task>, n: &ByteCount, data: &[u8], opts: &Options) {
        if !write_prologue(task, n) {
            return;
        }
        let mut st = self.state.lock().unwrap();
        st.wrq.push_back(WriteOp {
            task: Arc::clone(task),
            n: n.clone(),
            data: data.to_vec(),
            opts: opts.clone(),
        });
        self.pump(st);
    }

    fn xlate(&self, st: &ChainState, pos: usize) -> (usize, usize) {
        let z = self.pool.buffer_size();
        let blocknum = pos / z;
        let offset = pos - blocknum * z;
        debug_assert!(blocknum <= st.bufs.len());
        debug_assert!(blocknum < st.bufs.len() || offset == 0);
        (blocknum, offset)
    }

    fn fill_locked(&self, st: &mut ChainState, data: &[u8]) -> usize {
        debug_assert!(st.rdpos <= st.wrpos);
        let sz = self.pool.buffer_size();
        let mut n = 0;
        while n < data.len() {
            let (blocknum, offset) = self.xlate(st, st.wrpos);
            while blocknum >= st.bufs.len() && st.bufs.len() < self.max {
                st.bufs.push_back(self.pool.take());
            }
            if blocknum >= st.bufs.len() {
                break;
            }
            let wrnum = (data.len() - n).min(sz - offset);
            st.bufs[blocknum].data_mut()[offset..offset + wrnum]
                .copy_from_slice(&data[n..n + wrnum]);
            n += wrnum;
            st.wrpos += wrnum;
            debug_assert!(st.rdpos <= st.wrpos);
        }
        n
    }

    fn drain_locked(&self, st: &mut ChainState, out: &mut [u8]) -> usize {
        debug_assert!(st.rdpos <= st.wrpos);
        let sz = self.pool.buffer_size();
        let mut n = 0;
        while n < out.len() {
            let (blocknum, offset) = self.xlate(st, st.rdpos);
            if blocknum >= st.bufs.len() || st.rdpos >= st.wrpos {
                break;
            }
            debug_assert_eq!(blocknum, 0);
            let rdnum = (out.len() - n)
                .min(sz - offset)
                .min(st.wrpos - st.rdpos);
            out[n..n + rdnum].copy_from_slice(&st.bufs[blocknum].data()[offset..offset + rdnum]);
            n += rdnum;
            st.rdpos += rdnum;
            if offset + rdnum == sz {
                let buf = st.bufs.pop_front().unwrap();
                self.pool.give(buf);
                st.rdpos -= sz;
                st.wrpos -= sz;
            }
            debug_assert!(st.rdpos <= st.wrpos);
        }
        n
    }

    fn undrain_locked(&self, st: &mut ChainState, data: &[u8]) {
        debug_assert!(st.rdpos <= st.wrpos);
        let sz = self.pool.buffer_size();
        while data.len() > st.rdpos {
            st.bufs.push_front(self.pool.take());
            st.rdpos += sz;
            st.wrpos += sz;
        }
        st.rdpos -= data.len();
        let mut n = 0;
        while n < data.len() {
            let (blocknum, offset) = self.xlate(st, st.rdpos + n);
            let wrnum = (data.len() - n).min(sz - offset);
            st.bufs[blocknum].data_mut()[offset..offset + wrnum]
                .copy_from_slice(&data[n..n + wrnum]);
            n += wrnum;
        }
    }

    /// The reactor loop. Re-entrant calls (task callbacks poking the chain
    /// while a pump is live) bump the depth counter and return; the outer
    /// pump notices and runs extra rounds.
    fn pump<'a>(&'a self, mut st: MutexGuard<'a, ChainState>) {
        st.depth += 1;
        if st.depth > 1 {
            return;
        }

        loop {
            let (wrote, deferred_w) = self.writes_pass(&mut st);
            let (read, deferred_r) = self.reads_pass(&mut st);

            let mut finished = false;
            if !wrote && !read {
                st.depth -= 1;
                finished = st.depth == 0;
            }

            if !deferred_w.is_empty() || !deferred_r.is_empty() {
                drop(st);
                deferred_w.run();
                deferred_r.run();
                if finished {
                    return;
                }
                st = self.state.lock().unwrap();
            } else if finished {
                return;
            }
        }
    }

    /// Processes pending writes FIFO until one stalls. Completions and the
    /// owner notification are deferred: task callbacks may re-enter the
    /// chain, so they must run with the lock dropped.
    fn writes_pass(&self, st: &mut ChainState) -> (bool, Deferred) {
        let mut some = false;
        let mut want = false;
        let mut deferred = Deferred {
            done: Vec::new(),
            notify: None,
        };
        while let Some(op) = st.wrq.pop_front() {
            let (progress, result) = self.write_locked(st, &op);
            if progress != Progress::None {
                some = true;
            }
            match result {
                Some(result) => deferred.done.push((Arc::clone(&op.task), result)),
                None => {
                    want = true;
                    st.wrq.push_front(op);
                    break;
                }
            }
        }

        if want {
            if let Some(wrfn) = &st.wrfn {
                let opts = st.wrq.front().unwrap().opts.clone();
                deferred.notify = Some((Arc::clone(wrfn), opts));
            }
        }

        (some, deferred)
    }

    fn reads_pass(&self, st: &mut ChainState) -> (bool, Deferred) {
        let mut some = false;
        let mut want = false;
        let mut deferred = Deferred {
            done: Vec::new(),
            notify: None,
        };
        while let Some(op) = st.rdq.pop_front() {
            let (progress, result) = self.read_locked(st, &op);
            if progress != Progress::None {
                some = true;
            }
            match result {
                Some(result) => deferred.done.push((Arc::clone(&op.task), result)),
                None => {
                    want = true;
                    st.rdq.push_front(op);
                    break;
                }
            }
        }

        if want {
            if let Some(rdfn) = &st.rdfn {
                let opts = st.rdq.front().unwrap().opts.clone();
                deferred.notify = Some((Arc::clone(rdfn), opts));
            }
        }

        (some, deferred)
    }

    /// Drives one pending read. Returns the progress made plus the final
    /// result if the operation completed.
    fn read_locked(&self, st: &mut ChainState, op: &ReadOp) -> (Progress, Option<Status>) {
        let (oldn, newn) = op.out.with(|vec| {
            let oldn = vec.len();
            let want = op.max - oldn;
            let have = st.wrpos - st.rdpos;
            let grab = want.min(have);
            if grab > 0 {
                vec.resize(oldn + grab, 0);
                let got = self.drain_locked(st, &mut vec[oldn..]);
                vec.truncate(oldn + got);
            }
            (oldn, vec.len())
        });

        if newn >= op.min {
            return (Progress::Complete, Some(Status::ok()));
        }
        if let Some(err) = &st.rderr {
            return (Progress::Complete, Some(err.clone()));
        }
        if newn > oldn {
            (Progress::Partial, None)
        } else {
            (Progress::None, None)
        }
    }

    fn write_locked(&self, st: &mut ChainState, op: &WriteOp) -> (Progress, Option<Status>) {
        if let Some(err) = &st.wrerr {
            return (Progress::Complete, Some(err.clone()));
        }
        let oldn = op.n.get();
        let wrote = self.fill_locked(st, &op.data[oldn..]);
        op.n.add(wrote);
        let newn = oldn + wrote;
        if newn >= op.data.len() {
            return (Progress::Complete, Some(Status::ok()));
        }
        if newn > oldn {
            (Progress::Partial, None)
        } else {
            (Progress::None, None)
        }
    }
}

impl Default for Chain {
    fn default() -> Chain {
        Chain::with_sizes(DEFAULT_BLOCK_SIZE, DEFAULT_MAX_BUFFERS)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::status::Code;

    fn small_chain() -> Chain {
        // 16-byte buffers force frequent boundary crossings.
        Chain::with_sizes(16, 3)
    }

    #[test]
    fn fill_then_drain_conserves_bytes() {
        let chain = small_chain();
        let data: Vec<u8> = (0..40u8).collect();
        assert_eq!(chain.fill(&data), 40);
        assert_eq!(chain.bytes_available(), 40);

        let mut out = vec![0u8; 40];
        assert_eq!(chain.drain(&mut out), 40);
        assert_eq!(out, data);
        assert_eq!(chain.bytes_available(), 0);
    }

    #[test]
    fn fill_is_bounded_by_spine_capacity() {
        let chain = small_chain();
        let data = vec![7u8; 100];
        // 3 buffers x 16 bytes.
        assert_eq!(chain.fill(&data), 48);
        assert_eq!(chain.fill(&data), 0);

        let mut out = vec![0u8; 16];
        assert_eq!(chain.drain(&mut out), 16);
        assert_eq!(chain.fill(&data), 16);
    }

    #[test]
    fn interleaved_order_is_preserved() {
        let chain = small_chain();
        let mut expect = Vec::new();
        let mut got = Vec::new();
        let mut next = 0u8;
        for round in 0..8 {
            let put = 1 + (round * 5) % 11;
            let data: Vec<u8> = (0..put).map(|_| {
                let b = next;
                next = next.wrapping_add(1);
                b
            }).collect();
            let accepted = chain.fill(&data);
            expect.extend_from_slice(&data[..accepted]);
            // When the spine refuses bytes, resynchronize the generator.
            next = next.wrapping_sub((put - accepted) as u8);

            let mut out = vec![0u8; 7];
            let drained = chain.drain(&mut out);
            got.extend_from_slice(&out[..drained]);
        }
        let mut out = vec![0u8; 64];
        let drained = chain.drain(&mut out);
        got.extend_from_slice(&out[..drained]);
        assert_eq!(got, expect);
    }

    #[test]
    fn undrain_restores_bytes_in_order() {
        let chain = small_chain();
        chain.fill(b"abcdefgh");
        let mut out = vec![0u8; 4];
        assert_eq!(chain.drain(&mut out), 4);
        assert_eq!(&out, b"abcd");

        chain.undrain(b"abcd");
        let mut out = vec![0u8; 8];
        assert_eq!(chain.drain(&mut out), 8);
        assert_eq!(&out, b"abcdefgh");
    }

    #[test]
    fn undrain_past_front_buffer_grows_spine() {
        let chain = small_chain();
        chain.fill(b"xy");
        let mut out = vec![0u8; 2];
        chain.drain(&mut out);
        assert_eq!(chain.bytes_available(), 0);

        // rdpos is 0; pushing back 20 bytes must insert spine buffers.
        let pushback: Vec<u8> = (0..20u8).collect();
        chain.undrain(&pushback);
        assert_eq!(chain.bytes_available(), 20);

        let mut out = vec![0u8; 20];
        assert_eq!(chain.drain(&mut out), 20);
        assert_eq!(out, pushback);
    }

    #[test]
    fn async_read_waits_for_write() {
        let chain = small_chain();
        let opts = Options::new();

        let rd = Task::new();
        let out = SharedBuf::new();
        chain.read(&rd, &out, 4, 8, &opts);
        assert!(!rd.is_done());

        let wr = Task::new();
        let n = ByteCount::new();
        chain.write(&wr, &n, b"abcdef", &opts);

        assert!(wr.result().is_ok());
        assert_eq!(n.get(), 6);
        assert!(rd.result().is_ok());
        assert_eq!(out.to_vec(), b"abcdef");
    }

    #[test]
    fn write_backpressure_completes_after_drain() {
        let chain = small_chain();
        let opts = Options::new();

        let wr = Task::new();
        let n = ByteCount::new();
        let data = vec![3u8; 60];
        chain.write(&wr, &n, &data, &opts);
        // Spine holds 48 bytes; the write is parked with partial progress.
        assert!(!wr.is_done());
        assert_eq!(n.get(), 48);

        // Draining one whole buffer recycles it and makes room.
        let mut out = vec![0u8; 16];
        assert_eq!(chain.drain(&mut out), 16);
        chain.process();

        assert!(wr.result().is_ok());
        assert_eq!(n.get(), 60);
        assert_eq!(chain.bytes_available(), 44);
    }

    #[test]
    fn fifo_completion_within_direction() {
        let chain = small_chain();
        let opts = Options::new();

        let rd1 = Task::new();
        let out1 = SharedBuf::new();
        chain.read(&rd1, &out1, 4, 4, &opts);
        let rd2 = Task::new();
        let out2 = SharedBuf::new();
        chain.read(&rd2, &out2, 4, 4, &opts);

        let wr = Task::new();
        let n = ByteCount::new();
        chain.write(&wr, &n, b"aaaabbbb", &opts);

        assert_eq!(out1.to_vec(), b"aaaa");
        assert_eq!(out2.to_vec(), b"bbbb");
    }

    #[test]
    fn read_error_after_drained() {
        let chain = small_chain();
        let opts = Options::new();
        chain.fill(b"qr");
        chain.fail_reads(Status::eof());

        let rd = Task::new();
        let out = SharedBuf::new();
        chain.read(&rd, &out, 4, 4, &opts);
        // Two bytes were delivered, then the terminal error.
        assert_eq!(rd.result().code(), Code::Eof);
        assert_eq!(out.to_vec(), b"qr");
    }

    #[test]
    fn write_error_fails_fast() {
        let chain = small_chain();
        let opts = Options::new();
        chain.fail_writes(Status::failed_precondition("closed"));

        let wr = Task::new();
        let n = ByteCount::new();
        chain.write(&wr, &n, b"abc", &opts);
        assert_eq!(wr.result().code(), Code::FailedPrecondition);
        assert_eq!(n.get(), 0);
    }

    #[test]
    fn wrfn_notifier_fires_when_full() {
        let chain = Arc::new(small_chain());
        let fired = Arc::new(Mutex::new(0usize));
        {
            let fired = Arc::clone(&fired);
            chain.set_wrfn(Arc::new(move |_opts| {
                *fired.lock().unwrap() += 1;
            }));
        }

        let opts = Options::new();
        let wr = Task::new();
        let n = ByteCount::new();
        chain.write(&wr, &n, &vec![1u8; 60], &opts);
        assert!(*fired.lock().unwrap() > 0);
    }
}
