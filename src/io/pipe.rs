//! An in-process pipe: a shared [`Chain`] bridging a write-side
//! [`Writer`] and a read-side [`Reader`] with backpressure.
//!
//! Closing the write side installs `EOF` on reads and
//! `FAILED_PRECONDITION` on further writes; closing the read side installs
//! `FAILED_PRECONDITION` on both sides and flushes the queue.

use std::sync::{Arc, Mutex};

use crate::io::buffer::BufferPool;
use crate::io::chain::Chain;
use crate::io::reader::{close_prologue, ReadImpl, Reader};
use crate::io::writer::{WriteImpl, Writer};
use crate::io::{ByteCount, SharedBuf, DEFAULT_BLOCK_SIZE, DEFAULT_MAX_BUFFERS};
use crate::options::Options;
use crate::status::Status;
use crate::task::Task;

fn closed_pipe() -> Status {
    Status::failed_precondition("pipe is closed")
}

struct Guts {
    chain: Chain,
    flags: Mutex<Flags>,
}

#[derive(Default)]
struct Flags {
    rdclosed: bool,
    wrclosed: bool,
}

/// Closes the read side: every future operation on either side fails and
/// queued bytes are discarded. Returns true if it was already closed.
fn close_read_side(guts: &Guts) -> bool {
    let mut flags = guts.flags.lock().unwrap();
    if flags.rdclosed {
        return true;
    }
    guts.chain.fail_writes(closed_pipe());
    guts.chain.fail_reads(closed_pipe());
    guts.chain.flush();
    guts.chain.process();
    flags.rdclosed = true;
    flags.wrclosed = true;
    false
}

/// Closes the write side: readers drain what is queued and then see EOF.
/// Returns true if it was already closed.
fn close_write_side(guts: &Guts) -> bool {
    let mut flags = guts.flags.lock().unwrap();
    if flags.wrclosed {
        return true;
    }
    guts.chain.fail_writes(closed_pipe());
    guts.chain.fail_reads(Status::eof());
    guts.chain.process();
    flags.wrclosed = true;
    false
}

struct PipeReader {
    guts: Arc<Guts>,
    bufsz: usize,
}

impl ReadImpl for PipeReader {
    fn ideal_block_size(&self) -> usize {
        self.bufsz
    }

    fn read(&self, task: &Arc<Task>, out: &SharedBuf, min: usize, max: usize, opts: &Options) {
        self.guts.chain.read(task, out, min, max, opts);
    }

    fn close(&self, task: &Arc<Task>, _opts: &Options) {
        let was = close_read_side(&self.guts);
        if close_prologue(task) {
            if was {
                task.finish(closed_pipe());
            } else {
                task.finish_ok();
            }
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        close_read_side(&self.guts);
    }
}

struct PipeWriter {
    guts: Arc<Guts>,
    bufsz: usize,
}

impl WriteImpl for PipeWriter {
    fn ideal_block_size(&self) -> usize {
        self.bufsz
    }

    fn write(&self, task: &Arc<Task>, n: &ByteCount, data: &[u8], opts: &Options) {
        self.guts.chain.write(task, n, data, opts);
    }

    fn close(&self, task: &Arc<Task>, _opts: &Options) {
        let was = close_write_side(&self.guts);
        if close_prologue(task) {
            if was {
                task.finish(closed_pipe());
            } else {
                task.finish_ok();
            }
        }
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        close_write_side(&self.guts);
    }
}

/// The two ends of an in-process pipe.
pub struct Pipe {
    pub read: Reader,
    pub write: Writer,
}

/// Builds a pipe over a fresh default-sized chain.
pub fn make_pipe() -> Pipe {
    make_pipe_with(BufferPool::new(DEFAULT_BLOCK_SIZE), DEFAULT_MAX_BUFFERS)
}

/// Builds a pipe whose chain draws from `pool` and holds at most
/// `max_buffers` spine buffers.
pub fn make_pipe_with(pool: BufferPool, max_buffers: usize) -> Pipe {
    let bufsz = pool.buffer_size();
    let guts = Arc::new(Guts {
        chain: Chain::new(pool, max_buffers),
        flags: Mutex::new(Flags::default()),
    });
    Pipe {
        read: Reader::new(Arc::new(PipeReader {
            guts: Arc::clone(&guts),
            bufsz,
        })),
        write: Writer::new(Arc::new(PipeWriter { guts, bufsz })),
    }
}
