//! Reader-to-writer copying.
//!
//! [`copy_n`] probes the endpoints' fast paths in order: the reader's
//! `write_to`, then the writer's `read_from`, and finally a pooled
//! read-then-write loop. A `NOT_IMPLEMENTED` answer moves to the next
//! strategy; anything else settles the copy.

use std::sync::{Arc, Mutex};

use crate::io::buffer::BufferPool;
use crate::io::reader::Reader;
use crate::io::writer::Writer;
use crate::io::{ByteCount, SharedBuf};
use crate::options::Options;
use crate::status::Code;
use crate::task::Task;

struct CopyHelper {
    task: Arc<Task>,
    copied: ByteCount,
    max: usize,
    writer: Writer,
    reader: Reader,
    pool: BufferPool,
    buffer: SharedBuf,
    eof: Mutex<bool>,
    opts: Options,
}

fn choose_pool(w: &Writer, r: &Reader) -> BufferPool {
    let block_size = w.block_size().max(r.block_size());
    let wpool = w.options().pool();
    let rpool = r.options().pool();
    let mut pool = if wpool.buffer_size() >= rpool.buffer_size() {
        wpool
    } else {
        rpool
    };
    if pool.buffer_size() < block_size {
        pool = BufferPool::null(block_size);
    }
    pool
}

impl CopyHelper {
    fn begin(helper: &Arc<CopyHelper>) {
        let subtask = Task::new();
        helper.task.add_subtask(&subtask);
        helper.reader.write_to(
            &subtask,
            &helper.copied,
            helper.max,
            &helper.writer,
            &helper.opts,
        );
        let this = Arc::clone(helper);
        let sub = Arc::clone(&subtask);
        subtask.on_finished(move || CopyHelper::write_to_complete(&this, &sub));
    }

    fn write_to_complete(helper: &Arc<CopyHelper>, sub: &Arc<Task>) {
        let r = sub.result();
        if r.code() != Code::NotImplemented {
            helper.task.finish(r);
            return;
        }
        let subtask = Task::new();
        helper.task.add_subtask(&subtask);
        helper.writer.read_from(
            &subtask,
            &helper.copied,
            helper.max,
            &helper.reader,
            &helper.opts,
        );
        let this = Arc::clone(helper);
        let sub = Arc::clone(&subtask);
        subtask.on_finished(move || CopyHelper::read_from_complete(&this, &sub));
    }

    fn read_from_complete(helper: &Arc<CopyHelper>, sub: &Arc<Task>) {
        let r = sub.result();
        if r.code() != Code::NotImplemented {
            helper.task.finish(r);
            return;
        }
        CopyHelper::fallback_read(helper);
    }

    fn fallback_read(helper: &Arc<CopyHelper>) {
        let subtask = Task::new();
        helper.task.add_subtask(&subtask);
        let mut len = helper.pool.buffer_size();
        let left = helper.max - helper.copied.get();
        if len > left {
            len = left;
        }
        let min = 1.min(len);
        helper
            .reader
            .read(&subtask, &helper.buffer, min, len, &helper.opts);
        let this = Arc::clone(helper);
        let sub = Arc::clone(&subtask);
        subtask.on_finished(move || CopyHelper::fallback_read_complete(&this, &sub));
    }

    fn fallback_read_complete(helper: &Arc<CopyHelper>, sub: &Arc<Task>) {
        let r = sub.result();
        match r.code() {
            Code::Ok => {
                *helper.eof.lock().unwrap() = helper.buffer.is_empty();
            }
            Code::Eof => {
                *helper.eof.lock().unwrap() = true;
            }
            _ => {
                helper.task.finish(r);
                return;
            }
        }

        let subtask = Task::new();
        helper.task.add_subtask(&subtask);
        let wn = ByteCount::new();
        let data = helper.buffer.take();
        helper.writer.write(&subtask, &wn, &data, &helper.opts);
        let this = Arc::clone(helper);
        let sub = Arc::clone(&subtask);
        subtask.on_finished(move || {
            this.copied.add(wn.get());
            let r = sub.result();
            if *this.eof.lock().unwrap() || !r.is_ok() {
                this.task.finish(r);
                return;
            }
            if this.copied.get() >= this.max {
                this.task.finish_ok();
                return;
            }
            CopyHelper::fallback_read(&this);
        });
    }
}

/// Copies up to `max` bytes from `r` into `w`, reporting through `task`
/// and metering through `copied`.
pub fn copy_n(
    task: &Arc<Task>,
    copied: &ByteCount,
    max: usize,
    w: &Writer,
    r: &Reader,
    opts: &Options,
) {
    copied.set(0);
    if !task.start() {
        return;
    }
    let helper = Arc::new(CopyHelper {
        task: Arc::clone(task),
        copied: copied.clone(),
        max,
        writer: w.clone(),
        reader: r.clone(),
        pool: choose_pool(w, r),
        buffer: SharedBuf::new(),
        eof: Mutex::new(false),
        opts: opts.clone(),
    });
    CopyHelper::begin(&helper);
}

/// Copies until the reader is exhausted.
pub fn copy(task: &Arc<Task>, copied: &ByteCount, w: &Writer, r: &Reader, opts: &Options) {
    copy_n(task, copied, usize::MAX, w, r, opts);
}
