//! An event-driven I/O runtime for Rust: readiness polling, a task and
//! dispatch model, buffered streaming with backpressure, and bounded
//! in-process caching.
//!
//! The building blocks, bottom up:
//!
//! * [`Status`] / [`Code`] — the error vocabulary shared by every component.
//! * [`Task`] — a single-shot rendezvous carrying a `Status` plus completion
//!   callbacks; supports cancellation and deadlines.
//! * [`Poller`] — a level-triggered readiness poller (epoll or poll).
//! * [`Dispatcher`] — runs callbacks inline, from a queue, or on an
//!   adaptively sized worker pool.
//! * [`Manager`] — binds one poller and one dispatcher, and owns fd, signal,
//!   timer and generic event registrations.
//! * [`io`] — `Reader`/`Writer` stream contracts, pooled buffers, the
//!   chained byte queue, in-process pipes, and fd-backed streams with
//!   `splice(2)`/`sendfile(2)` fast paths.
//! * [`cache`] — bounded key/value stores with Clock, LRU and CART
//!   eviction, driven through the task API.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hive_io::io::{make_pipe, SharedBuf, ByteCount};
//! use hive_io::options::Options;
//! use hive_io::task::Task;
//! use hive_io::manager;
//!
//! let opts = Options::new();
//! let m = manager::system_manager();
//! let pipe = make_pipe();
//!
//! let wr = Task::new();
//! let n = ByteCount::new();
//! pipe.write.write(&wr, &n, b"Hello, world!\n", &opts);
//!
//! let rd = Task::new();
//! let out = SharedBuf::new();
//! pipe.read.read(&rd, &out, 1, 64, &opts);
//!
//! manager::wait_all(&[m], &[Arc::clone(&wr), Arc::clone(&rd)]);
//! assert!(rd.result().is_ok());
//! assert_eq!(out.to_vec(), b"Hello, world!\n");
//! ```

#[macro_use]
extern crate log;

macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub mod cache;
pub mod cleanup;
pub mod dispatcher;
pub mod event;
pub mod io;
pub mod manager;
pub mod options;
pub mod poller;
pub mod ready;
pub mod status;
pub mod sys;
pub mod task;
pub mod token;

pub use dispatcher::{Dispatcher, DispatcherOptions, DispatcherStats, DispatcherType};
pub use event::{handler, Data, Handler};
pub use manager::{Manager, ManagerOptions};
pub use poller::{Poller, PollerType};
pub use ready::Ready;
pub use status::{Code, Status};
pub use task::Task;
pub use token::Token;
