//! The front door of the event layer.
//!
//! A [`Manager`] binds exactly one [`Poller`] and one [`Dispatcher`] and
//! owns every registration: descriptors, posix signals, timers, and generic
//! user-fired events. Poller threads block on readiness, convert low-level
//! events into [`Data`] records, resolve each record's handler by token, and
//! hand the callbacks to the dispatcher.
//!
//! Every manager also owns a non-blocking event pipe. Signal fan-out and
//! generic fires write fixed-size `Data` records to it; the poll loop parses
//! records until the pipe runs dry. A sentinel record (empty event set)
//! wakes pollers without dispatching anything, which is how shutdown gets
//! their attention.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::dispatcher::{self, Dispatcher, DispatcherOptions};
use crate::event::{handler, Data, Handler, DATA_WIRE_SIZE};
use crate::poller::{Poller, PollerType};
use crate::ready::Ready;
use crate::status::{Code, Status};
use crate::sys::pipe;
use crate::sys::signal;
use crate::sys::timerfd::{SetTimeFlags, TimerFd, TimerSpec};
use crate::task::Task;
use crate::token::{next_token, Token};

#[derive(Clone, Debug, Default)]
pub struct ManagerOptions {
    pub poller: PollerType,
    pub dispatcher: DispatcherOptions,
    /// Poller threads spawned at construction. Default 1.
    pub min_pollers: Option<usize>,
    /// Donated threads beyond this count go straight to the dispatcher.
    /// Default: same as `min_pollers`.
    pub max_pollers: Option<usize>,
}

impl ManagerOptions {
    /// A manager with no background threads at all: polling happens only
    /// when a caller donates (usually via [`wait`]). Handy for
    /// deterministic single-threaded use.
    pub fn async_mode() -> ManagerOptions {
        ManagerOptions {
            min_pollers: Some(0),
            max_pollers: Some(1),
            ..ManagerOptions::default()
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum RecordKind {
    Fd,
    Signal,
    Timer,
    Generic,
}

struct Record {
    kind: RecordKind,
    n: i32,
    set: Ready,
    handler: Arc<dyn Handler>,
    timer: Option<TimerFd>,
}

struct Registry {
    records: HashMap<Token, Record>,
    fds: HashMap<RawFd, Vec<Token>>,
    signals: HashMap<i32, Vec<Token>>,
    timers: HashMap<RawFd, Token>,
    pipe_rfd: RawFd,
    pipe_wfd: RawFd,
    current: usize,
    running: bool,
}

struct Core {
    poller: Poller,
    dispatcher: Dispatcher,
    mu: Mutex<Registry>,
    curr_cv: Condvar,
    min: usize,
    max: usize,
}

/// A cheaply cloneable handle to one manager.
#[derive(Clone)]
pub struct Manager {
    core: Arc<Core>,
}

type PendingCallbacks = Vec<(Arc<dyn Handler>, Data)>;

impl Manager {
    pub fn dispatcher(&self) -> Dispatcher {
        self.core.dispatcher.clone()
    }

    /// Watches `fd` for the events in `set`. Several watches may share one
    /// descriptor; the poller sees the union of their interest sets.
    pub fn fd(&self, fd: RawFd, set: Ready, h: Arc<dyn Handler>) -> Result<FdWatch, Status> {
        let mut reg = self.core.mu.lock().unwrap();
        if !reg.running {
            return Err(Status::failed_precondition("manager is shut down"));
        }
        let t = next_token();

        let is_new = !reg.fds.contains_key(&fd);
        let before = merged_interest(&reg, fd, None);

        reg.records.insert(
            t,
            Record {
                kind: RecordKind::Fd,
                n: fd,
                set,
                handler: h,
                timer: None,
            },
        );
        reg.fds.entry(fd).or_default().push(t);

        let result = if is_new {
            self.core.poller.add(fd, set)
        } else {
            let after = before | set;
            if before != after {
                self.core.poller.modify(fd, after)
            } else {
                Status::ok()
            }
        };
        if !result.is_ok() {
            let vec = reg.fds.get_mut(&fd).unwrap();
            vec.pop();
            if vec.is_empty() {
                reg.fds.remove(&fd);
            }
            reg.records.remove(&t);
            return Err(result);
        }
        Ok(FdWatch {
            core: Some(Arc::clone(&self.core)),
            fd,
            token: t,
        })
    }

    /// Routes `signo` through the process-wide trampoline into this
    /// manager's event pipe.
    pub fn signal(&self, signo: i32, h: Arc<dyn Handler>) -> Result<SignalWatch, Status> {
        let mut reg = self.core.mu.lock().unwrap();
        if !reg.running {
            return Err(Status::failed_precondition("manager is shut down"));
        }
        let t = next_token();

        reg.records.insert(
            t,
            Record {
                kind: RecordKind::Signal,
                n: signo,
                set: Ready::empty(),
                handler: h,
                timer: None,
            },
        );
        let vec = reg.signals.entry(signo).or_default();
        let was_empty = vec.is_empty();
        vec.push(t);

        if was_empty {
            let result = signal::tee_add(reg.pipe_wfd, signo);
            if !result.is_ok() {
                let vec = reg.signals.get_mut(&signo).unwrap();
                vec.pop();
                if vec.is_empty() {
                    reg.signals.remove(&signo);
                }
                reg.records.remove(&t);
                return Err(result);
            }
        }
        Ok(SignalWatch {
            core: Some(Arc::clone(&self.core)),
            signo,
            token: t,
        })
    }

    /// Creates an unarmed monotonic timer delivering to `h`.
    pub fn timer(&self, h: Arc<dyn Handler>) -> Result<TimerWatch, Status> {
        let mut reg = self.core.mu.lock().unwrap();
        if !reg.running {
            return Err(Status::failed_precondition("manager is shut down"));
        }
        let t = next_token();

        let timer = TimerFd::new().map_err(|e| Status::from_io_error(&e, "timerfd_create(2)"))?;
        let fd = timer.as_raw_fd();

        reg.records.insert(
            t,
            Record {
                kind: RecordKind::Timer,
                n: fd,
                set: Ready::empty(),
                handler: h,
                timer: Some(timer),
            },
        );
        reg.timers.insert(fd, t);

        let result = self.core.poller.add(fd, Ready::readable());
        if !result.is_ok() {
            reg.timers.remove(&fd);
            reg.records.remove(&t);
            return Err(result);
        }
        Ok(TimerWatch {
            core: Some(Arc::clone(&self.core)),
            token: t,
        })
    }

    /// Registers a generic event; deliveries are caused by
    /// [`GenericWatch::fire`].
    pub fn generic(&self, h: Arc<dyn Handler>) -> Result<GenericWatch, Status> {
        let mut reg = self.core.mu.lock().unwrap();
        if !reg.running {
            return Err(Status::failed_precondition("manager is shut down"));
        }
        let t = next_token();
        reg.records.insert(
            t,
            Record {
                kind: RecordKind::Generic,
                n: -1,
                set: Ready::empty(),
                handler: h,
                timer: None,
            },
        );
        Ok(GenericWatch {
            core: Some(Arc::clone(&self.core)),
            token: t,
        })
    }

    /// Arranges for `task.expire()` when the monotonic clock reaches `at`.
    /// Cancelling or finishing the task tears the timer down.
    pub fn set_deadline(&self, task: &Arc<Task>, at: Instant) -> Status {
        let delay = at.saturating_duration_since(Instant::now());
        if delay.is_zero() {
            return Status::invalid_argument("deadline must be strictly in the future");
        }
        self.set_timeout(task, delay)
    }

    /// Arranges for `task.expire()` after `delay`.
    pub fn set_timeout(&self, task: &Arc<Task>, delay: Duration) -> Status {
        if delay.is_zero() {
            return Status::invalid_argument("delay must be strictly positive");
        }
        let weak = Arc::downgrade(task);
        let h = handler(move |_data: &Data| {
            if let Some(task) = weak.upgrade() {
                task.expire();
            }
            Status::ok()
        });
        let watch = match self.timer(h) {
            Ok(watch) => watch,
            Err(err) => return err,
        };
        let r = watch.set_delay(delay);
        if r.is_ok() {
            task.on_finished(move || drop(watch));
        }
        r
    }

    /// Donates the calling thread to the manager. Below `min_pollers` the
    /// thread polls; between `min` and `max` it alternates dispatcher work
    /// with zero-timeout polls; above `max` it goes straight to the
    /// dispatcher.
    pub fn donate(&self, forever: bool) -> Status {
        let reg = self.core.mu.lock().unwrap();
        if reg.current >= self.core.max {
            drop(reg);
            self.donate_as_worker(forever)
        } else if reg.current >= self.core.min {
            self.donate_as_mixed(reg, forever)
        } else {
            self.donate_as_poller(reg, forever)
        }
    }

    fn donate_as_poller<'a>(&'a self, mut reg: MutexGuard<'a, Registry>, forever: bool) -> Status {
        let core = &self.core;
        reg.current += 1;
        core.curr_cv.notify_all();

        let mut events: Vec<(RawFd, Ready)> = Vec::new();
        let mut cbs: PendingCallbacks = Vec::new();
        let mut result = Status::ok();
        while reg.running {
            drop(reg);
            let r = core.poller.wait(&mut events, None);
            reg = core.mu.lock().unwrap();
            result = r;

            for &(fd, set) in &events {
                self.handle_event(&mut reg, &mut cbs, fd, set);
            }
            events.clear();

            drop(reg);
            for (h, data) in cbs.drain(..) {
                core.dispatcher
                    .dispatch(None, Box::new(move || h.on_event(&data)));
            }
            reg = core.mu.lock().unwrap();

            if !result.is_ok() {
                break;
            }
            if !forever {
                break;
            }
        }

        reg.current -= 1;
        core.curr_cv.notify_all();
        drop(reg);
        result.expect_ok();
        Status::ok()
    }

    fn donate_as_mixed<'a>(&'a self, mut reg: MutexGuard<'a, Registry>, forever: bool) -> Status {
        fn donate_ok(result: &Status) -> bool {
            result.is_ok() || result.code() == Code::NotImplemented
        }

        let core = &self.core;
        reg.current += 1;
        core.curr_cv.notify_all();

        let mut events: Vec<(RawFd, Ready)> = Vec::new();
        let mut cbs: PendingCallbacks = Vec::new();
        let mut result = Status::ok();
        while reg.running {
            drop(reg);
            let r = core.dispatcher.donate(false);
            reg = core.mu.lock().unwrap();
            if !donate_ok(&r) {
                result = r;
                break;
            }

            drop(reg);
            let r = core.poller.wait(&mut events, Some(Duration::from_millis(0)));
            reg = core.mu.lock().unwrap();
            result = r;

            for &(fd, set) in &events {
                self.handle_event(&mut reg, &mut cbs, fd, set);
            }
            events.clear();

            drop(reg);
            for (h, data) in cbs.drain(..) {
                core.dispatcher
                    .dispatch(None, Box::new(move || h.on_event(&data)));
            }
            reg = core.mu.lock().unwrap();

            if !result.is_ok() {
                break;
            }
            if !forever {
                break;
            }
        }

        reg.current -= 1;
        core.curr_cv.notify_all();
        drop(reg);
        result.expect_ok();
        Status::ok()
    }

    fn donate_as_worker(&self, forever: bool) -> Status {
        self.core.dispatcher.donate(forever)
    }

    fn handle_event(&self, reg: &mut Registry, cbs: &mut PendingCallbacks, fd: RawFd, set: Ready) {
        if fd == reg.pipe_rfd {
            self.handle_pipe_event(reg, cbs);
            return;
        }

        if let Some(&t) = reg.timers.get(&fd) {
            handle_timer_event(reg, cbs, t);
            return;
        }

        if let Some(tokens) = reg.fds.get(&fd) {
            let tokens = tokens.clone();
            handle_fd_event(reg, cbs, fd, set, &tokens);
            return;
        }

        Status::internal("BUG: fell off the end of Manager::handle_event").expect_ok();
    }

    fn handle_pipe_event(&self, reg: &mut Registry, cbs: &mut PendingCallbacks) {
        loop {
            let mut wire = [0u8; DATA_WIRE_SIZE];
            match pipe::read_exactly(reg.pipe_rfd, &mut wire) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    Status::from_io_error(&err, "event pipe").expect_ok();
                    return;
                }
                Ok(()) => {}
            }
            let mut data = Data::decode(&wire);

            if data.events.is_signal() {
                for (&t, rec) in reg.records.iter() {
                    if rec.kind == RecordKind::Signal && rec.n == data.signal_number {
                        data.token = t;
                        cbs.push((Arc::clone(&rec.handler), data));
                    }
                }
            }

            if data.events.is_event() {
                if let Some(rec) = reg.records.get(&data.token) {
                    if rec.kind == RecordKind::Generic {
                        cbs.push((Arc::clone(&rec.handler), data));
                    }
                }
            }
        }
    }

    /// Tears the manager down: drops every registration, wakes and joins
    /// the pollers, closes the event pipe, and shuts the dispatcher down.
    /// A second shutdown fails with `FAILED_PRECONDITION`.
    pub fn shutdown(&self) -> Status {
        let core = &self.core;
        let mut reg = core.mu.lock().unwrap();

        if !reg.running {
            return Status::failed_precondition("manager is already stopped");
        }
        reg.running = false;

        // Throw away all handlers and ancillary data. Dropping a timer
        // record closes its timerfd, which also evicts it from the poller.
        signal::tee_remove_all(reg.pipe_wfd);
        reg.fds.clear();
        reg.signals.clear();
        reg.timers.clear();
        reg.records.clear();

        // Wake the pollers with sentinels until they have all noticed.
        while reg.current > 0 {
            let sentinel = Data::new().encode();
            if let Err(err) = pipe::write_exactly(reg.pipe_wfd, &sentinel) {
                Status::from_io_error(&err, "event pipe").expect_ok();
            }
            reg = core.curr_cv.wait(reg).unwrap();
        }

        let rfd = std::mem::replace(&mut reg.pipe_rfd, -1);
        let wfd = std::mem::replace(&mut reg.pipe_wfd, -1);
        let w_rc = syscall!(close(wfd));
        let r_rc = syscall!(close(rfd));
        drop(reg);

        core.dispatcher.shutdown();
        if let Err(err) = w_rc {
            return Status::from_io_error(&err, "close(2)");
        }
        if let Err(err) = r_rc {
            return Status::from_io_error(&err, "close(2)");
        }
        Status::ok()
    }

    fn fd_get(&self, fd: RawFd, t: Token) -> Result<Ready, Status> {
        let reg = self.core.mu.lock().unwrap();
        let rec = reg.records.get(&t).ok_or_else(Status::not_found)?;
        if rec.kind != RecordKind::Fd {
            return Err(Status::wrong_type());
        }
        if rec.n != fd {
            return Err(Status::invalid_argument("wrong fd"));
        }
        Ok(rec.set)
    }

    fn fd_modify(&self, fd: RawFd, t: Token, set: Ready) -> Status {
        let mut reg = self.core.mu.lock().unwrap();
        match reg.records.get(&t) {
            None => return Status::not_found(),
            Some(rec) => {
                if rec.kind != RecordKind::Fd {
                    return Status::wrong_type();
                }
                if rec.n != fd {
                    return Status::invalid_argument("wrong fd");
                }
            }
        }
        if !reg.fds.contains_key(&fd) {
            return Status::not_found();
        }

        let before = merged_interest(&reg, fd, None);
        let after = merged_interest(&reg, fd, Some((t, set)));

        let result = if before != after {
            self.core.poller.modify(fd, after)
        } else {
            Status::ok()
        };
        if result.is_ok() {
            reg.records.get_mut(&t).unwrap().set = set;
        }
        result
    }

    fn fd_remove(&self, fd: RawFd, t: Token) -> Status {
        let mut reg = self.core.mu.lock().unwrap();
        match reg.records.get(&t) {
            None => return Status::not_found(),
            Some(rec) => {
                if rec.kind != RecordKind::Fd {
                    return Status::wrong_type();
                }
                if rec.n != fd {
                    return Status::invalid_argument("wrong fd");
                }
            }
        }
        reg.records.remove(&t);

        let vec = match reg.fds.get_mut(&fd) {
            None => return Status::not_found(),
            Some(vec) => vec,
        };
        vec.retain(|&other| other != t);
        let empty = vec.is_empty();

        if empty {
            reg.fds.remove(&fd);
            self.core.poller.remove(fd)
        } else {
            let after = merged_interest(&reg, fd, None);
            self.core.poller.modify(fd, after)
        }
    }

    fn signal_remove(&self, signo: i32, t: Token) -> Status {
        let mut reg = self.core.mu.lock().unwrap();
        match reg.records.get(&t) {
            None => return Status::not_found(),
            Some(rec) => {
                if rec.kind != RecordKind::Signal {
                    return Status::wrong_type();
                }
                if rec.n != signo {
                    return Status::invalid_argument("wrong signal");
                }
            }
        }
        reg.records.remove(&t);

        let vec = match reg.signals.get_mut(&signo) {
            None => return Status::not_found(),
            Some(vec) => vec,
        };
        vec.retain(|&other| other != t);

        if vec.is_empty() {
            reg.signals.remove(&signo);
            return signal::tee_remove(reg.pipe_wfd, signo);
        }
        Status::ok()
    }

    fn timer_arm(&self, t: Token, delay: Duration, period: Duration) -> Status {
        let reg = self.core.mu.lock().unwrap();
        let rec = match reg.records.get(&t) {
            None => return Status::not_found(),
            Some(rec) => rec,
        };
        if rec.kind != RecordKind::Timer {
            return Status::wrong_type();
        }
        let spec = TimerSpec {
            interval: period,
            value: delay,
        };
        match rec
            .timer
            .as_ref()
            .unwrap()
            .settime(spec, SetTimeFlags::Default)
        {
            Ok(_) => Status::ok(),
            Err(err) => Status::from_io_error(&err, "timerfd_settime(2)"),
        }
    }

    fn timer_remove(&self, t: Token) -> Status {
        let mut reg = self.core.mu.lock().unwrap();
        let rec = match reg.records.get(&t) {
            None => return Status::not_found(),
            Some(rec) => rec,
        };
        if rec.kind != RecordKind::Timer {
            return Status::wrong_type();
        }
        let fd = rec.n;
        reg.timers.remove(&fd);
        self.core.poller.remove(fd).expect_ok();
        reg.records.remove(&t);
        Status::ok()
    }

    fn generic_fire(&self, t: Token, value: i64) -> Status {
        let mut data = Data::new();
        data.token = t;
        data.int_value = value;
        data.events = Ready::event();

        let reg = self.core.mu.lock().unwrap();
        match reg.records.get(&t) {
            None => return Status::not_found(),
            Some(rec) => {
                if rec.kind != RecordKind::Generic {
                    return Status::wrong_type();
                }
            }
        }
        match pipe::write_exactly(reg.pipe_wfd, &data.encode()) {
            Ok(()) => Status::ok(),
            Err(err) => Status::from_io_error(&err, "event pipe"),
        }
    }

    fn generic_remove(&self, t: Token) -> Status {
        let mut reg = self.core.mu.lock().unwrap();
        match reg.records.get(&t) {
            None => return Status::not_found(),
            Some(rec) => {
                if rec.kind != RecordKind::Generic {
                    return Status::wrong_type();
                }
            }
        }
        reg.records.remove(&t);
        Status::ok()
    }
}

/// The union of every token's interest on `fd`, with `override_token`'s
/// contribution replaced when given.
fn merged_interest(reg: &Registry, fd: RawFd, replace: Option<(Token, Ready)>) -> Ready {
    let mut set = Ready::empty();
    if let Some(tokens) = reg.fds.get(&fd) {
        for &t in tokens {
            match replace {
                Some((rt, rset)) if rt == t => set |= rset,
                _ => {
                    if let Some(rec) = reg.records.get(&t) {
                        set |= rec.set;
                    }
                }
            }
        }
    }
    set
}

fn handle_timer_event(reg: &mut Registry, cbs: &mut PendingCallbacks, t: Token) {
    let rec = match reg.records.get(&t) {
        None => return,
        Some(rec) => rec,
    };
    let count = match rec.timer.as_ref().unwrap().read() {
        Ok(count) => count,
        Err(err) => {
            if err.kind() != io::ErrorKind::WouldBlock {
                Status::from_io_error(&err, "timerfd").expect_ok();
            }
            return;
        }
    };

    let mut data = Data::new();
    data.token = t;
    data.int_value = count.min(i64::MAX as u64) as i64;
    data.events = Ready::timer();
    cbs.push((Arc::clone(&rec.handler), data));
}

fn handle_fd_event(
    reg: &mut Registry,
    cbs: &mut PendingCallbacks,
    fd: RawFd,
    set: Ready,
    tokens: &[Token],
) {
    for &t in tokens {
        if let Some(rec) = reg.records.get(&t) {
            let mut data = Data::new();
            data.token = t;
            data.fd = fd;
            data.events = rec.set & set;
            if !data.events.is_empty() {
                cbs.push((Arc::clone(&rec.handler), data));
            }
        }
    }
}

// Watch handles {{{

/// A live descriptor registration; releasing (or dropping) it deregisters.
pub struct FdWatch {
    core: Option<Arc<Core>>,
    fd: RawFd,
    token: Token,
}

impl FdWatch {
    pub fn get(&self) -> Result<Ready, Status> {
        match &self.core {
            Some(core) => Manager { core: Arc::clone(core) }.fd_get(self.fd, self.token),
            None => Err(Status::failed_precondition("watch is empty")),
        }
    }

    pub fn modify(&self, set: Ready) -> Status {
        match &self.core {
            Some(core) => Manager { core: Arc::clone(core) }.fd_modify(self.fd, self.token, set),
            None => Status::failed_precondition("watch is empty"),
        }
    }

    pub fn release(&mut self) -> Status {
        match self.core.take() {
            Some(core) => Manager { core }.fd_remove(self.fd, self.token),
            None => Status::ok(),
        }
    }
}

impl Drop for FdWatch {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// A live signal registration.
pub struct SignalWatch {
    core: Option<Arc<Core>>,
    signo: i32,
    token: Token,
}

impl SignalWatch {
    pub fn release(&mut self) -> Status {
        match self.core.take() {
            Some(core) => Manager { core }.signal_remove(self.signo, self.token),
            None => Status::ok(),
        }
    }
}

impl Drop for SignalWatch {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// A live timer registration backed by a monotonic timer descriptor.
pub struct TimerWatch {
    core: Option<Arc<Core>>,
    token: Token,
}

impl TimerWatch {
    fn arm(&self, delay: Duration, period: Duration) -> Status {
        match &self.core {
            Some(core) => Manager { core: Arc::clone(core) }.timer_arm(self.token, delay, period),
            None => Status::failed_precondition("watch is empty"),
        }
    }

    /// One shot, at an absolute monotonic instant.
    pub fn set_at(&self, at: Instant) -> Status {
        let delay = at.saturating_duration_since(Instant::now());
        if delay.is_zero() {
            return Status::invalid_argument("initial event must be strictly in the future");
        }
        self.arm(delay, Duration::ZERO)
    }

    /// One shot, after a delay.
    pub fn set_delay(&self, delay: Duration) -> Status {
        if delay.is_zero() {
            return Status::invalid_argument("delay must be strictly positive");
        }
        self.arm(delay, Duration::ZERO)
    }

    /// Fires every `period`, starting one period from now.
    pub fn set_periodic(&self, period: Duration) -> Status {
        if period.is_zero() {
            return Status::invalid_argument("zero period doesn't make sense");
        }
        self.arm(period, period)
    }

    /// Fires every `period`, starting after `delay`.
    pub fn set_periodic_delay(&self, period: Duration, delay: Duration) -> Status {
        if period.is_zero() {
            return Status::invalid_argument("zero period doesn't make sense");
        }
        if delay.is_zero() {
            return Status::invalid_argument("delay must be strictly positive");
        }
        self.arm(delay, period)
    }

    /// Disarms without releasing the registration.
    pub fn cancel(&self) -> Status {
        self.arm(Duration::ZERO, Duration::ZERO)
    }

    pub fn release(&mut self) -> Status {
        match self.core.take() {
            Some(core) => Manager { core }.timer_remove(self.token),
            None => Status::ok(),
        }
    }
}

impl Drop for TimerWatch {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// A live generic-event registration.
pub struct GenericWatch {
    core: Option<Arc<Core>>,
    token: Token,
}

impl GenericWatch {
    /// Queues one delivery carrying `value` onto the event pipe.
    pub fn fire(&self, value: i64) -> Status {
        match &self.core {
            Some(core) => Manager { core: Arc::clone(core) }.generic_fire(self.token, value),
            None => Status::failed_precondition("watch is empty"),
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn release(&mut self) -> Status {
        match self.core.take() {
            Some(core) => Manager { core }.generic_remove(self.token),
            None => Status::ok(),
        }
    }
}

impl Drop for GenericWatch {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

// }}}

/// Builds a manager from options: poller type, dispatcher configuration,
/// and the poller thread range.
pub fn new_manager(o: &ManagerOptions) -> Result<Manager, Status> {
    let min = o.min_pollers.unwrap_or(1);
    let max = o.max_pollers.unwrap_or(min);
    if min > max {
        return Err(Status::invalid_argument("min_pollers > max_pollers"));
    }
    if max < 1 {
        return Err(Status::invalid_argument("max_pollers < 1"));
    }

    let (rfd, wfd) = pipe::make_pipe().map_err(|e| Status::from_io_error(&e, "pipe2(2)"))?;
    let pipe_cleanup = crate::cleanup::Cleanup::new(|| unsafe {
        let _ = libc::close(rfd);
        let _ = libc::close(wfd);
    });
    pipe::set_nonblocking(rfd).map_err(|e| Status::from_io_error(&e, "fcntl(2)"))?;

    let poller = Poller::new(o.poller)?;
    let r = poller.add(rfd, Ready::readable());
    if !r.is_ok() {
        return Err(r);
    }

    let dispatcher = dispatcher::new_dispatcher(&o.dispatcher)?;

    let core = Arc::new(Core {
        poller,
        dispatcher,
        mu: Mutex::new(Registry {
            records: HashMap::new(),
            fds: HashMap::new(),
            signals: HashMap::new(),
            timers: HashMap::new(),
            pipe_rfd: rfd,
            pipe_wfd: wfd,
            current: 0,
            running: true,
        }),
        curr_cv: Condvar::new(),
        min,
        max,
    });
    pipe_cleanup.cancel();

    let manager = Manager { core };
    for _ in 0..min {
        let m = manager.clone();
        let spawned = thread::Builder::new()
            .name("event-poller".into())
            .spawn(move || {
                m.donate(true).expect_ok();
            });
        if let Err(err) = spawned {
            manager.shutdown().expect_ok();
            return Err(Status::internal(format!(
                "failed to spawn poller thread: {}",
                err
            )));
        }
    }
    {
        let mut reg = manager.core.mu.lock().unwrap();
        while reg.current < min {
            reg = manager.core.curr_cv.wait(reg).unwrap();
        }
    }
    Ok(manager)
}

static SYSTEM: Mutex<Option<Manager>> = Mutex::new(None);

/// The process-wide shared manager, built lazily with default options.
pub fn system_manager() -> Manager {
    let mut guard = SYSTEM.lock().unwrap();
    if guard.is_none() {
        let m = new_manager(&ManagerOptions::default()).expect("failed to build system manager");
        *guard = Some(m);
    }
    guard.as_ref().unwrap().clone()
}

pub fn set_system_manager(m: Manager) {
    *SYSTEM.lock().unwrap() = Some(m);
}

// Rendezvous {{{

struct WaitData {
    mu: Mutex<usize>,
    cv: Condvar,
}

/// Blocks until at least `n` of `tasks` have finished, donating the calling
/// thread to the managers so single-threaded configurations make progress.
pub fn wait_n(managers: &[Manager], tasks: &[Arc<Task>], n: usize) {
    assert!(
        n <= tasks.len(),
        "asked to wait for more task completions than there are tasks"
    );

    let data = Arc::new(WaitData {
        mu: Mutex::new(0),
        cv: Condvar::new(),
    });
    for task in tasks {
        let data = Arc::clone(&data);
        task.on_finished(move || {
            *data.mu.lock().unwrap() += 1;
            data.cv.notify_all();
        });
    }

    let any_threaded = managers
        .iter()
        .any(|m| m.dispatcher().kind() == crate::dispatcher::DispatcherType::Threaded);

    let mut done = data.mu.lock().unwrap();
    while *done < n {
        // Inline? Maybe it's blocked on I/O. Try donating.
        // Async? Just donate.
        // Threaded? Don't be so eager to join the fray.
        if any_threaded {
            let (guard, _) = data
                .cv
                .wait_timeout(done, Duration::from_millis(1))
                .unwrap();
            done = guard;
            if *done >= n {
                return;
            }
        }
        drop(done);
        for m in managers {
            m.donate(false).expect_ok();
        }
        done = data.mu.lock().unwrap();
    }
}

/// Blocks until `task` finishes.
pub fn wait(m: &Manager, task: &Arc<Task>) {
    wait_n(std::slice::from_ref(m), std::slice::from_ref(task), 1);
}

/// Blocks until every task finishes.
pub fn wait_all(managers: &[Manager], tasks: &[Arc<Task>]) {
    wait_n(managers, tasks, tasks.len());
}

// }}}
