//! Runs callback bodies: inline, queued, or on an adaptively sized worker
//! pool.
//!
//! Every variant accepts work through [`Dispatcher::dispatch`]; the task may
//! be omitted for fire-and-forget execution, in which case a failing status
//! is logged instead of stamped. User callbacks run under a panic shield: a
//! panicking callback finishes its task with an `INTERNAL` status (or is
//! logged), and each dispatcher counts completed callbacks and caught
//! panics for [`Dispatcher::stats`].

use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use concurrent_queue::ConcurrentQueue;

use crate::status::Status;
use crate::task::{panic_message, Task};

/// A callback body. The returned status finishes the owning task.
pub type Callback = Box<dyn FnOnce() -> Status + Send>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum DispatcherType {
    /// Run callbacks on the caller's thread, synchronously.
    Inline,
    /// Queue callbacks; they run when a thread donates itself.
    #[default]
    Async,
    /// A worker pool sized to the workload.
    Threaded,
    /// The process-wide shared dispatcher.
    System,
}

#[derive(Clone, Debug, Default)]
pub struct DispatcherOptions {
    pub kind: DispatcherType,
    pub min_workers: Option<usize>,
    pub max_workers: Option<usize>,
}

/// A point-in-time snapshot of a dispatcher's gauges and counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub min_workers: usize,
    pub max_workers: usize,
    pub desired_num_workers: usize,
    pub current_num_workers: usize,
    pub pending_count: usize,
    pub active_count: usize,
    pub completed_count: usize,
    pub caught_exceptions: usize,
    pub corked: bool,
}

struct Work {
    task: Option<Arc<Task>>,
    callback: Callback,
}

thread_local! {
    static DONATE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> DepthGuard {
        DONATE_DEPTH.with(|depth| {
            assert_eq!(depth.get(), 0, "Dispatcher::donate is not re-entrant");
            depth.set(1);
        });
        DepthGuard
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DONATE_DEPTH.with(|depth| depth.set(0));
    }
}

/// Runs one callback under the panic shield. Returns true if a panic was
/// caught.
fn invoke(work: Work) -> bool {
    let Work { task, callback } = work;
    let run = match &task {
        Some(task) => task.start(),
        None => true,
    };
    if !run {
        return false;
    }
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(result) => {
            match &task {
                Some(task) => task.finish(result),
                None => result.expect_ok(),
            }
            false
        }
        Err(payload) => {
            match &task {
                Some(task) => task.finish_panic(payload),
                None => error!(
                    "dispatched callback panicked: {}",
                    panic_message(payload)
                ),
            }
            true
        }
    }
}

// Inline {{{

#[derive(Default)]
struct InlineState {
    counters: Mutex<(usize, usize, usize)>, // (busy, done, caught)
}

impl InlineState {
    fn dispatch(&self, work: Work) {
        self.counters.lock().unwrap().0 += 1;
        let caught = invoke(work);
        let mut counters = self.counters.lock().unwrap();
        counters.0 -= 1;
        counters.1 += 1;
        if caught {
            counters.2 += 1;
        }
    }

    fn stats(&self) -> DispatcherStats {
        let counters = self.counters.lock().unwrap();
        DispatcherStats {
            active_count: counters.0,
            completed_count: counters.1,
            caught_exceptions: counters.2,
            ..DispatcherStats::default()
        }
    }
}

// }}}
// Async {{{

struct AsyncState {
    queue: ConcurrentQueue<Work>,
    counters: Mutex<(usize, usize, usize)>,
}

impl AsyncState {
    fn new() -> AsyncState {
        AsyncState {
            queue: ConcurrentQueue::unbounded(),
            counters: Mutex::new((0, 0, 0)),
        }
    }

    fn dispatch(&self, work: Work) {
        // The queue only closes at drop, so a push cannot fail here.
        let _ = self.queue.push(work);
    }

    fn donate(&self) -> Status {
        let _depth = DepthGuard::enter();
        while let Ok(work) = self.queue.pop() {
            self.counters.lock().unwrap().0 += 1;
            let caught = invoke(work);
            let mut counters = self.counters.lock().unwrap();
            counters.0 -= 1;
            counters.1 += 1;
            if caught {
                counters.2 += 1;
            }
        }
        Status::ok()
    }

    fn stats(&self) -> DispatcherStats {
        let counters = self.counters.lock().unwrap();
        DispatcherStats {
            pending_count: self.queue.len(),
            active_count: counters.0,
            completed_count: counters.1,
            caught_exceptions: counters.2,
            ..DispatcherStats::default()
        }
    }
}

// }}}
// Threaded {{{

const INITIAL_IDLE_TIMEOUT: Duration = Duration::from_millis(125);
const MAXIMUM_IDLE_TIMEOUT: Duration = Duration::from_millis(8000);

struct PoolInner {
    work: VecDeque<Work>,
    min: usize,
    max: usize,
    desired: usize,
    current: usize,
    busy: usize,
    done: usize,
    caught: usize,
    corked: bool,
}

struct PoolState {
    mu: Mutex<PoolInner>,
    work_cv: Condvar,
    curr_cv: Condvar,
    busy_cv: Condvar,
}

impl PoolState {
    fn new(min: usize, mut max: usize) -> Arc<PoolState> {
        if min > max {
            error!("BUG: min_workers > max_workers");
            max = min;
        }
        let state = Arc::new(PoolState {
            mu: Mutex::new(PoolInner {
                work: VecDeque::new(),
                min,
                max,
                desired: min,
                current: 0,
                busy: 0,
                done: 0,
                caught: 0,
                corked: false,
            }),
            work_cv: Condvar::new(),
            curr_cv: Condvar::new(),
            busy_cv: Condvar::new(),
        });
        let mut inner = state.mu.lock().unwrap();
        PoolState::ensure(&state, &inner);
        while inner.current < inner.min {
            inner = state.curr_cv.wait(inner).unwrap();
        }
        drop(inner);
        state
    }

    /// Spawns workers until the running count can reach `desired`. Threads
    /// that haven't finished starting still count toward the goal.
    fn ensure(state: &Arc<PoolState>, inner: &PoolInner) {
        for _ in inner.current..inner.desired {
            let state = Arc::clone(state);
            let spawned = thread::Builder::new()
                .name("dispatch-worker".into())
                .spawn(move || {
                    PoolState::donate(&state, true).expect_ok();
                });
            if let Err(err) = spawned {
                error!("failed to spawn dispatch worker: {}", err);
            }
        }
    }

    fn dispatch(state: &Arc<PoolState>, work: Work) {
        let mut inner = state.mu.lock().unwrap();
        inner.work.push_back(work);
        if inner.corked {
            return;
        }

        let n = inner.work.len();
        // HEURISTIC: if queue size is greater than num threads, add a
        // thread. This is (intentionally) a fairly aggressive growth
        // policy.
        if inner.desired < inner.max && n >= inner.desired {
            inner.desired += 1;
            PoolState::ensure(state, &inner);
        }
        state.work_cv.notify_one();
    }

    fn donate(state: &Arc<PoolState>, forever: bool) -> Status {
        let _depth = DepthGuard::enter();

        let mut ms = INITIAL_IDLE_TIMEOUT;
        let mut inner = state.mu.lock().unwrap();
        inner.current += 1;
        state.curr_cv.notify_all();

        loop {
            while !inner.corked && !inner.work.is_empty() {
                if inner.current > inner.max {
                    break;
                }
                ms = INITIAL_IDLE_TIMEOUT;
                let item = inner.work.pop_front().unwrap();
                inner.busy += 1;
                drop(inner);
                let caught = invoke(item);
                inner = state.mu.lock().unwrap();
                inner.busy -= 1;
                inner.done += 1;
                if caught {
                    inner.caught += 1;
                }
                if inner.busy == 0 {
                    state.busy_cv.notify_all();
                }
            }
            if inner.current > inner.desired {
                break;
            }
            if !inner.corked && !inner.work.is_empty() {
                continue;
            }
            if !forever {
                break;
            }
            let (guard, timeout) = state.work_cv.wait_timeout(inner, ms).unwrap();
            inner = guard;
            if timeout.timed_out() {
                // HEURISTIC: after waiting roughly 2x the maximum timeout
                // with nothing arriving, shed one thread. Every idle worker
                // runs this clock in parallel, so all surplus workers are
                // pruned once enough time passes.
                if ms < MAXIMUM_IDLE_TIMEOUT {
                    ms *= 2;
                } else if inner.desired > inner.min {
                    inner.desired -= 1;
                }
            }
        }

        inner.current -= 1;
        state.curr_cv.notify_all();
        Status::ok()
    }

    fn cork(&self) -> Status {
        let mut inner = self.mu.lock().unwrap();
        if inner.corked {
            return Status::failed_precondition("Dispatcher is already corked");
        }
        inner.corked = true;
        while inner.busy > 0 {
            inner = self.busy_cv.wait(inner).unwrap();
        }
        Status::ok()
    }

    fn uncork(state: &Arc<PoolState>) -> Status {
        let mut inner = state.mu.lock().unwrap();
        if !inner.corked {
            return Status::failed_precondition("Dispatcher is not corked");
        }
        inner.corked = false;
        if !inner.work.is_empty() {
            // HEURISTIC: when uncorking, aggressively spawn one thread per
            // queued callback.
            let n = inner.work.len().min(inner.max);
            if n > inner.desired {
                inner.desired = n;
                PoolState::ensure(state, &inner);
            }
            state.work_cv.notify_all();
        }
        Status::ok()
    }

    fn adjust(state: &Arc<PoolState>, opts: &DispatcherOptions) -> Status {
        let mut inner = state.mu.lock().unwrap();
        let min = opts.min_workers.unwrap_or(inner.min);
        let max = opts.max_workers.unwrap_or_else(|| min.max(inner.max));
        if min > max {
            return Status::invalid_argument("bad DispatcherOptions: min_workers > max_workers");
        }
        inner.min = min;
        inner.max = max;
        inner.desired = inner.desired.clamp(min, max);
        PoolState::ensure(state, &inner);
        state.work_cv.notify_all();
        // Block until the thread count is within the new bounds.
        while inner.current < inner.min {
            inner = state.curr_cv.wait(inner).unwrap();
        }
        while inner.current > inner.max {
            inner = state.curr_cv.wait(inner).unwrap();
        }
        Status::ok()
    }

    fn shutdown(&self) {
        let mut inner = self.mu.lock().unwrap();
        inner.min = 0;
        inner.max = 0;
        inner.desired = 0;
        self.work_cv.notify_all();
        while inner.current > inner.desired {
            inner = self.curr_cv.wait(inner).unwrap();
        }
    }

    fn stats(&self) -> DispatcherStats {
        let inner = self.mu.lock().unwrap();
        DispatcherStats {
            min_workers: inner.min,
            max_workers: inner.max,
            desired_num_workers: inner.desired,
            current_num_workers: inner.current,
            pending_count: inner.work.len(),
            active_count: inner.busy,
            completed_count: inner.done,
            caught_exceptions: inner.caught,
            corked: inner.corked,
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if self.current > 0 {
            warn!("thread pool dropped with {} workers live", self.current);
        }
    }
}

// }}}

enum Flavor {
    Inline(InlineState),
    Async(AsyncState),
    Threaded(Arc<PoolState>),
}

/// A cheaply cloneable handle to one dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    flavor: Arc<Flavor>,
}

impl Dispatcher {
    pub fn kind(&self) -> DispatcherType {
        match &*self.flavor {
            Flavor::Inline(_) => DispatcherType::Inline,
            Flavor::Async(_) => DispatcherType::Async,
            Flavor::Threaded(_) => DispatcherType::Threaded,
        }
    }

    /// Submits a callback. With a task, the callback's status finishes it;
    /// without one, a failing status is logged.
    pub fn dispatch(&self, task: Option<&Arc<Task>>, callback: Callback) {
        let work = Work {
            task: task.map(Arc::clone),
            callback,
        };
        match &*self.flavor {
            Flavor::Inline(state) => state.dispatch(work),
            Flavor::Async(state) => state.dispatch(work),
            Flavor::Threaded(state) => PoolState::dispatch(state, work),
        }
    }

    /// Donates the calling thread: drains queued callbacks (forever, if
    /// asked). Inline dispatchers have nothing to drain.
    pub fn donate(&self, forever: bool) -> Status {
        match &*self.flavor {
            Flavor::Inline(_) => Status::ok(),
            Flavor::Async(state) => state.donate(),
            Flavor::Threaded(state) => PoolState::donate(state, forever),
        }
    }

    /// Blocks until no callback is mid-flight, then holds new work queued.
    pub fn cork(&self) -> Status {
        match &*self.flavor {
            Flavor::Threaded(state) => state.cork(),
            _ => Status::not_implemented(),
        }
    }

    /// Releases a cork, pre-spawning threads proportional to the backlog.
    pub fn uncork(&self) -> Status {
        match &*self.flavor {
            Flavor::Threaded(state) => PoolState::uncork(state),
            _ => Status::not_implemented(),
        }
    }

    /// Re-sizes the worker pool, blocking until the thread count is within
    /// the new bounds.
    pub fn adjust(&self, opts: &DispatcherOptions) -> Status {
        match &*self.flavor {
            Flavor::Threaded(state) => PoolState::adjust(state, opts),
            _ => Status::not_implemented(),
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        match &*self.flavor {
            Flavor::Inline(state) => state.stats(),
            Flavor::Async(state) => state.stats(),
            Flavor::Threaded(state) => state.stats(),
        }
    }

    /// Zeroes the pool bounds and waits for every worker to exit.
    pub fn shutdown(&self) {
        if let Flavor::Threaded(state) = &*self.flavor {
            state.shutdown();
        }
    }
}

fn num_cores() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Builds a dispatcher of the requested type.
pub fn new_dispatcher(opts: &DispatcherOptions) -> Result<Dispatcher, Status> {
    let flavor = match opts.kind {
        DispatcherType::Inline => Flavor::Inline(InlineState::default()),
        DispatcherType::Async => Flavor::Async(AsyncState::new()),
        DispatcherType::Threaded => {
            let min = opts.min_workers.unwrap_or(1);
            let max = opts.max_workers.unwrap_or_else(|| min.max(num_cores()));
            if min > max {
                return Err(Status::invalid_argument(
                    "bad DispatcherOptions: min_workers > max_workers",
                ));
            }
            Flavor::Threaded(PoolState::new(min, max))
        }
        DispatcherType::System => return Ok(system_dispatcher()),
    };
    Ok(Dispatcher {
        flavor: Arc::new(flavor),
    })
}

static SYSTEM: Mutex<Option<Dispatcher>> = Mutex::new(None);
static SYSTEM_INLINE: Mutex<Option<Dispatcher>> = Mutex::new(None);

/// The process-wide shared dispatcher: a worker pool sized `1..num_cores`.
pub fn system_dispatcher() -> Dispatcher {
    let mut guard = SYSTEM.lock().unwrap();
    if guard.is_none() {
        *guard = Some(Dispatcher {
            flavor: Arc::new(Flavor::Threaded(PoolState::new(1, num_cores()))),
        });
    }
    guard.as_ref().unwrap().clone()
}

pub fn set_system_dispatcher(d: Dispatcher) {
    *SYSTEM.lock().unwrap() = Some(d);
}

/// The process-wide inline dispatcher.
pub fn system_inline_dispatcher() -> Dispatcher {
    let mut guard = SYSTEM_INLINE.lock().unwrap();
    if guard.is_none() {
        *guard = Some(Dispatcher {
            flavor: Arc::new(Flavor::Inline(InlineState::default())),
        });
    }
    guard.as_ref().unwrap().clone()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::status::Code;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn inline_runs_on_caller() {
        let d = new_dispatcher(&DispatcherOptions {
            kind: DispatcherType::Inline,
            ..Default::default()
        })
        .unwrap();

        let caller = thread::current().id();
        let task = Task::new();
        d.dispatch(
            Some(&task),
            Box::new(move || {
                assert_eq!(thread::current().id(), caller);
                Status::ok()
            }),
        );
        assert!(task.result().is_ok());
        assert_eq!(d.stats().completed_count, 1);
    }

    #[test]
    fn async_queues_until_donated() {
        let d = new_dispatcher(&DispatcherOptions::default()).unwrap();
        let task = Task::new();
        d.dispatch(Some(&task), Box::new(Status::ok));
        assert!(!task.is_done());
        assert_eq!(d.stats().pending_count, 1);

        assert!(d.donate(false).is_ok());
        assert!(task.result().is_ok());
        assert_eq!(d.stats().pending_count, 0);
    }

    #[test]
    fn panic_is_caught_and_counted() {
        let d = new_dispatcher(&DispatcherOptions::default()).unwrap();
        let task = Task::new();
        d.dispatch(Some(&task), Box::new(|| panic!("boom")));
        d.donate(false).expect_ok();

        assert_eq!(task.result().code(), Code::Internal);
        assert_eq!(d.stats().caught_exceptions, 1);
        assert_eq!(d.stats().completed_count, 1);
    }

    #[test]
    fn threaded_completes_all() {
        let d = new_dispatcher(&DispatcherOptions {
            kind: DispatcherType::Threaded,
            min_workers: Some(1),
            max_workers: Some(4),
        })
        .unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let hits = Arc::clone(&hits);
            let task = Task::new();
            d.dispatch(
                Some(&task),
                Box::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Status::ok()
                }),
            );
            tasks.push(task);
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while tasks.iter().any(|t| !t.is_done()) {
            assert!(Instant::now() < deadline, "pool wedged");
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 32);
        assert!(d.stats().completed_count >= 32);
        d.shutdown();
        assert_eq!(d.stats().current_num_workers, 0);
    }

    #[test]
    fn cancelled_task_never_runs() {
        let d = new_dispatcher(&DispatcherOptions::default()).unwrap();
        let task = Task::new();
        task.cancel();
        d.dispatch(Some(&task), Box::new(|| panic!("must not run")));
        d.donate(false).expect_ok();
        assert_eq!(task.result().code(), Code::Cancelled);
        assert_eq!(d.stats().caught_exceptions, 0);
    }
}
