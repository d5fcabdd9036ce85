use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hive_io::dispatcher::{DispatcherOptions, DispatcherType};
use hive_io::event::handler;
use hive_io::manager::{new_manager, Manager, ManagerOptions};
use hive_io::ready::Ready;
use hive_io::status::{Code, Status};
use hive_io::sys::pipe;
use hive_io::task::Task;

fn background_manager() -> Manager {
    new_manager(&ManagerOptions {
        dispatcher: DispatcherOptions {
            kind: DispatcherType::Threaded,
            min_workers: Some(1),
            max_workers: Some(2),
        },
        ..Default::default()
    })
    .unwrap()
}

fn spin_until(deadline: Duration, mut done: impl FnMut() -> bool) {
    let give_up = Instant::now() + deadline;
    while !done() {
        assert!(Instant::now() < give_up, "timed out");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn timeout_expires_the_task() {
    let m = background_manager();

    let task = Task::new();
    assert!(m.set_timeout(&task, Duration::from_millis(10)).is_ok());
    thread::sleep(Duration::from_millis(80));
    spin_until(Duration::from_secs(5), || task.is_done());
    assert_eq!(task.result().code(), Code::DeadlineExceeded);

    m.shutdown().expect_ok();
}

#[test]
fn deadline_expires_the_task() {
    let m = background_manager();

    let task = Task::new();
    let at = Instant::now() + Duration::from_millis(15);
    assert!(m.set_deadline(&task, at).is_ok());
    spin_until(Duration::from_secs(5), || task.is_done());
    assert_eq!(task.result().code(), Code::DeadlineExceeded);

    // A deadline in the past is refused outright.
    let task = Task::new();
    let r = m.set_deadline(&task, Instant::now() - Duration::from_millis(1));
    assert_eq!(r.code(), Code::InvalidArgument);

    m.shutdown().expect_ok();
}

#[test]
fn finished_task_tears_down_its_timer() {
    let m = background_manager();

    let task = Task::new();
    assert!(m.set_timeout(&task, Duration::from_millis(50)).is_ok());
    assert!(task.start());
    task.finish_ok();

    thread::sleep(Duration::from_millis(120));
    // The timer fired into a finished task (or was torn down first);
    // either way the result is untouched.
    assert!(task.result().is_ok());

    m.shutdown().expect_ok();
}

#[test]
fn generic_events_deliver_values() {
    let m = background_manager();

    let seen = Arc::new(AtomicI64::new(0));
    let count = Arc::new(AtomicUsize::new(0));
    let seen2 = Arc::clone(&seen);
    let count2 = Arc::clone(&count);
    let watch = m
        .generic(handler(move |data| {
            assert!(data.events.is_event());
            seen2.fetch_add(data.int_value, Ordering::SeqCst);
            count2.fetch_add(1, Ordering::SeqCst);
            Status::ok()
        }))
        .unwrap();

    assert!(watch.fire(40).is_ok());
    assert!(watch.fire(2).is_ok());
    spin_until(Duration::from_secs(5), || count.load(Ordering::SeqCst) == 2);
    assert_eq!(seen.load(Ordering::SeqCst), 42);

    let mut watch = watch;
    assert!(watch.release().is_ok());
    assert_eq!(watch.fire(1).code(), Code::FailedPrecondition);

    m.shutdown().expect_ok();
}

#[test]
fn fd_readiness_reaches_the_handler() {
    let m = background_manager();

    let (rfd, wfd) = pipe::make_pipe().unwrap();
    pipe::set_nonblocking(rfd).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = Arc::clone(&hits);
    let watch = m
        .fd(
            rfd,
            Ready::readable(),
            handler(move |data| {
                assert!(data.events.is_readable());
                // Drain so level-triggered readiness quiesces.
                let mut buf = [0u8; 16];
                unsafe {
                    libc::read(data.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
                }
                hits2.fetch_add(1, Ordering::SeqCst);
                Status::ok()
            }),
        )
        .unwrap();

    assert_eq!(watch.get().unwrap(), Ready::readable());

    pipe::write_exactly(wfd, b"ping").unwrap();
    spin_until(Duration::from_secs(5), || hits.load(Ordering::SeqCst) >= 1);

    let mut watch = watch;
    assert!(watch.release().is_ok());
    assert!(watch.release().is_ok());

    m.shutdown().expect_ok();
    unsafe {
        let _ = libc::close(rfd);
        let _ = libc::close(wfd);
    }
}

#[test]
fn periodic_timer_fires_repeatedly() {
    let m = background_manager();

    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = Arc::clone(&fired);
    let watch = m
        .timer(handler(move |data| {
            assert!(data.events.is_timer());
            assert!(data.int_value >= 1);
            fired2.fetch_add(1, Ordering::SeqCst);
            Status::ok()
        }))
        .unwrap();

    assert!(watch.set_periodic(Duration::from_millis(5)).is_ok());
    spin_until(Duration::from_secs(5), || fired.load(Ordering::SeqCst) >= 3);

    assert!(watch.cancel().is_ok());
    m.shutdown().expect_ok();
}

#[test]
fn signal_delivery_carries_siginfo() {
    let m = background_manager();

    let got = Arc::new(AtomicI64::new(-1));
    let got2 = Arc::clone(&got);
    let _watch = m
        .signal(
            libc::SIGUSR2,
            handler(move |data| {
                assert!(data.events.is_signal());
                assert_eq!(data.signal_number, libc::SIGUSR2);
                got2.store(data.pid as i64, Ordering::SeqCst);
                Status::ok()
            }),
        )
        .unwrap();

    unsafe {
        libc::kill(libc::getpid(), libc::SIGUSR2);
    }
    spin_until(Duration::from_secs(5), || got.load(Ordering::SeqCst) >= 0);
    assert_eq!(got.load(Ordering::SeqCst), unsafe { libc::getpid() } as i64);

    m.shutdown().expect_ok();
}

#[test]
fn shutdown_is_an_idempotent_error() {
    let m = new_manager(&ManagerOptions::async_mode()).unwrap();
    assert!(m.shutdown().is_ok());
    assert_eq!(m.shutdown().code(), Code::FailedPrecondition);
}

#[test]
fn registrations_refuse_a_dead_manager() {
    let m = new_manager(&ManagerOptions::async_mode()).unwrap();
    assert!(m.shutdown().is_ok());

    let r = m.generic(handler(|_| Status::ok()));
    assert!(r.is_err());
    assert_eq!(r.err().unwrap().code(), Code::FailedPrecondition);
}

#[test]
fn cancelling_a_task_with_a_timeout_wins_the_race() {
    let m = background_manager();

    let task = Task::new();
    assert!(m.set_timeout(&task, Duration::from_secs(60)).is_ok());
    assert!(task.start());
    task.cancel();
    task.finish_cancel();
    assert_eq!(task.result().code(), Code::Cancelled);

    m.shutdown().expect_ok();
}
