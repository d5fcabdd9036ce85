use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hive_io::dispatcher::{new_dispatcher, DispatcherOptions, DispatcherType};
use hive_io::status::Status;
use hive_io::task::Task;

fn threaded(min: usize, max: usize) -> hive_io::Dispatcher {
    new_dispatcher(&DispatcherOptions {
        kind: DispatcherType::Threaded,
        min_workers: Some(min),
        max_workers: Some(max),
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
fn corking_holds_work_and_uncorking_releases_it() {
    let d = threaded(1, 4);
    assert!(d.cork().is_ok());

    let hits = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();
    for _ in 0..10 {
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

    // Corked: everything queues, nothing runs.
    thread::sleep(Duration::from_millis(50));
    let stats = d.stats();
    assert!(stats.corked);
    assert_eq!(stats.active_count, 0);
    assert_eq!(stats.pending_count, 10);
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    // Double cork is refused.
    assert!(!d.cork().is_ok());

    assert!(d.uncork().is_ok());
    spin_until(Duration::from_secs(10), || {
        tasks.iter().all(|t| t.is_done())
    });
    assert_eq!(hits.load(Ordering::SeqCst), 10);
    assert_eq!(d.stats().completed_count, 10);
    assert!(!d.stats().corked);

    d.shutdown();
}

#[test]
fn completed_count_is_monotone() {
    let d = threaded(1, 2);
    let mut last = 0;
    for round in 0..5 {
        let batch: Vec<_> = (0..4)
            .map(|_| {
                let task = Task::new();
                d.dispatch(Some(&task), Box::new(Status::ok));
                task
            })
            .collect();
        spin_until(Duration::from_secs(10), || batch.iter().all(|t| t.is_done()));
        let count = d.stats().completed_count;
        assert!(count >= last, "round {}: {} < {}", round, count, last);
        assert!(count >= (round + 1) * 4);
        last = count;
    }
    d.shutdown();
}

#[test]
fn pool_grows_under_backlog_and_respects_bounds() {
    let d = threaded(1, 3);

    // Saturate the pool with slow callbacks to force growth.
    let gate = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();
    for _ in 0..12 {
        let gate = Arc::clone(&gate);
        let task = Task::new();
        d.dispatch(
            Some(&task),
            Box::new(move || {
                while gate.load(Ordering::SeqCst) == 0 {
                    thread::sleep(Duration::from_millis(1));
                }
                Status::ok()
            }),
        );
        tasks.push(task);
    }

    spin_until(Duration::from_secs(10), || {
        d.stats().current_num_workers >= 2
    });
    assert!(d.stats().current_num_workers <= 3);

    gate.store(1, Ordering::SeqCst);
    spin_until(Duration::from_secs(10), || tasks.iter().all(|t| t.is_done()));
    d.shutdown();
    assert_eq!(d.stats().current_num_workers, 0);
}

#[test]
fn adjust_moves_the_bounds() {
    let d = threaded(1, 1);
    assert!(d
        .adjust(&DispatcherOptions {
            kind: DispatcherType::Threaded,
            min_workers: Some(2),
            max_workers: Some(4),
        })
        .is_ok());
    let stats = d.stats();
    assert_eq!(stats.min_workers, 2);
    assert_eq!(stats.max_workers, 4);
    assert!(stats.current_num_workers >= 2);

    // min > max is refused.
    assert!(!d
        .adjust(&DispatcherOptions {
            kind: DispatcherType::Threaded,
            min_workers: Some(5),
            max_workers: Some(2),
        })
        .is_ok());
    d.shutdown();
}

#[test]
fn cork_is_not_implemented_off_the_pool() {
    use hive_io::status::Code;
    let inline = new_dispatcher(&DispatcherOptions {
        kind: DispatcherType::Inline,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(inline.cork().code(), Code::NotImplemented);

    let queued = new_dispatcher(&DispatcherOptions::default()).unwrap();
    assert_eq!(queued.uncork().code(), Code::NotImplemented);
}
