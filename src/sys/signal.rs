//! Process-wide signal plumbing.
//!
//! Exactly one signal handler ("trampoline") is installed per subscribed
//! signal number. The trampoline does the only async-signal-safe thing it
//! can: it writes the raw `siginfo_t` to a private pipe. A single fan-out
//! thread services the read end, converts each record into an event
//! [`Data`], and tees it to every manager event pipe subscribed to that
//! signal.

use std::collections::HashMap;
use std::mem::{self, MaybeUninit};
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;
use std::thread;

use crate::event::Data;
use crate::ready::Ready;
use crate::status::Status;
use crate::sys::pipe;

const NUM_SIGNALS: i32 = 64;

// si_code values for user-originated signals; fixed Linux ABI.
const SI_USER: i32 = 0;
const SI_QUEUE: i32 = -1;
const SI_TKILL: i32 = -6;

/// Write end of the trampoline pipe. The handler may not take locks, so
/// this lives outside the hub mutex and never changes once set.
static SIG_PIPE_WFD: AtomicI32 = AtomicI32::new(-1);

struct Hub {
    /// Event-pipe fds interested in each signal number.
    tees: HashMap<i32, Vec<RawFd>>,
}

static HUB: Mutex<Option<Hub>> = Mutex::new(None);

fn assert_valid_signo(signo: i32) -> Status {
    if signo <= 0 || signo >= NUM_SIGNALS {
        return Status::invalid_argument("invalid signal number");
    }
    Status::ok()
}

extern "C" fn trampoline(
    _signo: libc::c_int,
    si: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    let wfd = SIG_PIPE_WFD.load(Ordering::Relaxed);
    if wfd >= 0 {
        unsafe {
            let _ = libc::write(
                wfd,
                si as *const libc::c_void,
                mem::size_of::<libc::siginfo_t>(),
            );
        }
    }
}

/// Parses out the guts of a `siginfo_t` and makes event-record sausage.
fn data_from_siginfo(si: &libc::siginfo_t) -> Data {
    let mut data = Data::new();
    data.events = Ready::signal();
    data.signal_number = si.si_signo;
    data.signal_code = si.si_code;
    match si.si_code {
        SI_USER | SI_TKILL | SI_QUEUE => unsafe {
            data.pid = si.si_pid();
            data.uid = si.si_uid();
            if si.si_code == SI_QUEUE {
                data.int_value = si.si_value().sival_ptr as i64;
            }
        },
        _ => {
            if si.si_signo == libc::SIGCHLD {
                unsafe {
                    data.pid = si.si_pid();
                    data.uid = si.si_uid();
                    data.wait_status = si.si_status();
                }
            }
        }
    }
    data
}

/// Services the read end of the trampoline pipe forever.
fn fan_out_thread(rfd: RawFd) {
    loop {
        let mut raw = MaybeUninit::<libc::siginfo_t>::uninit();
        let buf = unsafe {
            std::slice::from_raw_parts_mut(
                raw.as_mut_ptr() as *mut u8,
                mem::size_of::<libc::siginfo_t>(),
            )
        };
        if let Err(err) = pipe::read_exactly(rfd, buf) {
            error!("signal pipe read failed: {}", err);
            continue;
        }
        let si = unsafe { raw.assume_init() };

        let fds: Vec<RawFd> = {
            let hub = HUB.lock().unwrap();
            match hub.as_ref().and_then(|h| h.tees.get(&si.si_signo)) {
                Some(vec) => vec.clone(),
                None => Vec::new(),
            }
        };

        let data = data_from_siginfo(&si);
        let wire = data.encode();
        for fd in fds {
            if let Err(err) = pipe::write_exactly(fd, &wire) {
                warn!("signal fan-out to fd {} failed: {}", fd, err);
            }
        }
    }
}

fn install_trampoline(signo: i32) -> Status {
    let mut sa: libc::sigaction = unsafe { mem::zeroed() };
    let f: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) = trampoline;
    sa.sa_sigaction = f as libc::sighandler_t;
    sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    match syscall!(sigaction(signo, &sa, ptr::null_mut())) {
        Ok(_) => Status::ok(),
        Err(err) => Status::from_io_error(&err, "sigaction(2)"),
    }
}

fn restore_default(signo: i32) -> Status {
    let mut sa: libc::sigaction = unsafe { mem::zeroed() };
    sa.sa_sigaction = libc::SIG_DFL;
    match syscall!(sigaction(signo, &sa, ptr::null_mut())) {
        Ok(_) => Status::ok(),
        Err(err) => Status::from_io_error(&err, "sigaction(2)"),
    }
}

/// Asks that each `signo` delivery write one event record into `fd`.
///
/// Bootstraps the trampoline pipe and fan-out thread on first use.
pub fn tee_add(fd: RawFd, signo: i32) -> Status {
    let r = assert_valid_signo(signo);
    if !r.is_ok() {
        return r;
    }

    let mut hub = HUB.lock().unwrap();
    if hub.is_none() {
        let (rfd, wfd) = match pipe::make_pipe() {
            Ok(pair) => pair,
            Err(err) => return Status::from_io_error(&err, "pipe2(2)"),
        };
        SIG_PIPE_WFD.store(wfd, Ordering::SeqCst);
        thread::Builder::new()
            .name("signal-fan-out".into())
            .spawn(move || fan_out_thread(rfd))
            .expect("failed to spawn signal fan-out thread");
        *hub = Some(Hub {
            tees: HashMap::new(),
        });
    }

    let tees = &mut hub.as_mut().unwrap().tees;
    let vec = tees.entry(signo).or_default();
    if vec.is_empty() {
        let r = install_trampoline(signo);
        if !r.is_ok() {
            return r;
        }
    }
    vec.push(fd);
    Status::ok()
}

/// Stops sending `signo` deliveries to `fd`. When the last subscriber for a
/// signal leaves, its disposition reverts to the default.
pub fn tee_remove(fd: RawFd, signo: i32) -> Status {
    let r = assert_valid_signo(signo);
    if !r.is_ok() {
        return r;
    }

    let mut hub = HUB.lock().unwrap();
    let hub = match hub.as_mut() {
        Some(hub) => hub,
        None => return Status::not_found(),
    };

    let vec = hub.tees.entry(signo).or_default();
    vec.retain(|&tee| tee != fd);

    if vec.is_empty() {
        hub.tees.remove(&signo);
        return restore_default(signo);
    }
    Status::ok()

    // The fan-out thread never exits by design.
}

/// Stops sending ANY signal to `fd`.
pub fn tee_remove_all(fd: RawFd) {
    let mut hub = HUB.lock().unwrap();
    let hub = match hub.as_mut() {
        Some(hub) => hub,
        None => return,
    };

    let mut orphaned = Vec::new();
    for (&signo, vec) in hub.tees.iter_mut() {
        vec.retain(|&tee| tee != fd);
        if vec.is_empty() {
            orphaned.push(signo);
        }
    }
    for signo in orphaned {
        hub.tees.remove(&signo);
        restore_default(signo).expect_ok();
    }
}
