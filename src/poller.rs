//! The readiness poller.
//!
//! A [`Poller`] is level-triggered from the user's perspective: a readable
//! descriptor with buffered data keeps reporting readable until the data is
//! consumed. Only the contract is exposed; the backend is epoll where the
//! kernel provides it, or poll(2) otherwise.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::ready::Ready;
use crate::status::Status;
use crate::sys::epoll::Epoll;
use crate::sys::poll::PollSet;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum PollerType {
    /// Pick the best available backend.
    #[default]
    Default,
    Epoll,
    Poll,
}

enum Backend {
    Epoll(Epoll),
    Poll(PollSet),
}

pub struct Poller {
    backend: Backend,
}

impl Poller {
    /// Builds a poller of the requested type. A backend whose kernel
    /// interface is missing (`ENOSYS`) is rejected here, never at wait
    /// time.
    pub fn new(kind: PollerType) -> Result<Poller, Status> {
        let backend = match kind {
            PollerType::Epoll => Backend::Epoll(
                Epoll::new().map_err(|e| Status::from_io_error(&e, "epoll_create1(2)"))?,
            ),
            PollerType::Poll => {
                Backend::Poll(PollSet::new().map_err(|e| Status::from_io_error(&e, "poll(2)"))?)
            }
            PollerType::Default => match Epoll::new() {
                Ok(epoll) => Backend::Epoll(epoll),
                Err(_) => Backend::Poll(
                    PollSet::new().map_err(|e| Status::from_io_error(&e, "poll(2)"))?,
                ),
            },
        };
        Ok(Poller { backend })
    }

    /// Registers `fd` with the given interest set.
    pub fn add(&self, fd: RawFd, interest: Ready) -> Status {
        let r = match &self.backend {
            Backend::Epoll(epoll) => epoll.add(fd, interest),
            Backend::Poll(pollset) => pollset.add(fd, interest),
        };
        into_status(r, "poller add")
    }

    /// Replaces the interest set for `fd`.
    pub fn modify(&self, fd: RawFd, interest: Ready) -> Status {
        let r = match &self.backend {
            Backend::Epoll(epoll) => epoll.modify(fd, interest),
            Backend::Poll(pollset) => pollset.modify(fd, interest),
        };
        into_status(r, "poller modify")
    }

    /// Drops the registration for `fd`.
    pub fn remove(&self, fd: RawFd) -> Status {
        let r = match &self.backend {
            Backend::Epoll(epoll) => epoll.remove(fd),
            Backend::Poll(pollset) => pollset.remove(fd),
        };
        into_status(r, "poller remove")
    }

    /// Blocks until at least one registered descriptor is ready or the
    /// timeout elapses (`None` blocks indefinitely), appending
    /// `(fd, readiness)` pairs. Partial fills are allowed.
    pub fn wait(&self, out: &mut Vec<(RawFd, Ready)>, timeout: Option<Duration>) -> Status {
        let r = match &self.backend {
            Backend::Epoll(epoll) => epoll.wait(out, timeout),
            Backend::Poll(pollset) => pollset.wait(out, timeout),
        };
        match r {
            Ok(_) => Status::ok(),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Status::ok(),
            Err(err) => Status::from_io_error(&err, "poller wait"),
        }
    }
}

fn into_status(r: io::Result<()>, what: &str) -> Status {
    match r {
        Ok(()) => Status::ok(),
        Err(err) => Status::from_io_error(&err, what),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sys::pipe;

    fn exercise(kind: PollerType) {
        let poller = Poller::new(kind).unwrap();
        let (rfd, wfd) = pipe::make_pipe().unwrap();

        assert!(poller.add(rfd, Ready::readable()).is_ok());

        let mut out = Vec::new();
        assert!(poller
            .wait(&mut out, Some(Duration::from_millis(0)))
            .is_ok());
        assert!(out.is_empty());

        pipe::write_exactly(wfd, b"x").unwrap();

        // Level-triggered: unread data keeps reporting readable.
        for _ in 0..2 {
            out.clear();
            assert!(poller
                .wait(&mut out, Some(Duration::from_millis(100)))
                .is_ok());
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].0, rfd);
            assert!(out[0].1.is_readable());
        }

        assert!(poller.remove(rfd).is_ok());
        unsafe {
            let _ = libc::close(rfd);
            let _ = libc::close(wfd);
        }
    }

    #[test]
    fn epoll_backend() {
        exercise(PollerType::Epoll);
    }

    #[test]
    fn poll_backend() {
        exercise(PollerType::Poll);
    }
}
