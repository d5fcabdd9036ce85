use std::io;
use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::Duration;
use std::{cmp, convert::TryInto};

use indexmap::IndexMap;

use crate::ready::Ready;

/// A poll(2) readiness backend for systems without epoll.
///
/// Registrations live in an ordered map; each wait snapshots them into a
/// `pollfd` array. Interest changes made while another thread is blocked in
/// `wait` take effect on the next wait.
pub struct PollSet {
    entries: Mutex<IndexMap<RawFd, Ready>>,
}

impl PollSet {
    pub fn new() -> io::Result<PollSet> {
        Ok(PollSet {
            entries: Mutex::new(IndexMap::new()),
        })
    }

    pub fn add(&self, fd: RawFd, interest: Ready) -> io::Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&fd) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        entries.insert(fd, interest);
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, interest: Ready) -> io::Result<()> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&fd) {
            Some(slot) => {
                *slot = interest;
                Ok(())
            }
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        let mut entries = self.entries.lock().unwrap();
        match entries.shift_remove(&fd) {
            Some(_) => Ok(()),
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    pub fn wait(
        &self,
        out: &mut Vec<(RawFd, Ready)>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let mut pollfds: Vec<libc::pollfd> = {
            let entries = self.entries.lock().unwrap();
            entries
                .iter()
                .map(|(&fd, &interest)| libc::pollfd {
                    fd,
                    events: ready_to_poll(interest),
                    revents: 0,
                })
                .collect()
        };

        let timeout = timeout
            .map(|to| cmp::min(to.as_millis(), libc::c_int::MAX as u128) as libc::c_int)
            .unwrap_or(-1);

        let ret = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len().try_into().unwrap(),
                timeout,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        let mut n = 0;
        for pollfd in &pollfds {
            if pollfd.revents != 0 {
                out.push((pollfd.fd, poll_to_ready(pollfd.revents)));
                n += 1;
            }
        }

        Ok(n)
    }
}

fn ready_to_poll(interest: Ready) -> libc::c_short {
    let mut kind = 0;

    if interest.is_readable() {
        kind |= libc::POLLIN;
    }

    if interest.is_writable() {
        kind |= libc::POLLOUT;
    }

    if interest.is_priority() {
        kind |= libc::POLLPRI;
    }

    kind
}

fn poll_to_ready(events: libc::c_short) -> Ready {
    let mut kind = Ready::empty();

    if (events & libc::POLLIN) != 0 {
        kind = kind | Ready::readable();
    }

    if (events & libc::POLLPRI) != 0 {
        kind = kind | Ready::priority() | Ready::readable();
    }

    if (events & libc::POLLOUT) != 0 {
        kind = kind | Ready::writable();
    }

    if (events & libc::POLLERR) != 0 {
        kind = kind | Ready::error();
    }

    if (events & libc::POLLHUP) != 0 {
        kind = kind | Ready::hup();
    }

    kind
}
