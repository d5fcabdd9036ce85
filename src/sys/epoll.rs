use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{cmp, mem};

use libc::{self, c_int};
use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use crate::ready::Ready;

/// A level-triggered epoll instance.
pub struct Epoll {
    epfd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;

        Ok(Epoll { epfd })
    }

    pub fn wait(
        &self,
        out: &mut Vec<(RawFd, Ready)>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let timeout = timeout
            .map(|to| cmp::min(to.as_millis(), libc::c_int::MAX as u128) as libc::c_int)
            .unwrap_or(-1);

        let mut events: Vec<libc::epoll_event> = Vec::with_capacity(256);

        let cnt = syscall!(epoll_wait(
            self.epfd,
            events.as_mut_ptr(),
            events.capacity() as i32,
            timeout
        ))?;

        unsafe { events.set_len(cnt as usize) };

        for event in &events {
            let fd = event.u64 as RawFd;
            out.push((fd, epoll_to_ready(event.events as c_int)));
        }

        Ok(cnt as usize)
    }

    pub fn add(&self, fd: RawFd, interest: Ready) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: ready_to_epoll(interest),
            u64: fd as u64,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info))?;

        Ok(())
    }

    pub fn modify(&self, fd: RawFd, interest: Ready) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: ready_to_epoll(interest),
            u64: fd as u64,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info))?;

        Ok(())
    }

    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        let mut info: libc::epoll_event = unsafe { mem::zeroed() };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info))?;

        Ok(())
    }
}

fn ready_to_epoll(interest: Ready) -> u32 {
    let mut kind = 0;

    if interest.is_readable() {
        kind |= EPOLLIN;
    }

    if interest.is_writable() {
        kind |= EPOLLOUT;
    }

    if interest.is_priority() {
        kind |= EPOLLPRI;
    }

    if interest.is_hup() {
        kind |= EPOLLRDHUP;
    }

    kind as u32
}

fn epoll_to_ready(epoll: c_int) -> Ready {
    let mut kind = Ready::empty();

    if (epoll & EPOLLIN) != 0 {
        kind = kind | Ready::readable();
    }

    if (epoll & EPOLLPRI) != 0 {
        kind = kind | Ready::priority() | Ready::readable();
    }

    if (epoll & EPOLLOUT) != 0 {
        kind = kind | Ready::writable();
    }

    // EPOLLHUP - Usually means a socket error happened
    if (epoll & EPOLLERR) != 0 {
        kind = kind | Ready::error();
    }

    if (epoll & EPOLLRDHUP) != 0 || (epoll & EPOLLHUP) != 0 {
        kind = kind | Ready::hup();
    }

    kind
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}
