//! The CLOEXEC pipe pair backing manager event delivery and signal fan-out.

use std::io;
use std::os::unix::io::RawFd;

/// Creates a CLOEXEC pipe, returning `(read_fd, write_fd)`.
pub fn make_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC))?;
    Ok((fds[0], fds[1]))
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    Ok(())
}

/// Reads exactly `buf.len()` bytes, retrying on `EINTR`. A short read is an
/// error: callers only exchange fixed-size records.
pub fn read_exactly(fd: RawFd, buf: &mut [u8]) -> io::Result<()> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if n as usize != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short read: {} of {} bytes", n, buf.len()),
            ));
        }
        return Ok(());
    }
}

/// Writes exactly `buf.len()` bytes, retrying on `EINTR`. Record writes stay
/// under `PIPE_BUF`, so the kernel keeps them atomic.
pub fn write_exactly(fd: RawFd, buf: &[u8]) -> io::Result<()> {
    loop {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if n as usize != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write: {} of {} bytes", n, buf.len()),
            ));
        }
        return Ok(());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn record_round_trip() {
        let (rfd, wfd) = make_pipe().unwrap();
        write_exactly(wfd, b"0123456789").unwrap();

        let mut buf = [0u8; 10];
        read_exactly(rfd, &mut buf).unwrap();
        assert_eq!(&buf, b"0123456789");

        unsafe {
            let _ = libc::close(rfd);
            let _ = libc::close(wfd);
        }
    }

    #[test]
    fn nonblocking_read_reports_would_block() {
        let (rfd, wfd) = make_pipe().unwrap();
        set_nonblocking(rfd).unwrap();

        let mut buf = [0u8; 4];
        let err = read_exactly(rfd, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        unsafe {
            let _ = libc::close(rfd);
            let _ = libc::close(wfd);
        }
    }
}
