use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::status::Status;

/// A uniquely-owned file descriptor, closed on drop.
#[derive(Debug)]
pub struct FileDesc(File);

impl FileDesc {
    /// # Safety
    ///
    /// `fd` must be open, and ownership transfers to the `FileDesc`.
    pub unsafe fn new(fd: RawFd) -> Self {
        FileDesc(File::from_raw_fd(fd))
    }

    pub fn try_clone(&self) -> io::Result<FileDesc> {
        Ok(FileDesc(self.0.try_clone()?))
    }
}

impl FromRawFd for FileDesc {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        FileDesc(File::from_raw_fd(fd))
    }
}

impl AsRawFd for FileDesc {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl IntoRawFd for FileDesc {
    fn into_raw_fd(self) -> RawFd {
        self.0.into_raw_fd()
    }
}

impl Read for FileDesc {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Read for &FileDesc {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.0).read(buf)
    }
}

impl Write for FileDesc {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for &FileDesc {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A shared, refcounted descriptor handle.
///
/// Clones refer to the same descriptor. A syscall user takes the descriptor
/// with [`FdHandle::acquire`], which holds it open for the duration of the
/// guard; [`FdHandle::close`] closes it exactly once, and a second close
/// reports `FAILED_PRECONDITION`.
#[derive(Clone, Debug)]
pub struct FdHandle {
    guts: Arc<FdGuts>,
}

#[derive(Debug)]
struct FdGuts {
    fd: Mutex<Option<RawFd>>,
}

impl FdHandle {
    /// Takes ownership of `fd`.
    pub fn wrap(fd: RawFd) -> FdHandle {
        FdHandle {
            guts: Arc::new(FdGuts {
                fd: Mutex::new(Some(fd)),
            }),
        }
    }

    pub fn from_file(file: File) -> FdHandle {
        FdHandle::wrap(file.into_raw_fd())
    }

    /// Locks the descriptor for the duration of a syscall.
    pub fn acquire(&self) -> FdGuard<'_> {
        FdGuard {
            guard: self.guts.fd.lock().unwrap(),
        }
    }

    pub fn close(&self) -> Status {
        let mut guard = self.guts.fd.lock().unwrap();
        match guard.take() {
            Some(fd) => match syscall!(close(fd)) {
                Ok(_) => Status::ok(),
                Err(err) => Status::from_io_error(&err, "close(2)"),
            },
            None => Status::failed_precondition("file descriptor is closed"),
        }
    }
}

impl Drop for FdGuts {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.lock().unwrap().take() {
            unsafe {
                let _ = libc::close(fd);
            }
        }
    }
}

pub struct FdGuard<'a> {
    guard: MutexGuard<'a, Option<RawFd>>,
}

impl FdGuard<'_> {
    /// The raw descriptor, or `EBADF` if the handle was closed.
    pub fn raw(&self) -> io::Result<RawFd> {
        match *self.guard {
            Some(fd) => Ok(fd),
            None => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::status::Code;

    #[test]
    fn close_is_idempotent_error() {
        let (rfd, wfd) = crate::sys::pipe::make_pipe().unwrap();
        let handle = FdHandle::wrap(rfd);
        unsafe {
            let _ = libc::close(wfd);
        }

        assert!(handle.acquire().raw().is_ok());
        assert!(handle.close().is_ok());
        assert_eq!(handle.close().code(), Code::FailedPrecondition);
        assert!(handle.acquire().raw().is_err());
    }
}
