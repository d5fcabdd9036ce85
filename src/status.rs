//! The error vocabulary shared by every component.
//!
//! A [`Status`] is a value, not an exception: operations that can fail in
//! expected ways return one (or stamp one on a [`Task`](crate::task::Task))
//! instead of panicking. A default-constructed `Status` is OK, and
//! [`Code::Eof`] is a non-error terminal category distinct from OK so that
//! callers can tell a short read from a failure.

use std::fmt;
use std::io;

/// Failure categories.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    NotImplemented,
    Internal,
    Unavailable,
    DataLoss,
    Eof,
    WrongType,
}

impl Code {
    fn name(self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::Unauthenticated => "UNAUTHENTICATED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::NotImplemented => "NOT_IMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Eof => "END_OF_FILE",
            Code::WrongType => "WRONG_TYPE",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A categorized success-or-failure value with a human-readable message and
/// an optional OS errno.
#[derive(Clone, Debug)]
pub struct Status {
    code: Code,
    message: String,
    errno: Option<i32>,
}

impl Status {
    pub fn ok() -> Status {
        Status {
            code: Code::Ok,
            message: String::new(),
            errno: None,
        }
    }

    pub fn new(code: Code, message: impl Into<String>) -> Status {
        Status {
            code,
            message: message.into(),
            errno: None,
        }
    }

    pub fn cancelled() -> Status {
        Status::new(Code::Cancelled, "")
    }

    pub fn unknown(message: impl Into<String>) -> Status {
        Status::new(Code::Unknown, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Status {
        Status::new(Code::InvalidArgument, message)
    }

    pub fn deadline_exceeded() -> Status {
        Status::new(Code::DeadlineExceeded, "")
    }

    pub fn not_found() -> Status {
        Status::new(Code::NotFound, "")
    }

    pub fn already_exists(message: impl Into<String>) -> Status {
        Status::new(Code::AlreadyExists, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Status {
        Status::new(Code::PermissionDenied, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Status {
        Status::new(Code::Unauthenticated, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Status {
        Status::new(Code::ResourceExhausted, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Status {
        Status::new(Code::FailedPrecondition, message)
    }

    pub fn aborted(message: impl Into<String>) -> Status {
        Status::new(Code::Aborted, message)
    }

    pub fn out_of_range(message: impl Into<String>) -> Status {
        Status::new(Code::OutOfRange, message)
    }

    pub fn not_implemented() -> Status {
        Status::new(Code::NotImplemented, "")
    }

    pub fn internal(message: impl Into<String>) -> Status {
        Status::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Status {
        Status::new(Code::Unavailable, message)
    }

    pub fn data_loss(message: impl Into<String>) -> Status {
        Status::new(Code::DataLoss, message)
    }

    pub fn eof() -> Status {
        Status::new(Code::Eof, "")
    }

    pub fn wrong_type() -> Status {
        Status::new(Code::WrongType, "")
    }

    /// Builds a `Status` from a raw errno, naming the syscall that failed.
    pub fn from_errno(errno: i32, what: &str) -> Status {
        let code = match errno {
            libc::EINVAL => Code::InvalidArgument,
            libc::ENOENT => Code::NotFound,
            libc::EEXIST => Code::AlreadyExists,
            libc::EACCES | libc::EPERM => Code::PermissionDenied,
            libc::ENOMEM | libc::ENOSPC | libc::EMFILE | libc::ENFILE => Code::ResourceExhausted,
            libc::ETIMEDOUT => Code::DeadlineExceeded,
            libc::ENOSYS => Code::NotImplemented,
            libc::ERANGE => Code::OutOfRange,
            _ => Code::Unknown,
        };
        let message = format!("{}: {}", what, io::Error::from_raw_os_error(errno));
        Status {
            code,
            message,
            errno: Some(errno),
        }
    }

    pub fn from_io_error(err: &io::Error, what: &str) -> Status {
        match err.raw_os_error() {
            Some(errno) => Status::from_errno(errno, what),
            None => Status::internal(format!("{}: {}", what, err)),
        }
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn errno(&self) -> Option<i32> {
        self.errno
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }

    pub fn is_eof(&self) -> bool {
        self.code == Code::Eof
    }

    /// Chains a fallible continuation: runs `f` only if `self` is OK.
    pub fn and_then(self, f: impl FnOnce() -> Status) -> Status {
        if self.is_ok() {
            f()
        } else {
            self
        }
    }

    /// Logs an error if `self` is not OK. The counterpart of "this failure
    /// was unexpected but must not take the process down".
    pub fn expect_ok(&self) {
        if !self.is_ok() {
            error!("unexpected failure: {}", self);
        }
    }
}

impl Default for Status {
    fn default() -> Status {
        Status::ok()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}({})", self.code, self.code as u8 as usize)?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

impl PartialEq for Status {
    fn eq(&self, other: &Status) -> bool {
        self.code == other.code
    }
}

impl Eq for Status {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_is_ok() {
        let s = Status::default();
        assert!(s.is_ok());
        assert_eq!(s.code(), Code::Ok);
        assert!(s.errno().is_none());
    }

    #[test]
    fn eof_is_not_ok() {
        let s = Status::eof();
        assert!(!s.is_ok());
        assert!(s.is_eof());
    }

    #[test]
    fn and_then_short_circuits() {
        let s = Status::not_found().and_then(|| Status::ok());
        assert_eq!(s.code(), Code::NotFound);

        let s = Status::ok().and_then(Status::eof);
        assert_eq!(s.code(), Code::Eof);
    }

    #[test]
    fn errno_mapping() {
        let s = Status::from_errno(libc::ENOENT, "open(2)");
        assert_eq!(s.code(), Code::NotFound);
        assert_eq!(s.errno(), Some(libc::ENOENT));
        assert!(s.message().starts_with("open(2): "));

        let s = Status::from_errno(libc::ENOSYS, "splice(2)");
        assert_eq!(s.code(), Code::NotImplemented);
    }
}
