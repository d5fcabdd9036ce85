//! Event records and the handler contract.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::ready::Ready;
use crate::status::Status;
use crate::token::Token;

/// One delivered event: which registration it belongs to, what fired, and
/// (for signals) the siginfo-derived details.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Data {
    /// Registration this record belongs to. `Token(0)` marks a sentinel.
    pub token: Token,
    /// Descriptor that became ready, or -1.
    pub fd: RawFd,
    /// Which parts of the readiness domain fired.
    pub events: Ready,
    /// Signal number (signal records only).
    pub signal_number: i32,
    /// Raw `si_code` (signal records only).
    pub signal_code: i32,
    /// Originating process id, when the kernel reported one.
    pub pid: i32,
    /// Originating user id, when the kernel reported one.
    pub uid: u32,
    /// Child wait status, for `SIGCHLD` records.
    pub wait_status: i32,
    /// Queued integer for `sigqueue`-style signals, timer expiry counts,
    /// and generic event fires.
    pub int_value: i64,
}

/// Size of one encoded [`Data`] record on the event pipe. Well under
/// `PIPE_BUF`, so writes are atomic.
pub const DATA_WIRE_SIZE: usize = 52;

impl Data {
    pub fn new() -> Data {
        Data {
            token: Token(0),
            fd: -1,
            events: Ready::empty(),
            signal_number: 0,
            signal_code: 0,
            pid: 0,
            uid: 0,
            wait_status: 0,
            int_value: 0,
        }
    }

    /// Encodes the record for the event pipe, native endian.
    pub fn encode(&self) -> [u8; DATA_WIRE_SIZE] {
        let mut buf = [0u8; DATA_WIRE_SIZE];
        buf[0..8].copy_from_slice(&(self.token.0 as u64).to_ne_bytes());
        buf[8..16].copy_from_slice(&(self.fd as i64).to_ne_bytes());
        buf[16..24].copy_from_slice(&(self.events.as_usize() as u64).to_ne_bytes());
        buf[24..28].copy_from_slice(&self.signal_number.to_ne_bytes());
        buf[28..32].copy_from_slice(&self.signal_code.to_ne_bytes());
        buf[32..36].copy_from_slice(&self.pid.to_ne_bytes());
        buf[36..40].copy_from_slice(&self.uid.to_ne_bytes());
        buf[40..44].copy_from_slice(&self.wait_status.to_ne_bytes());
        buf[44..52].copy_from_slice(&self.int_value.to_ne_bytes());
        buf
    }

    pub fn decode(buf: &[u8; DATA_WIRE_SIZE]) -> Data {
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            u64::from_ne_bytes(b)
        };
        let i64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            i64::from_ne_bytes(b)
        };
        let i32_at = |at: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&buf[at..at + 4]);
            i32::from_ne_bytes(b)
        };
        let u32_at = |at: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&buf[at..at + 4]);
            u32::from_ne_bytes(b)
        };
        Data {
            token: Token(u64_at(0) as usize),
            fd: i64_at(8) as RawFd,
            events: Ready::from(u64_at(16) as usize),
            signal_number: i32_at(24),
            signal_code: i32_at(28),
            pid: i32_at(32),
            uid: u32_at(36),
            wait_status: i32_at(40),
            int_value: i64_at(44),
        }
    }
}

impl Default for Data {
    fn default() -> Data {
        Data::new()
    }
}

/// A callable invoked with one delivered [`Data`] record.
///
/// Handlers run on dispatcher threads and must be safe to invoke from any
/// of them.
pub trait Handler: Send + Sync {
    fn on_event(&self, data: &Data) -> Status;
}

struct FnHandler<F>(F);

impl<F> Handler for FnHandler<F>
where
    F: Fn(&Data) -> Status + Send + Sync,
{
    fn on_event(&self, data: &Data) -> Status {
        (self.0)(data)
    }
}

/// Wraps a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(&Data) -> Status + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codec_round_trip() {
        let mut data = Data::new();
        data.token = Token(7777);
        data.fd = 42;
        data.events = Ready::signal() | Ready::readable();
        data.signal_number = libc::SIGCHLD;
        data.signal_code = 1;
        data.pid = 1234;
        data.uid = 1000;
        data.wait_status = 0x7f00;
        data.int_value = -9;

        let wire = data.encode();
        assert_eq!(Data::decode(&wire), data);
    }

    #[test]
    fn sentinel_is_empty() {
        let data = Data::new();
        assert_eq!(data.token, Token(0));
        assert!(data.events.is_empty());
        let wire = data.encode();
        assert_eq!(Data::decode(&wire), data);
    }

    #[test]
    fn handler_adapter() {
        let h = handler(|data: &Data| {
            assert_eq!(data.fd, 3);
            Status::ok()
        });
        let mut data = Data::new();
        data.fd = 3;
        assert!(h.on_event(&data).is_ok());
    }
}
