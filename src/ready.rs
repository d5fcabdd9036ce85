use std::{fmt, ops};

/// A set of readiness events.
///
/// `Ready` is a set of operation descriptors indicating that an operation is
/// ready to be performed. For example, `Ready::readable()` indicates that the
/// associated descriptor is ready to perform a `read` operation.
///
/// Beyond descriptor readiness, the set also carries the delivery-domain
/// bits used by [`Manager`](crate::manager::Manager) event records: `signal`,
/// `timer` and `event` mark records produced by signal fan-out, timer expiry
/// and generic event fires respectively.
///
/// `Ready` values can be combined together using the various bitwise
/// operators.
///
/// # Examples
///
/// ```
/// use hive_io::Ready;
///
/// let ready = Ready::readable() | Ready::writable();
///
/// assert!(ready.is_readable());
/// assert!(ready.is_writable());
/// ```
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord, Hash)]
pub struct Ready(usize);

const READABLE: usize = 0b0000_0001;
const WRITABLE: usize = 0b0000_0010;
const ERROR: usize = 0b0000_0100;
const HUP: usize = 0b0000_1000;
const PRIORITY: usize = 0b0001_0000;
const SIGNAL: usize = 0b0010_0000;
const TIMER: usize = 0b0100_0000;
const EVENT: usize = 0b1000_0000;
const READY_ALL: usize = READABLE | WRITABLE | ERROR | HUP | PRIORITY | SIGNAL | TIMER | EVENT;

impl Ready {
    /// Returns the empty `Ready` set.
    pub fn empty() -> Ready {
        Ready(0)
    }

    #[inline]
    pub fn readable() -> Ready {
        Ready(READABLE)
    }

    #[inline]
    pub fn writable() -> Ready {
        Ready(WRITABLE)
    }

    /// Error readiness. Usually means the descriptor saw a socket error;
    /// treat it as a hint.
    #[inline]
    pub fn error() -> Ready {
        Ready(ERROR)
    }

    /// HUP readiness: the peer closed its end, or shut down its writing
    /// half. Treat it as a hint.
    #[inline]
    pub fn hup() -> Ready {
        Ready(HUP)
    }

    /// Priority-readable readiness (out-of-band data).
    #[inline]
    pub fn priority() -> Ready {
        Ready(PRIORITY)
    }

    /// Marks an event record produced by signal fan-out.
    #[inline]
    pub fn signal() -> Ready {
        Ready(SIGNAL)
    }

    /// Marks an event record produced by timer expiry.
    #[inline]
    pub fn timer() -> Ready {
        Ready(TIMER)
    }

    /// Marks an event record produced by a generic event fire.
    #[inline]
    pub fn event() -> Ready {
        Ready(EVENT)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        *self == Ready::empty()
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.contains(Ready::readable())
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.contains(Ready::writable())
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.contains(Ready(ERROR))
    }

    #[inline]
    pub fn is_hup(&self) -> bool {
        self.contains(Ready(HUP))
    }

    #[inline]
    pub fn is_priority(&self) -> bool {
        self.contains(Ready(PRIORITY))
    }

    #[inline]
    pub fn is_signal(&self) -> bool {
        self.contains(Ready(SIGNAL))
    }

    #[inline]
    pub fn is_timer(&self) -> bool {
        self.contains(Ready(TIMER))
    }

    #[inline]
    pub fn is_event(&self) -> bool {
        self.contains(Ready(EVENT))
    }

    /// Adds all readiness represented by `other` into `self`.
    ///
    /// This is equivalent to `*self = *self | other`.
    #[inline]
    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    /// Removes all options represented by `other` from `self`.
    ///
    /// This is equivalent to `*self = *self & !other`.
    #[inline]
    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }

    /// Returns true if `self` is a superset of `other`.
    ///
    /// `other` may represent more than one readiness operations, in which
    /// case the function only returns true if `self` contains all readiness
    /// specified in `other`.
    #[inline]
    pub fn contains(&self, other: Ready) -> bool {
        (*self & other) == other
    }

    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    #[inline]
    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Ready {
    #[inline]
    fn bitor_assign(&mut self, other: Ready) {
        self.0 |= other.0;
    }
}

impl ops::BitXor for Ready {
    type Output = Ready;

    #[inline]
    fn bitxor(self, other: Ready) -> Ready {
        Ready(self.0 ^ other.0)
    }
}

impl ops::BitAnd for Ready {
    type Output = Ready;

    #[inline]
    fn bitand(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }
}

impl ops::Sub for Ready {
    type Output = Ready;

    #[inline]
    fn sub(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }
}

impl ops::Not for Ready {
    type Output = Ready;

    #[inline]
    fn not(self) -> Ready {
        Ready(!self.0 & READY_ALL)
    }
}

impl From<usize> for Ready {
    fn from(event: usize) -> Ready {
        Ready(event & READY_ALL)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let flags = [
            (Ready::readable(), "Readable"),
            (Ready::writable(), "Writable"),
            (Ready(ERROR), "Error"),
            (Ready(HUP), "Hup"),
            (Ready(PRIORITY), "Priority"),
            (Ready(SIGNAL), "Signal"),
            (Ready(TIMER), "Timer"),
            (Ready(EVENT), "Event"),
        ];

        write!(fmt, "Ready {{")?;

        for &(flag, msg) in &flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;

                one = true
            }
        }

        write!(fmt, "}}")?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_operations() {
        let mut readiness = Ready::empty();
        readiness.insert(Ready::readable());
        assert!(readiness.is_readable());

        readiness.remove(Ready::readable());
        assert!(!readiness.is_readable());

        let both = Ready::readable() | Ready::writable();
        assert!(both.contains(Ready::readable()));
        assert!(both.contains(Ready::writable()));
        assert!(!Ready::readable().contains(both));
        assert!((both | Ready::hup()).contains(both));
    }

    #[test]
    fn delivery_domain_bits() {
        let set = Ready::signal() | Ready::timer() | Ready::event();
        assert!(set.is_signal());
        assert!(set.is_timer());
        assert!(set.is_event());
        assert!(!set.is_readable());
        assert_eq!(set & Ready::readable(), Ready::empty());
    }

    #[test]
    fn from_usize_masks() {
        let set = Ready::from(usize::MAX);
        assert_eq!(set, !Ready::empty());
    }
}
