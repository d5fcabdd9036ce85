use std::sync::atomic::{AtomicUsize, Ordering};

/// An opaque handle naming one registration on a
/// [`Manager`](crate::manager::Manager).
///
/// Tokens are process-unique: every call to [`next_token`] mints a fresh
/// value, so a stale token can never address a newer registration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<usize> for Token {
    #[inline]
    fn from(val: usize) -> Token {
        Token(val)
    }
}

impl From<Token> for usize {
    #[inline]
    fn from(val: Token) -> usize {
        val.0
    }
}

static NEXT_TOKEN: AtomicUsize = AtomicUsize::new(0);

/// Mints a fresh process-unique token. Token 0 is never handed out; it is
/// reserved for sentinel records.
pub fn next_token() -> Token {
    Token(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed) + 1)
}
