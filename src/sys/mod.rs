//! Raw OS surface: everything that talks to the kernel directly.

pub mod epoll;
pub mod fd;
pub mod pipe;
pub mod poll;
pub mod signal;
pub mod timerfd;
