//! Configurable I/O behaviors, carried through the type-indexed options
//! bag.

use crate::io::buffer::BufferPool;
use crate::io::DEFAULT_BLOCK_SIZE;
use crate::manager::{self, Manager};

/// How data moves from a `Reader` to a `Writer` when both ends are
/// descriptor-backed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TransferMode {
    /// Do read(2) and write(2) in a loop.
    ReadWrite,

    /// Try sendfile(2), falling back to `ReadWrite` when the kernel
    /// rejects the descriptor pair.
    Sendfile,

    /// Try splice(2), falling back through `Sendfile` to `ReadWrite`.
    Splice,

    /// Let the system choose.
    #[default]
    SystemDefault,
}

impl TransferMode {
    /// Resolves `SystemDefault` to the most aggressive strategy; the
    /// per-pair downgrade path handles kernels and descriptor pairs that
    /// reject it.
    pub fn normalize(self) -> TransferMode {
        match self {
            TransferMode::SystemDefault => TransferMode::Splice,
            other => other,
        }
    }
}

/// I/O knobs consumed by readers, writers, pipes and chains.
///
/// Stored in the [`options bag`](crate::options::Options) under this type;
/// every async I/O entry point pulls it out of the bag it is given.
#[derive(Clone, Default)]
pub struct Options {
    /// The manager on which to perform async I/O. `None` means the
    /// process-wide system manager.
    pub manager: Option<Manager>,
    /// An optional pool for scratch buffers during copies.
    pub pool: Option<BufferPool>,
    /// Preferred I/O block size; implementation default when `None`.
    pub block_size: Option<usize>,
    pub transfer_mode: TransferMode,
}

impl Options {
    pub fn manager(&self) -> Manager {
        match &self.manager {
            Some(m) => m.clone(),
            None => manager::system_manager(),
        }
    }

    pub fn pool(&self) -> BufferPool {
        match &self.pool {
            Some(pool) => pool.clone(),
            None => BufferPool::null(self.block_size()),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size.unwrap_or(DEFAULT_BLOCK_SIZE)
    }
}

/// Pulls the I/O manager out of an options bag.
pub fn get_manager(opts: &crate::options::Options) -> Manager {
    opts.get::<Options>().manager()
}

/// Pulls the I/O options out of an options bag.
pub fn get_io_options(opts: &crate::options::Options) -> Options {
    opts.get::<Options>()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalize_resolves_system_default() {
        assert_eq!(TransferMode::SystemDefault.normalize(), TransferMode::Splice);
        assert_eq!(TransferMode::ReadWrite.normalize(), TransferMode::ReadWrite);
    }

    #[test]
    fn mode_ordering_is_slow_to_fast() {
        assert!(TransferMode::ReadWrite < TransferMode::Sendfile);
        assert!(TransferMode::Sendfile < TransferMode::Splice);
    }

    #[test]
    fn default_block_size() {
        let opts = Options::default();
        assert_eq!(opts.block_size(), DEFAULT_BLOCK_SIZE);
        assert_eq!(opts.pool().buffer_size(), DEFAULT_BLOCK_SIZE);
    }
}
