use std::io;

/// Shorter syntax for results returned by [`crate::Vm`].
pub type VmResult<T> = Result<T, VmError>;

/// Recoverable failures. Anything else (misaligned ranges, destroying a
/// handle that still has mapped pages, the OS refusing to give back memory
/// it gave us) is a bug and panics instead.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("size {size:#x} rounded up to grain {grain:#x} does not fit in the address space")]
    SizeOverflow { size: usize, grain: usize },

    #[error("failed to reserve {length:#x} bytes of address space")]
    Reserve {
        length: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to commit memory in range [{base:#x}, {limit:#x})")]
    Commit {
        base: usize,
        limit: usize,
        #[source]
        source: io::Error,
    },
}

/// What went wrong, from the point of view of the caller deciding how to
/// recover.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Out of address space. Try a smaller or differently placed
    /// reservation.
    Resource,
    /// Address space is there but the OS can't back it with storage. Free
    /// something and retry, or fail the allocation.
    Memory,
}

impl VmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SizeOverflow { .. } | Self::Reserve { .. } => ErrorKind::Resource,
            Self::Commit { .. } => ErrorKind::Memory,
        }
    }
}
