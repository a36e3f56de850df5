use std::io;

use thiserror::Error;

/// Errors returned by virtual interface operations.
///
/// `RingFull` and `NotReady` are transient: nothing was posted or consumed and
/// the caller may retry once completions have been polled.
#[derive(Debug, Error)]
pub enum Error {
    /// Mapping or other OS-level operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Configuration or supplied resources do not fit together.
    #[error("ring setup: {0}")]
    RingSetup(String),
    /// The descriptor ring (or CTPIO FIFO) has no room for this request.
    #[error("ring full")]
    RingFull,
    /// The kernel has not handed over a fresh superbuf yet.
    #[error("no superbuf ready")]
    NotReady,
    /// The operation is not offered by this architecture.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    /// A transmit buffer lies outside the registered packet buffer memory.
    #[error("buffer {addr:#x}+{len} outside registered packet buffers")]
    BadAddress { addr: u64, len: u32 },
    /// Every EFCT receive queue slot is in use.
    #[error("receive queue limit reached")]
    RxqLimit,
    /// Remapping superbufs after a configuration change failed.
    #[error("superbuf refresh: {0}")]
    Refresh(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
