//! Crate-wide error type.
//!
//! Every fallible operation reports its failure as a distinct variant;
//! nothing in this crate unwinds. Resource exhaustion (a cache full of
//! pinned entries, no free sectors, no swap slots, no evictable frame) is
//! an ordinary outcome of running under pressure, not a bug, and callers
//! routinely match on it.

use core::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Every cache entry is pinned; the caller should retry.
    CacheBusy,
    /// The free map has no clear bit left.
    NoFreeSector,
    /// The swap slot map has no clear bit left.
    SwapFull,
    /// No frame could be allocated or evicted.
    NoFrame,
    /// A caller-supplied argument is out of range or misaligned.
    InvalidArg,
    /// The operation would exceed the maximum indexed file size.
    TooLarge,
    /// No such inode, page, frame or mapping.
    NotFound,
    /// The requested range overlaps an existing mapping.
    Overlap,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::CacheBusy => "all cache entries in use",
            Error::NoFreeSector => "out of disk sectors",
            Error::SwapFull => "out of swap slots",
            Error::NoFrame => "out of page frames",
            Error::InvalidArg => "invalid argument",
            Error::TooLarge => "file too large",
            Error::NotFound => "not found",
            Error::Overlap => "mapping overlap",
        };
        write!(f, "{}", msg)
    }
}
