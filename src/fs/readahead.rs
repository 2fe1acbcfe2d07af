//! On-demand readahead.
//!
//! Each opener carries a readahead window over the file's sectors. The
//! policy is the classic adaptive one: a read starting at offset zero, an
//! oversized read, or a read adjacent to the previous position starts a
//! sequential window; a read landing where the window predicted shifts and
//! ramps the window; consuming the asynchronous mark triggers the next
//! window before the reader gets there; anything else is treated as random
//! and fetched one-shot without disturbing the window.
//!
//! The fetch itself ([`do_cache_readahead`]) populates the sector cache and
//! stamps the readahead mark on the lookahead sector. Finding a window
//! sector already cached suppresses the whole pass: the reader is already
//! ahead of the prediction, so prefetching again would only churn the
//! cache.

use arrayvec::ArrayVec;
use log::trace;

use super::{FileSys, Inode};
use crate::hal::Tid;
use crate::param::{RA_MAX, SECTOR_SIZE};

/// Per-opener readahead state.
pub struct RaState {
    /// First sector of the current window (file sector index).
    pub start: u32,
    /// Window size in sectors.
    pub size: u32,
    /// Tail of the window fetched ahead of the reader; its first sector
    /// carries the readahead mark.
    pub async_size: u32,
    /// Ceiling of the window, in sectors.
    pub max: u32,
    /// Byte position right after the previous read; -1 before any read.
    pub prev_pos: i64,
}

impl RaState {
    pub fn new() -> Self {
        Self {
            start: 0,
            size: 0,
            async_size: 0,
            max: RA_MAX as u32,
            prev_pos: -1,
        }
    }
}

impl Default for RaState {
    fn default() -> Self {
        Self::new()
    }
}

/// Initial window for a sequential start: the request rounded up to a
/// power of two, scaled by how far below the ceiling it falls.
fn get_init_ra_size(req: u32, max: u32) -> u32 {
    let size = req.next_power_of_two();
    let size = if size <= max / 32 {
        size * 4
    } else if size <= max / 4 {
        size * 2
    } else {
        max
    };
    size.min(max)
}

/// Window ramp for a confirmed sequential reader.
fn get_next_ra_size(cur: u32, max: u32) -> u32 {
    let size = if cur < max / 16 {
        cur * 4
    } else if cur <= max / 2 {
        cur * 2
    } else {
        max
    };
    size.min(max)
}

/// The readahead oracle.
///
/// `offset` is the file sector index being read, `req` the number of
/// sectors the current read still wants, and `hit_marker` whether the
/// reader just consumed a readahead mark. Decides what to prefetch and
/// updates `ra`'s window; see the module doc for the cases.
pub(super) fn ondemand_readahead(
    inode: &Inode,
    fs: &FileSys,
    tid: Tid,
    ra: &mut RaState,
    offset: u32,
    req: u32,
    hit_marker: bool,
) {
    let max = ra.max;

    // Sequential start from the beginning of the file.
    let sequential_start = if offset == 0 {
        true
    } else if offset == ra.start + ra.size - ra.async_size || offset == ra.start + ra.size {
        // The reader followed the predicted path: shift and ramp.
        ra.start += ra.size;
        ra.size = get_next_ra_size(ra.size, max);
        ra.async_size = ra.size;
        readit(inode, fs, tid, ra, offset, max);
        return;
    } else if hit_marker {
        // Marked sector consumed by a non-sequential reader: restart the
        // window at the first sector the cache is missing.
        let mut next_miss = None;
        for probe in offset + 1..=offset + max {
            match inode.data_sector(fs, tid, probe * SECTOR_SIZE as u32) {
                Ok(Some(sector)) => {
                    if !fs.cache.contains(sector) {
                        next_miss = Some(probe);
                        break;
                    }
                }
                // Off the end of the file or a hole.
                _ => break,
            }
        }
        match next_miss {
            Some(start) => {
                ra.start = start;
                ra.size = get_next_ra_size(ra.size.max(1), max);
                ra.async_size = ra.size;
                readit(inode, fs, tid, ra, offset, max);
            }
            // Everything in reach is cached; nothing to prefetch.
            None => {}
        }
        return;
    } else if req > max {
        true
    } else {
        // Adjacent to the previous read position. Unsigned comparison, so
        // a backward jump is a random access, and the -1 initial position
        // only matches offset 0.
        let prev_sector = ra.prev_pos >> SECTOR_SIZE.trailing_zeros();
        (offset as i64).wrapping_sub(prev_sector) as u64 <= 1
    };

    if !sequential_start {
        // Random access: one-shot fetch, no lookahead, window untouched.
        trace!("readahead: random fetch of {} at {}", req, offset);
        let _ = do_cache_readahead(inode, fs, tid, offset, req, 0);
        return;
    }

    ra.start = offset;
    ra.size = get_init_ra_size(req, max);
    ra.async_size = if ra.size > req { ra.size - req } else { ra.size };
    readit(inode, fs, tid, ra, offset, max);
}

/// Issues the window fetch, merging the next window ahead of time when the
/// fetch itself is about to consume the asynchronous mark.
fn readit(inode: &Inode, fs: &FileSys, tid: Tid, ra: &mut RaState, offset: u32, max: u32) {
    if offset == ra.start && ra.size == ra.async_size {
        ra.async_size = get_next_ra_size(ra.size, max);
        ra.size += ra.async_size;
    }
    let fetched = do_cache_readahead(inode, fs, tid, ra.start, ra.size, ra.async_size);
    trace!(
        "readahead: window [{}, +{}) async {} fetched {}",
        ra.start,
        ra.size,
        ra.async_size,
        fetched
    );
}

/// Fetches `n` sectors of the file starting at file sector `start` into
/// the cache, stamping the readahead mark on the sector `lookahead` from
/// the end. Returns the number of sectors fetched; finding one already
/// cached suppresses the pass and returns 0.
pub(super) fn do_cache_readahead(
    inode: &Inode,
    fs: &FileSys,
    tid: Tid,
    start: u32,
    n: u32,
    lookahead: u32,
) -> u32 {
    let mut sectors = ArrayVec::<u32, { 2 * RA_MAX }>::new();
    for i in 0..n.min(2 * RA_MAX as u32) {
        let pos = (start + i) as u64 * SECTOR_SIZE as u64;
        if pos > u32::MAX as u64 {
            break;
        }
        match inode.data_sector(fs, tid, pos as u32) {
            Ok(Some(sector)) => {
                if fs.cache.contains(sector) {
                    // The reader is already ahead of this window.
                    return 0;
                }
                sectors.push(sector);
            }
            // End of file, a hole, or a cache hiccup: stop the window.
            _ => break,
        }
    }

    let total = sectors.len() as u32;
    for (i, &sector) in sectors.iter().enumerate() {
        match fs.cache.get(tid, sector) {
            Ok(buf) => drop(buf),
            // Prefetch is advisory; a busy cache just ends the pass.
            Err(_) => return i as u32,
        }
        if Some(i as u32) == total.checked_sub(lookahead) {
            fs.cache.set_readahead(sector);
        }
    }
    total
}
