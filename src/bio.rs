//! Sector cache.
//!
//! The sector cache holds cached copies of disk sector contents. Caching
//! sectors in memory reduces the number of device reads and also provides a
//! synchronization point for sectors used by multiple threads.
//!
//! Interface:
//! * To get a pinned buffer for a particular sector, call `get`.
//! * After changing buffer data, call `mark_dirty`; write-behind, eviction
//!   or an explicit flush writes it to the device.
//! * Dropping the buffer unpins it. Do not keep buffers longer than
//!   necessary: a cache whose every entry is pinned fails `get` with
//!   [`Error::CacheBusy`].
//!
//! The table (sector map, recency order, pins, readahead marks) lives under
//! the cache spinlock; each entry's payload lives under its own sleep lock,
//! so the fill read never runs with the cache lock held. Entries carry a
//! readahead mark: the inode engine stamps the lookahead sector of an
//! asynchronous window, and a reader consuming the mark triggers the next
//! prefetch.
//!
//! Lock order: the cache lock is taken before an entry's data lock; a held
//! buffer releases its data lock before unpinning. Eviction writes the
//! victim back under the cache lock, so a concurrent miss on the victim's
//! sector can never read stale device contents.

use core::mem::ManuallyDrop;

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

use array_macro::array;
use log::trace;

use crate::error::Error;
use crate::hal::{BlockDevice, Tid};
use crate::lock::{SleepLock, SleepLockGuard, SpinLock};
use crate::param::{NBUF, SECTOR_SIZE, WRITE_BEHIND_TICKS};

/// Payload of one cache entry.
///
/// `data` may be assumed to be u32-aligned, so index sectors can be read
/// in place.
#[repr(align(4))]
pub struct BufInner {
    /// Has data been read from the device?
    valid: bool,

    /// Does the buffer differ from the device?
    dirty: bool,

    data: [u8; SECTOR_SIZE],
}

impl BufInner {
    const fn new() -> Self {
        Self {
            valid: false,
            dirty: false,
            data: [0; SECTOR_SIZE],
        }
    }
}

/// Per-entry bookkeeping, guarded by the cache spinlock.
struct Entry {
    sector: u32,

    /// Pin count; a pinned entry is never evicted or reassigned.
    pins: u32,

    /// Readahead mark; consumed by the inode engine.
    readahead: bool,

    /// Thread the entry currently belongs to, as a tag.
    owner: Option<Tid>,
}

impl Entry {
    const fn new() -> Self {
        Self {
            sector: 0,
            pins: 0,
            readahead: false,
            owner: None,
        }
    }
}

struct BcacheInner {
    entries: [Entry; NBUF],

    /// sector -> slot. Agrees with `lru` on membership.
    map: BTreeMap<u32, usize>,

    /// Recency order of live slots; least-recently-used at the front.
    lru: VecDeque<usize>,

    /// Slots with no sector assigned.
    free: Vec<usize>,

    /// Write-behind tick accumulator.
    ticks: u32,
}

impl BcacheInner {
    /// Moves `slot` to the most-recently-used end.
    fn touch(&mut self, slot: usize) {
        if let Some(pos) = self.lru.iter().position(|s| *s == slot) {
            let _ = self.lru.remove(pos);
        }
        self.lru.push_back(slot);
    }

    /// Removes `slot` from the map and the recency order and clears its
    /// marks. The caller decides whether the slot goes back to `free`.
    fn detach(&mut self, slot: usize) {
        let _ = self.map.remove(&self.entries[slot].sector);
        if let Some(pos) = self.lru.iter().position(|s| *s == slot) {
            let _ = self.lru.remove(pos);
        }
        self.entries[slot].readahead = false;
        self.entries[slot].owner = None;
    }
}

/// The sector cache. One per mounted device.
pub struct Bcache {
    dev: Arc<dyn BlockDevice>,
    inner: SpinLock<BcacheInner>,
    data: [SleepLock<BufInner>; NBUF],
}

/// A pinned, locked cache entry.
///
/// Holds the entry's sleep lock; dropping it releases the lock and unpins
/// the entry.
pub struct Buf<'s> {
    cache: &'s Bcache,
    slot: usize,
    sector: u32,
    guard: ManuallyDrop<SleepLockGuard<'s, BufInner>>,
}

impl Buf<'_> {
    pub fn sector(&self) -> u32 {
        self.sector
    }

    pub fn data(&self) -> &[u8; SECTOR_SIZE] {
        &self.guard.data
    }

    pub fn data_mut(&mut self) -> &mut [u8; SECTOR_SIZE] {
        &mut self.guard.data
    }

    /// Records that the buffer differs from the device.
    pub fn mark_dirty(&mut self) {
        self.guard.dirty = true;
    }
}

impl Drop for Buf<'_> {
    fn drop(&mut self) {
        // Release the data lock before taking the cache lock, so a flush
        // holding the cache lock never waits on a held buffer.
        // SAFETY: `self.guard` is never used again.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        let mut inner = self.cache.inner.lock();
        debug_assert!(inner.entries[self.slot].pins > 0);
        inner.entries[self.slot].pins -= 1;
    }
}

impl Bcache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev,
            inner: SpinLock::new(
                "bcache",
                BcacheInner {
                    entries: array![_ => Entry::new(); NBUF],
                    map: BTreeMap::new(),
                    lru: VecDeque::new(),
                    free: (0..NBUF).rev().collect(),
                    ticks: 0,
                },
            ),
            data: array![_ => SleepLock::new("buffer", BufInner::new()); NBUF],
        }
    }

    /// Returns a pinned buffer with the contents of `sector`.
    ///
    /// Concurrent `get`s of the same sector coalesce to the same entry; the
    /// second caller waits on the entry's sleep lock. A miss on a full
    /// cache evicts the first unpinned entry in recency order; if every
    /// entry is pinned the call fails with `CacheBusy`.
    pub fn get(&self, tid: Tid, sector: u32) -> Result<Buf<'_>, Error> {
        self.get_internal(tid, sector, true)
    }

    /// Returns a pinned buffer for `sector` with zeroed contents, without
    /// reading the device. For callers about to overwrite the full sector.
    pub fn get_zeroed(&self, tid: Tid, sector: u32) -> Result<Buf<'_>, Error> {
        let mut buf = self.get_internal(tid, sector, false)?;
        buf.guard.data.fill(0);
        buf.guard.valid = true;
        buf.guard.dirty = true;
        Ok(buf)
    }

    fn get_internal(&self, tid: Tid, sector: u32, fill: bool) -> Result<Buf<'_>, Error> {
        let mut inner = self.inner.lock();

        // Hit: pin and bump recency.
        if let Some(&slot) = inner.map.get(&sector) {
            inner.entries[slot].pins += 1;
            inner.entries[slot].owner = Some(tid);
            inner.touch(slot);
            drop(inner);

            let mut guard = self.data[slot].lock();
            if fill && !guard.valid {
                // The slot was reassigned before its first fill completed;
                // a duplicate fill is an upsert with identical contents.
                self.dev.read_sector(sector, &mut guard.data);
                guard.valid = true;
            }
            return Ok(Buf {
                cache: self,
                slot,
                sector,
                guard: ManuallyDrop::new(guard),
            });
        }

        // Miss: take a free slot, or evict the first unpinned entry in
        // recency order. The victim's write-back happens under the cache
        // lock so its sector cannot be refetched stale in the meantime.
        let slot = match inner.free.pop() {
            Some(slot) => {
                // A recycled slot may still say `valid` for its old sector.
                // Invalidate before the slot becomes reachable via the map.
                self.data[slot].lock().valid = false;
                slot
            }
            None => {
                let slot = inner
                    .lru
                    .iter()
                    .copied()
                    .find(|s| inner.entries[*s].pins == 0)
                    .ok_or(Error::CacheBusy)?;
                let old = inner.entries[slot].sector;
                {
                    // An unpinned entry's data lock is free: only buffers
                    // (pinned) and flushes (cache lock, which we hold) take
                    // it.
                    let mut guard = self.data[slot].lock();
                    if guard.dirty {
                        trace!("bcache: evict writes back sector {}", old);
                        self.dev.write_sector(old, &guard.data);
                        guard.dirty = false;
                    }
                    guard.valid = false;
                }
                inner.detach(slot);
                slot
            }
        };

        let entry = &mut inner.entries[slot];
        entry.sector = sector;
        entry.pins = 1;
        entry.readahead = false;
        entry.owner = Some(tid);
        let _ = inner.map.insert(sector, slot);
        inner.lru.push_back(slot);
        drop(inner);

        // The entry is pinned: no one can reassign the slot, so the fill
        // read runs without the cache lock.
        let mut guard = self.data[slot].lock();
        if fill && !guard.valid {
            self.dev.read_sector(sector, &mut guard.data);
            guard.valid = true;
        }
        Ok(Buf {
            cache: self,
            slot,
            sector,
            guard: ManuallyDrop::new(guard),
        })
    }

    /// Returns the cached entry for `sector` without consulting the device
    /// and without disturbing the recency order.
    pub fn find(&self, tid: Tid, sector: u32) -> Option<Buf<'_>> {
        let mut inner = self.inner.lock();
        let slot = *inner.map.get(&sector)?;
        inner.entries[slot].pins += 1;
        inner.entries[slot].owner = Some(tid);
        drop(inner);
        Some(Buf {
            cache: self,
            slot,
            sector,
            guard: ManuallyDrop::new(self.data[slot].lock()),
        })
    }

    /// Whether `sector` is present, without pinning it.
    pub fn contains(&self, sector: u32) -> bool {
        self.inner.lock().map.contains_key(&sector)
    }

    /// Drops the entry for `sector`, writing it back first if dirty.
    /// A pinned entry is left alone.
    pub fn free(&self, sector: u32) {
        let mut inner = self.inner.lock();
        let slot = match inner.map.get(&sector) {
            Some(&slot) if inner.entries[slot].pins == 0 => slot,
            _ => return,
        };
        self.flush_slot(slot, sector);
        inner.detach(slot);
        inner.free.push(slot);
    }

    /// Flushes and drops every unpinned entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let slots: Vec<usize> = inner.lru.iter().copied().collect();
        for slot in slots {
            if inner.entries[slot].pins == 0 {
                self.flush_slot(slot, inner.entries[slot].sector);
                inner.detach(slot);
                inner.free.push(slot);
            }
        }
    }

    /// Flushes and drops every unpinned entry owned by `tid`.
    /// Per-thread teardown.
    pub fn free_owned_by(&self, tid: Tid) {
        let mut inner = self.inner.lock();
        let slots: Vec<usize> = inner.lru.iter().copied().collect();
        for slot in slots {
            if inner.entries[slot].owner == Some(tid) && inner.entries[slot].pins == 0 {
                self.flush_slot(slot, inner.entries[slot].sector);
                inner.detach(slot);
                inner.free.push(slot);
            }
        }
    }

    /// Writes every dirty, unpinned entry back to the device and clears its
    /// dirty flag. Takes the cache lock once; pinned entries are flushed by
    /// a later pass or by their own eviction.
    pub fn flush(&self) {
        let inner = self.inner.lock();
        for &slot in inner.lru.iter() {
            self.flush_slot(slot, inner.entries[slot].sector);
        }
        drop(inner);
    }

    /// Writes back one slot if its data lock is free and it is dirty.
    ///
    /// Called with the cache lock held. A pinned entry holds its data lock,
    /// so `try_lock` both skips pinned entries and cannot deadlock.
    fn flush_slot(&self, slot: usize, sector: u32) {
        if let Some(mut guard) = self.data[slot].try_lock() {
            if guard.dirty {
                self.dev.write_sector(sector, &guard.data);
                guard.dirty = false;
            }
        }
    }

    /// Write-behind: one timer tick. Every `WRITE_BEHIND_TICKS` ticks,
    /// flushes the whole cache. The embedder's timer thread drives this.
    pub fn write_behind_tick(&self) {
        let flush = {
            let mut inner = self.inner.lock();
            inner.ticks += 1;
            if inner.ticks >= WRITE_BEHIND_TICKS {
                inner.ticks = 0;
                true
            } else {
                false
            }
        };
        if flush {
            trace!("bcache: write-behind flush");
            self.flush();
        }
    }

    /// Stamps the readahead mark on `sector` if cached.
    pub fn set_readahead(&self, sector: u32) {
        let mut inner = self.inner.lock();
        if let Some(&slot) = inner.map.get(&sector) {
            inner.entries[slot].readahead = true;
        }
    }

    /// Whether `sector` bears the readahead mark.
    pub fn readahead(&self, sector: u32) -> bool {
        let inner = self.inner.lock();
        inner
            .map
            .get(&sector)
            .map_or(false, |&slot| inner.entries[slot].readahead)
    }

    /// Clears the readahead mark on `sector`.
    pub fn clear_readahead(&self, sector: u32) {
        let mut inner = self.inner.lock();
        if let Some(&slot) = inner.map.get(&sector) {
            inner.entries[slot].readahead = false;
        }
    }

    /// Reads `dst.len()` bytes of `sector` starting at byte `off`.
    pub fn read(&self, tid: Tid, sector: u32, dst: &mut [u8], off: usize) -> Result<(), Error> {
        debug_assert!(off + dst.len() <= SECTOR_SIZE);
        let buf = self.get(tid, sector)?;
        dst.copy_from_slice(&buf.data()[off..off + dst.len()]);
        Ok(())
    }

    /// Writes `src` into `sector` starting at byte `off`.
    pub fn write(&self, tid: Tid, sector: u32, src: &[u8], off: usize) -> Result<(), Error> {
        debug_assert!(off + src.len() <= SECTOR_SIZE);
        let mut buf = if src.len() == SECTOR_SIZE {
            self.get_zeroed(tid, sector)?
        } else {
            self.get(tid, sector)?
        };
        buf.data_mut()[off..off + src.len()].copy_from_slice(src);
        buf.mark_dirty();
        Ok(())
    }

    /// Reads the little-endian u32 at byte `pos` of `sector`.
    pub fn read_u32(&self, tid: Tid, sector: u32, pos: usize) -> Result<u32, Error> {
        let mut bytes = [0; 4];
        self.read(tid, sector, &mut bytes, pos)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Writes `value` little-endian at byte `pos` of `sector`.
    pub fn write_u32(&self, tid: Tid, sector: u32, pos: usize, value: u32) -> Result<(), Error> {
        self.write(tid, sector, &value.to_le_bytes(), pos)
    }

    /// Fills `size` bytes of `sector` from byte `off` with `value`.
    pub fn memset(
        &self,
        tid: Tid,
        sector: u32,
        value: u8,
        off: usize,
        size: usize,
    ) -> Result<(), Error> {
        debug_assert!(off + size <= SECTOR_SIZE);
        let mut buf = if off == 0 && size == SECTOR_SIZE {
            self.get_zeroed(tid, sector)?
        } else {
            self.get(tid, sector)?
        };
        buf.data_mut()[off..off + size].fill(value);
        buf.mark_dirty();
        Ok(())
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live sectors in recency order, least recently used first.
    /// Introspection for stats and the test harness.
    pub fn sectors_by_recency(&self) -> Vec<u32> {
        let inner = self.inner.lock();
        inner
            .lru
            .iter()
            .map(|&slot| inner.entries[slot].sector)
            .collect()
    }

    /// Whether the entry for `sector` is dirty; `None` if absent or held.
    pub fn dirty(&self, sector: u32) -> Option<bool> {
        let inner = self.inner.lock();
        let slot = *inner.map.get(&sector)?;
        let guard = self.data[slot].try_lock()?;
        Some(guard.dirty)
    }
}
