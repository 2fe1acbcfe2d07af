//! File system implementation. Four layers:
//!   + Sectors: allocator for raw device sectors (the free-map file).
//!   + Cache: write-behind sector cache with readahead ([`crate::bio`]).
//!   + Inodes: multi-level indexed file layout, extension, teardown.
//!   + Openers: per-opener handles carrying readahead state.
//!
//! The directory layer and path resolution live above this crate; the only
//! thing the engine knows about directories is the inode `type` tag.
//!
//! Disk layout: sector 0 holds the free-map file's inode, sector 1 the root
//! directory's; everything else is allocated out of the free map, whose
//! bytes are stored in the free-map file itself.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use log::{debug, info};

use crate::bio::Bcache;
use crate::error::Error;
use crate::hal::{BlockDevice, Tid};
use crate::lock::{SleepLock, SpinLock};
use crate::param::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR};

mod inode;
mod readahead;

pub use inode::{Inode, InodeType, Itable, RcInode};
pub use readahead::RaState;

/// Sectors are addressed by 32-bit indices.
pub type SectorNo = u32;

/// In-memory image of the device free map.
///
/// The authoritative copy lives in the free-map file at sector 0; this
/// image is loaded at mount and written back by [`FileSys::done`].
struct FreeMap {
    inner: SpinLock<FreeMapInner>,
}

struct FreeMapInner {
    words: Vec<u64>,
    nsectors: u32,
}

impl FreeMap {
    fn new(nsectors: u32) -> Self {
        let nwords = (nsectors as usize + 63) / 64;
        Self {
            inner: SpinLock::new(
                "freemap",
                FreeMapInner {
                    words: vec![0; nwords],
                    nsectors,
                },
            ),
        }
    }

    /// Scans for a clear bit, sets it, and returns the sector.
    fn allocate(&self) -> Result<SectorNo, Error> {
        let mut inner = self.inner.lock();
        let nsectors = inner.nsectors;
        for (w, word) in inner.words.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                let sector = (w * 64 + bit) as u32;
                if sector >= nsectors {
                    break;
                }
                *word |= 1 << bit;
                return Ok(sector);
            }
        }
        Err(Error::NoFreeSector)
    }

    /// Clears the bit for `sector`.
    fn release(&self, sector: SectorNo) {
        let mut inner = self.inner.lock();
        let (w, bit) = (sector as usize / 64, sector as usize % 64);
        debug_assert_ne!(inner.words[w] & (1 << bit), 0, "releasing free sector");
        inner.words[w] &= !(1 << bit);
    }

    /// Marks `sector` used. Bootstrap only.
    fn mark(&self, sector: SectorNo) {
        let mut inner = self.inner.lock();
        let (w, bit) = (sector as usize / 64, sector as usize % 64);
        inner.words[w] |= 1 << bit;
    }

    fn count_free(&self) -> u32 {
        let inner = self.inner.lock();
        let used: u32 = inner.words.iter().map(|w| w.count_ones()).sum();
        inner.nsectors - used
    }

    /// Size of the on-disk image in bytes.
    fn byte_len(&self) -> u32 {
        (self.inner.lock().nsectors + 7) / 8
    }

    fn to_bytes(&self) -> Vec<u8> {
        let inner = self.inner.lock();
        let len = ((inner.nsectors + 7) / 8) as usize;
        let mut bytes = vec![0u8; len];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = (inner.words[i / 8] >> ((i % 8) * 8)) as u8;
        }
        bytes
    }

    fn load_bytes(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        for word in inner.words.iter_mut() {
            *word = 0;
        }
        for (i, byte) in bytes.iter().enumerate() {
            inner.words[i / 8] |= (*byte as u64) << ((i % 8) * 8);
        }
    }
}

/// The mounted file system: device, cache, free map and open-inode table.
pub struct FileSys {
    pub cache: Bcache,
    freemap: FreeMap,
    itable: Itable,
    nsectors: u32,
}

impl FileSys {
    /// Formats a blank device: writes a root directory inode at sector 1
    /// and the free-map file at sector 0, then returns the mounted system.
    pub fn format(dev: Arc<dyn BlockDevice>, tid: Tid) -> Result<Self, Error> {
        let nsectors = dev.sector_count();
        let fs = Self {
            cache: Bcache::new(dev),
            freemap: FreeMap::new(nsectors),
            itable: Itable::new(),
            nsectors,
        };
        fs.freemap.mark(FREE_MAP_SECTOR);
        fs.freemap.mark(ROOT_DIR_SECTOR);

        fs.create(tid, ROOT_DIR_SECTOR, 0, InodeType::Dir)?;
        fs.create(tid, FREE_MAP_SECTOR, fs.freemap.byte_len(), InodeType::File)?;
        fs.write_free_map(tid)?;
        info!("fs: formatted {} sectors", nsectors);
        Ok(fs)
    }

    /// Mounts a previously formatted device, loading the free map from the
    /// free-map file.
    pub fn mount(dev: Arc<dyn BlockDevice>, tid: Tid) -> Result<Self, Error> {
        let nsectors = dev.sector_count();
        let fs = Self {
            cache: Bcache::new(dev),
            freemap: FreeMap::new(nsectors),
            itable: Itable::new(),
            nsectors,
        };
        let map = fs.open(tid, FREE_MAP_SECTOR)?;
        let len = map.length(&fs, tid)? as usize;
        let mut bytes = vec![0u8; len];
        let mut ra = RaState::new();
        let read = map.read_at(&fs, tid, &mut ra, &mut bytes, 0)?;
        debug_assert_eq!(read, len);
        fs.freemap.load_bytes(&bytes);
        fs.close(tid, map);
        debug!("fs: mounted, {} sectors free", fs.freemap.count_free());
        Ok(fs)
    }

    /// Persists the free map and flushes the cache. Call at shutdown.
    pub fn done(&self, tid: Tid) -> Result<(), Error> {
        self.write_free_map(tid)?;
        self.cache.flush();
        Ok(())
    }

    fn write_free_map(&self, tid: Tid) -> Result<(), Error> {
        let map = self.open(tid, FREE_MAP_SECTOR)?;
        let bytes = self.freemap.to_bytes();
        let written = map.write_at(self, tid, &bytes, 0)?;
        debug_assert_eq!(written, bytes.len());
        self.close(tid, map);
        Ok(())
    }

    /// Creates an inode at `sector` with `length` zero-filled bytes.
    ///
    /// The caller supplies (and has allocated) the inode sector itself;
    /// data sectors come from the free map. All-or-nothing: on failure
    /// every data sector acquired is released and `sector` is left blank.
    pub fn create(
        &self,
        tid: Tid,
        sector: SectorNo,
        length: u32,
        typ: InodeType,
    ) -> Result<(), Error> {
        inode::create(self, tid, sector, length, typ)
    }

    /// Opens the inode at `sector`. Opening the same sector twice returns
    /// the same handle with its open count incremented.
    pub fn open(&self, tid: Tid, sector: SectorNo) -> Result<RcInode, Error> {
        self.itable.open(self, tid, sector)
    }

    /// Bumps the open count of `handle`.
    pub fn reopen(&self, handle: &RcInode) -> RcInode {
        self.itable.reopen(handle)
    }

    /// Closes `handle`. The last close of a removed inode releases every
    /// sector the file occupied, including the inode sector.
    pub fn close(&self, tid: Tid, handle: RcInode) {
        self.itable.close(self, tid, handle)
    }

    /// Allocates a sector from the free map (for file data or a new
    /// inode's own sector).
    pub fn alloc_sector(&self) -> Result<SectorNo, Error> {
        self.freemap.allocate()
    }

    /// Releases a sector and drops its cache entry.
    pub fn free_sector(&self, sector: SectorNo) {
        self.cache.free(sector);
        self.freemap.release(sector);
    }

    /// Number of free sectors. Introspection for stats and tests.
    pub fn free_sectors(&self) -> u32 {
        self.freemap.count_free()
    }

    pub fn sector_count(&self) -> u32 {
        self.nsectors
    }
}

/// An opener of an inode: the handle file I/O goes through.
///
/// Each opener carries its own readahead window, so two sequential readers
/// of one file do not fight over the prediction state.
pub struct File {
    pub inode: RcInode,
    ra: SleepLock<RaState>,
}

/// A reference-counted file opener.
pub type RcFile = Arc<File>;

impl File {
    /// Wraps an open inode handle into an opener with fresh readahead
    /// state. Takes over the handle's open count.
    pub fn new(inode: RcInode) -> RcFile {
        Arc::new(Self {
            inode,
            ra: SleepLock::new("file-ra", RaState::new()),
        })
    }

    pub fn read_at(
        &self,
        fs: &FileSys,
        tid: Tid,
        dst: &mut [u8],
        offset: u32,
    ) -> Result<usize, Error> {
        let mut ra = self.ra.lock();
        self.inode.read_at(fs, tid, &mut ra, dst, offset)
    }

    pub fn write_at(
        &self,
        fs: &FileSys,
        tid: Tid,
        src: &[u8],
        offset: u32,
    ) -> Result<usize, Error> {
        self.inode.write_at(fs, tid, src, offset)
    }

    /// Closes the opener's inode handle.
    pub fn close(self: Arc<Self>, fs: &FileSys, tid: Tid) {
        fs.close(tid, self.inode.clone());
    }
}
