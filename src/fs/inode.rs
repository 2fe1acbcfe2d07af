//! Inodes.
//!
//! An inode describes a single unnamed file. The on-disk structure is one
//! sector: twelve direct sector slots, one single-indirect slot, one
//! double-indirect slot, the file length, a type tag and a magic number.
//! Index sectors hold 128 slots each, so the largest file is
//! (12 + 128 + 128 * 128) sectors.
//!
//! The kernel keeps a table of in-use inodes in memory to provide a place
//! for synchronizing access to inodes used by multiple threads. Opening a
//! sector that is already open returns the same handle with its open count
//! incremented; the handle is freed at the last close, and if the inode was
//! removed in the meantime, the last close also releases every sector the
//! file occupied.
//!
//! All metadata reads and writes go through the sector cache, so index
//! sectors and the inode sector itself stay cached between operations. The
//! length stored in the inode sector is authoritative; it moves only when
//! an extension commits, under the per-inode grow lock.

use core::mem;

use alloc::sync::Arc;
use alloc::vec::Vec;

use log::debug;
use scopeguard::ScopeGuard;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use super::readahead::{self, RaState};
use super::{FileSys, SectorNo};
use crate::error::Error;
use crate::hal::Tid;
use crate::lock::{SleepLock, SpinLock};
use crate::param::{MAXFILE, NDIRECT, NINDIRECT, SECTOR_SIZE};

/// Sanity tag stored in every inode sector ("INOD").
const INODE_MAGIC: u32 = 0x494E_4F44;

/// Byte offset of the single-indirect slot.
const OFS_INDIRECT: usize = 4 * NDIRECT;
/// Byte offset of the double-indirect slot.
const OFS_DINDIRECT: usize = 4 * (NDIRECT + 1);
/// Byte offset of the length field.
const OFS_LENGTH: usize = 4 * (NDIRECT + 2);
/// Byte offset of the type tag.
const OFS_TYPE: usize = 4 * (NDIRECT + 3);
/// Byte offset of the magic number.
const OFS_MAGIC: usize = 4 * (NDIRECT + 4);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InodeType {
    Dir,
    File,
}

impl InodeType {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(InodeType::Dir),
            1 => Some(InodeType::File),
            _ => None,
        }
    }

    fn into_raw(self) -> u32 {
        match self {
            InodeType::Dir => 0,
            InodeType::File => 1,
        }
    }
}

/// On-disk inode header. Written at the start of the inode sector; the
/// rest of the sector is reserved zeros.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
pub struct Dinode {
    /// Twelve direct slots, then the single- and double-indirect slots.
    /// A slot of 0 means no sector.
    sectors: [u32; NDIRECT + 2],

    /// File size in bytes.
    length: u32,

    /// 0 = directory, 1 = regular file.
    typ: u32,

    /// Must be `INODE_MAGIC`.
    magic: u32,
}

/// Size of the header; everything after it up to the sector end is zero.
const DINODE_SIZE: usize = 4 * (NDIRECT + 5);

const_assert!(mem::size_of::<Dinode>() == DINODE_SIZE);
const_assert!(DINODE_SIZE <= SECTOR_SIZE);

impl Dinode {
    fn new(typ: InodeType) -> Self {
        Self {
            sectors: [0; NDIRECT + 2],
            length: 0,
            typ: typ.into_raw(),
            magic: INODE_MAGIC,
        }
    }
}

/// Book-keeping of one open inode, not stored on disk.
struct InodeMeta {
    open_cnt: u32,
    removed: bool,
    deny_write_cnt: u32,
}

/// In-memory handle to an on-disk inode.
pub struct Inode {
    /// Sector of the on-disk inode; doubles as the inode number.
    inum: SectorNo,

    meta: SpinLock<InodeMeta>,

    /// Held while the file grows, so the new length commits atomically
    /// with the sectors that back it.
    grow: SleepLock<()>,
}

/// A reference-counted inode handle.
pub type RcInode = Arc<Inode>;

/// The table interning open inodes by sector.
pub struct Itable {
    list: SpinLock<Vec<RcInode>>,
}

impl Itable {
    pub(super) fn new() -> Self {
        Self {
            list: SpinLock::new("itable", Vec::new()),
        }
    }

    /// Finds or creates the handle for `sector` and bumps its open count.
    pub(super) fn open(
        &self,
        fs: &FileSys,
        tid: Tid,
        sector: SectorNo,
    ) -> Result<RcInode, Error> {
        let mut list = self.list.lock();
        if let Some(ip) = list.iter().find(|ip| ip.inum == sector) {
            ip.meta.lock().open_cnt += 1;
            return Ok(ip.clone());
        }

        let magic = fs.cache.read_u32(tid, sector, OFS_MAGIC)?;
        assert_eq!(magic, INODE_MAGIC, "inode: bad magic at sector {}", sector);

        let ip = Arc::new(Inode {
            inum: sector,
            meta: SpinLock::new(
                "inode-meta",
                InodeMeta {
                    open_cnt: 1,
                    removed: false,
                    deny_write_cnt: 0,
                },
            ),
            grow: SleepLock::new("inode-grow", ()),
        });
        list.push(ip.clone());
        Ok(ip)
    }

    /// Bumps the open count of an existing handle.
    pub(super) fn reopen(&self, handle: &RcInode) -> RcInode {
        handle.meta.lock().open_cnt += 1;
        handle.clone()
    }

    /// Drops one open of `handle`. The last close unlinks the handle from
    /// the table; if the inode was removed, its sectors are released.
    pub(super) fn close(&self, fs: &FileSys, tid: Tid, handle: RcInode) {
        let mut list = self.list.lock();
        let (last, removed) = {
            let mut meta = handle.meta.lock();
            debug_assert!(meta.open_cnt > 0);
            meta.open_cnt -= 1;
            (meta.open_cnt == 0, meta.removed)
        };
        if !last {
            return;
        }
        list.retain(|ip| ip.inum != handle.inum);
        drop(list);
        if removed {
            handle.release_sectors(fs, tid);
        }
    }
}

/// One (holder sector, byte position, allocated sector) record; undoing it
/// zeroes the slot and releases the sector.
type JournalEntry = (SectorNo, usize, SectorNo);

/// Allocates a zero-filled sector and records it at `pos` of `holder`.
fn alloc_into(
    fs: &FileSys,
    tid: Tid,
    holder: SectorNo,
    pos: usize,
    journal: &mut Vec<JournalEntry>,
) -> Result<SectorNo, Error> {
    let sector = fs.alloc_sector()?;
    // Journal first, so the sector is released even if a step below fails.
    journal.push((holder, pos, sector));
    // Zero-fill through the cache; no device read for a fresh sector.
    drop(fs.cache.get_zeroed(tid, sector)?);
    fs.cache.write_u32(tid, holder, pos, sector)?;
    Ok(sector)
}

/// Undoes every allocation in `journal`, newest first.
fn rollback(fs: &FileSys, tid: Tid, journal: &mut Vec<JournalEntry>) {
    while let Some((holder, pos, sector)) = journal.pop() {
        // Best effort: the holder may itself be gone already.
        let _ = fs.cache.write_u32(tid, holder, pos, 0);
        fs.free_sector(sector);
    }
}

/// Resolves file sector `idx` to the (holder sector, byte position) of its
/// slot, allocating missing index sectors along the way when `journal` is
/// given; read-only resolution returns `None` at the first missing index
/// sector.
fn slot_of(
    fs: &FileSys,
    tid: Tid,
    inum: SectorNo,
    idx: usize,
    mut journal: Option<&mut Vec<JournalEntry>>,
) -> Result<Option<(SectorNo, usize)>, Error> {
    if idx < NDIRECT {
        return Ok(Some((inum, 4 * idx)));
    }
    if idx < NDIRECT + NINDIRECT {
        let mut ind = fs.cache.read_u32(tid, inum, OFS_INDIRECT)?;
        if ind == 0 {
            match journal.as_deref_mut() {
                Some(journal) => ind = alloc_into(fs, tid, inum, OFS_INDIRECT, journal)?,
                None => return Ok(None),
            }
        }
        return Ok(Some((ind, 4 * (idx - NDIRECT))));
    }
    if idx >= MAXFILE {
        return Err(Error::TooLarge);
    }

    let idx = idx - NDIRECT - NINDIRECT;
    let mut dbl = fs.cache.read_u32(tid, inum, OFS_DINDIRECT)?;
    if dbl == 0 {
        match journal.as_deref_mut() {
            Some(journal) => dbl = alloc_into(fs, tid, inum, OFS_DINDIRECT, journal)?,
            None => return Ok(None),
        }
    }
    let mut ind = fs.cache.read_u32(tid, dbl, 4 * (idx / NINDIRECT))?;
    if ind == 0 {
        match journal {
            Some(journal) => ind = alloc_into(fs, tid, dbl, 4 * (idx / NINDIRECT), journal)?,
            None => return Ok(None),
        }
    }
    Ok(Some((ind, 4 * (idx % NINDIRECT))))
}

/// Grows the file behind `inum` from `old_len` to `new_len` bytes,
/// allocating and zero-filling the missing data sectors tier by tier. The
/// new length is committed only after every sector is in place; any
/// failure rolls back the sectors allocated by this call.
fn extend_raw(
    fs: &FileSys,
    tid: Tid,
    inum: SectorNo,
    old_len: u32,
    new_len: u32,
) -> Result<(), Error> {
    debug_assert!(new_len > old_len);
    if new_len as usize > MAXFILE * SECTOR_SIZE {
        return Err(Error::TooLarge);
    }

    let first = (old_len as usize + SECTOR_SIZE - 1) / SECTOR_SIZE;
    let last = (new_len as usize + SECTOR_SIZE - 1) / SECTOR_SIZE;

    let mut journal = scopeguard::guard(Vec::new(), |mut j| rollback(fs, tid, &mut j));
    for idx in first..last {
        let (holder, pos) = slot_of(fs, tid, inum, idx, Some(&mut *journal))?
            .expect("slot_of with journal resolves");
        if fs.cache.read_u32(tid, holder, pos)? == 0 {
            let _ = alloc_into(fs, tid, holder, pos, &mut *journal)?;
        }
    }
    fs.cache.write_u32(tid, inum, OFS_LENGTH, new_len)?;
    let _ = ScopeGuard::into_inner(journal);
    debug!("inode {}: extended {} -> {} bytes", inum, old_len, new_len);
    Ok(())
}

/// Writes a fresh inode image at `sector` and allocates `length` bytes of
/// zero-filled data. See [`FileSys::create`].
pub(super) fn create(
    fs: &FileSys,
    tid: Tid,
    sector: SectorNo,
    length: u32,
    typ: InodeType,
) -> Result<(), Error> {
    {
        let mut buf = fs.cache.get_zeroed(tid, sector)?;
        buf.data_mut()[..DINODE_SIZE].copy_from_slice(Dinode::new(typ).as_bytes());
        buf.mark_dirty();
    }
    if length > 0 {
        if let Err(err) = extend_raw(fs, tid, sector, 0, length) {
            // Leave the caller's sector blank rather than as an empty inode.
            let _ = fs.cache.memset(tid, sector, 0, 0, SECTOR_SIZE);
            return Err(err);
        }
    }
    Ok(())
}

impl Inode {
    /// The inode's sector number.
    pub fn inumber(&self) -> SectorNo {
        self.inum
    }

    pub fn is_dir(&self, fs: &FileSys, tid: Tid) -> Result<bool, Error> {
        Ok(self.typ(fs, tid)? == InodeType::Dir)
    }

    fn typ(&self, fs: &FileSys, tid: Tid) -> Result<InodeType, Error> {
        let raw = fs.cache.read_u32(tid, self.inum, OFS_TYPE)?;
        Ok(InodeType::from_raw(raw).expect("inode: bad type tag"))
    }

    /// File length in bytes, read from the inode sector.
    pub fn length(&self, fs: &FileSys, tid: Tid) -> Result<u32, Error> {
        fs.cache.read_u32(tid, self.inum, OFS_LENGTH)
    }

    /// Marks the inode for deletion at its last close.
    pub fn remove(&self) {
        self.meta.lock().removed = true;
    }

    /// Forbids writes through this inode until `allow_write`.
    pub fn deny_write(&self) {
        self.meta.lock().deny_write_cnt += 1;
    }

    pub fn allow_write(&self) {
        let mut meta = self.meta.lock();
        debug_assert!(meta.deny_write_cnt > 0);
        meta.deny_write_cnt -= 1;
    }

    /// Open count of the handle. Introspection for tests and stats.
    pub fn open_count(&self) -> u32 {
        self.meta.lock().open_cnt
    }

    /// Device sector holding file byte `pos`, or `None` for a hole.
    pub(super) fn data_sector(
        &self,
        fs: &FileSys,
        tid: Tid,
        pos: u32,
    ) -> Result<Option<SectorNo>, Error> {
        let idx = pos as usize / SECTOR_SIZE;
        if idx >= MAXFILE {
            return Ok(None);
        }
        let (holder, slot_pos) = match slot_of(fs, tid, self.inum, idx, None)? {
            Some(v) => v,
            None => return Ok(None),
        };
        let sector = fs.cache.read_u32(tid, holder, slot_pos)?;
        Ok(if sector == 0 { None } else { Some(sector) })
    }

    /// Reads up to `dst.len()` bytes at byte `offset`, returning the number
    /// of bytes read. Reading past end-of-file returns fewer bytes than
    /// requested. Maintains `ra`'s window: a miss consults the readahead
    /// oracle synchronously, and consuming a marked sector triggers the
    /// next asynchronous window.
    pub fn read_at(
        &self,
        fs: &FileSys,
        tid: Tid,
        ra: &mut RaState,
        dst: &mut [u8],
        offset: u32,
    ) -> Result<usize, Error> {
        let length = self.length(fs, tid)?;
        if offset >= length {
            ra.prev_pos = offset as i64;
            return Ok(0);
        }
        let n = dst.len().min((length - offset) as usize);
        let last_idx = (offset as usize + n - 1) / SECTOR_SIZE;

        let mut tot = 0;
        while tot < n {
            let pos = offset as usize + tot;
            let idx = pos / SECTOR_SIZE;
            let sector = match self.data_sector(fs, tid, pos as u32)? {
                Some(sector) => sector,
                // Holes only exist beyond the committed length.
                None => break,
            };

            let req = (last_idx - idx + 1) as u32;
            if !fs.cache.contains(sector) {
                readahead::ondemand_readahead(self, fs, tid, ra, idx as u32, req, false);
            }
            if fs.cache.readahead(sector) {
                fs.cache.clear_readahead(sector);
                readahead::ondemand_readahead(self, fs, tid, ra, idx as u32, req, true);
            }

            let in_sector = pos % SECTOR_SIZE;
            let chunk = (n - tot).min(SECTOR_SIZE - in_sector);
            fs.cache
                .read(tid, sector, &mut dst[tot..tot + chunk], in_sector)?;
            tot += chunk;
        }
        ra.prev_pos = (offset as usize + tot) as i64;
        Ok(tot)
    }

    /// Writes `src` at byte `offset`, extending the file first if the
    /// write ends beyond it. Returns the number of bytes written: 0 while
    /// writes are denied. Directories are not writable through this
    /// interface.
    pub fn write_at(
        &self,
        fs: &FileSys,
        tid: Tid,
        src: &[u8],
        offset: u32,
    ) -> Result<usize, Error> {
        if self.meta.lock().deny_write_cnt > 0 {
            return Ok(0);
        }
        if self.typ(fs, tid)? == InodeType::Dir {
            return Err(Error::InvalidArg);
        }
        if src.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(src.len() as u32)
            .ok_or(Error::TooLarge)?;
        if end as usize > MAXFILE * SECTOR_SIZE {
            return Err(Error::TooLarge);
        }

        if end > self.length(fs, tid)? {
            let _grow = self.grow.lock();
            // Rechecked under the grow lock; another writer may have
            // extended past `end` already.
            let length = self.length(fs, tid)?;
            if end > length {
                extend_raw(fs, tid, self.inum, length, end)?;
            }
        }

        let mut tot = 0;
        while tot < src.len() {
            let pos = offset as usize + tot;
            let sector = self
                .data_sector(fs, tid, pos as u32)?
                .ok_or(Error::NotFound)?;
            let in_sector = pos % SECTOR_SIZE;
            let chunk = (src.len() - tot).min(SECTOR_SIZE - in_sector);
            fs.cache
                .write(tid, sector, &src[tot..tot + chunk], in_sector)?;
            tot += chunk;
        }
        Ok(tot)
    }

    /// Releases every sector the file occupies, the index sectors, and the
    /// inode sector itself. Runs at the last close of a removed inode.
    fn release_sectors(&self, fs: &FileSys, tid: Tid) {
        let image = {
            match fs.cache.get(tid, self.inum) {
                Ok(buf) => Dinode::read_from(&buf.data()[..DINODE_SIZE]).expect("inode image"),
                Err(_) => return,
            }
        };

        for &sector in image.sectors[..NDIRECT].iter() {
            if sector != 0 {
                fs.free_sector(sector);
            }
        }
        if image.sectors[NDIRECT] != 0 {
            self.release_index(fs, tid, image.sectors[NDIRECT], 1);
        }
        if image.sectors[NDIRECT + 1] != 0 {
            self.release_index(fs, tid, image.sectors[NDIRECT + 1], 2);
        }
        fs.free_sector(self.inum);
        debug!("inode {}: released", self.inum);
    }

    /// Releases an index sector of the given depth and everything below it.
    fn release_index(&self, fs: &FileSys, tid: Tid, index: SectorNo, depth: u32) {
        for slot in 0..NINDIRECT {
            let sector = match fs.cache.read_u32(tid, index, 4 * slot) {
                Ok(sector) => sector,
                Err(_) => continue,
            };
            if sector == 0 {
                continue;
            }
            if depth > 1 {
                self.release_index(fs, tid, sector, depth - 1);
            } else {
                fs.free_sector(sector);
            }
        }
        fs.free_sector(index);
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::sync::Arc;

    use super::*;
    use crate::hal::{BlockDevice, MemDisk};
    use crate::param::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR};

    const T0: Tid = Tid(0);

    fn fresh_fs(nsectors: u32) -> FileSys {
        FileSys::format(Arc::new(MemDisk::new(nsectors)), T0).unwrap()
    }

    fn alloc_inode_sector(fs: &FileSys) -> SectorNo {
        fs.alloc_sector().unwrap()
    }

    #[test]
    fn create_write_read_round_trip() {
        let fs = fresh_fs(256);
        let sector = alloc_inode_sector(&fs);
        fs.create(T0, sector, 0, InodeType::File).unwrap();
        let ip = fs.open(T0, sector).unwrap();

        assert_eq!(ip.write_at(&fs, T0, b"hello", 0).unwrap(), 5);
        assert_eq!(ip.length(&fs, T0).unwrap(), 5);

        let mut ra = RaState::new();
        let mut out = [0u8; 5];
        assert_eq!(ip.read_at(&fs, T0, &mut ra, &mut out, 0).unwrap(), 5);
        assert_eq!(&out, b"hello");
        fs.close(T0, ip);
    }

    #[test]
    fn create_nonzero_length_reads_zeros() {
        let fs = fresh_fs(256);
        let sector = alloc_inode_sector(&fs);
        fs.create(T0, sector, 600, InodeType::File).unwrap();
        let ip = fs.open(T0, sector).unwrap();
        assert_eq!(ip.length(&fs, T0).unwrap(), 600);

        let mut ra = RaState::new();
        let mut out = vec![0xFFu8; 600];
        assert_eq!(ip.read_at(&fs, T0, &mut ra, &mut out, 0).unwrap(), 600);
        assert!(out.iter().all(|b| *b == 0));
        fs.close(T0, ip);
    }

    #[test]
    fn open_twice_interns_to_same_handle() {
        let fs = fresh_fs(256);
        let sector = alloc_inode_sector(&fs);
        fs.create(T0, sector, 0, InodeType::File).unwrap();

        let a = fs.open(T0, sector).unwrap();
        let b = fs.open(T0, sector).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.open_count(), 2);
        fs.close(T0, b);
        assert_eq!(a.open_count(), 1);
        fs.close(T0, a);
    }

    #[test]
    fn remove_then_close_frees_every_sector() {
        let fs = fresh_fs(512);
        let before = fs.free_sectors();

        let sector = fs.alloc_sector().unwrap();
        // Spans direct and single-indirect tiers.
        fs.create(T0, sector, (NDIRECT as u32 + 4) * SECTOR_SIZE as u32, InodeType::File)
            .unwrap();
        assert!(fs.free_sectors() < before - NDIRECT as u32);

        let ip = fs.open(T0, sector).unwrap();
        ip.remove();
        fs.close(T0, ip);
        assert_eq!(fs.free_sectors(), before);
    }

    #[test]
    fn extension_preserves_zero_gap() {
        let fs = fresh_fs(256);
        let sector = alloc_inode_sector(&fs);
        fs.create(T0, sector, 0, InodeType::File).unwrap();
        let ip = fs.open(T0, sector).unwrap();

        assert_eq!(ip.write_at(&fs, T0, b"ab", 0).unwrap(), 2);
        // Write far past the end; the gap must read back as zeros.
        assert_eq!(ip.write_at(&fs, T0, b"z", 1000).unwrap(), 1);
        assert_eq!(ip.length(&fs, T0).unwrap(), 1001);

        let mut ra = RaState::new();
        let mut out = vec![0xFFu8; 1001];
        assert_eq!(ip.read_at(&fs, T0, &mut ra, &mut out, 0).unwrap(), 1001);
        assert_eq!(&out[..2], b"ab");
        assert!(out[2..1000].iter().all(|b| *b == 0));
        assert_eq!(out[1000], b'z');
        fs.close(T0, ip);
    }

    #[test]
    fn write_crosses_all_index_tiers() {
        let fs = fresh_fs(2048);
        let sector = alloc_inode_sector(&fs);
        fs.create(T0, sector, 0, InodeType::File).unwrap();
        let ip = fs.open(T0, sector).unwrap();

        // Ends three sectors into the double-indirect tier.
        let end_idx = NDIRECT + NINDIRECT + 3;
        let offset = (end_idx * SECTOR_SIZE - 100) as u32;
        let payload = [0x5Au8; 200];
        assert_eq!(ip.write_at(&fs, T0, &payload, offset).unwrap(), 200);

        let mut ra = RaState::new();
        let mut out = [0u8; 200];
        assert_eq!(ip.read_at(&fs, T0, &mut ra, &mut out, offset).unwrap(), 200);
        assert_eq!(out, payload);

        // The zero gap before the payload is intact.
        let mut head = [0xFFu8; 64];
        assert_eq!(ip.read_at(&fs, T0, &mut ra, &mut head, 0).unwrap(), 64);
        assert!(head.iter().all(|b| *b == 0));
        fs.close(T0, ip);
    }

    #[test]
    fn write_beyond_max_file_fails_without_state_change() {
        let fs = fresh_fs(256);
        let sector = alloc_inode_sector(&fs);
        fs.create(T0, sector, 0, InodeType::File).unwrap();
        let ip = fs.open(T0, sector).unwrap();
        let free_before = fs.free_sectors();

        let offset = (MAXFILE * SECTOR_SIZE) as u32 - 2;
        assert_eq!(
            ip.write_at(&fs, T0, &[1, 2, 3, 4], offset),
            Err(Error::TooLarge)
        );
        assert_eq!(ip.length(&fs, T0).unwrap(), 0);
        assert_eq!(fs.free_sectors(), free_before);
        fs.close(T0, ip);
    }

    #[test]
    fn failed_extension_rolls_back_allocations() {
        // Tiny device: extension runs out of sectors partway through.
        let fs = fresh_fs(24);
        let sector = alloc_inode_sector(&fs);
        fs.create(T0, sector, 0, InodeType::File).unwrap();
        let ip = fs.open(T0, sector).unwrap();
        let free_before = fs.free_sectors();

        let too_big = vec![7u8; 64 * SECTOR_SIZE];
        assert_eq!(
            ip.write_at(&fs, T0, &too_big, 0),
            Err(Error::NoFreeSector)
        );
        assert_eq!(ip.length(&fs, T0).unwrap(), 0);
        assert_eq!(fs.free_sectors(), free_before);
        fs.close(T0, ip);
    }

    #[test]
    fn read_past_eof_is_short() {
        let fs = fresh_fs(256);
        let sector = alloc_inode_sector(&fs);
        fs.create(T0, sector, 0, InodeType::File).unwrap();
        let ip = fs.open(T0, sector).unwrap();
        ip.write_at(&fs, T0, b"0123456789", 0).unwrap();

        let mut ra = RaState::new();
        let mut out = [0u8; 32];
        assert_eq!(ip.read_at(&fs, T0, &mut ra, &mut out, 4).unwrap(), 6);
        assert_eq!(&out[..6], b"456789");
        assert_eq!(ip.read_at(&fs, T0, &mut ra, &mut out, 10).unwrap(), 0);
        assert_eq!(ip.read_at(&fs, T0, &mut ra, &mut out, 100).unwrap(), 0);
        fs.close(T0, ip);
    }

    #[test]
    fn deny_write_blocks_and_allow_restores() {
        let fs = fresh_fs(256);
        let sector = alloc_inode_sector(&fs);
        fs.create(T0, sector, 0, InodeType::File).unwrap();
        let ip = fs.open(T0, sector).unwrap();

        ip.deny_write();
        assert_eq!(ip.write_at(&fs, T0, b"xx", 0).unwrap(), 0);
        assert_eq!(ip.length(&fs, T0).unwrap(), 0);
        ip.allow_write();
        assert_eq!(ip.write_at(&fs, T0, b"xx", 0).unwrap(), 2);
        fs.close(T0, ip);
    }

    #[test]
    fn directory_write_is_rejected() {
        let fs = fresh_fs(256);
        let root = fs.open(T0, ROOT_DIR_SECTOR).unwrap();
        assert!(root.is_dir(&fs, T0).unwrap());
        assert_eq!(root.write_at(&fs, T0, b"x", 0), Err(Error::InvalidArg));
        fs.close(T0, root);
    }

    #[test]
    fn mount_reloads_free_map() {
        let disk = Arc::new(MemDisk::new(256));
        let free;
        {
            let fs = FileSys::format(disk.clone(), T0).unwrap();
            let sector = fs.alloc_sector().unwrap();
            fs.create(T0, sector, 3 * SECTOR_SIZE as u32, InodeType::File)
                .unwrap();
            free = fs.free_sectors();
            fs.done(T0).unwrap();
        }
        let fs = FileSys::mount(disk, T0).unwrap();
        // One bit was spent on the inode sector plus three data sectors;
        // the reloaded map agrees with the state at shutdown.
        assert_eq!(fs.free_sectors(), free);
        let _ = fs.open(T0, FREE_MAP_SECTOR).unwrap();
    }

    #[test]
    fn on_disk_image_is_bit_exact() {
        let disk = Arc::new(MemDisk::new(256));
        let fs = FileSys::format(disk.clone(), T0).unwrap();
        fs.create(T0, 42, 5, InodeType::File).unwrap();
        fs.done(T0).unwrap();

        let mut raw = [0u8; SECTOR_SIZE];
        disk.read_sector(42, &mut raw);
        // 14 little-endian sector slots: one direct, the rest empty.
        assert_ne!(&raw[..4], &0u32.to_le_bytes());
        assert!(raw[4..4 * (NDIRECT + 2)].iter().all(|b| *b == 0));
        // length 5, type 1 = FILE, magic "INOD", zeros to the end.
        assert_eq!(&raw[OFS_LENGTH..OFS_LENGTH + 4], &5u32.to_le_bytes());
        assert_eq!(&raw[OFS_TYPE..OFS_TYPE + 4], &1u32.to_le_bytes());
        assert_eq!(&raw[OFS_MAGIC..OFS_MAGIC + 4], &[0x44, 0x4F, 0x4E, 0x49]);
        assert!(raw[OFS_MAGIC + 4..].iter().all(|b| *b == 0));
    }
}
