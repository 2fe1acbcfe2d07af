//! Hardware abstraction seams.
//!
//! The core drives exactly three pieces of hardware-adjacent state: a block
//! device, a per-process hardware page table, and a thread identity. Each is
//! a trait (or a plain tag) here so the rest of the crate stays portable;
//! the kernel proper supplies the real implementations, and the test
//! harness supplies [`MemDisk`] and [`SoftPageDir`].

use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::addr::{KVAddr, UVAddr};
use crate::param::SECTOR_SIZE;

/// Thread identity tag.
///
/// Cache entries and frames record which thread they currently belong to as
/// a tag, so per-thread teardown is a sweep over the table rather than a
/// walk of per-thread lists.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Tid(pub u32);

/// The block-device contract: sector-sized reads and writes plus a size.
///
/// Sectors are `SECTOR_SIZE` bytes. Devices are assumed infallible here; a
/// real driver should treat device errors as fatal.
pub trait BlockDevice: Send + Sync {
    fn read_sector(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]);
    fn write_sector(&self, sector: u32, buf: &[u8; SECTOR_SIZE]);
    fn sector_count(&self) -> u32;
}

/// The hardware page-table contract of one process.
///
/// `upage` arguments are page-aligned user addresses. The accessed and
/// dirty bits are the MMU-maintained ones; the eviction scan reads and
/// clears them through this trait.
pub trait PageDir: Send + Sync {
    /// Maps `upage` to the kernel page `kpage`. Fails if already mapped.
    fn install_page(&self, upage: UVAddr, kpage: KVAddr, writable: bool) -> bool;

    /// Removes the mapping for `upage`; later accesses fault.
    fn clear_page(&self, upage: UVAddr);

    /// The kernel page `upage` currently maps to, if present.
    fn get_page(&self, upage: UVAddr) -> Option<KVAddr>;

    fn is_accessed(&self, upage: UVAddr) -> bool;
    fn set_accessed(&self, upage: UVAddr, accessed: bool);

    fn is_dirty(&self, upage: UVAddr) -> bool;
    fn set_dirty(&self, upage: UVAddr, dirty: bool);
}

/// RAM-backed block device.
///
/// Stands in for the disk driver on hosts; also what the tests mount.
pub struct MemDisk {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
}

impl MemDisk {
    pub fn new(nsectors: u32) -> Self {
        Self {
            sectors: Mutex::new(vec![[0; SECTOR_SIZE]; nsectors as usize]),
        }
    }
}

impl BlockDevice for MemDisk {
    fn read_sector(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        buf.copy_from_slice(&self.sectors.lock()[sector as usize]);
    }

    fn write_sector(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        self.sectors.lock()[sector as usize].copy_from_slice(buf);
    }

    fn sector_count(&self) -> u32 {
        self.sectors.lock().len() as u32
    }
}

struct SoftEntry {
    kpage: KVAddr,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// Software page table.
///
/// Keeps the same bookkeeping an MMU page table would; tests poke the
/// accessed and dirty bits to simulate user memory traffic.
pub struct SoftPageDir {
    entries: Mutex<alloc::collections::BTreeMap<UVAddr, SoftEntry>>,
}

impl SoftPageDir {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(alloc::collections::BTreeMap::new()),
        }
    }
}

impl Default for SoftPageDir {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDir for SoftPageDir {
    fn install_page(&self, upage: UVAddr, kpage: KVAddr, writable: bool) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&upage) {
            return false;
        }
        let _ = entries.insert(
            upage,
            SoftEntry {
                kpage,
                writable,
                accessed: true,
                dirty: false,
            },
        );
        true
    }

    fn clear_page(&self, upage: UVAddr) {
        let _ = self.entries.lock().remove(&upage);
    }

    fn get_page(&self, upage: UVAddr) -> Option<KVAddr> {
        self.entries.lock().get(&upage).map(|e| e.kpage)
    }

    fn is_accessed(&self, upage: UVAddr) -> bool {
        self.entries.lock().get(&upage).map_or(false, |e| e.accessed)
    }

    fn set_accessed(&self, upage: UVAddr, accessed: bool) {
        if let Some(e) = self.entries.lock().get_mut(&upage) {
            e.accessed = accessed;
        }
    }

    fn is_dirty(&self, upage: UVAddr) -> bool {
        self.entries.lock().get(&upage).map_or(false, |e| e.dirty)
    }

    fn set_dirty(&self, upage: UVAddr, dirty: bool) {
        if let Some(e) = self.entries.lock().get_mut(&upage) {
            e.dirty = dirty;
        }
    }
}

#[allow(dead_code)]
impl SoftPageDir {
    /// Whether `upage` is mapped writable. Test-harness accessor.
    pub fn is_writable(&self, upage: UVAddr) -> bool {
        self.entries.lock().get(&upage).map_or(false, |e| e.writable)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    #[test]
    fn memdisk_round_trip() {
        let disk = MemDisk::new(8);
        let mut buf = [0u8; SECTOR_SIZE];
        buf[0] = 0xa5;
        buf[SECTOR_SIZE - 1] = 0x5a;
        disk.write_sector(3, &buf);
        let mut out = [0u8; SECTOR_SIZE];
        disk.read_sector(3, &mut out);
        assert_eq!(buf, out);
        disk.read_sector(2, &mut out);
        assert!(out.iter().all(|b| *b == 0));
    }

    #[test]
    fn soft_pagedir_bits() {
        let pd = SoftPageDir::new();
        let upage = UVAddr::new(0x8000);
        let kpage = KVAddr::new(0x1000);
        assert!(pd.install_page(upage, kpage, true));
        assert!(!pd.install_page(upage, kpage, true));
        assert_eq!(pd.get_page(upage), Some(kpage));
        assert!(pd.is_accessed(upage));
        pd.set_accessed(upage, false);
        assert!(!pd.is_accessed(upage));
        assert!(!pd.is_dirty(upage));
        pd.set_dirty(upage, true);
        assert!(pd.is_dirty(upage));
        pd.clear_page(upage);
        assert_eq!(pd.get_page(upage), None);
    }
}
