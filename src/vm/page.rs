//! Supplemental page map.
//!
//! One map per process, keyed by user page. Each entry tells the pager
//! where the page's contents come from: a segment of an executable file, a
//! memory-mapped file, or a fresh stack page, possibly overlaid by a swap
//! slot holding the page's current bytes. The origin never changes over an
//! entry's life; the swap overlay comes and goes as the frame table evicts
//! and the fault handler loads.
//!
//! The five legal states are STACK, FILE, MMAPFILE, STACK|SWAP and
//! FILE|SWAP. Mapped-file pages are never overlaid by swap: their dirty
//! bytes go back to the file itself.

use alloc::collections::BTreeMap;

use bitflags::bitflags;

use super::swap::SwapSlot;
use crate::addr::UVAddr;
use crate::error::Error;
use crate::fs::RcFile;

bitflags! {
    /// Where a page's contents live, as a queryable bitmask view.
    pub struct Position: u32 {
        const STACK = 0b0001;
        const FILE = 0b0010;
        const MMAPFILE = 0b0100;
        const SWAP = 0b1000;
    }
}

/// Immutable origin of a page's contents.
pub enum Origin {
    /// Anonymous stack page; starts zeroed.
    Stack,
    /// A segment of an executable file: `read_bytes` from `off`, then
    /// `zero_bytes` of zeros.
    File {
        file: RcFile,
        off: u32,
        read_bytes: u32,
        zero_bytes: u32,
        writable: bool,
    },
    /// A page of a memory-mapped file; always writable, dirty bytes go
    /// back to the file.
    MmapFile { file: RcFile, off: u32, read_bytes: u32 },
}

/// Where the page's current bytes are, relative to its origin.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(super) enum Location {
    /// In the origin's backing store (file contents or nothing yet).
    Backing,
    /// In this swap slot.
    Swap(SwapSlot),
}

/// One supplemental page entry.
pub struct PageEntry {
    pub(super) upage: UVAddr,
    pub(super) origin: Origin,
    pub(super) location: Location,
    /// Whether a frame currently backs the page.
    pub(super) loaded: bool,
}

impl PageEntry {
    /// The entry's position bitmask; always one of the five legal states.
    pub fn position(&self) -> Position {
        let origin = match self.origin {
            Origin::Stack => Position::STACK,
            Origin::File { .. } => Position::FILE,
            Origin::MmapFile { .. } => Position::MMAPFILE,
        };
        match self.location {
            Location::Backing => origin,
            Location::Swap(_) => origin | Position::SWAP,
        }
    }

    pub fn loaded(&self) -> bool {
        self.loaded
    }

    pub fn upage(&self) -> UVAddr {
        self.upage
    }

    /// The swap slot holding the page, when SWAP is set.
    pub fn swap_slot(&self) -> Option<SwapSlot> {
        match self.location {
            Location::Swap(slot) => Some(slot),
            Location::Backing => None,
        }
    }

    /// Whether eviction must save the page to swap (as opposed to writing
    /// it to a mapped file or just dropping it).
    pub(super) fn swaps_on_evict(&self) -> bool {
        match self.origin {
            Origin::Stack => true,
            Origin::File { writable, .. } => writable,
            Origin::MmapFile { .. } => false,
        }
    }
}

/// The per-process supplemental page map.
pub struct PageMap {
    entries: BTreeMap<UVAddr, PageEntry>,
}

impl PageMap {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    fn add(&mut self, upage: UVAddr, origin: Origin) -> Result<(), Error> {
        if !upage.is_page_aligned() {
            return Err(Error::InvalidArg);
        }
        if self.entries.contains_key(&upage) {
            return Err(Error::Overlap);
        }
        let _ = self.entries.insert(
            upage,
            PageEntry {
                upage,
                origin,
                location: Location::Backing,
                loaded: false,
            },
        );
        Ok(())
    }

    /// Records a lazily loaded executable-file page.
    pub fn add_file(
        &mut self,
        upage: UVAddr,
        file: RcFile,
        off: u32,
        read_bytes: u32,
        zero_bytes: u32,
        writable: bool,
    ) -> Result<(), Error> {
        self.add(
            upage,
            Origin::File {
                file,
                off,
                read_bytes,
                zero_bytes,
                writable,
            },
        )
    }

    /// Records a page of a memory-mapped file.
    pub fn add_mapfile(
        &mut self,
        upage: UVAddr,
        file: RcFile,
        off: u32,
        read_bytes: u32,
    ) -> Result<(), Error> {
        self.add(
            upage,
            Origin::MmapFile {
                file,
                off,
                read_bytes,
            },
        )
    }

    /// Records an anonymous stack page.
    pub fn add_stack(&mut self, upage: UVAddr) -> Result<(), Error> {
        self.add(upage, Origin::Stack)
    }

    pub fn find(&self, upage: UVAddr) -> Option<&PageEntry> {
        self.entries.get(&upage)
    }

    pub(super) fn find_mut(&mut self, upage: UVAddr) -> Option<&mut PageEntry> {
        self.entries.get_mut(&upage)
    }

    /// Removes and returns the entry for `upage`.
    pub fn delete(&mut self, upage: UVAddr) -> Option<PageEntry> {
        self.entries.remove(&upage)
    }

    /// Removes every entry, returning them for resource release.
    pub(super) fn drain(&mut self) -> alloc::vec::Vec<PageEntry> {
        let entries = core::mem::take(&mut self.entries);
        entries.into_values().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any entry overlaps `[base, base + npages pages)`.
    pub fn overlaps(&self, base: UVAddr, npages: usize) -> bool {
        let end = UVAddr::new(base.into_usize() + npages * crate::param::PGSIZE);
        self.entries.range(base..end).next().is_some()
    }
}

impl Default for PageMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::param::PGSIZE;

    #[test]
    fn positions_are_the_legal_five() {
        let mut map = PageMap::new();
        let up = |i: usize| UVAddr::new(0x1000_0000 + i * PGSIZE);
        map.add_stack(up(0)).unwrap();
        assert_eq!(map.find(up(0)).unwrap().position(), Position::STACK);

        // Unaligned and duplicate adds are rejected.
        assert_eq!(
            map.add_stack(UVAddr::new(0x1000_0001)),
            Err(Error::InvalidArg)
        );
        assert_eq!(map.add_stack(up(0)), Err(Error::Overlap));
    }

    #[test]
    fn overlap_detection_covers_the_range() {
        let mut map = PageMap::new();
        let base = UVAddr::new(0x2000_0000);
        map.add_stack(UVAddr::new(0x2000_0000 + 2 * PGSIZE)).unwrap();
        assert!(map.overlaps(base, 3));
        assert!(!map.overlaps(base, 2));
        assert!(!map.overlaps(UVAddr::new(0x2000_0000 + 3 * PGSIZE), 4));
    }

    #[test]
    fn delete_returns_the_entry() {
        let mut map = PageMap::new();
        let upage = UVAddr::new(0x3000_0000);
        map.add_stack(upage).unwrap();
        let entry = map.delete(upage).unwrap();
        assert_eq!(entry.upage(), upage);
        assert!(map.is_empty());
        assert!(map.delete(upage).is_none());
    }
}
