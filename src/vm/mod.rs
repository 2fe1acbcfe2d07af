//! Virtual-memory layer: supplemental page maps, the frame table with
//! two-list eviction, the swap allocator and per-process memory mappings.
//!
//! [`Vm`] bundles one process's paging state: its hardware page table, its
//! supplemental page map and its mapping table. The fault handler calls
//! [`Vm::load_page`] after verifying the faulting address; eviction walks
//! back to the owner through a weak reference on each frame.
//!
//! The storage collaborators an operation may reach (file system, frame
//! table, swap device) travel together in a [`VmCtx`], so nothing in here
//! depends on process-global state.

use alloc::sync::Arc;

use crate::addr::UVAddr;
use crate::error::Error;
use crate::fs::{FileSys, RcFile, RcInode};
use crate::hal::{PageDir, Tid};
use crate::kalloc;
use crate::lock::SpinLock;

pub mod frame;
pub mod mmap;
pub mod page;
pub mod swap;

use frame::{AllocFlags, FrameTable};
use mmap::{MapId, MmapTable};
use page::{Location, Origin, PageMap};
use swap::{SwapDev, SwapSlot};

/// The collaborators a paging operation reaches.
#[derive(Copy, Clone)]
pub struct VmCtx<'a> {
    pub fs: &'a FileSys,
    pub frames: &'a FrameTable,
    pub swap: &'a SwapDev,
}

/// Per-process virtual-memory state.
pub struct Vm {
    tid: Tid,
    pagedir: Arc<dyn PageDir>,
    pages: SpinLock<PageMap>,
    mmaps: SpinLock<MmapTable>,
}

/// What a fault needs to do for a page, decided under the map lock and
/// executed outside it (frame allocation may evict, which takes the frame
/// lock and some page-map lock).
enum LoadPlan {
    File {
        file: RcFile,
        off: u32,
        read_bytes: u32,
        writable: bool,
    },
    MmapFile {
        file: RcFile,
        off: u32,
        read_bytes: u32,
    },
    Swap(SwapSlot),
}

impl Vm {
    pub fn new(tid: Tid, pagedir: Arc<dyn PageDir>) -> Arc<Self> {
        Arc::new(Self {
            tid,
            pagedir,
            pages: SpinLock::new("pages", PageMap::new()),
            mmaps: SpinLock::new("mmaps", MmapTable::new()),
        })
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn pagedir(&self) -> &dyn PageDir {
        &*self.pagedir
    }

    /// The supplemental page map.
    pub fn pages(&self) -> &SpinLock<PageMap> {
        &self.pages
    }

    /// Records a lazily loaded executable-file page. Loader entry point.
    pub fn add_file(
        &self,
        upage: UVAddr,
        file: RcFile,
        off: u32,
        read_bytes: u32,
        zero_bytes: u32,
        writable: bool,
    ) -> Result<(), Error> {
        self.pages
            .lock()
            .add_file(upage, file, off, read_bytes, zero_bytes, writable)
    }

    /// Fault-handler entry: resolves the faulting address to its page and
    /// loads it. The caller has already verified `addr` is a user address.
    pub fn handle_fault(self: &Arc<Self>, ctx: &VmCtx<'_>, addr: UVAddr) -> Result<(), Error> {
        self.load_page(ctx, addr.page())
    }

    /// Brings the page at `upage` into a frame and installs it.
    ///
    /// FILE and MMAPFILE pages read from their file; swapped pages come
    /// back from their slot and drop the swap overlay. A bare STACK entry
    /// is never loaded this way: the stack grower installs its frame
    /// eagerly.
    pub fn load_page(self: &Arc<Self>, ctx: &VmCtx<'_>, upage: UVAddr) -> Result<(), Error> {
        let plan = {
            let pages = self.pages.lock();
            let entry = pages.find(upage).ok_or(Error::NotFound)?;
            if entry.loaded() {
                return Ok(());
            }
            match (&entry.origin, entry.location) {
                (
                    Origin::File {
                        file,
                        off,
                        read_bytes,
                        writable,
                        ..
                    },
                    Location::Backing,
                ) => LoadPlan::File {
                    file: file.clone(),
                    off: *off,
                    read_bytes: *read_bytes,
                    writable: *writable,
                },
                (
                    Origin::MmapFile {
                        file,
                        off,
                        read_bytes,
                    },
                    Location::Backing,
                ) => LoadPlan::MmapFile {
                    file: file.clone(),
                    off: *off,
                    read_bytes: *read_bytes,
                },
                (Origin::File { .. }, Location::Swap(slot))
                | (Origin::Stack, Location::Swap(slot)) => LoadPlan::Swap(slot),
                _ => return Err(Error::InvalidArg),
            }
        };

        let kpage = ctx
            .frames
            .get(ctx.fs, ctx.swap, AllocFlags::ZERO, self, upage)?;

        // SAFETY: the frame was just allocated and is exclusively ours
        // until installed in the page table.
        let page = unsafe { kalloc::page_mut(kpage) };
        let filled: Result<bool, Error> = match plan {
            LoadPlan::File {
                file,
                off,
                read_bytes,
                writable,
            } => file
                .read_at(ctx.fs, self.tid, &mut page[..read_bytes as usize], off)
                .map(|_| writable),
            LoadPlan::MmapFile {
                file,
                off,
                read_bytes,
            } => file
                .read_at(ctx.fs, self.tid, &mut page[..read_bytes as usize], off)
                .map(|_| true),
            LoadPlan::Swap(slot) => {
                ctx.swap.load(page, slot);
                Ok(true)
            }
        };
        let writable = match filled {
            Ok(writable) => writable,
            Err(err) => {
                ctx.frames.free(kpage);
                return Err(err);
            }
        };

        if !self.pagedir.install_page(upage, kpage, writable) {
            ctx.frames.free(kpage);
            return Err(Error::InvalidArg);
        }

        let mut pages = self.pages.lock();
        match pages.find_mut(upage) {
            Some(entry) => {
                entry.loaded = true;
                entry.location = Location::Backing;
            }
            // Unmapped while we were loading; undo.
            None => {
                drop(pages);
                self.pagedir.clear_page(upage);
                ctx.frames.free(kpage);
                return Err(Error::NotFound);
            }
        }
        Ok(())
    }

    /// Grows the stack by one page at `addr`: records the entry and
    /// installs a zeroed, writable frame eagerly.
    pub fn grow_stack(self: &Arc<Self>, ctx: &VmCtx<'_>, addr: UVAddr) -> Result<(), Error> {
        let upage = addr.page();
        self.pages.lock().add_stack(upage)?;

        let kpage = match ctx
            .frames
            .get(ctx.fs, ctx.swap, AllocFlags::ZERO, self, upage)
        {
            Ok(kpage) => kpage,
            Err(err) => {
                let _ = self.pages.lock().delete(upage);
                return Err(err);
            }
        };
        if !self.pagedir.install_page(upage, kpage, true) {
            ctx.frames.free(kpage);
            let _ = self.pages.lock().delete(upage);
            return Err(Error::InvalidArg);
        }
        if let Some(entry) = self.pages.lock().find_mut(upage) {
            entry.loaded = true;
        }
        Ok(())
    }

    /// Maps the open file `file` at `addr`. See [`mmap::mmap`].
    pub fn mmap(
        self: &Arc<Self>,
        ctx: &VmCtx<'_>,
        file: &RcInode,
        addr: UVAddr,
    ) -> Result<MapId, Error> {
        mmap::mmap(self, ctx, file, addr)
    }

    /// Unmaps mapping `mapid`, writing dirty pages back to the file.
    pub fn munmap(self: &Arc<Self>, ctx: &VmCtx<'_>, mapid: MapId) -> Result<(), Error> {
        mmap::munmap(self, ctx, mapid)
    }

    pub(super) fn mmaps(&self) -> &SpinLock<MmapTable> {
        &self.mmaps
    }

    /// Number of live mappings. Introspection for tests.
    pub fn mmap_count(&self) -> usize {
        self.mmaps.lock().len()
    }

    /// Releases every supplemental entry: the frame of each loaded page
    /// goes back to the table, the slot of each swapped page back to the
    /// swap map.
    pub fn free_pages(&self, ctx: &VmCtx<'_>) {
        let entries = self.pages.lock().drain();
        for entry in entries {
            if entry.loaded() {
                if let Some(kpage) = self.pagedir.get_page(entry.upage()) {
                    self.pagedir.clear_page(entry.upage());
                    ctx.frames.free(kpage);
                }
            }
            if let Some(slot) = entry.swap_slot() {
                ctx.swap.free(slot);
            }
        }
    }

    /// Process teardown: unmap every mapping, release every page and swap
    /// slot, return every frame, and drop this thread's cache entries.
    pub fn teardown(self: &Arc<Self>, ctx: &VmCtx<'_>) {
        let mapids = self.mmaps.lock().ids();
        for mapid in mapids {
            let _ = mmap::munmap(self, ctx, mapid);
        }
        self.free_pages(ctx);
        ctx.fs.cache.free_owned_by(self.tid);
    }
}
