//! Memory-mapped files.
//!
//! Each process keeps a list of its file mappings. Creating one reopens
//! the file (the mapping holds its own handle, with its own readahead
//! window) and installs one supplemental entry per page; the last page of
//! a file that is not page-sized maps a short range. Tearing one down
//! deletes the entries, writes hardware-dirty pages back to the file,
//! and closes the handle.
//!
//! A mapping that fails partway through install leaves nothing behind:
//! every entry added by the failing call is deleted and the reopened file
//! is closed before the error is reported.

use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, warn};

use super::page::Origin;
use super::{Vm, VmCtx};
use crate::addr::UVAddr;
use crate::error::Error;
use crate::fs::{File, RcFile, RcInode};
use crate::kalloc;
use crate::param::PGSIZE;

/// Mapping identifier, unique per process, monotonically increasing
/// from 1.
pub type MapId = u32;

pub struct Mapping {
    mapid: MapId,
    base: UVAddr,
    npages: usize,
    file: RcFile,
}

/// The per-process mapping list. The process serializes access to it.
pub struct MmapTable {
    maps: Vec<Mapping>,
}

impl MmapTable {
    pub fn new() -> Self {
        Self { maps: Vec::new() }
    }

    fn next_id(&self) -> MapId {
        self.maps.last().map_or(1, |m| m.mapid + 1)
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub(super) fn ids(&self) -> Vec<MapId> {
        self.maps.iter().map(|m| m.mapid).collect()
    }
}

impl Default for MmapTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps the open file `file` at `addr`, one supplemental entry per page.
///
/// Rejects a null or unaligned address, an empty file, and any overlap
/// with existing supplemental entries. Returns the new mapping's id.
pub(super) fn mmap(
    vm: &Arc<Vm>,
    ctx: &VmCtx<'_>,
    file: &RcInode,
    addr: UVAddr,
) -> Result<MapId, Error> {
    if addr.into_usize() == 0 || !addr.is_page_aligned() {
        return Err(Error::InvalidArg);
    }
    let length = file.length(ctx.fs, vm.tid())?;
    if length == 0 {
        return Err(Error::InvalidArg);
    }
    let npages = (length as usize + PGSIZE - 1) / PGSIZE;

    // The mapping owns a reopened handle; the caller's stays untouched.
    let handle = File::new(ctx.fs.reopen(file));

    {
        let mut pages = vm.pages().lock();
        if pages.overlaps(addr, npages) {
            drop(pages);
            handle.close(ctx.fs, vm.tid());
            return Err(Error::Overlap);
        }
        let mut installed: Vec<UVAddr> = Vec::with_capacity(npages);
        for i in 0..npages {
            let upage = addr.add(i * PGSIZE);
            let off = (i * PGSIZE) as u32;
            let read_bytes = (length - off).min(PGSIZE as u32);
            if let Err(err) = pages.add_mapfile(upage, handle.clone(), off, read_bytes) {
                // Leave nothing of the failed call behind.
                for upage in installed {
                    let _ = pages.delete(upage);
                }
                drop(pages);
                handle.close(ctx.fs, vm.tid());
                return Err(err);
            }
            installed.push(upage);
        }
    }

    let mut maps = vm.mmaps().lock();
    let mapid = maps.next_id();
    maps.maps.push(Mapping {
        mapid,
        base: addr,
        npages,
        file: handle,
    });
    debug!("mmap: id {} at {:?}, {} pages", mapid, addr, npages);
    Ok(mapid)
}

/// Unmaps mapping `mapid`: deletes its entries, writes hardware-dirty
/// loaded pages back to the file, returns their frames, and closes the
/// mapping's handle.
pub(super) fn munmap(vm: &Arc<Vm>, ctx: &VmCtx<'_>, mapid: MapId) -> Result<(), Error> {
    let mapping = {
        let mut maps = vm.mmaps().lock();
        let pos = maps
            .maps
            .iter()
            .position(|m| m.mapid == mapid)
            .ok_or(Error::NotFound)?;
        maps.maps.remove(pos)
    };

    for i in 0..mapping.npages {
        let upage = mapping.base.add(i * PGSIZE);
        let entry = vm.pages().lock().delete(upage);
        let entry = match entry {
            Some(entry) => entry,
            None => continue,
        };
        if !entry.loaded() {
            continue;
        }
        let kpage = match vm.pagedir().get_page(upage) {
            Some(kpage) => kpage,
            None => continue,
        };
        if vm.pagedir().is_dirty(upage) {
            if let Origin::MmapFile {
                off, read_bytes, ..
            } = entry.origin
            {
                // SAFETY: the frame is still in the table; the hardware
                // mapping is cleared right below.
                let page = unsafe { kalloc::page_ref(kpage) };
                if mapping
                    .file
                    .write_at(ctx.fs, vm.tid(), &page[..read_bytes as usize], off)
                    .is_err()
                {
                    warn!("munmap: write-back of {:?} failed", upage);
                }
            }
        }
        vm.pagedir().clear_page(upage);
        ctx.frames.free(kpage);
    }

    mapping.file.close(ctx.fs, vm.tid());
    debug!("munmap: id {} released", mapid);
    Ok(())
}
