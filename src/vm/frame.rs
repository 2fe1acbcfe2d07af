//! Frame table and eviction.
//!
//! Every user page frame is tracked by a descriptor keyed by its kernel
//! page, linked into exactly one of two queues. Fresh frames start on the
//! active queue; eviction sweeps the inactive queue first, giving each
//! frame a second chance if its hardware accessed bit is set, then the
//! active queue, and finally forces the head of the active queue out.
//! After every successful eviction the active queue is drained into the
//! inactive queue down to a floor, so the next eviction has candidates.
//!
//! Saving a victim goes through the owner's supplemental page map: stack
//! pages and writable file pages go to swap, dirty mapped-file pages go
//! back to their file, and read-only file pages are simply dropped (the
//! file itself is their backing store).
//!
//! Lock order: the frame lock is held across the whole eviction sweep (so
//! the queues and counters stay consistent); a victim owner's page-map
//! lock, the swap map lock and the cache lock all nest inside it, and
//! nothing that holds one of those ever takes the frame lock.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::{Arc, Weak};

use bitflags::bitflags;
use log::{debug, warn};

use super::page::{Location, Origin};
use super::swap::SwapDev;
use super::Vm;
use crate::addr::{KVAddr, UVAddr};
use crate::error::Error;
use crate::fs::FileSys;
use crate::hal::Tid;
use crate::kalloc::{self, Kmem};
use crate::lock::SpinLock;
use crate::param::{NR_INACTIVE_MIN, PGSIZE};

bitflags! {
    pub struct AllocFlags: u32 {
        /// Zero the frame before returning it.
        const ZERO = 0b0001;
    }
}

/// Descriptor of one allocated run of page frames (normally a single
/// page). Holds its owner weakly, so process teardown stays O(frames the
/// process owns) and a dead owner never keeps a frame alive.
pub struct Frame {
    pub(super) kpage: KVAddr,
    pub(super) upage: UVAddr,
    pub(super) owner: Weak<Vm>,
    pub(super) tid: Tid,
    /// Size in pages; eviction only considers single-page frames.
    pub(super) size: usize,
    pub(super) active: bool,
}

impl Frame {
    pub fn kpage(&self) -> KVAddr {
        self.kpage
    }

    pub fn upage(&self) -> UVAddr {
        self.upage
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }
}

/// A copy of a frame's bookkeeping, for callers outside the table.
#[derive(Copy, Clone, Debug)]
pub struct FrameInfo {
    pub upage: UVAddr,
    pub tid: Tid,
    pub size: usize,
    pub active: bool,
}

struct FrameTableInner {
    frames: BTreeMap<KVAddr, Frame>,
    active: VecDeque<KVAddr>,
    inactive: VecDeque<KVAddr>,
    nr_active: usize,
    nr_inactive: usize,
}

/// The frame table: allocator plus the two eviction queues.
pub struct FrameTable {
    kmem: Kmem,
    inner: SpinLock<FrameTableInner>,
}

impl FrameTable {
    pub fn new(kmem: Kmem) -> Self {
        Self {
            kmem,
            inner: SpinLock::new(
                "frames",
                FrameTableInner {
                    frames: BTreeMap::new(),
                    active: VecDeque::new(),
                    inactive: VecDeque::new(),
                    nr_active: 0,
                    nr_inactive: 0,
                },
            ),
        }
    }

    /// Allocates one frame for `upage` of `owner`, evicting under memory
    /// pressure.
    pub fn get(
        &self,
        fs: &FileSys,
        swap: &SwapDev,
        flags: AllocFlags,
        owner: &Arc<Vm>,
        upage: UVAddr,
    ) -> Result<KVAddr, Error> {
        self.get_multiple(fs, swap, flags, 1, owner, upage)
    }

    /// Allocates `n` contiguous frames, evicting until the allocator can
    /// satisfy the run.
    pub fn get_multiple(
        &self,
        fs: &FileSys,
        swap: &SwapDev,
        flags: AllocFlags,
        n: usize,
        owner: &Arc<Vm>,
        upage: UVAddr,
    ) -> Result<KVAddr, Error> {
        let kpage = loop {
            if let Some(kpage) = self.kmem.alloc_multiple(n) {
                break kpage;
            }
            // Reclaim through the pool so a victim of any size helps.
            let victim = self.evict(fs, swap)?;
            // SAFETY: the victim's descriptor is out of the table; its
            // frames are not referenced anymore.
            unsafe { self.kmem.free(victim.kpage, victim.size) };
        };

        if flags.contains(AllocFlags::ZERO) {
            for i in 0..n {
                // SAFETY: the run was just allocated and is exclusively
                // ours until returned.
                unsafe {
                    kalloc::page_mut(KVAddr::new(kpage.into_usize() + i * PGSIZE))
                }
                .zero();
            }
        }

        let mut inner = self.inner.lock();
        let _ = inner.frames.insert(
            kpage,
            Frame {
                kpage,
                upage,
                owner: Arc::downgrade(owner),
                tid: owner.tid(),
                size: n,
                active: true,
            },
        );
        inner.active.push_back(kpage);
        inner.nr_active += 1;
        Ok(kpage)
    }

    /// Frees the frame at `kpage`, returning its pages to the allocator.
    pub fn free(&self, kpage: KVAddr) {
        let mut inner = self.inner.lock();
        let frame = match inner.frames.remove(&kpage) {
            Some(frame) => frame,
            None => return,
        };
        let list = if frame.active {
            inner.nr_active -= 1;
            &mut inner.active
        } else {
            inner.nr_inactive -= 1;
            &mut inner.inactive
        };
        if let Some(pos) = list.iter().position(|k| *k == kpage) {
            let _ = list.remove(pos);
        }
        drop(inner);
        // SAFETY: the descriptor is gone; nothing references the pages.
        unsafe { self.kmem.free(kpage, frame.size) };
    }

    /// Looks up the frame at `kpage`.
    pub fn find(&self, kpage: KVAddr) -> Option<FrameInfo> {
        let inner = self.inner.lock();
        inner.frames.get(&kpage).map(|f| FrameInfo {
            upage: f.upage,
            tid: f.tid,
            size: f.size,
            active: f.active,
        })
    }

    /// Returns the pages of an evicted frame to the allocator.
    pub fn reclaim(&self, frame: Frame) {
        // SAFETY: an evicted descriptor is out of the table; its frames
        // are not referenced anymore.
        unsafe { self.kmem.free(frame.kpage, frame.size) };
    }

    /// Picks a victim frame, saves its contents through the owner's
    /// supplemental map, and returns its unlinked descriptor. The frame
    /// lock is held across the whole sweep.
    pub fn evict(&self, fs: &FileSys, swap: &SwapDev) -> Result<Frame, Error> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        // Inactive sweep: second chance, then save.
        for _ in 0..inner.inactive.len() {
            let kpage = inner.inactive.pop_front().expect("inactive head");
            let frame = inner.frames.get_mut(&kpage).expect("inactive frame");
            if frame.size != 1 {
                inner.inactive.push_back(kpage);
                continue;
            }
            if accessed(frame) {
                set_accessed(frame, false);
                frame.active = true;
                inner.nr_inactive -= 1;
                inner.nr_active += 1;
                inner.active.push_back(kpage);
                continue;
            }
            if save(fs, swap, frame) {
                let frame = inner.frames.remove(&kpage).expect("victim");
                inner.nr_inactive -= 1;
                shrink_active_list(inner);
                debug!("frame: evicted inactive {:?}", frame.upage);
                return Ok(frame);
            }
            inner.inactive.push_back(kpage);
        }

        // Active sweep: clear accessed bits, save the first idle frame.
        for _ in 0..inner.active.len() {
            let kpage = inner.active.pop_front().expect("active head");
            let frame = inner.frames.get_mut(&kpage).expect("active frame");
            if frame.size != 1 {
                inner.active.push_back(kpage);
                continue;
            }
            if accessed(frame) {
                set_accessed(frame, false);
                inner.active.push_back(kpage);
                continue;
            }
            if save(fs, swap, frame) {
                let frame = inner.frames.remove(&kpage).expect("victim");
                inner.nr_active -= 1;
                shrink_active_list(inner);
                debug!("frame: evicted active {:?}", frame.upage);
                return Ok(frame);
            }
            inner.active.push_back(kpage);
        }

        // Forced: take the head of the active queue, saved or not.
        for _ in 0..inner.active.len() {
            let kpage = inner.active.pop_front().expect("active head");
            let frame = inner.frames.get_mut(&kpage).expect("active frame");
            if frame.size != 1 {
                inner.active.push_back(kpage);
                continue;
            }
            if !save(fs, swap, frame) {
                warn!("frame: forced eviction of {:?} without save", frame.upage);
                detach(frame);
            }
            let frame = inner.frames.remove(&kpage).expect("victim");
            inner.nr_active -= 1;
            shrink_active_list(inner);
            return Ok(frame);
        }

        Err(Error::NoFrame)
    }

    /// (active, inactive) counter pair.
    pub fn counters(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.nr_active, inner.nr_inactive)
    }

    /// Number of tracked frames.
    pub fn nframes(&self) -> usize {
        self.inner.lock().frames.len()
    }

    /// Number of free pages in the underlying allocator.
    pub fn pages_free(&self) -> usize {
        self.kmem.nfree()
    }

    /// Checks the queue/counter invariants. Test-harness hook.
    pub fn validate(&self) {
        let inner = self.inner.lock();
        assert_eq!(inner.nr_active, inner.active.len());
        assert_eq!(inner.nr_inactive, inner.inactive.len());
        assert_eq!(inner.nr_active + inner.nr_inactive, inner.frames.len());
        for kpage in inner.active.iter() {
            assert!(inner.frames.get(kpage).map_or(false, |f| f.active));
        }
        for kpage in inner.inactive.iter() {
            assert!(inner.frames.get(kpage).map_or(false, |f| !f.active));
        }
    }
}

/// Refills the inactive queue from the active queue down to the floor.
fn shrink_active_list(inner: &mut FrameTableInner) {
    while inner.nr_inactive < NR_INACTIVE_MIN {
        let kpage = match inner.active.pop_front() {
            Some(kpage) => kpage,
            None => return,
        };
        let frame = inner.frames.get_mut(&kpage).expect("active frame");
        set_accessed(frame, false);
        frame.active = false;
        inner.inactive.push_back(kpage);
        inner.nr_active -= 1;
        inner.nr_inactive += 1;
    }
}

/// Hardware accessed bit of the frame's user page; a dead owner counts as
/// idle.
fn accessed(frame: &Frame) -> bool {
    frame
        .owner
        .upgrade()
        .map_or(false, |vm| vm.pagedir().is_accessed(frame.upage))
}

fn set_accessed(frame: &Frame, value: bool) {
    if let Some(vm) = frame.owner.upgrade() {
        vm.pagedir().set_accessed(frame.upage, value);
    }
}

/// Saves the victim's contents through its owner's supplemental map and
/// unmaps it. Returns false if the page cannot be saved (no entry, not
/// loaded, or no room in its backing store).
fn save(fs: &FileSys, swap: &SwapDev, frame: &Frame) -> bool {
    let vm = match frame.owner.upgrade() {
        Some(vm) => vm,
        // The owner is gone; there is nothing to preserve.
        None => return true,
    };

    let mut pages = vm.pages().lock();
    let entry = match pages.find_mut(frame.upage) {
        Some(entry) if entry.loaded => entry,
        _ => return false,
    };

    if entry.swaps_on_evict() {
        // SAFETY: the frame is in the table, so its page is live; eviction
        // is the only kernel-side accessor while the entry is loaded.
        let page = unsafe { kalloc::page_ref(frame.kpage) };
        match swap.store(page) {
            Ok(slot) => entry.location = Location::Swap(slot),
            Err(_) => return false,
        }
    } else if let Origin::MmapFile {
        ref file,
        off,
        read_bytes,
    } = entry.origin
    {
        if vm.pagedir().is_dirty(frame.upage) {
            // SAFETY: as above.
            let page = unsafe { kalloc::page_ref(frame.kpage) };
            let file = file.clone();
            if file
                .write_at(fs, frame.tid, &page[..read_bytes as usize], off)
                .is_err()
            {
                return false;
            }
            vm.pagedir().set_dirty(frame.upage, false);
        }
    }
    // Read-only file pages keep the file itself as their backing store.

    vm.pagedir().clear_page(frame.upage);
    entry.loaded = false;
    true
}

/// Drops the victim's hardware mapping without saving it. Forced path.
fn detach(frame: &Frame) {
    if let Some(vm) = frame.owner.upgrade() {
        vm.pagedir().clear_page(frame.upage);
        if let Some(entry) = vm.pages().lock().find_mut(frame.upage) {
            entry.loaded = false;
        }
    }
}
