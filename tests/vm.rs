//! End-to-end paging scenarios: demand loading, eviction to swap, mapped
//! files and teardown, against a RAM disk and a software page table.

use std::sync::Arc;

use itertools::Itertools;
use pv6_core::*;

const T1: Tid = Tid(1);

struct Harness {
    fs: FileSys,
    frames: FrameTable,
    swap: SwapDev,
}

impl Harness {
    fn new(npages: usize) -> Self {
        Self {
            fs: FileSys::format(Arc::new(MemDisk::new(1024)), T1).unwrap(),
            frames: FrameTable::new(Kmem::new(npages)),
            swap: SwapDev::new(Arc::new(MemDisk::new(256))),
        }
    }

    fn ctx(&self) -> VmCtx<'_> {
        VmCtx {
            fs: &self.fs,
            frames: &self.frames,
            swap: &self.swap,
        }
    }

    fn new_vm(&self) -> (Arc<Vm>, Arc<SoftPageDir>) {
        let pagedir = Arc::new(SoftPageDir::new());
        (Vm::new(T1, pagedir.clone()), pagedir)
    }

    /// Creates a file of `len` bytes filled by `fill` and returns its open
    /// inode handle.
    fn file_with(&self, fill: impl Fn(usize) -> u8, len: usize) -> RcInode {
        let sector = self.fs.alloc_sector().unwrap();
        self.fs.create(T1, sector, 0, InodeType::File).unwrap();
        let ip = self.fs.open(T1, sector).unwrap();
        let data: Vec<u8> = (0..len).map(fill).collect();
        assert_eq!(ip.write_at(&self.fs, T1, &data, 0).unwrap(), len);
        ip
    }
}

/// Writes through the "hardware" mapping: pokes bytes into the kernel page
/// and sets the dirty bit, as a user store would.
fn poke(pagedir: &SoftPageDir, upage: UVAddr, offset: usize, bytes: &[u8]) {
    let kpage = pagedir.get_page(upage).expect("page mapped");
    // SAFETY: the page is mapped and the test is the only accessor.
    let page = unsafe { page_mut(kpage) };
    page[offset..offset + bytes.len()].copy_from_slice(bytes);
    pagedir.set_dirty(upage, true);
    pagedir.set_accessed(upage, true);
}

fn peek(pagedir: &SoftPageDir, upage: UVAddr, offset: usize, len: usize) -> Vec<u8> {
    let kpage = pagedir.get_page(upage).expect("page mapped");
    // SAFETY: the page is mapped and the test is the only accessor.
    let page = unsafe { page_ref(kpage) };
    page[offset..offset + len].to_vec()
}

#[test]
fn stack_pages_survive_eviction_round_trip() {
    let h = Harness::new(4);
    let ctx = h.ctx();
    let (vm, pagedir) = h.new_vm();

    let base = 0x1000_0000;
    // Fill the pool with stack pages carrying distinct patterns.
    for i in 0..4usize {
        let upage = UVAddr::new(base + i * PGSIZE);
        vm.grow_stack(&ctx, upage).unwrap();
        poke(&pagedir, upage, 0, &[i as u8 + 1; 32]);
        pagedir.set_accessed(upage, false);
    }
    assert_eq!(h.frames.pages_free(), 0);
    h.frames.validate();

    // A fifth page forces an eviction into swap.
    let fifth = UVAddr::new(base + 4 * PGSIZE);
    vm.grow_stack(&ctx, fifth).unwrap();
    assert!(h.swap.slots_in_use() >= 1);
    h.frames.validate();

    // Exactly the evicted entries are STACK|SWAP with a slot; all others
    // are plain STACK.
    let pages = vm.pages().lock();
    let mut swapped = Vec::new();
    for entry in pages.iter() {
        let position = entry.position();
        if position == (Position::STACK | Position::SWAP) {
            assert!(entry.swap_slot().is_some());
            assert!(!entry.loaded());
            swapped.push(entry.upage());
        } else {
            assert_eq!(position, Position::STACK);
        }
    }
    assert_eq!(swapped.len(), h.swap.slots_in_use());
    assert!(!swapped.is_empty());
    drop(pages);

    // Faulting a swapped page back restores its bytes.
    let victim = swapped[0];
    let index = (victim.into_usize() - base) / PGSIZE;
    vm.load_page(&ctx, victim).unwrap();
    assert_eq!(peek(&pagedir, victim, 0, 32), vec![index as u8 + 1; 32]);
    let pages = vm.pages().lock();
    assert_eq!(pages.find(victim).unwrap().position(), Position::STACK);
    drop(pages);

    vm.teardown(&ctx);
    assert_eq!(h.frames.nframes(), 0);
    assert_eq!(h.swap.slots_in_use(), 0);
    assert_eq!(h.frames.pages_free(), 4);
}

#[test]
fn every_swap_slot_is_owned_by_exactly_one_entry() {
    let h = Harness::new(3);
    let ctx = h.ctx();
    let (vm, pagedir) = h.new_vm();

    let base = 0x2000_0000;
    for i in 0..8usize {
        let upage = UVAddr::new(base + i * PGSIZE);
        vm.grow_stack(&ctx, upage).unwrap();
        poke(&pagedir, upage, 0, &[0xB0 + i as u8; 8]);
        pagedir.set_accessed(upage, false);
    }

    let pages = vm.pages().lock();
    let slots: Vec<SwapSlot> = pages.iter().filter_map(|e| e.swap_slot()).collect();
    let unique: Vec<u32> = slots.iter().map(|s| s.0).sorted().dedup().collect();
    assert_eq!(unique.len(), slots.len());
    assert_eq!(slots.len(), h.swap.slots_in_use());
    drop(pages);

    vm.teardown(&ctx);
    assert_eq!(h.swap.slots_in_use(), 0);
}

#[test]
fn file_pages_load_lazily_with_correct_protection() {
    let h = Harness::new(8);
    let ctx = h.ctx();
    let (vm, pagedir) = h.new_vm();

    let ip = h.file_with(|i| i as u8, 2 * PGSIZE);
    let file = File::new(h.fs.reopen(&ip));

    let ro = UVAddr::new(0x3000_0000);
    let rw = UVAddr::new(0x3000_0000 + PGSIZE);
    vm.add_file(ro, file.clone(), 0, PGSIZE as u32, 0, false).unwrap();
    vm.add_file(rw, file, PGSIZE as u32, 100, PGSIZE as u32 - 100, true)
        .unwrap();

    // Nothing is resident until the fault.
    assert!(pagedir.get_page(ro).is_none());
    vm.handle_fault(&ctx, UVAddr::new(ro.into_usize() + 123)).unwrap();
    vm.handle_fault(&ctx, rw).unwrap();

    assert!(!pagedir.is_writable(ro));
    assert!(pagedir.is_writable(rw));
    assert_eq!(peek(&pagedir, ro, 0, 4), vec![0, 1, 2, 3]);
    // read_bytes of the second page, then the zeroed tail.
    let expect: Vec<u8> = (0..100usize).map(|i| (PGSIZE + i) as u8).collect();
    assert_eq!(peek(&pagedir, rw, 0, 100), expect);
    assert_eq!(peek(&pagedir, rw, 100, 64), vec![0; 64]);

    vm.teardown(&ctx);
    h.fs.close(T1, ip);
}

#[test]
fn mmap_dirty_writeback_round_trip() {
    let h = Harness::new(8);
    let ctx = h.ctx();
    let (vm, pagedir) = h.new_vm();

    // A two-page file; dirty only page 0 through the mapping.
    let ip = h.file_with(|i| (i % 251) as u8, 2 * PGSIZE);
    let addr = UVAddr::new(0x4000_0000);
    let mapid = vm.mmap(&ctx, &ip, addr).unwrap();
    assert_eq!(mapid, 1);

    vm.load_page(&ctx, addr).unwrap();
    vm.load_page(&ctx, UVAddr::new(addr.into_usize() + PGSIZE)).unwrap();
    let pages = vm.pages().lock();
    assert_eq!(
        pages.find(addr).unwrap().position(),
        Position::MMAPFILE
    );
    drop(pages);

    poke(&pagedir, addr, 10, b"DIRTYDATA");
    vm.munmap(&ctx, mapid).unwrap();
    assert_eq!(vm.mmap_count(), 0);
    assert!(pagedir.get_page(addr).is_none());

    // Page 0 carries the dirtied bytes, page 1 the original ones.
    let mut ra = RaState::new();
    let mut out = vec![0u8; 2 * PGSIZE];
    assert_eq!(
        ip.read_at(&h.fs, T1, &mut ra, &mut out, 0).unwrap(),
        2 * PGSIZE
    );
    assert_eq!(&out[10..19], b"DIRTYDATA");
    assert_eq!(out[0], 0);
    for (i, byte) in out[PGSIZE..].iter().enumerate() {
        assert_eq!(*byte, ((PGSIZE + i) % 251) as u8);
    }

    vm.teardown(&ctx);
    h.fs.close(T1, ip);
}

#[test]
fn mmap_of_one_byte_file_maps_one_short_page() {
    let h = Harness::new(4);
    let ctx = h.ctx();
    let (vm, pagedir) = h.new_vm();

    let ip = h.file_with(|_| b'x', 1);
    let addr = UVAddr::new(0x5000_0000);
    let mapid = vm.mmap(&ctx, &ip, addr).unwrap();
    assert_eq!(vm.mmap_count(), 1);

    vm.load_page(&ctx, addr).unwrap();
    assert_eq!(peek(&pagedir, addr, 0, 1), vec![b'x']);
    poke(&pagedir, addr, 0, b"y");
    vm.munmap(&ctx, mapid).unwrap();

    // Exactly the one byte came back; the file did not grow.
    assert_eq!(ip.length(&h.fs, T1).unwrap(), 1);
    let mut ra = RaState::new();
    let mut out = [0u8; 4];
    assert_eq!(ip.read_at(&h.fs, T1, &mut ra, &mut out, 0).unwrap(), 1);
    assert_eq!(out[0], b'y');

    vm.teardown(&ctx);
    h.fs.close(T1, ip);
}

#[test]
fn mmap_rejects_bad_arguments_and_overlap() {
    let h = Harness::new(4);
    let ctx = h.ctx();
    let (vm, _pagedir) = h.new_vm();

    let ip = h.file_with(|_| 7, PGSIZE + 1);
    let empty_sector = h.fs.alloc_sector().unwrap();
    h.fs.create(T1, empty_sector, 0, InodeType::File).unwrap();
    let empty = h.fs.open(T1, empty_sector).unwrap();

    assert_eq!(
        vm.mmap(&ctx, &ip, UVAddr::new(0)),
        Err(Error::InvalidArg)
    );
    assert_eq!(
        vm.mmap(&ctx, &ip, UVAddr::new(0x6000_0001)),
        Err(Error::InvalidArg)
    );
    assert_eq!(
        vm.mmap(&ctx, &empty, UVAddr::new(0x6000_0000)),
        Err(Error::InvalidArg)
    );

    // An overlap with any supplemental entry fails and leaves no trace:
    // the reopen is undone and no entry of the failed call survives.
    let clash = UVAddr::new(0x6000_0000 + PGSIZE);
    vm.grow_stack(&ctx, clash).unwrap();
    let opens_before = ip.open_count();
    let entries_before = vm.pages().lock().len();
    assert_eq!(
        vm.mmap(&ctx, &ip, UVAddr::new(0x6000_0000)),
        Err(Error::Overlap)
    );
    assert_eq!(ip.open_count(), opens_before);
    assert_eq!(vm.pages().lock().len(), entries_before);

    // Ids keep increasing across unmaps.
    let a = vm.mmap(&ctx, &ip, UVAddr::new(0x7000_0000)).unwrap();
    assert_eq!(a, 1);
    vm.munmap(&ctx, a).unwrap();
    let b = vm.mmap(&ctx, &ip, UVAddr::new(0x7000_0000)).unwrap();
    assert_eq!(b, 1);
    let c = vm.mmap(&ctx, &ip, UVAddr::new(0x9000_0000)).unwrap();
    assert_eq!(c, 2);

    vm.teardown(&ctx);
    h.fs.close(T1, empty);
    h.fs.close(T1, ip);
}

#[test]
fn second_chance_prefers_idle_inactive_head() {
    let h = Harness::new(6);
    let ctx = h.ctx();
    let (vm, pagedir) = h.new_vm();

    let base = 0x8000_0000;
    for i in 0..6usize {
        let upage = UVAddr::new(base + i * PGSIZE);
        vm.grow_stack(&ctx, upage).unwrap();
        poke(&pagedir, upage, 0, &[i as u8; 4]);
    }

    // First eviction is forced (everything recently accessed); afterwards
    // the shrink pass populated the inactive queue.
    let first = h.frames.evict(&h.fs, &h.swap).unwrap();
    h.frames.reclaim(first);
    let (_, inactive) = h.frames.counters();
    assert!(inactive > 0);
    h.frames.validate();

    // Touch every page, then clear one inactive frame's accessed bit: the
    // sweep must pick an idle frame, not a touched one.
    for i in 0..6usize {
        pagedir.set_accessed(UVAddr::new(base + i * PGSIZE), true);
    }
    let idle = vm
        .pages()
        .lock()
        .iter()
        .find(|e| e.loaded())
        .map(|e| e.upage())
        .unwrap();
    pagedir.set_accessed(idle, false);

    let victim = h.frames.evict(&h.fs, &h.swap).unwrap();
    assert_eq!(victim.upage(), idle);
    h.frames.reclaim(victim);
    h.frames.validate();

    vm.teardown(&ctx);
}

#[test]
fn frame_counters_match_lists_through_load_and_free() {
    let h = Harness::new(16);
    let ctx = h.ctx();
    let (vm, pagedir) = h.new_vm();

    let ip = h.file_with(|i| i as u8, 4 * PGSIZE);
    let file = File::new(h.fs.reopen(&ip));
    let base = 0xA000_0000;
    for i in 0..4usize {
        let upage = UVAddr::new(base + i * PGSIZE);
        vm.add_file(
            upage,
            file.clone(),
            (i * PGSIZE) as u32,
            PGSIZE as u32,
            0,
            true,
        )
        .unwrap();
        vm.load_page(&ctx, upage).unwrap();
    }
    let (active, inactive) = h.frames.counters();
    assert_eq!(active + inactive, h.frames.nframes());
    assert_eq!(h.frames.nframes(), 4);
    h.frames.validate();

    // A frame lookup agrees with the page table.
    let kpage = pagedir.get_page(UVAddr::new(base)).unwrap();
    let info = h.frames.find(kpage).unwrap();
    assert_eq!(info.upage, UVAddr::new(base));
    assert_eq!(info.tid, T1);

    vm.teardown(&ctx);
    assert_eq!(h.frames.nframes(), 0);
    h.frames.validate();
    h.fs.close(T1, ip);
}
