//! pv6: the storage and virtual-memory core of a teaching kernel.
//!
//! Three subsystems provide demand-paged file I/O over a block device:
//!
//! * a sector cache with write-behind and readahead ([`bio`]),
//! * a multi-level indexed inode engine ([`fs`]),
//! * a paging layer: supplemental page maps, a two-list frame table and a
//!   swap-slot allocator ([`vm`]).
//!
//! The block device and the hardware page table are collaborator traits
//! ([`hal`]); everything above them is portable and runs under the host
//! test harness.

#![cfg_attr(not(test), no_std)]
//
// # Tries to deny lints that matter for kernel code (`rustc -W help`).
#![deny(anonymous_parameters)]
#![deny(bare_trait_objects)]
#![deny(elided_lifetimes_in_paths)]
#![deny(keyword_idents)]
#![deny(macro_use_extern_crate)]
#![deny(trivial_numeric_casts)]
#![deny(unsafe_op_in_unsafe_fn)]
#![deny(unused_import_braces)]

extern crate alloc;

mod addr;
mod bio;
mod error;
mod fs;
mod hal;
mod kalloc;
mod lock;
mod page;
mod param;
mod vm;

pub use addr::{pg_round_down, pg_round_up, KVAddr, UVAddr};
pub use bio::{Bcache, Buf};
pub use error::Error;
pub use fs::{File, FileSys, Inode, InodeType, RaState, RcFile, RcInode, SectorNo};
pub use hal::{BlockDevice, MemDisk, PageDir, SoftPageDir, Tid};
pub use kalloc::{page_mut, page_ref, Kmem};
pub use page::Page;
pub use param::*;
pub use vm::{
    frame::{AllocFlags, Frame, FrameInfo, FrameTable},
    mmap::MapId,
    page::{PageEntry, PageMap, Position},
    swap::{SwapDev, SwapSlot},
    Vm, VmCtx,
};
