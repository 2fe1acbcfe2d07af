//! Swap-slot allocator.
//!
//! The swap device is carved into page-sized slots of
//! `SECTORS_PER_PAGE` sectors each, tracked by a fixed slot map. The map
//! scan-and-flip runs under the swap lock; the sector I/O does not, since
//! the flipped bit already reserves the slot against concurrent writers.
//! Slots are single-use: loading a page back clears its bit, so a page
//! that is evicted again gets a fresh slot.

use core::convert::TryInto;

use alloc::sync::Arc;

use bitmaps::Bitmap;
use log::trace;

use crate::error::Error;
use crate::hal::BlockDevice;
use crate::lock::SpinLock;
use crate::page::Page;
use crate::param::{NSWAP, SECTORS_PER_PAGE, SECTOR_SIZE};

/// Index of one page-sized slot on the swap device.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SwapSlot(pub u32);

pub struct SwapDev {
    dev: Arc<dyn BlockDevice>,
    map: SpinLock<Bitmap<NSWAP>>,
}

impl SwapDev {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        let nslots = (dev.sector_count() as usize / SECTORS_PER_PAGE).min(NSWAP);
        let mut map = Bitmap::new();
        // Slots past the device capacity are permanently "in use".
        for slot in nslots..NSWAP {
            let _ = map.set(slot, true);
        }
        Self {
            dev,
            map: SpinLock::new("swap", map),
        }
    }

    /// Reserves a slot and writes `page` into it.
    pub fn store(&self, page: &Page) -> Result<SwapSlot, Error> {
        let slot = {
            let mut map = self.map.lock();
            let slot = map.first_false_index().ok_or(Error::SwapFull)?;
            let _ = map.set(slot, true);
            slot as u32
        };
        for i in 0..SECTORS_PER_PAGE {
            let chunk: &[u8; SECTOR_SIZE] = page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]
                .try_into()
                .expect("sector chunk");
            self.dev
                .write_sector(slot * SECTORS_PER_PAGE as u32 + i as u32, chunk);
        }
        trace!("swap: stored slot {}", slot);
        Ok(SwapSlot(slot))
    }

    /// Reads `slot` back into `page` and releases the slot.
    pub fn load(&self, page: &mut Page, slot: SwapSlot) {
        for i in 0..SECTORS_PER_PAGE {
            let chunk: &mut [u8; SECTOR_SIZE] = (&mut page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE])
                .try_into()
                .expect("sector chunk");
            self.dev
                .read_sector(slot.0 * SECTORS_PER_PAGE as u32 + i as u32, chunk);
        }
        self.free(slot);
        trace!("swap: loaded slot {}", slot.0);
    }

    /// Releases `slot` without reading it.
    pub fn free(&self, slot: SwapSlot) {
        let _ = self.map.lock().set(slot.0 as usize, false);
    }

    /// Number of slots currently holding pages. Introspection for tests.
    pub fn slots_in_use(&self) -> usize {
        let map = self.map.lock();
        let nslots = (self.dev.sector_count() as usize / SECTORS_PER_PAGE).min(NSWAP);
        (0..nslots).filter(|slot| map.get(*slot)).count()
    }
}
