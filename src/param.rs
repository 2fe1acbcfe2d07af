/// Size of a device sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Size of a page in bytes.
pub const PGSIZE: usize = 4096;

/// Sectors per page; swap slots are this many sectors.
pub const SECTORS_PER_PAGE: usize = PGSIZE / SECTOR_SIZE;

/// Size of the disk sector cache.
pub const NBUF: usize = 64;

/// Ticks between write-behind flushes of the sector cache.
pub const WRITE_BEHIND_TICKS: u32 = 30;

/// Direct sector slots in an on-disk inode.
pub const NDIRECT: usize = 12;

/// Sector slots in an index sector.
pub const NINDIRECT: usize = SECTOR_SIZE / core::mem::size_of::<u32>();

/// Largest file in sectors: direct + single-indirect + double-indirect.
pub const MAXFILE: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT;

/// Sector of the free-map file.
pub const FREE_MAP_SECTOR: u32 = 0;

/// Sector of the root directory inode.
pub const ROOT_DIR_SECTOR: u32 = 1;

/// Default ceiling of a readahead window, in sectors.
pub const RA_MAX: usize = 32;

/// Maximum number of swap slots tracked by the slot map.
pub const NSWAP: usize = 1024;

/// Floor of the inactive frame list; eviction refills down to it.
pub const NR_INACTIVE_MIN: usize = 10;
