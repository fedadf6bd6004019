//! Layout constants shared across the cache, inode, and directory layers.
//!
//! Centralized the way `BSIZE`/`NDIRECT`/`ROOTINO`/`FSMAGIC` are kept
//! together in `fs/mod.rs` rather than scattering literals through the
//! implementation.

/// Bytes per sector on the block device.
pub const SECTOR_SIZE: usize = 512;

/// Number of direct block pointers in an on-disk inode.
pub const DIRECT_COUNT: usize = 12;

/// Sector pointers that fit in one indirect block (512 / 4).
pub const PTRS_PER_INDIRECT: usize = SECTOR_SIZE / 4;

/// First index reachable only through the single-indirect block.
pub const LAYER0: usize = DIRECT_COUNT;

/// First index reachable only through the double-indirect block.
pub const LAYER1: usize = DIRECT_COUNT + PTRS_PER_INDIRECT;

/// One past the last index reachable at all.
pub const LAYER2: usize = LAYER1 + PTRS_PER_INDIRECT * PTRS_PER_INDIRECT;

/// Largest file size representable by the three-tier index, in bytes.
pub const MAX_FILE_BYTES: u64 = (LAYER2 * SECTOR_SIZE) as u64;

/// Longest file name a directory entry can hold (excluding the NUL terminator).
pub const NAME_MAX: usize = 14;

/// Buffer cache capacity, in 512-byte slots.
pub const CACHE_SLOTS: usize = 64;

/// Sector holding the free map's inode.
pub const FREE_MAP_SECTOR: u32 = 0;

/// Sector holding the root directory's inode.
pub const ROOT_SECTOR: u32 = 1;

/// Sentinel stamped into every on-disk inode; a mismatch is Fatal (§7).
pub const INODE_MAGIC: u32 = 0x494E_4F44;

/// A pointer value of 0 means "not yet allocated" (sector 0 is reserved).
pub const NONE_SECTOR: u32 = 0;
