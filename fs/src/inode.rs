//! Inode layer.
//!
//! On-disk and in-memory inode, the three-level block index (12 direct, 1
//! single-indirect, 1 double-indirect), on-demand growth, and the
//! open-inode registry. Grounded on `INode`/`DINode` in
//! `kernel/src/fs/mod.rs` and `kernel/src/fs/fs.rs` (`bmap`, `itrunc`,
//! `readi`/`writei`, `iget`/`iput`), generalized from that two-tier index
//! to this three-tier one, and on
//! `original_source/src/filesys/inode.c` (`byte_to_sector`,
//! `inode_allocate*`, `inode_deallocate`) for the allocation/deallocation
//! sequencing itself.
//!
//! Differs from both in two ways directed by §9:
//! - on-disk (de)serialization is explicit little-endian encode/decode
//!   rather than an `unsafe { ... }.align_to::<DINode>()` transmutation,
//!   since the byte layout is externally specified (§6) rather than
//!   derived from the host's struct layout;
//! - deallocation walks the index mapping directly (any non-zero pointer
//!   is freed) instead of the original's sector-count arithmetic, which
//!   §9 calls out as off-by-one in the single/double-indirect tiers.

use std::collections::HashMap;

use crate::cache::Cache;
use crate::config::{
    DIRECT_COUNT, INODE_MAGIC, LAYER0, LAYER1, LAYER2, MAX_FILE_BYTES, NONE_SECTOR,
    PTRS_PER_INDIRECT, SECTOR_SIZE,
};
use crate::device::BlockDevice;
use crate::freemap::FreeMap;

/// What an inode names: a file's byte stream or a directory's entry list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    File,
    Directory,
}

impl Kind {
    fn to_u32(self) -> u32 {
        match self {
            Kind::File => 0,
            Kind::Directory => 1,
        }
    }

    fn from_u32(v: u32) -> Self {
        match v {
            0 => Kind::File,
            1 => Kind::Directory,
            other => panic!("inode: invalid kind tag {other}"),
        }
    }
}

/// On-disk inode, exactly one sector wide (§6).
#[derive(Debug, Clone)]
pub struct DiskInode {
    pub direct: [u32; DIRECT_COUNT],
    pub indirect: u32,
    pub double_indirect: u32,
    pub kind: Kind,
    pub length: u64,
}

impl DiskInode {
    fn zeroed(kind: Kind) -> Self {
        Self {
            direct: [NONE_SECTOR; DIRECT_COUNT],
            indirect: NONE_SECTOR,
            double_indirect: NONE_SECTOR,
            kind,
            length: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; SECTOR_SIZE] {
        let mut buf = [0u8; SECTOR_SIZE];
        let mut off = 0;
        for ptr in &self.direct {
            buf[off..off + 4].copy_from_slice(&ptr.to_le_bytes());
            off += 4;
        }
        buf[48..52].copy_from_slice(&self.indirect.to_le_bytes());
        buf[52..56].copy_from_slice(&self.double_indirect.to_le_bytes());
        // offset 56..60 is the reserved `indirect_layer` field (§6).
        buf[60..64].copy_from_slice(&self.kind.to_u32().to_le_bytes());
        buf[64..68].copy_from_slice(&(self.length as u32).to_le_bytes());
        buf[68..72].copy_from_slice(&INODE_MAGIC.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; SECTOR_SIZE]) -> Self {
        let magic = u32::from_le_bytes(buf[68..72].try_into().unwrap());
        if magic != INODE_MAGIC {
            log::error!("inode: bad magic {magic:#x}, expected {INODE_MAGIC:#x}");
            panic!("inode: magic mismatch, corrupt file system");
        }
        let mut direct = [0u32; DIRECT_COUNT];
        for (i, slot) in direct.iter_mut().enumerate() {
            *slot = u32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
        }
        let indirect = u32::from_le_bytes(buf[48..52].try_into().unwrap());
        let double_indirect = u32::from_le_bytes(buf[52..56].try_into().unwrap());
        let kind = Kind::from_u32(u32::from_le_bytes(buf[60..64].try_into().unwrap()));
        let length = u32::from_le_bytes(buf[64..68].try_into().unwrap()) as u64;
        Self {
            direct,
            indirect,
            double_indirect,
            kind,
            length,
        }
    }
}

/// In-memory inode (§3). Lives in the open-inode registry for as long
/// as `open_count > 0`.
pub struct InMemInode {
    pub sector: u32,
    pub open_count: u32,
    pub removed: bool,
    pub deny_write_count: u32,
    pub disk: DiskInode,
}

/// Open-inode registry keyed by sector: at most one in-memory inode per
/// disk sector (invariant I5), with reference counting instead of the
/// teacher's intrusive doubly-linked list (§9, "Cyclic references
/// removed"). File handles hold a sector number and look the inode up
/// here on every access rather than holding a back-pointer.
#[derive(Default)]
pub struct InodeTable {
    open: HashMap<u32, InMemInode>,
}

impl InodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, sector: u32) -> &InMemInode {
        self.open
            .get(&sector)
            .unwrap_or_else(|| panic!("inode: sector {sector} not open"))
    }

    pub fn get_mut(&mut self, sector: u32) -> &mut InMemInode {
        self.open
            .get_mut(&sector)
            .unwrap_or_else(|| panic!("inode: sector {sector} not open"))
    }

    pub fn is_open(&self, sector: u32) -> bool {
        self.open.contains_key(&sector)
    }

    /// Opens `sector`, bumping its `open_count` if already resident or
    /// loading it from disk otherwise (§4.2 `open`).
    pub fn open<D: BlockDevice>(&mut self, cache: &Cache<D>, sector: u32) -> &mut InMemInode {
        if let Some(existing) = self.open.get_mut(&sector) {
            existing.open_count += 1;
            return self.open.get_mut(&sector).unwrap();
        }
        let raw = cache.read(sector);
        let disk = DiskInode::from_bytes(&raw);
        self.open.insert(
            sector,
            InMemInode {
                sector,
                open_count: 1,
                removed: false,
                deny_write_count: 0,
                disk,
            },
        );
        self.open.get_mut(&sector).unwrap()
    }

    /// Closes `sector`. If this was the last reference, removes it from the
    /// table, deallocating its data and index sectors (and its own inode
    /// sector) if it had been marked `removed`.
    pub fn close<D: BlockDevice>(&mut self, cache: &Cache<D>, free_map: &mut FreeMap, sector: u32) {
        let open_count = {
            let inode = self.get_mut(sector);
            inode.open_count -= 1;
            inode.open_count
        };
        if open_count > 0 {
            return;
        }
        let inode = self.open.remove(&sector).expect("inode: close of unopened sector");
        if inode.removed {
            deallocate(cache, free_map, &inode.disk);
            free_map.release(sector, 1);
            log::debug!("inode: released sector {sector} on final close");
        }
    }
}

fn read_indirect(cache: &Cache<impl BlockDevice>, sector: u32) -> [u32; PTRS_PER_INDIRECT] {
    let raw = cache.read(sector);
    let mut out = [0u32; PTRS_PER_INDIRECT];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = u32::from_le_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap());
    }
    out
}

fn write_indirect(cache: &Cache<impl BlockDevice>, sector: u32, block: &[u32; PTRS_PER_INDIRECT]) {
    let mut raw = [0u8; SECTOR_SIZE];
    for (i, ptr) in block.iter().enumerate() {
        raw[i * 4..i * 4 + 4].copy_from_slice(&ptr.to_le_bytes());
    }
    cache.write(sector, &raw);
}

/// Maps a byte offset to its backing sector (§4.2 `byte_to_sector`).
/// Returns `None` if the index has no mapping yet (growth needed) or the
/// offset is out of range.
pub fn byte_to_sector(cache: &Cache<impl BlockDevice>, disk: &DiskInode, pos: u64) -> Option<u32> {
    let i = (pos / SECTOR_SIZE as u64) as usize;
    if i < LAYER0 {
        return none_if_zero(disk.direct[i]);
    }
    if i < LAYER1 {
        if disk.indirect == NONE_SECTOR {
            return None;
        }
        let block = read_indirect(cache, disk.indirect);
        return none_if_zero(block[i - LAYER0]);
    }
    if i < LAYER2 {
        if disk.double_indirect == NONE_SECTOR {
            return None;
        }
        let outer = read_indirect(cache, disk.double_indirect);
        let rem = i - LAYER1;
        let outer_idx = rem / PTRS_PER_INDIRECT;
        let inner_idx = rem % PTRS_PER_INDIRECT;
        let inner_sector = outer[outer_idx];
        if inner_sector == NONE_SECTOR {
            return None;
        }
        let inner = read_indirect(cache, inner_sector);
        return none_if_zero(inner[inner_idx]);
    }
    None
}

fn none_if_zero(sector: u32) -> Option<u32> {
    if sector == NONE_SECTOR {
        None
    } else {
        Some(sector)
    }
}

/// Rolls back every sector reserved so far if a later allocation step
/// fails, so a partial failure leaks nothing (§9, invariant I4).
struct Rollback<'a> {
    free_map: &'a mut FreeMap,
    reserved: Vec<u32>,
}

impl<'a> Rollback<'a> {
    fn new(free_map: &'a mut FreeMap) -> Self {
        Self {
            free_map,
            reserved: Vec::new(),
        }
    }

    fn reserve_one(&mut self) -> Option<u32> {
        let sector = self.free_map.allocate(1)?;
        self.reserved.push(sector);
        Some(sector)
    }

    fn commit(self) {}

    fn unwind(self) {
        for sector in self.reserved {
            self.free_map.release(sector, 1);
        }
    }
}

fn zero_sector(cache: &Cache<impl BlockDevice>, sector: u32) {
    cache.write(sector, &[0u8; SECTOR_SIZE]);
}

/// Materializes every sector (data and index) needed to cover `length`
/// bytes, zero-filling newly reserved ones. Already-allocated pointers are
/// left untouched, which is what makes repeated calls with increasing
/// `length` implement file growth (§4.2 `allocate`).
pub fn allocate(
    cache: &Cache<impl BlockDevice>,
    free_map: &mut FreeMap,
    disk: &mut DiskInode,
    length: u64,
) -> bool {
    if length > MAX_FILE_BYTES {
        return false;
    }
    // Snapshot the whole struct, not just the sectors reserved along the
    // way: `Rollback` only undoes the free-map bits, so any index pointer
    // already written into `disk` before a later tier fails has to be
    // undone here too, or it's left referencing a sector the free map
    // considers free again (§9, invariant I4).
    let before = disk.clone();
    let sectors = length.div_ceil(SECTOR_SIZE as u64) as usize;
    let mut rb = Rollback::new(free_map);

    // Tier 1: direct.
    for i in 0..sectors.min(DIRECT_COUNT) {
        if disk.direct[i] != NONE_SECTOR {
            continue;
        }
        match rb.reserve_one() {
            Some(s) => {
                zero_sector(cache, s);
                disk.direct[i] = s;
            }
            None => {
                rb.unwind();
                *disk = before;
                return false;
            }
        }
    }
    if sectors <= LAYER0 {
        rb.commit();
        return true;
    }

    // Tier 2: single indirect.
    if disk.indirect == NONE_SECTOR {
        match rb.reserve_one() {
            Some(s) => {
                zero_sector(cache, s);
                disk.indirect = s;
            }
            None => {
                rb.unwind();
                *disk = before;
                return false;
            }
        }
    }
    let mut indirect_block = read_indirect(cache, disk.indirect);
    let needed = (sectors - LAYER0).min(PTRS_PER_INDIRECT);
    for slot in indirect_block.iter_mut().take(needed) {
        if *slot != NONE_SECTOR {
            continue;
        }
        match rb.reserve_one() {
            Some(s) => {
                zero_sector(cache, s);
                *slot = s;
            }
            None => {
                rb.unwind();
                *disk = before;
                return false;
            }
        }
    }
    write_indirect(cache, disk.indirect, &indirect_block);
    if sectors <= LAYER1 {
        rb.commit();
        return true;
    }

    // Tier 3: double indirect.
    if disk.double_indirect == NONE_SECTOR {
        match rb.reserve_one() {
            Some(s) => {
                zero_sector(cache, s);
                disk.double_indirect = s;
            }
            None => {
                rb.unwind();
                *disk = before;
                return false;
            }
        }
    }
    let mut outer = read_indirect(cache, disk.double_indirect);
    let mut remaining = sectors - LAYER1;
    let mut outer_idx = 0;
    while remaining > 0 {
        if outer_idx >= PTRS_PER_INDIRECT {
            rb.unwind();
            *disk = before;
            return false;
        }
        if outer[outer_idx] == NONE_SECTOR {
            match rb.reserve_one() {
                Some(s) => {
                    zero_sector(cache, s);
                    outer[outer_idx] = s;
                }
                None => {
                    rb.unwind();
                    *disk = before;
                    return false;
                }
            }
        }
        let mut inner = read_indirect(cache, outer[outer_idx]);
        let take = remaining.min(PTRS_PER_INDIRECT);
        for slot in inner.iter_mut().take(take) {
            if *slot != NONE_SECTOR {
                continue;
            }
            match rb.reserve_one() {
                Some(s) => {
                    zero_sector(cache, s);
                    *slot = s;
                }
                None => {
                    rb.unwind();
                    *disk = before;
                    return false;
                }
            }
        }
        write_indirect(cache, outer[outer_idx], &inner);
        remaining -= take;
        outer_idx += 1;
    }
    write_indirect(cache, disk.double_indirect, &outer);

    rb.commit();
    true
}

/// Releases every data and index sector reachable from `disk`, walking the
/// index mapping directly rather than relying on a sector count derived
/// from `length` (§9).
fn deallocate(cache: &Cache<impl BlockDevice>, free_map: &mut FreeMap, disk: &DiskInode) {
    for &sector in &disk.direct {
        if sector != NONE_SECTOR {
            free_map.release(sector, 1);
        }
    }
    if disk.indirect != NONE_SECTOR {
        let block = read_indirect(cache, disk.indirect);
        for &sector in &block {
            if sector != NONE_SECTOR {
                free_map.release(sector, 1);
            }
        }
        free_map.release(disk.indirect, 1);
    }
    if disk.double_indirect != NONE_SECTOR {
        let outer = read_indirect(cache, disk.double_indirect);
        for &outer_sector in &outer {
            if outer_sector == NONE_SECTOR {
                continue;
            }
            let inner = read_indirect(cache, outer_sector);
            for &sector in &inner {
                if sector != NONE_SECTOR {
                    free_map.release(sector, 1);
                }
            }
            free_map.release(outer_sector, 1);
        }
        free_map.release(disk.double_indirect, 1);
    }
}

/// Writes a fresh on-disk inode at `sector`, with enough sectors allocated
/// and zero-filled to back `length` bytes (§4.2 `create`).
pub fn create(
    cache: &Cache<impl BlockDevice>,
    free_map: &mut FreeMap,
    sector: u32,
    length: u64,
    kind: Kind,
) -> bool {
    let mut disk = DiskInode::zeroed(kind);
    if !allocate(cache, free_map, &mut disk, length) {
        return false;
    }
    disk.length = length;
    cache.write(sector, &disk.to_bytes());
    true
}

/// Persists `inode`'s on-disk header (§3 invariant: re-persisted
/// after every metadata change before the operation returns).
fn persist_header(cache: &Cache<impl BlockDevice>, inode: &InMemInode) {
    cache.write(inode.sector, &inode.disk.to_bytes());
}

/// Reads up to `buf.len()` bytes starting at `offset`, stopping at the
/// inode's length (§4.2 `read_at`).
pub fn read_at(cache: &Cache<impl BlockDevice>, inode: &InMemInode, buf: &mut [u8], offset: u64) -> usize {
    if offset >= inode.disk.length {
        return 0;
    }
    let to_read = (buf.len() as u64).min(inode.disk.length - offset) as usize;
    let mut done = 0;
    while done < to_read {
        let pos = offset + done as u64;
        let sector_ofs = (pos % SECTOR_SIZE as u64) as usize;
        let chunk = (to_read - done).min(SECTOR_SIZE - sector_ofs);
        match byte_to_sector(cache, &inode.disk, pos) {
            Some(sector) => {
                let data = cache.read(sector);
                buf[done..done + chunk].copy_from_slice(&data[sector_ofs..sector_ofs + chunk]);
            }
            None => {
                // Within length but unmapped should not happen under eager
                // allocation (§9); treat as a zero-filled hole rather
                // than panicking, which is the more defensive choice.
                buf[done..done + chunk].fill(0);
            }
        }
        done += chunk;
    }
    done
}

/// Writes `buf` at `offset`, growing the file first if the write extends
/// past the current length (§4.2 `write_at`). Returns 0 immediately
/// if writes are currently denied.
pub fn write_at(
    cache: &Cache<impl BlockDevice>,
    free_map: &mut FreeMap,
    inode: &mut InMemInode,
    buf: &[u8],
    offset: u64,
) -> usize {
    if inode.deny_write_count > 0 {
        return 0;
    }

    let end = offset + buf.len() as u64;
    if end > inode.disk.length {
        let old_length = inode.disk.length;
        inode.disk.length = end;
        persist_header(cache, inode);
        if !allocate(cache, free_map, &mut inode.disk, end) {
            // Growth failed: restore the old length so no in-length sector
            // is left unbacked, and report that nothing was written.
            inode.disk.length = old_length;
            persist_header(cache, inode);
            return 0;
        }
        persist_header(cache, inode);
    }

    let mut done = 0;
    while done < buf.len() {
        let pos = offset + done as u64;
        let sector_ofs = (pos % SECTOR_SIZE as u64) as usize;
        let chunk = (buf.len() - done).min(SECTOR_SIZE - sector_ofs);
        let sector = byte_to_sector(cache, &inode.disk, pos)
            .expect("write_at: sector must be allocated after growth");

        let mut data = if sector_ofs == 0 && chunk == SECTOR_SIZE {
            [0u8; SECTOR_SIZE]
        } else {
            cache.read(sector)
        };
        data[sector_ofs..sector_ofs + chunk].copy_from_slice(&buf[done..done + chunk]);
        cache.write(sector, &data);

        done += chunk;
    }
    done
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn fixture(sectors: u32) -> (Cache<MemDevice>, FreeMap) {
        let cache = Cache::new(MemDevice::new(sectors));
        let mut map = FreeMap::empty(sectors);
        map.mark_used(0);
        (cache, map)
    }

    #[test]
    fn create_then_read_back_header() {
        let (cache, mut map) = fixture(64);
        assert!(create(&cache, &mut map, 10, 100, Kind::File));
        let raw = cache.read(10);
        let disk = DiskInode::from_bytes(&raw);
        assert_eq!(disk.length, 100);
        assert_eq!(disk.kind, Kind::File);
        assert_ne!(disk.direct[0], NONE_SECTOR);
    }

    #[test]
    fn write_then_read_round_trips_within_direct_tier() {
        let (cache, mut map) = fixture(64);
        let mut table = InodeTable::new();
        assert!(create(&cache, &mut map, 10, 0, Kind::File));
        let inode = table.open(&cache, 10);
        let n = write_at(&cache, &mut map, inode, b"hello", 0);
        assert_eq!(n, 5);
        let mut buf = [0u8; 5];
        let inode = table.get(10);
        assert_eq!(read_at(&cache, inode, &mut buf, 0), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn growth_zero_fills_the_gap() {
        let (cache, mut map) = fixture(512);
        let mut table = InodeTable::new();
        assert!(create(&cache, &mut map, 10, 0, Kind::File));
        let inode = table.open(&cache, 10);
        write_at(&cache, &mut map, inode, b"0123456789", 80_000);

        let inode = table.get(10);
        assert_eq!(inode.disk.length, 80_010);
        let mut head = vec![0u8; 80_000];
        assert_eq!(read_at(&cache, inode, &mut head, 0), 80_000);
        assert!(head.iter().all(|&b| b == 0));

        let mut tail = [0u8; 10];
        assert_eq!(read_at(&cache, inode, &mut tail, 80_000), 10);
        assert_eq!(&tail, b"0123456789");
    }

    #[test]
    fn write_crossing_into_indirect_tier_round_trips() {
        let (cache, mut map) = fixture(400);
        let mut table = InodeTable::new();
        assert!(create(&cache, &mut map, 10, 0, Kind::File));
        let inode = table.open(&cache, 10);
        let offset = (LAYER0 as u64) * SECTOR_SIZE as u64;
        let payload = vec![0x42u8; 1024];
        write_at(&cache, &mut map, inode, &payload, offset);

        let inode = table.get(10);
        let mut out = vec![0u8; 1024];
        read_at(&cache, inode, &mut out, offset);
        assert_eq!(out, payload);
    }

    #[test]
    fn deny_write_blocks_writes() {
        let (cache, mut map) = fixture(64);
        let mut table = InodeTable::new();
        assert!(create(&cache, &mut map, 10, 0, Kind::File));
        let inode = table.open(&cache, 10);
        inode.deny_write_count += 1;
        assert_eq!(write_at(&cache, &mut map, inode, b"x", 0), 0);
    }

    #[test]
    fn allocation_rolls_back_on_out_of_space() {
        // Only 2 free data sectors available beyond the reserved sector 0.
        let cache = Cache::new(MemDevice::new(3));
        let mut map = FreeMap::empty(3);
        map.mark_used(0);
        let mut disk = DiskInode::zeroed(Kind::File);
        // Needs 3 sectors but only 2 are free: must fail and release both.
        assert!(!allocate(&cache, &mut map, &mut disk, 3 * SECTOR_SIZE as u64));
        assert!(!map.is_allocated(1));
        assert!(!map.is_allocated(2));
    }

    #[test]
    fn close_of_removed_inode_releases_its_sectors() {
        let (cache, mut map) = fixture(64);
        let mut table = InodeTable::new();
        assert!(create(&cache, &mut map, 10, 600, Kind::File));
        let inode = table.open(&cache, 10);
        let data_sector = inode.disk.direct[0];
        inode.removed = true;
        table.close(&cache, &mut map, 10);
        assert!(!table.is_open(10));
        assert!(!map.is_allocated(10));
        assert!(!map.is_allocated(data_sector));
    }
}
