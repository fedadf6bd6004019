//! File handle.
//!
//! A thin wrapper over an open inode plus a byte position (§4.6),
//! grounded on `File`/`file_read`/`file_write` in
//! `kernel/src/file/file.rs`, generalized from that fixed `readi`/`writei`
//! pair to route through the three-tier inode index, and to carry its own
//! `readdir` cursor rather than delegating to a single per-inode offset.
//!
//! Holds only a sector number, not a reference to the open inode itself
//! (§9 "Cyclic references removed"): every operation looks the inode
//! up in the [`crate::inode::InodeTable`] the caller passes in.

use crate::cache::Cache;
use crate::device::BlockDevice;
use crate::dir;
use crate::freemap::FreeMap;
use crate::inode::{self, InodeTable};

/// An open file or directory (§3 "File handle").
pub struct FileHandle {
    pub sector: u32,
    pub position: u64,
    pub is_directory: bool,
    dir_cursor: u64,
}

impl FileHandle {
    pub(crate) fn new(sector: u32, is_directory: bool) -> Self {
        Self {
            sector,
            position: 0,
            is_directory,
            dir_cursor: 0,
        }
    }
}

/// Reads at the handle's current position and advances it (§4.6).
pub fn read<D: BlockDevice>(cache: &Cache<D>, table: &InodeTable, handle: &mut FileHandle, buf: &mut [u8]) -> usize {
    let inode = table.get(handle.sector);
    let n = inode::read_at(cache, inode, buf, handle.position);
    handle.position += n as u64;
    n
}

/// Writes at the handle's current position and advances it by the number
/// of bytes actually written (§4.6). Returns 0 without advancing if
/// writes are denied on this inode.
pub fn write<D: BlockDevice>(
    cache: &Cache<D>,
    free_map: &mut FreeMap,
    table: &mut InodeTable,
    handle: &mut FileHandle,
    buf: &[u8],
) -> usize {
    let inode = table.get_mut(handle.sector);
    let n = inode::write_at(cache, free_map, inode, buf, handle.position);
    handle.position += n as u64;
    n
}

/// Moves the position cursor with no bound check (§4.6 "no bound
/// check"): reads past length return 0, writes past length grow the file.
pub fn seek(handle: &mut FileHandle, position: u64) {
    handle.position = position;
}

pub fn tell(handle: &FileHandle) -> u64 {
    handle.position
}

pub fn length(table: &InodeTable, handle: &FileHandle) -> u64 {
    table.get(handle.sector).disk.length
}

/// Forbids writes to the underlying inode process-wide (§4.6, used to
/// keep a running executable immutable).
pub fn deny_write(table: &mut InodeTable, handle: &FileHandle) {
    table.get_mut(handle.sector).deny_write_count += 1;
}

pub fn allow_write(table: &mut InodeTable, handle: &FileHandle) {
    let inode = table.get_mut(handle.sector);
    assert!(inode.deny_write_count > 0, "file: allow_write without matching deny_write");
    inode.deny_write_count -= 1;
}

/// Advances this handle's directory cursor (§4.4 `readdir`). Only
/// meaningful when `is_directory`.
pub fn readdir<D: BlockDevice>(cache: &Cache<D>, table: &InodeTable, handle: &mut FileHandle) -> Option<String> {
    debug_assert!(handle.is_directory, "file: readdir on a non-directory handle");
    let inode = table.get(handle.sector);
    dir::readdir(cache, inode, &mut handle.dir_cursor)
}

/// Closes the handle's underlying inode (§4.6 `close`).
pub fn close<D: BlockDevice>(cache: &Cache<D>, free_map: &mut FreeMap, table: &mut InodeTable, handle: FileHandle) {
    table.close(cache, free_map, handle.sector);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::inode::Kind;

    fn fixture(sectors: u32) -> (Cache<MemDevice>, FreeMap, InodeTable) {
        let cache = Cache::new(MemDevice::new(sectors));
        let mut map = FreeMap::empty(sectors);
        map.mark_used(0);
        (cache, map, InodeTable::new())
    }

    #[test]
    fn write_then_read_advances_position() {
        let (cache, mut map, mut table) = fixture(64);
        assert!(inode::create(&cache, &mut map, 10, 0, Kind::File));
        table.open(&cache, 10);
        let mut handle = FileHandle::new(10, false);

        assert_eq!(write(&cache, &mut map, &mut table, &mut handle, b"hello"), 5);
        assert_eq!(tell(&handle), 5);

        seek(&mut handle, 0);
        let mut buf = [0u8; 5];
        assert_eq!(read(&cache, &table, &mut handle, &mut buf), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(tell(&handle), 5);
        assert_eq!(length(&table, &handle), 5);
    }

    #[test]
    fn deny_write_then_allow_write() {
        let (cache, mut map, mut table) = fixture(64);
        assert!(inode::create(&cache, &mut map, 10, 0, Kind::File));
        table.open(&cache, 10);
        let mut handle = FileHandle::new(10, false);

        deny_write(&mut table, &handle);
        assert_eq!(write(&cache, &mut map, &mut table, &mut handle, b"x"), 0);

        allow_write(&mut table, &handle);
        assert_eq!(write(&cache, &mut map, &mut table, &mut handle, b"x"), 1);
    }

    #[test]
    fn readdir_yields_each_entry_once() {
        let (cache, mut map, mut table) = fixture(64);
        assert!(inode::create(&cache, &mut map, 10, 0, Kind::Directory));
        let dir_inode = table.open(&cache, 10);
        assert!(dir::init_entries(&cache, &mut map, dir_inode, 10, 10));
        assert!(dir::add(&cache, &mut map, dir_inode, "x", 20));

        let mut handle = FileHandle::new(10, true);
        let mut names = Vec::new();
        while let Some(name) = readdir(&cache, &table, &mut handle) {
            names.push(name);
        }
        assert_eq!(names, vec![".", "..", "x"]);
    }
}
