//! Directory layer.
//!
//! A directory is a file whose contents are fixed-width
//! `{ in_use, name[NAME_MAX+1], inode_sector }` entries (§4.4/§6).
//! Lookup and add are linear scans over the directory's own inode, which
//! the caller is expected to already have open. Grounded on
//! `dirlookup`/`dirlink` in `kernel/src/fs/fs.rs`, generalized from their
//! `Dirent` (2-byte inode number, no in-use flag — free slots are
//! recognized by `inum == 0`) to this crate's explicit `in_use` byte plus
//! 32-bit inode sector, and from their flat root-only `..`-less tree to a
//! full hierarchy.
//!
//! `.` and `..` are ordinary entries rather than a dedicated inode field:
//! every directory gets a `.` entry pointing at itself and a `..` entry
//! pointing at its parent when created, so the on-disk inode layout in
//! §6 needs no extra field to satisfy the §9 redesign note asking
//! that `..` be resolvable.

use crate::cache::Cache;
use crate::config::NAME_MAX;
use crate::device::BlockDevice;
use crate::inode::{self, InMemInode, InodeTable};
use crate::freemap::FreeMap;

const NAME_FIELD: usize = NAME_MAX + 1;
pub const ENTRY_SIZE: usize = 1 + NAME_FIELD + 4 + 2;

fn encode(in_use: bool, name: &str, sector: u32) -> [u8; ENTRY_SIZE] {
    assert!(name.len() <= NAME_MAX, "directory name too long: {name}");
    let mut buf = [0u8; ENTRY_SIZE];
    buf[0] = in_use as u8;
    buf[1..1 + name.len()].copy_from_slice(name.as_bytes());
    buf[1 + NAME_FIELD..1 + NAME_FIELD + 4].copy_from_slice(&sector.to_le_bytes());
    buf
}

struct Decoded {
    in_use: bool,
    name: String,
    sector: u32,
}

fn decode(buf: &[u8; ENTRY_SIZE]) -> Decoded {
    let in_use = buf[0] != 0;
    let name_bytes = &buf[1..1 + NAME_FIELD];
    let len = name_bytes.iter().position(|&b| b == 0).unwrap_or(NAME_FIELD);
    let name = String::from_utf8_lossy(&name_bytes[..len]).into_owned();
    let sector = u32::from_le_bytes(
        buf[1 + NAME_FIELD..1 + NAME_FIELD + 4]
            .try_into()
            .unwrap(),
    );
    Decoded { in_use, name, sector }
}

fn read_entry(cache: &Cache<impl BlockDevice>, dir: &InMemInode, offset: u64) -> Option<Decoded> {
    let mut raw = [0u8; ENTRY_SIZE];
    let n = inode::read_at(cache, dir, &mut raw, offset);
    if n < ENTRY_SIZE {
        return None;
    }
    Some(decode(&raw))
}

/// Returns `false` if fewer than `ENTRY_SIZE` bytes actually landed (the
/// directory needed to grow and `write_at` ran out of space), so callers
/// can tell a `NoSpace` failure apart from success instead of assuming it.
fn write_entry(
    cache: &Cache<impl BlockDevice>,
    free_map: &mut FreeMap,
    dir: &mut InMemInode,
    offset: u64,
    in_use: bool,
    name: &str,
    sector: u32,
) -> bool {
    let raw = encode(in_use, name, sector);
    inode::write_at(cache, free_map, dir, &raw, offset) == ENTRY_SIZE
}

/// Seeds a freshly created directory's inode with `.` and `..` entries.
/// Returns `false` if either entry couldn't be written (disk full).
pub fn init_entries(
    cache: &Cache<impl BlockDevice>,
    free_map: &mut FreeMap,
    dir: &mut InMemInode,
    self_sector: u32,
    parent_sector: u32,
) -> bool {
    let a = write_entry(cache, free_map, dir, 0, true, ".", self_sector);
    let b = write_entry(cache, free_map, dir, ENTRY_SIZE as u64, true, "..", parent_sector);
    a && b
}

/// Linear scan for `name` among in-use entries (§4.4 `lookup`).
pub fn lookup(cache: &Cache<impl BlockDevice>, dir: &InMemInode, name: &str) -> Option<u32> {
    let mut offset = 0;
    while offset < dir.disk.length {
        if let Some(entry) = read_entry(cache, dir, offset) {
            if entry.in_use && entry.name == name {
                return Some(entry.sector);
            }
        }
        offset += ENTRY_SIZE as u64;
    }
    None
}

/// Adds `name -> sector`. Fails if `name` already denotes an in-use entry
/// (§4.4 `add`, `AlreadyExists`).
pub fn add(
    cache: &Cache<impl BlockDevice>,
    free_map: &mut FreeMap,
    dir: &mut InMemInode,
    name: &str,
    sector: u32,
) -> bool {
    if name.is_empty() || name.len() > NAME_MAX {
        return false;
    }
    if lookup(cache, dir, name).is_some() {
        return false;
    }

    let mut offset = 0;
    let mut free_slot = None;
    while offset < dir.disk.length {
        if let Some(entry) = read_entry(cache, dir, offset) {
            if !entry.in_use {
                free_slot = Some(offset);
                break;
            }
        }
        offset += ENTRY_SIZE as u64;
    }
    let target = free_slot.unwrap_or(dir.disk.length);
    write_entry(cache, free_map, dir, target, true, name, sector)
}

/// True if `dir` has no in-use entries besides `.`/`..` (§9).
pub fn is_empty(cache: &Cache<impl BlockDevice>, dir: &InMemInode) -> bool {
    let mut offset = 0;
    while offset < dir.disk.length {
        if let Some(entry) = read_entry(cache, dir, offset) {
            if entry.in_use && entry.name != "." && entry.name != ".." {
                return false;
            }
        }
        offset += ENTRY_SIZE as u64;
    }
    true
}

/// Removes `name` from the directory at `dir_sector`. Fails if absent, or
/// if it names a non-empty directory (§4.4 `remove`, §9 "Directory
/// removal"). Marks the target inode `removed`, deferring deallocation to
/// its final close (it may still be open elsewhere).
///
/// Takes the directory's sector rather than an already-borrowed
/// `&mut InMemInode`: `table` is also needed to open/close the *target*
/// inode while checking whether it's an empty directory, and a borrowed
/// `InMemInode` from the same table would alias it.
pub fn remove(
    cache: &Cache<impl BlockDevice>,
    free_map: &mut FreeMap,
    table: &mut InodeTable,
    dir_sector: u32,
    name: &str,
) -> bool {
    if name == "." || name == ".." {
        return false;
    }
    let mut offset = 0;
    let mut target = None;
    let dir_length = table.get(dir_sector).disk.length;
    while offset < dir_length {
        if let Some(entry) = read_entry(cache, table.get(dir_sector), offset) {
            if entry.in_use && entry.name == name {
                target = Some((offset, entry.sector));
                break;
            }
        }
        offset += ENTRY_SIZE as u64;
    }
    let Some((offset, target_sector)) = target else {
        return false;
    };

    let target_inode = table.open(cache, target_sector);
    if target_inode.disk.kind == crate::inode::Kind::Directory && !is_empty(cache, target_inode) {
        table.close(cache, free_map, target_sector);
        return false;
    }

    write_entry(cache, free_map, table.get_mut(dir_sector), offset, false, "", 0);

    table.get_mut(target_sector).removed = true;
    // Balances the `open` above; the original opener (if any) keeps the
    // inode alive until it closes too.
    table.close(cache, free_map, target_sector);
    true
}

/// Advances a readdir cursor, returning the next in-use entry's name.
pub fn readdir(cache: &Cache<impl BlockDevice>, dir: &InMemInode, cursor: &mut u64) -> Option<String> {
    while *cursor < dir.disk.length {
        let offset = *cursor;
        *cursor += ENTRY_SIZE as u64;
        if let Some(entry) = read_entry(cache, dir, offset) {
            if entry.in_use {
                return Some(entry.name);
            }
        }
    }
    None
}
