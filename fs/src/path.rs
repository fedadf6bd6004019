//! Path resolver.
//!
//! Splits a `/`-separated path into a sequence of directory traversals,
//! anchored on `ROOT_SECTOR` for absolute paths or the caller-supplied
//! working-directory sector for relative ones (§4.5). Grounded on the
//! teacher's `namex`/`nameiparent` (`kernel/src/fs/fs.rs`), generalized to
//! return an open, reference-counted inode rather than a raw pointer.
//!
//! `.` and `..` need no special casing here: [`crate::dir::init_entries`]
//! seeds every directory with both as ordinary entries, so an intermediate
//! `..` component is resolved by the same [`crate::dir::lookup`] call as
//! any other name. This is what makes `..` resolvable at all, unlike the
//! teacher's flat single-directory tree, which never has to cross a parent
//! boundary.

use crate::cache::Cache;
use crate::config::NAME_MAX;
use crate::device::BlockDevice;
use crate::dir;
use crate::freemap::FreeMap;
use crate::inode::{InodeTable, Kind};

/// The parent directory (left open, caller must close) and final path
/// component of a resolved path.
pub struct ResolvedParent {
    pub parent_sector: u32,
    pub name: String,
}

fn split(path: &str) -> (bool, Vec<String>) {
    let absolute = path.starts_with('/');
    let parts = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    (absolute, parts)
}

/// Walks `parts` one directory at a time starting from `start`, opening
/// each next directory before closing the previous one. Returns the final
/// sector, left open for the caller to close. `None` if any intermediate
/// component is absent or not a directory.
fn walk<D: BlockDevice>(
    cache: &Cache<D>,
    free_map: &mut FreeMap,
    table: &mut InodeTable,
    start: u32,
    parts: &[String],
) -> Option<u32> {
    let mut current = start;
    table.open(cache, current);
    for part in parts {
        let inode = table.get(current);
        if inode.disk.kind != Kind::Directory {
            table.close(cache, free_map, current);
            return None;
        }
        let next = dir::lookup(cache, inode, part);
        table.close(cache, free_map, current);
        current = next?;
        table.open(cache, current);
    }
    Some(current)
}

/// Resolves `path` to the sector of the directory it would live in, plus
/// its final component, for `create`/`remove` (§4.5). The returned
/// `parent_sector` is left open in `table`; the caller must close it.
pub fn resolve_parent<D: BlockDevice>(
    cache: &Cache<D>,
    free_map: &mut FreeMap,
    table: &mut InodeTable,
    root_sector: u32,
    cwd_sector: u32,
    path: &str,
) -> Option<ResolvedParent> {
    let (absolute, mut parts) = split(path);
    let name = parts.pop()?;
    if name.is_empty() || name.len() > NAME_MAX {
        return None;
    }
    let start = if absolute { root_sector } else { cwd_sector };
    let parent_sector = walk(cache, free_map, table, start, &parts)?;
    Some(ResolvedParent { parent_sector, name })
}

/// Resolves `path` all the way to its target inode's sector, for `open`
/// and `chdir`. The returned sector is left open in `table`; the caller
/// must close it. An empty path or a bare `/` resolves to the anchor
/// itself (root or cwd).
pub fn resolve<D: BlockDevice>(
    cache: &Cache<D>,
    free_map: &mut FreeMap,
    table: &mut InodeTable,
    root_sector: u32,
    cwd_sector: u32,
    path: &str,
) -> Option<u32> {
    let (absolute, parts) = split(path);
    let start = if absolute { root_sector } else { cwd_sector };
    walk(cache, free_map, table, start, &parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::inode;

    fn root_fixture(sectors: u32) -> (Cache<MemDevice>, FreeMap, InodeTable) {
        let cache = Cache::new(MemDevice::new(sectors));
        let mut map = FreeMap::empty(sectors);
        map.mark_used(0);
        map.mark_used(1);
        assert!(inode::create(&cache, &mut map, 1, 0, Kind::Directory));
        let mut table = InodeTable::new();
        let root = table.open(&cache, 1);
        assert!(dir::init_entries(&cache, &mut map, root, 1, 1));
        table.close(&cache, &mut map, 1);
        (cache, map, table)
    }

    #[test]
    fn resolves_top_level_parent() {
        let (cache, mut map, mut table) = root_fixture(64);
        let resolved = resolve_parent(&cache, &mut map, &mut table, 1, 1, "/a.txt").unwrap();
        assert_eq!(resolved.parent_sector, 1);
        assert_eq!(resolved.name, "a.txt");
        table.close(&cache, &mut map, resolved.parent_sector);
    }

    #[test]
    fn resolves_nested_parent_after_mkdir() {
        let (cache, mut map, mut table) = root_fixture(64);
        assert!(inode::create(&cache, &mut map, 10, 0, Kind::Directory));
        let sub = table.open(&cache, 10);
        assert!(dir::init_entries(&cache, &mut map, sub, 10, 1));
        table.close(&cache, &mut map, 10);
        let root = table.open(&cache, 1);
        assert!(dir::add(&cache, &mut map, root, "sub", 10));
        table.close(&cache, &mut map, 1);

        let resolved = resolve_parent(&cache, &mut map, &mut table, 1, 1, "/sub/f.txt").unwrap();
        assert_eq!(resolved.parent_sector, 10);
        assert_eq!(resolved.name, "f.txt");
        table.close(&cache, &mut map, resolved.parent_sector);
    }

    #[test]
    fn dotdot_resolves_to_parent() {
        let (cache, mut map, mut table) = root_fixture(64);
        assert!(inode::create(&cache, &mut map, 10, 0, Kind::Directory));
        let sub = table.open(&cache, 10);
        assert!(dir::init_entries(&cache, &mut map, sub, 10, 1));
        table.close(&cache, &mut map, 10);
        let root = table.open(&cache, 1);
        assert!(dir::add(&cache, &mut map, root, "sub", 10));
        table.close(&cache, &mut map, 1);

        let sector = resolve(&cache, &mut map, &mut table, 1, 1, "/sub/..").unwrap();
        assert_eq!(sector, 1);
        table.close(&cache, &mut map, sector);
    }

    #[test]
    fn missing_intermediate_component_fails() {
        let (cache, mut map, mut table) = root_fixture(64);
        assert!(resolve_parent(&cache, &mut map, &mut table, 1, 1, "/missing/f.txt").is_none());
    }

    #[test]
    fn bare_root_has_no_parent() {
        let (cache, mut map, mut table) = root_fixture(64);
        assert!(resolve_parent(&cache, &mut map, &mut table, 1, 1, "/").is_none());
    }
}
