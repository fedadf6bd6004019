//! Indexed-allocation file system core: buffer cache, three-level inode
//! index, free-sector map, directory tree, path resolver, and file
//! handles, layered over a synchronous, fixed-sector block device.
//!
//! Wires the lower layers into the top-level API a system-call dispatcher
//! would call (§6): [`FileSystem::filesys_create`],
//! [`FileSystem::filesys_open`], [`FileSystem::filesys_remove`],
//! [`FileSystem::filesys_chdir`], and the `file_*` operations on
//! [`FileHandle`]. Grounded on the top-level `sys_open`/`sys_unlink`/
//! `create` functions in `kernel/src/fs/fs.rs` for the overall shape of
//! path resolution plus create-or-open, generalized to an explicit
//! `fs_lock`/`cache_lock` two-lock model (§5) instead of a single global
//! `ICACHE` spinlock plus per-inode sleeplock.

pub mod cache;
pub mod config;
pub mod device;
pub mod dir;
pub mod file;
pub mod freemap;
pub mod inode;
pub mod path;

pub use device::{BlockDevice, FileDevice, MemDevice};
pub use file::FileHandle;
pub use inode::Kind;

use std::sync::{Arc, Mutex};

use cache::Cache;
use config::{FREE_MAP_SECTOR, ROOT_SECTOR};
use freemap::FreeMap;
use inode::InodeTable;

/// Everything guarded by the coarse file-system lock (`fs_lock`, §5):
/// the cache (itself separately locked, `cache_lock`), the in-memory free
/// map, the open-inode table, and the anchors path resolution starts from.
struct Inner<D: BlockDevice> {
    cache: Cache<D>,
    free_map: FreeMap,
    table: InodeTable,
    root_sector: u32,
    cwd_sector: u32,
}

/// A mounted file system. Cloning shares the same underlying state (the
/// lock is inside an `Arc`), the way multiple threads share one mounted
/// `fs_lock`.
#[derive(Clone)]
pub struct FileSystem<D: BlockDevice> {
    inner: Arc<Mutex<Inner<D>>>,
}

impl<D: BlockDevice> FileSystem<D> {
    /// `filesys_init(format)`: mounts `device`, formatting it first if
    /// `format` is set. Thin dispatch to [`FileSystem::format`] /
    /// [`FileSystem::mount`], kept separate since callers that already
    /// know which one they want (the `mkfs` binary always formats, tests
    /// usually do too) can call those directly.
    pub fn filesys_init(device: D, format: bool) -> Self {
        if format {
            Self::format(device)
        } else {
            Self::mount(device)
        }
    }

    /// Builds a fresh file system on `device`, bootstrapping the free map
    /// and root directory.
    ///
    /// Sectors [`FREE_MAP_SECTOR`] and [`ROOT_SECTOR`] are marked used
    /// directly, before either inode exists, to break the chicken-and-egg
    /// dependency between the free map (which needs an inode to persist
    /// through) and inode allocation (which needs the free map). The
    /// bitmap's on-disk byte length depends only on the device's total
    /// sector count, not on which bits are set, so its inode can be
    /// `create`d with the right `initial_size` up front; every sector the
    /// bootstrap itself consumes is then reflected in the single
    /// `to_bytes()` snapshot taken right before that inode's content is
    /// written, and not before.
    pub fn format(device: D) -> Self {
        let cache = Cache::new(device);
        let total = cache.sector_count();
        let mut free_map = FreeMap::empty(total);
        free_map.mark_used(FREE_MAP_SECTOR);
        free_map.mark_used(ROOT_SECTOR);

        let mut table = InodeTable::new();

        assert!(
            inode::create(&cache, &mut free_map, ROOT_SECTOR, 0, Kind::Directory),
            "filesys: format: root directory allocation failed on a freshly marked sector"
        );
        {
            let root = table.open(&cache, ROOT_SECTOR);
            assert!(
                dir::init_entries(&cache, &mut free_map, root, ROOT_SECTOR, ROOT_SECTOR),
                "filesys: format: out of space seeding the root directory's `.`/`..` entries"
            );
        }
        // Opened twice: once as the permanent root anchor (closed only in
        // `filesys_done`), once as the initial `cwd_sector` reference
        // (closed/replaced by `filesys_chdir` as the cwd moves). Without
        // this second reference, the first `chdir` away from root would
        // drop its open_count to zero and evict it from the table.
        table.open(&cache, ROOT_SECTOR);

        let bitmap_len = free_map.to_bytes().len() as u64;
        assert!(
            inode::create(&cache, &mut free_map, FREE_MAP_SECTOR, bitmap_len, Kind::File),
            "filesys: format: free map ran out of space for its own bitmap"
        );
        let bytes = free_map.to_bytes();
        {
            let fm_inode = table.open(&cache, FREE_MAP_SECTOR);
            inode::write_at(&cache, &mut free_map, fm_inode, &bytes, 0);
            table.close(&cache, &mut free_map, FREE_MAP_SECTOR);
        }

        log::info!("filesys: formatted {total} sectors");
        Self {
            inner: Arc::new(Mutex::new(Inner {
                cache,
                free_map,
                table,
                root_sector: ROOT_SECTOR,
                cwd_sector: ROOT_SECTOR,
            })),
        }
    }

    /// `filesys_init(format: false)`: mounts an existing file system,
    /// reloading the free map from its backing file.
    pub fn mount(device: D) -> Self {
        let cache = Cache::new(device);
        let total = cache.sector_count();
        let mut table = InodeTable::new();
        // Opened twice: the permanent root anchor plus the initial
        // `cwd_sector` reference (see the matching comment in `format`).
        table.open(&cache, ROOT_SECTOR);
        table.open(&cache, ROOT_SECTOR);

        let fm_inode = table.open(&cache, FREE_MAP_SECTOR);
        let bitmap_len = fm_inode.disk.length as usize;
        let mut buf = vec![0u8; bitmap_len];
        inode::read_at(&cache, fm_inode, &mut buf, 0);
        let mut free_map = FreeMap::from_bytes(&buf, total);
        table.close(&cache, &mut free_map, FREE_MAP_SECTOR);

        log::info!("filesys: mounted {total} sectors");
        Self {
            inner: Arc::new(Mutex::new(Inner {
                cache,
                free_map,
                table,
                root_sector: ROOT_SECTOR,
                cwd_sector: ROOT_SECTOR,
            })),
        }
    }

    /// `filesys_done()`: persists the free map, closes the root directory
    /// and flushes the cache. After this call the `FileSystem` must not be
    /// used again.
    pub fn filesys_done(&self) {
        let mut inner = self.inner.lock().unwrap();
        let root_sector = inner.root_sector;
        let cwd_sector = inner.cwd_sector;

        inner.table.open(&inner.cache, FREE_MAP_SECTOR);
        let bytes = inner.free_map.to_bytes();
        {
            let cache = &inner.cache;
            let free_map = &mut inner.free_map;
            let fm_inode = inner.table.get_mut(FREE_MAP_SECTOR);
            inode::write_at(cache, free_map, fm_inode, &bytes, 0);
        }
        inner.table.close(&inner.cache, &mut inner.free_map, FREE_MAP_SECTOR);
        // Balances the cwd reference opened at mount/format time or left
        // behind by the last `filesys_chdir`, then the permanent root
        // anchor opened alongside it — two separate references, which
        // happen to name the same sector whenever the cwd is still root.
        inner.table.close(&inner.cache, &mut inner.free_map, cwd_sector);
        inner.table.close(&inner.cache, &mut inner.free_map, root_sector);
        inner.cache.shutdown();
        log::info!("filesys: shutdown complete");
    }

    /// `filesys_create(path, initial_size, kind) -> bool`. Creating a
    /// directory also seeds its `.`/`..` entries (this is `mkdir`, §5).
    pub fn filesys_create(&self, path: &str, initial_size: u64, kind: Kind) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Inner {
            cache,
            free_map,
            table,
            root_sector,
            cwd_sector,
        } = &mut *inner;

        let Some(resolved) =
            path::resolve_parent(cache, free_map, table, *root_sector, *cwd_sector, path)
        else {
            return false;
        };

        let parent = table.get(resolved.parent_sector);
        if parent.disk.kind != Kind::Directory || dir::lookup(cache, parent, &resolved.name).is_some() {
            table.close(cache, free_map, resolved.parent_sector);
            return false;
        }

        let Some(sector) = free_map.allocate(1) else {
            log::warn!("filesys_create: out of space creating {path}");
            table.close(cache, free_map, resolved.parent_sector);
            return false;
        };
        if !inode::create(cache, free_map, sector, initial_size, kind) {
            free_map.release(sector, 1);
            table.close(cache, free_map, resolved.parent_sector);
            return false;
        }
        if kind == Kind::Directory {
            let new_dir = table.open(cache, sector);
            if !dir::init_entries(cache, free_map, new_dir, sector, resolved.parent_sector) {
                log::warn!("filesys_create: out of space seeding {path}'s `.`/`..` entries");
                table.get_mut(sector).removed = true;
                table.close(cache, free_map, sector);
                table.close(cache, free_map, resolved.parent_sector);
                return false;
            }
            table.close(cache, free_map, sector);
        }

        let parent = table.get_mut(resolved.parent_sector);
        let added = dir::add(cache, free_map, parent, &resolved.name, sector);
        if !added {
            // The disk filled up while growing the parent directory to fit
            // the new entry (NoSpace, not the AlreadyExists case already
            // ruled out above): the child inode was created and, if a
            // directory, already seeded, but never became reachable from any
            // path. Deallocate it instead of leaking it.
            log::warn!("filesys_create: out of space linking {path} into its parent directory");
            let child = table.open(cache, sector);
            child.removed = true;
            table.close(cache, free_map, sector);
        }
        table.close(cache, free_map, resolved.parent_sector);
        added
    }

    /// `filesys_open(path) -> file | NONE`.
    pub fn filesys_open(&self, path: &str) -> Option<FileHandle> {
        let mut inner = self.inner.lock().unwrap();
        let Inner {
            cache,
            free_map,
            table,
            root_sector,
            cwd_sector,
        } = &mut *inner;
        let sector = path::resolve(cache, free_map, table, *root_sector, *cwd_sector, path)?;
        let is_directory = table.get(sector).disk.kind == Kind::Directory;
        Some(FileHandle::new(sector, is_directory))
    }

    /// `filesys_remove(path) -> bool`.
    pub fn filesys_remove(&self, path: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Inner {
            cache,
            free_map,
            table,
            root_sector,
            cwd_sector,
        } = &mut *inner;
        let Some(resolved) =
            path::resolve_parent(cache, free_map, table, *root_sector, *cwd_sector, path)
        else {
            return false;
        };
        let removed = dir::remove(cache, free_map, table, resolved.parent_sector, &resolved.name);
        table.close(cache, free_map, resolved.parent_sector);
        removed
    }

    /// `filesys_chdir(path) -> bool`.
    pub fn filesys_chdir(&self, path: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Inner {
            cache,
            free_map,
            table,
            root_sector,
            cwd_sector,
        } = &mut *inner;
        let Some(target) = path::resolve(cache, free_map, table, *root_sector, *cwd_sector, path)
        else {
            return false;
        };
        if table.get(target).disk.kind != Kind::Directory {
            table.close(cache, free_map, target);
            return false;
        }
        let old_cwd = *cwd_sector;
        *cwd_sector = target;
        table.close(cache, free_map, old_cwd);
        true
    }

    pub fn file_read(&self, handle: &mut FileHandle, buf: &mut [u8]) -> usize {
        let inner = self.inner.lock().unwrap();
        file::read(&inner.cache, &inner.table, handle, buf)
    }

    pub fn file_write(&self, handle: &mut FileHandle, buf: &[u8]) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let Inner { cache, free_map, table, .. } = &mut *inner;
        file::write(cache, free_map, table, handle, buf)
    }

    /// `file_seek`: no bound check, pure in-memory cursor move (§4.6).
    pub fn file_seek(&self, handle: &mut FileHandle, position: u64) {
        file::seek(handle, position);
    }

    pub fn file_tell(&self, handle: &FileHandle) -> u64 {
        file::tell(handle)
    }

    pub fn file_length(&self, handle: &FileHandle) -> u64 {
        let inner = self.inner.lock().unwrap();
        file::length(&inner.table, handle)
    }

    pub fn file_readdir(&self, handle: &mut FileHandle) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        file::readdir(&inner.cache, &inner.table, handle)
    }

    pub fn file_deny_write(&self, handle: &FileHandle) {
        let mut inner = self.inner.lock().unwrap();
        file::deny_write(&mut inner.table, handle);
    }

    pub fn file_allow_write(&self, handle: &FileHandle) {
        let mut inner = self.inner.lock().unwrap();
        file::allow_write(&mut inner.table, handle);
    }

    pub fn file_close(&self, handle: FileHandle) {
        let mut inner = self.inner.lock().unwrap();
        let Inner { cache, free_map, table, .. } = &mut *inner;
        file::close(cache, free_map, table, handle);
    }

    /// `inode_is_dir(inode) -> bool`. The handle already carries this flag
    /// (set once at `open` time from the on-disk `kind`), so no lock or
    /// table lookup is needed.
    pub fn inode_is_dir(&self, handle: &FileHandle) -> bool {
        handle.is_directory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_fs(sectors: u32) -> FileSystem<MemDevice> {
        FileSystem::format(MemDevice::new(sectors))
    }

    #[test]
    fn create_write_close_reopen_read() {
        let fs = mem_fs(64);
        assert!(fs.filesys_create("/a", 0, Kind::File));
        let mut h = fs.filesys_open("/a").unwrap();
        assert_eq!(fs.file_write(&mut h, b"hello"), 5);
        fs.file_close(h);

        let mut h = fs.filesys_open("/a").unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(fs.file_read(&mut h, &mut buf), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(fs.file_length(&h), 5);
        fs.file_close(h);
    }

    #[test]
    fn create_existing_name_fails() {
        let fs = mem_fs(64);
        assert!(fs.filesys_create("/a", 0, Kind::File));
        assert!(!fs.filesys_create("/a", 0, Kind::File));
    }

    #[test]
    fn mkdir_then_nested_create_and_remove() {
        let fs = mem_fs(64);
        assert!(fs.filesys_create("/d", 0, Kind::Directory));
        assert!(fs.filesys_create("/d/f", 0, Kind::File));
        assert!(fs.filesys_open("/d/f").is_some());

        assert!(fs.filesys_remove("/d/f"));
        assert!(fs.filesys_open("/d/f").is_none());
    }

    #[test]
    fn deny_write_blocks_other_handles() {
        let fs = mem_fs(64);
        assert!(fs.filesys_create("/prog", 0, Kind::File));
        let reader = fs.filesys_open("/prog").unwrap();
        let mut writer = fs.filesys_open("/prog").unwrap();

        fs.file_deny_write(&reader);
        assert_eq!(fs.file_write(&mut writer, b"x"), 0);
        fs.file_allow_write(&reader);
        assert_eq!(fs.file_write(&mut writer, b"x"), 1);

        fs.file_close(reader);
        fs.file_close(writer);
    }

    #[test]
    fn chdir_then_relative_create() {
        let fs = mem_fs(64);
        assert!(fs.filesys_create("/d", 0, Kind::Directory));
        assert!(fs.filesys_chdir("/d"));
        assert!(fs.filesys_create("f", 0, Kind::File));
        assert!(fs.filesys_open("/d/f").is_some());
    }

    #[test]
    fn filesys_done_after_chdir_away_from_root_does_not_panic() {
        let fs = mem_fs(64);
        assert!(fs.filesys_create("/d", 0, Kind::Directory));
        assert!(fs.filesys_chdir("/d"));
        fs.filesys_done();
    }

    #[test]
    fn remove_nonempty_directory_fails() {
        let fs = mem_fs(64);
        assert!(fs.filesys_create("/d", 0, Kind::Directory));
        assert!(fs.filesys_create("/d/f", 0, Kind::File));
        assert!(!fs.filesys_remove("/d"));
    }

    #[test]
    fn survives_shutdown_and_remount() {
        let device = MemDevice::new(128);
        let fs = FileSystem::format(device);
        assert!(fs.filesys_create("/a", 0, Kind::File));
        let mut h = fs.filesys_open("/a").unwrap();
        fs.file_write(&mut h, b"persisted");
        fs.file_close(h);
        fs.filesys_done();
    }
}
